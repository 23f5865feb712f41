//! Runs the translator as a child process that inherits its channel sockets.
//!
//! The oracle opens one socketpair per translator thread, keeps one end of
//! each and passes the other ends to the child, enumerated on the command
//! line as `<fd>,<fd>;<fd>,<fd>;…` (each fd named twice: the translator
//! expects a read fd and a write fd per channel and uses one socket for
//! both). The translator's configuration text goes to its stdin, which is
//! then closed.
//!
//! Host network setup wraps the whole thing: an ordered list of shell
//! commands runs before the translator starts and a mirror list after it
//! exits. Every command receives the same configuration text on stdin.

use crate::connection;
use crate::policy::Oracle;
use anyhow::{Context as _, Result, bail};
use std::future::Future;
use std::os::fd::{AsRawFd as _, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::pin::pin;
use std::process::Stdio;
use tokio::io::AsyncWriteExt as _;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;

pub struct Config {
    pub translator_threads: usize,
    pub executable: PathBuf,
    pub config_blob: String,
    pub pre_commands: Vec<String>,
    pub post_commands: Vec<String>,
}

/// Runs the translator with inherited channel fds until `shutdown` resolves.
pub async fn serve(
    config: Config,
    oracle: Oracle,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tracing::info!("Running pre-start commands");
    run_commands(&config.pre_commands, &config.config_blob)
        .await
        .context("Failed to run pre-start commands")?;

    let result = run_translator(&config, oracle, shutdown).await;

    // Teardown runs even if the translator phase failed; the host setup must
    // be undone either way.
    tracing::info!("Running post-stop commands");
    let cleanup = run_commands_to_completion(&config.post_commands, &config.config_blob)
        .await
        .context("Failed to run post-stop commands");

    result.and(cleanup)
}

async fn run_translator(
    config: &Config,
    oracle: Oracle,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tracing::info!(
        threads = config.translator_threads,
        "Opening translator channels"
    );

    let mut connections = JoinSet::new();
    let mut translator_ends = Vec::with_capacity(config.translator_threads);

    for n in 0..config.translator_threads {
        let (local, remote) = StdUnixStream::pair().context("Failed to create socketpair")?;
        local
            .set_nonblocking(true)
            .context("Failed to set channel to non-blocking")?;
        let local = tokio::net::UnixStream::from_std(local)
            .context("Failed to convert std to tokio stream")?;

        connections.spawn(connection::serve_connection(
            local,
            oracle,
            format!("channel-{n}"),
        ));
        translator_ends.push(remote);
    }

    let mut child = spawn_translator(config, &translator_ends)?;

    // The child holds its own copies now; ours would keep the channels open
    // past its exit.
    drop(translator_ends);

    tracing::info!("Sending configuration to the translator");
    if let Err(e) = feed_stdin(&mut child, &config.config_blob).await {
        stop_translator(&mut child).await;
        connections.shutdown().await;

        return Err(e).context("Failed to send configuration to the translator");
    }

    let mut shutdown = pin!(shutdown);
    let child_exited = tokio::select! {
        () = &mut shutdown => false,
        status = child.wait() => {
            match status {
                Ok(status) => tracing::warn!(%status, "Translator exited before shutdown"),
                Err(e) => tracing::warn!("Failed to await translator exit: {e}"),
            }

            true
        }
    };

    if child_exited {
        // The channels stay up until shutdown is actually requested.
        shutdown.await;
    } else {
        tracing::info!("Stopping the translator");
        stop_translator(&mut child).await;
    }

    tracing::info!("Closing translator channels");
    connections.shutdown().await;

    Ok(())
}

async fn stop_translator(child: &mut Child) {
    // SIGTERM, not `Child::kill` (SIGKILL): the translator drains its buffers
    // on SIGTERM before the channels go away.
    if let Err(e) = request_exit(child) {
        tracing::warn!("{e:#}");
    }

    match child.wait().await {
        Ok(status) => tracing::info!(%status, "Translator exited"),
        Err(e) => tracing::warn!("Failed to await translator exit: {e}"),
    }
}

fn spawn_translator(config: &Config, translator_ends: &[StdUnixStream]) -> Result<Child> {
    let fds: Vec<RawFd> = translator_ends.iter().map(|s| s.as_raw_fd()).collect();

    let pairs = fds
        .iter()
        .map(|fd| format!("{fd},{fd}"))
        .collect::<Vec<_>>()
        .join(";");

    let mut command = Command::new(&config.executable);
    command
        .arg("--config-file=-")
        .arg(format!("--addressing-external-inherited-fds={pairs}"))
        .arg("translate")
        .stdin(Stdio::piped());

    // The socketpair fds are close-on-exec; clear that in the child so it
    // actually inherits them under the numbers we put on the command line.
    unsafe {
        command.pre_exec(move || {
            for &fd in &fds {
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let child = command.spawn().with_context(|| {
        format!(
            "Failed to spawn translator at {}",
            config.executable.display()
        )
    })?;

    tracing::info!(pid = child.id(), "Started the translator");

    Ok(child)
}

fn request_exit(child: &Child) -> Result<()> {
    let pid = child.id().context("Translator has no pid")?;

    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to signal the translator");
    }

    Ok(())
}

async fn feed_stdin(child: &mut Child, blob: &str) -> Result<()> {
    let mut stdin = child.stdin.take().context("Child stdin is not piped")?;

    stdin
        .write_all(blob.as_bytes())
        .await
        .context("Failed to write to child stdin")?;

    // Dropping the handle closes the pipe.
    Ok(())
}

/// Runs commands in order, stopping at the first failure.
async fn run_commands(commands: &[String], stdin_blob: &str) -> Result<()> {
    for command in commands {
        run_command(command, stdin_blob).await?;
    }

    Ok(())
}

/// Runs every command even if some fail; reports the first failure.
async fn run_commands_to_completion(commands: &[String], stdin_blob: &str) -> Result<()> {
    let mut first_failure = None;

    for command in commands {
        if let Err(e) = run_command(command, stdin_blob).await {
            tracing::error!("{e:#}");
            first_failure.get_or_insert(e);
        }
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_command(command: &str, stdin_blob: &str) -> Result<()> {
    tracing::debug!(%command, "Running command");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn `{command}`"))?;

    feed_stdin(&mut child, stdin_blob).await?;

    let status = child
        .wait()
        .await
        .with_context(|| format!("Failed to await `{command}`"))?;

    if !status.success() {
        bail!("`{command}` exited with {status}");
    }

    Ok(())
}
