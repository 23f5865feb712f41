//! An external addressing oracle for a stateless NAT64 translator.
//!
//! Answers the translator's per-packet address questions with the `nat64`
//! policy over one of three transports: a unix domain socket, a TCP socket,
//! or socketpairs inherited by a translator child process.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::{Context as _, Result};
use clap::Parser;
use ip_network::Ipv6Network;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::process::ExitCode;
use xax_oracle::policy::{Nat64Policy, Oracle};
use xax_oracle::signals::{Shutdown, TerminationSignal};
use xax_oracle::transport;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// How the translator reaches the oracle.
    #[arg(long, env = "XAX_TRANSPORT", value_enum, default_value_t = Transport::Unix)]
    transport: Transport,

    /// Listen path for the `unix` transport.
    #[arg(long, env = "XAX_UNIX_PATH", default_value = "/tmp/tundra-external.sock")]
    unix_path: PathBuf,

    /// Listen host for the `tcp` transport.
    #[arg(long, env = "XAX_TCP_HOST", default_value = "127.0.0.1")]
    tcp_host: IpAddr,

    /// Listen port for the `tcp` transport.
    #[arg(long, env = "XAX_TCP_PORT", default_value_t = 6446)]
    tcp_port: u16,

    /// How many channels to open towards the translator (`inherited-fds`
    /// transport); must match the translator's thread count.
    #[arg(long, env = "XAX_TRANSLATOR_THREADS", default_value_t = 8)]
    translator_threads: usize,

    /// Path to the translator binary (`inherited-fds` transport).
    #[arg(long, env = "XAX_TRANSLATOR_EXECUTABLE")]
    translator_executable: Option<PathBuf>,

    /// File whose contents are piped to the translator (and to every pre/post
    /// command) on stdin.
    #[arg(long, env = "XAX_TRANSLATOR_CONFIG")]
    translator_config: Option<PathBuf>,

    /// Shell command to run before starting the translator; repeatable, runs
    /// in order.
    #[arg(long = "pre-command")]
    pre_commands: Vec<String>,

    /// Shell command to run after stopping the translator; repeatable, runs
    /// in order.
    #[arg(long = "post-command")]
    post_commands: Vec<String>,

    /// The translator's own IPv4 address.
    #[arg(long, env = "XAX_NAT64_IPV4", default_value = "192.168.64.2")]
    nat64_ipv4: Ipv4Addr,

    /// The translator's own IPv6 address.
    #[arg(long, env = "XAX_NAT64_IPV6", default_value = "fd64::2")]
    nat64_ipv6: Ipv6Addr,

    /// The /96 prefix carrying embedded IPv4 addresses.
    #[arg(long, env = "XAX_NAT64_PREFIX", default_value = "64:ff9b::/96")]
    nat64_prefix: Ipv6Network,

    /// Whether private addresses are translated.
    #[arg(long, env = "XAX_ALLOW_PRIVATE", default_value_t = true, action = clap::ArgAction::Set)]
    allow_private: bool,

    /// Cache lifetime echoed in successful responses.
    #[arg(long, env = "XAX_CACHE_LIFETIME", default_value_t = 5)]
    cache_lifetime: u8,

    /// Signal that triggers an orderly shutdown; repeatable.
    #[arg(
        long = "signal",
        value_enum,
        default_values_t = vec![
            TerminationSignal::Sigterm,
            TerminationSignal::Sigint,
            TerminationSignal::Sighup,
        ]
    )]
    signals: Vec<TerminationSignal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Transport {
    Unix,
    Tcp,
    InheritedFds,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(try_main(cli)) {
        Ok(()) => {
            tracing::info!("Goodbye!");

            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");

            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?cli.transport,
        "`xax-oracle` starting"
    );

    let policy = Nat64Policy::new(
        cli.nat64_ipv4,
        cli.nat64_ipv6,
        cli.nat64_prefix,
        cli.allow_private,
    )?;
    let oracle = Oracle::new(policy, cli.cache_lifetime);

    let mut shutdown = Shutdown::new(&cli.signals).context("Failed to install signal handlers")?;

    match cli.transport {
        Transport::Unix => transport::unix::serve(&cli.unix_path, oracle, shutdown.recv()).await,
        Transport::Tcp => {
            transport::tcp::serve(cli.tcp_host, cli.tcp_port, oracle, shutdown.recv()).await
        }
        Transport::InheritedFds => {
            let config = inherited_fds_config(&cli).await?;

            transport::inherited_fds::serve(config, oracle, shutdown.recv()).await
        }
    }
}

async fn inherited_fds_config(cli: &Cli) -> Result<transport::inherited_fds::Config> {
    let executable = cli
        .translator_executable
        .clone()
        .context("`--translator-executable` is required for the inherited-fds transport")?;
    let config_path = cli
        .translator_config
        .as_ref()
        .context("`--translator-config` is required for the inherited-fds transport")?;

    let config_blob = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| {
            format!(
                "Failed to read translator configuration from {}",
                config_path.display()
            )
        })?;

    Ok(transport::inherited_fds::Config {
        translator_threads: cli.translator_threads,
        executable,
        config_blob,
        pre_commands: cli.pre_commands.clone(),
        post_commands: cli.post_commands.clone(),
    })
}
