use crate::connection;
use crate::policy::Oracle;
use anyhow::{Context as _, Result};
use std::future::Future;
use std::path::Path;
use std::pin::pin;
use tokio::task::JoinSet;

/// Serves the oracle on a unix domain socket until `shutdown` resolves.
pub async fn serve(
    path: &Path,
    oracle: Oracle,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    // Remove the socket if a previous run left it there.
    tokio::fs::remove_file(path).await.ok();

    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind unix socket at {}", path.display()))?;

    tracing::info!(path = %path.display(), "Listening on unix socket");

    let mut connections = JoinSet::new();
    let mut shutdown = pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        connections.spawn(connection::serve_connection(
                            stream,
                            oracle,
                            format!("{addr:?}"),
                        ));
                    }
                    Err(e) => tracing::warn!("Failed to accept connection: {e}"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    tracing::info!("Stopping unix socket server");

    drop(listener);
    connections.shutdown().await;

    Ok(())
}
