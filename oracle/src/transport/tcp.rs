use crate::connection;
use crate::policy::Oracle;
use anyhow::{Context as _, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::pin;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

/// Serves the oracle on a TCP socket until `shutdown` resolves.
pub async fn serve(
    host: IpAddr,
    port: u16,
    oracle: Oracle,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let addr = SocketAddr::new(host, port);
    let listener = make_listener(addr)?;

    tracing::info!(%addr, "Listening on TCP socket");

    let mut connections = JoinSet::new();
    let mut shutdown = pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(connection::serve_connection(
                            stream,
                            oracle,
                            peer.to_string(),
                        ));
                    }
                    Err(e) => tracing::warn!("Failed to accept connection: {e}"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    tracing::info!("Stopping TCP server");

    drop(listener);
    connections.shutdown().await;

    Ok(())
}

fn make_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create TCP socket")?;

    // Rebinding after a restart must not wait out TIME_WAIT; the port is
    // still exclusively ours, so SO_REUSEPORT stays off.
    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR")?;
    socket
        .set_nonblocking(true)
        .context("Failed to set listener to non-blocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind TCP listener at {addr}"))?;
    socket.listen(128).context("Failed to listen")?;

    TcpListener::from_std(socket.into()).context("Failed to convert std to tokio listener")
}
