//! The per-connection request/response loop.
//!
//! The protocol is strictly serial on one stream: read exactly one 40-byte
//! request, answer it with exactly one 40-byte response, repeat. Nothing is
//! buffered across requests.

use crate::policy::Oracle;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use xaxlib::{InvalidMessage, Request, wire};

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] InvalidMessage),
}

/// Reads one frame, returning `None` when the peer closed the stream between
/// frames.
///
/// EOF in the middle of a frame is an I/O error like any other.
async fn read_frame<S>(stream: &mut S) -> io::Result<Option<[u8; wire::MESSAGE_SIZE]>>
where
    S: AsyncRead + Unpin,
{
    let mut frame = [0u8; wire::MESSAGE_SIZE];

    let n = stream.read(&mut frame).await?;
    if n == 0 {
        return Ok(None);
    }

    stream.read_exact(&mut frame[n..]).await?;

    Ok(Some(frame))
}

/// Serves one request: decode, translate, answer.
///
/// Only request frames are acceptable here; a peer sending response frames is
/// misusing the protocol and fails the decode.
async fn handle_request<S>(stream: &mut S, oracle: &Oracle) -> Result<Option<()>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(frame) = read_frame(stream).await? else {
        return Ok(None);
    };

    let request = Request::from_wire(&frame)?;
    let response = oracle.respond(&request)?;

    stream.write_all(&response.to_wire()).await?;
    stream.flush().await?;

    Ok(Some(()))
}

/// Serves one peer until it disconnects or misbehaves.
///
/// A single malformed frame terminates the connection; frames are fixed-size,
/// so the peer can simply reconnect and retry without resynchronisation.
pub async fn serve_connection<S>(mut stream: S, oracle: Oracle, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!(%peer, "Client connected");

    loop {
        match handle_request(&mut stream, &oracle).await {
            Ok(Some(())) => {}
            Ok(None) => break,
            Err(ConnectionError::Io(e)) => {
                tracing::debug!(%peer, "Connection error: {e}");
                break;
            }
            Err(ConnectionError::Protocol(e)) => {
                tracing::warn!(%peer, "Received an invalid message: {e}");
                break;
            }
        }
    }

    if let Err(e) = stream.shutdown().await {
        tracing::debug!(%peer, "Failed to shut down stream: {e}");
    }

    tracing::debug!(%peer, "Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Nat64Policy;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use xaxlib::{Message, MessageType};

    const ID: u32 = 0xDEAD_BEEF;

    fn oracle() -> Oracle {
        let policy = Nat64Policy::new(
            Ipv4Addr::new(192, 168, 64, 2),
            "fd64::2".parse().unwrap(),
            "64:ff9b::/96".parse().unwrap(),
            true,
        )
        .unwrap();

        Oracle::new(policy, 5)
    }

    fn request(destination: &str) -> Request {
        Request::new(
            MessageType::Ipv4ToIpv6Main,
            ID,
            Ipv4Addr::new(8, 8, 8, 8).into(),
            destination.parse::<IpAddr>().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn answers_requests_in_order_until_eof() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(server, oracle(), "test".to_owned()));

        for _ in 0..3 {
            client.write_all(&request("192.168.64.2").to_wire()).await.unwrap();

            let mut frame = [0u8; wire::MESSAGE_SIZE];
            client.read_exact(&mut frame).await.unwrap();

            let Message::SuccessfulResponse(response) = Message::from_wire(&frame).unwrap() else {
                panic!("expected a successful response");
            };

            assert_eq!(response.message_identifier(), ID);
            assert_eq!(response.cache_lifetime(), 5);
            assert_eq!(
                response.source(),
                "64:ff9b::808:808".parse::<IpAddr>().unwrap()
            );
            assert_eq!(response.destination(), "fd64::2".parse::<IpAddr>().unwrap());
        }

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn translation_failures_produce_erroneous_responses() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(server, oracle(), "test".to_owned()));

        client.write_all(&request("192.168.64.3").to_wire()).await.unwrap();

        let mut frame = [0u8; wire::MESSAGE_SIZE];
        client.read_exact(&mut frame).await.unwrap();

        let Message::ErroneousResponse(response) = Message::from_wire(&frame).unwrap() else {
            panic!("expected an erroneous response");
        };

        assert_eq!(response.message_identifier(), ID);
        assert!(!response.icmp());

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn a_bad_magic_byte_terminates_the_connection() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(server, oracle(), "test".to_owned()));

        let mut frame = request("192.168.64.2").to_wire();
        frame[0] = 0x00;
        client.write_all(&frame).await.unwrap();

        // No response; the stream just ends.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        task.await.unwrap();
    }

    #[tokio::test]
    async fn a_response_frame_from_the_peer_terminates_the_connection() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(server, oracle(), "test".to_owned()));

        let response = request("192.168.64.2").erroneous_response(false).unwrap();
        client.write_all(&response.to_wire()).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        task.await.unwrap();
    }

    #[tokio::test]
    async fn eof_mid_frame_terminates_the_connection() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(server, oracle(), "test".to_owned()));

        client
            .write_all(&request("192.168.64.2").to_wire()[..20])
            .await
            .unwrap();
        drop(client);

        task.await.unwrap();
    }
}
