//! End-to-end tests of the unix and TCP transports against real sockets.

#![allow(clippy::unwrap_used)]

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpStream, UnixStream};
use xax_oracle::policy::{Nat64Policy, Oracle};
use xax_oracle::transport;
use xaxlib::{Message, MessageType, Request, wire};

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

fn request() -> Request {
    Request::new(
        MessageType::Ipv4ToIpv6Main,
        ID,
        Ipv4Addr::new(8, 8, 8, 8).into(),
        Ipv4Addr::new(192, 168, 64, 2).into(),
    )
    .unwrap()
}

async fn exchange<S>(stream: &mut S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request().to_wire()).await.unwrap();

    let mut frame = [0u8; wire::MESSAGE_SIZE];
    stream.read_exact(&mut frame).await.unwrap();

    let Message::SuccessfulResponse(response) = Message::from_wire(&frame).unwrap() else {
        panic!("expected a successful response");
    };

    assert_eq!(response.message_identifier(), ID);
    assert_eq!(
        response.source(),
        "64:ff9b::808:808".parse::<IpAddr>().unwrap()
    );
    assert_eq!(response.destination(), "fd64::2".parse::<IpAddr>().unwrap());
}

#[tokio::test]
async fn translates_over_a_unix_socket() {
    let path = std::env::temp_dir().join(format!("xax-oracle-test-{}.sock", std::process::id()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn({
        let path = path.clone();
        async move {
            transport::unix::serve(&path, oracle(), async move {
                shutdown_rx.await.ok();
            })
            .await
        }
    });

    let mut stream = loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };

    // Several requests on one connection, answered in order.
    exchange(&mut stream).await;
    exchange(&mut stream).await;
    exchange(&mut stream).await;

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();

    // The in-flight connection was torn down with the server.
    let mut buf = [0u8; 1];
    assert!(matches!(stream.read(&mut buf).await, Ok(0) | Err(_)));

    // And the listener is gone.
    assert!(UnixStream::connect(&path).await.is_err());

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn translates_over_tcp() {
    const ADDR: &str = "127.0.0.1:16446";

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(transport::tcp::serve(
        Ipv4Addr::LOCALHOST.into(),
        16446,
        oracle(),
        async move {
            shutdown_rx.await.ok();
        },
    ));

    let mut stream = loop {
        match TcpStream::connect(ADDR).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };

    exchange(&mut stream).await;
    exchange(&mut stream).await;

    // A second, concurrent connection works too.
    let mut second = TcpStream::connect(ADDR).await.unwrap();
    exchange(&mut second).await;
    exchange(&mut stream).await;

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();

    assert!(TcpStream::connect(ADDR).await.is_err());
}
