mod support;

use std::time::Duration;

use support::server;
use tether::{ConnectionConfig, Origin, Scheme, Transport, TransportConfig, TransportState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn transport_to(server: &server::Server, config: TransportConfig) -> Transport {
    let origin = Origin::new(Scheme::Http, "127.0.0.1", server.addr().port());
    Transport::new(origin, config, None).unwrap()
}

async fn read_exactly(transport: &Transport, n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < n {
        let chunk = transport
            .read(n - out.len(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn connect_write_read_close() {
    let _ = env_logger::try_init();

    let server = server::tcp(|mut io, _| async move {
        let mut buf = [0; 4];
        io.read_exact(&mut buf).await.unwrap();
        io.write_all(&buf).await.unwrap();
        let _ = io.read(&mut buf).await;
    });

    let transport = transport_to(&server, TransportConfig::default());
    assert_eq!(transport.state(), TransportState::Closed);

    transport.connect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Connected);
    assert!(!transport.is_secure());

    transport.write(b"ping", None).await.unwrap();
    assert_eq!(read_exactly(&transport, 4).await, b"ping");

    transport.aclose().await;
    assert_eq!(transport.state(), TransportState::Closed);
    // Closing again is a no-op.
    transport.aclose().await;
}

#[tokio::test]
async fn connect_twice_is_misuse() {
    let _ = env_logger::try_init();

    let server = server::tcp(|mut io, _| async move {
        let _ = io.read(&mut [0; 1]).await;
    });

    let transport = transport_to(&server, TransportConfig::default());
    transport.connect().await.unwrap();
    let err = transport.connect().await.unwrap_err();
    assert!(err.is_misuse());
    transport.aclose().await;
}

#[tokio::test]
async fn connect_refused() {
    let _ = env_logger::try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let origin = Origin::new(Scheme::Http, "127.0.0.1", port);
    let transport = Transport::new(origin, TransportConfig::default(), None).unwrap();
    let err = transport.connect().await.unwrap_err();
    assert!(err.is_connect());
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test]
async fn read_timeout_leaves_connection_open() {
    let _ = env_logger::try_init();

    let server = server::tcp(|mut io, _| async move {
        let _ = io.read(&mut [0; 1]).await;
    });

    let transport = transport_to(&server, TransportConfig::default());
    transport.connect().await.unwrap();

    let err = transport
        .read(1024, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_read_timeout());
    assert!(err.is_timeout());
    assert_eq!(transport.state(), TransportState::Connected);

    transport.aclose().await;
}

#[tokio::test]
async fn eof_after_buffered_data() {
    let _ = env_logger::try_init();

    let server = server::tcp(|mut io, _| async move {
        io.write_all(b"bye").await.unwrap();
    });

    let transport = transport_to(&server, TransportConfig::default());
    transport.connect().await.unwrap();

    assert_eq!(read_exactly(&transport, 3).await, b"bye");
    let err = transport
        .read(1024, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(err.is_eof());
    assert!(transport.at_eof());

    transport.aclose().await;
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test]
async fn transport_can_be_reopened() {
    let _ = env_logger::try_init();

    let mut server = server::tcp(|mut io, _| async move {
        let _ = io.read(&mut [0; 1]).await;
    });

    let transport = transport_to(&server, TransportConfig::default());
    transport.connect().await.unwrap();
    transport.aclose().await;
    transport.connect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Connected);
    transport.aclose().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn reading_pauses_under_backpressure() {
    let _ = env_logger::try_init();

    const TOTAL: usize = 64 * 1024;
    let server = server::tcp(|mut io, _| async move {
        let _ = io.write_all(&[b'x'; TOTAL]).await;
        let _ = io.read(&mut [0; 1]).await;
    });

    let config = ConnectionConfig::builder()
        .read_buf_limit(1024)
        .build()
        .unwrap()
        .transport()
        .clone();
    let transport = transport_to(&server, config);
    transport.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport.is_reading_paused());
    assert!(transport.buffered() <= 3 * 1024, "buffered {}", transport.buffered());

    let data = read_exactly(&transport, TOTAL).await;
    assert_eq!(data.len(), TOTAL);
    assert!(!transport.is_reading_paused());

    transport.aclose().await;
}

#[tokio::test]
async fn write_timeout_when_peer_stops_reading() {
    let _ = env_logger::try_init();

    // Holds the socket open without reading from it.
    let server = server::tcp(|io, _| async move {
        let _io = io;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let config = ConnectionConfig::builder()
        .write_buf_limit(1024)
        .build()
        .unwrap()
        .transport()
        .clone();
    let transport = transport_to(&server, config);
    transport.connect().await.unwrap();

    let data = vec![0u8; 32 * 1024 * 1024];
    let err = transport
        .write(&data, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(err.is_write_timeout());
    assert_eq!(transport.state(), TransportState::Connected);
    assert!(transport.write_buffer_size() > 0);

    transport.abort();
    assert_eq!(transport.state(), TransportState::Closed);
    let err = transport.write(b"more", None).await.unwrap_err();
    assert!(err.is_connection_lost());
}
