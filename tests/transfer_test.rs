//! Transfer, unix-socket lifecycle and server-runtime integration.

use rcat::net::connection::Connection;
use rcat::net::transfer::{self, TransferOpts};
use rcat::sink::Sinks;
use rcat::types::Shutdown;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// Plain TCP carries arbitrary bytes unchanged in both directions.
#[tokio::test]
async fn test_plain_stream_is_transparent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();

    // Random binary data: NULs, 0xFF, CR/LF and everything else.
    let blob: Vec<u8> = (0..300_000usize).map(|_| rand::random::<u8>()).collect();
    let expected = blob.clone();

    let peer_task = tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        let mut got = Vec::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = s.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        // Send a blob back the other way before closing.
        s.write_all(b"response blob \x00\xff\r\n").await.unwrap();
        s.shutdown().await.unwrap();
        got
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let conn = Connection::Plain(stream);
    let opts = TransferOpts {
        close_on_eof: true,
        wait_time_ms: 2_000,
        ..TransferOpts::default()
    };
    let mut local_out = Vec::new();
    let mut sinks = Sinks::disabled();
    let summary = transfer::run(
        conn,
        blob.as_slice(),
        &mut local_out,
        &opts,
        &mut sinks,
        &shutdown,
        Vec::new(),
    )
    .await
    .unwrap();

    assert_eq!(peer_task.await.unwrap(), expected);
    assert_eq!(local_out, b"response blob \x00\xff\r\n");
    assert_eq!(summary.bytes_out, expected.len() as u64);
}

// The sinks observe exactly the received byte stream.
#[tokio::test]
async fn test_output_logger_tees_received_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let log_path = std::env::temp_dir().join(format!("rcat_tee_{}.bin", std::process::id()));
    let _ = std::fs::remove_file(&log_path);

    let peer_task = tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        s.write_all(b"logged payload").await.unwrap();
        s.shutdown().await.unwrap();
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let conn = Connection::Plain(stream);
    let mut sinks = Sinks {
        log: rcat::sink::OutputLogger::open(&log_path, false).unwrap(),
        hex: rcat::sink::HexDumper::disabled(),
    };
    let local_in: &[u8] = b"";
    let mut local_out = Vec::new();
    transfer::run(
        conn,
        local_in,
        &mut local_out,
        &TransferOpts::default(),
        &mut sinks,
        &shutdown,
        Vec::new(),
    )
    .await
    .unwrap();
    drop(sinks);

    peer_task.await.unwrap();
    assert_eq!(std::fs::read(&log_path).unwrap(), b"logged payload");
    std::fs::remove_file(&log_path).ok();
}

#[cfg(unix)]
mod unix_lifecycle {
    use super::*;
    use rcat::config::{Config, Mode, Transport};
    use rcat::net::listener::Server;
    use rcat::net::{AccessList, unixsock};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_sock(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rcat_it_{}_{}.sock", tag, std::process::id()))
    }

    // Clean shutdown leaves no socket file behind.
    #[tokio::test]
    async fn test_unix_server_cleans_up_socket() {
        let path = temp_sock("clean");
        let _ = std::fs::remove_file(&path);

        let cfg = Config {
            mode: Mode::Listen,
            transport: Transport::Unix,
            unix_path: Some(path.clone()),
            keep_listening: true,
            broker: true,
            max_clients: 4,
            ..Config::default()
        };
        let shutdown = Shutdown::new();
        let server = Server::new(
            Arc::new(cfg),
            Arc::new(AccessList::new(vec![], vec![])),
            shutdown.clone(),
        );
        let task = tokio::spawn(async move { server.run().await });

        // Wait for the socket file to exist, talk to it, then shut down.
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists(), "server never created the socket");
        let client = unixsock::connect(&path).await.unwrap();
        drop(client);

        shutdown.request();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server must stop on shutdown")
            .unwrap()
            .unwrap();
        assert!(!path.exists(), "socket file must be gone after shutdown");
    }

    // A stale socket from a dead server is reclaimed on restart.
    #[tokio::test]
    async fn test_unix_server_reclaims_stale_socket() {
        let path = temp_sock("stale");
        let _ = std::fs::remove_file(&path);
        {
            let _dead = unixsock::bind_listener(&path).unwrap();
        }
        assert!(path.exists());

        let listener = unixsock::bind_listener(&path).expect("stale reclaim failed");
        drop(listener);
        unixsock::cleanup(&path);
        assert!(!path.exists());
    }

    // Unix byte stream is transparent end to end.
    #[tokio::test]
    async fn test_unix_roundtrip() {
        let path = temp_sock("rt");
        let _ = std::fs::remove_file(&path);
        let listener = unixsock::bind_listener(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::Unix(stream, None);
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
            conn.close().await;
        });

        let stream = unixsock::connect(&path).await.unwrap();
        let mut conn = Connection::Unix(stream, None);
        conn.write_all(b"via unix").await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"via unix");
        server.await.unwrap();
        unixsock::cleanup(&path);
    }
}

mod server_runtime {
    use super::*;
    use rcat::config::{Config, Mode};
    use rcat::net::AccessList;
    use rcat::net::listener::Server;
    use std::sync::Arc;

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    // Denied peers are closed before any data exchange; the broker never
    // sees them.
    #[tokio::test]
    async fn test_server_access_gate_with_broker() {
        let port = free_port();
        let cfg = Config {
            mode: Mode::Listen,
            host: Some("127.0.0.1".into()),
            port,
            keep_listening: true,
            broker: true,
            max_clients: 4,
            ..Config::default()
        };
        // Deny everything.
        let access = AccessList::new(vec![], vec!["0.0.0.0/0".parse().unwrap()]);
        let shutdown = Shutdown::new();
        let server = Server::new(Arc::new(cfg), Arc::new(access), shutdown.clone());
        let stats = server.stats();
        let task = tokio::spawn(async move { server.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("denied client must see EOF quickly")
            .unwrap();
        assert_eq!(n, 0);

        for _ in 0..100 {
            if stats.rejected.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.rejected.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(stats.accepted.load(std::sync::atomic::Ordering::SeqCst), 0);

        shutdown.request();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    // Broker over the full server runtime: accept, gate, relay.
    #[tokio::test]
    async fn test_server_brokered_clients() {
        let port = free_port();
        let cfg = Config {
            mode: Mode::Listen,
            host: Some("127.0.0.1".into()),
            port,
            keep_listening: true,
            broker: true,
            max_clients: 4,
            ..Config::default()
        };
        let access = AccessList::new(vec![], vec![]);
        let shutdown = Shutdown::new();
        let server = Server::new(Arc::new(cfg), Arc::new(access), shutdown.clone());
        let task = tokio::spawn(async move { server.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        a.write_all(b"through the server").await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(3), b.read(&mut buf))
            .await
            .expect("relay delivery timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"through the server");

        shutdown.request();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
