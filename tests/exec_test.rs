//! Exec bridge integration: the immediate-exit crash class, full-server
//! wiring with an allow list, and flow control under load.

#![cfg(unix)]

use rcat::config::{Config, Mode};
use rcat::net::exec::ExecSession;
use rcat::net::listener::Server;
use rcat::net::{AccessList, Connection};
use rcat::types::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

// S8: rcat -l -e /bin/true --allow-ip 127.0.0.1; a client connects and
// closes. The handler must return within a second, cleanly.
#[tokio::test]
async fn test_exec_immediate_exit_full_server() {
    let port = free_port();
    let cfg = Config {
        mode: Mode::Listen,
        host: Some("127.0.0.1".into()),
        port,
        keep_listening: false,
        exec: rcat::config::ExecOptions {
            program: vec!["/bin/true".into()],
            ..Default::default()
        },
        ..Config::default()
    };
    let access = AccessList::new(vec!["127.0.0.1".parse().unwrap()], vec![]);
    let shutdown = Shutdown::new();
    let server = Server::new(Arc::new(cfg), Arc::new(access), shutdown.clone());

    let server_task = tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = std::time::Instant::now();
    let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    drop(client);

    let result = tokio::time::timeout(Duration::from_secs(1), server_task)
        .await
        .expect("handler must return within 1s")
        .unwrap();
    result.expect("no error for an immediately-exiting child");
    assert!(start.elapsed() < Duration::from_secs(1));
}

// Server-mode exec without an allow list is refused before accepting.
#[tokio::test]
async fn test_exec_without_allow_list_refused() {
    let cfg = Config {
        mode: Mode::Listen,
        host: Some("127.0.0.1".into()),
        port: free_port(),
        exec: rcat::config::ExecOptions {
            program: vec!["/bin/true".into()],
            ..Default::default()
        },
        ..Config::default()
    };
    let access = AccessList::new(vec![], vec![]);
    let shutdown = Shutdown::new();
    let server = Server::new(Arc::new(cfg), Arc::new(access), shutdown);
    let err = server.run().await.unwrap_err();
    assert_eq!(err.exit_code(), rcat::EXIT_SECURITY);
}

async fn conn_pair() -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server_side, _) = listener.accept().await.unwrap();
    (Connection::Plain(server_side), client)
}

// Push well past the aggregate buffer cap through `cat`; hysteresis must
// throttle without losing or reordering bytes.
#[tokio::test]
async fn test_flow_control_large_roundtrip() {
    let (conn, mut peer) = conn_pair().await;
    let shutdown = Shutdown::new();
    let opts = rcat::config::ExecOptions {
        program: vec!["/bin/cat".into()],
        ..Default::default()
    };
    let session = ExecSession::spawn(&opts).unwrap();
    let bridge = tokio::spawn(async move { session.bridge(conn, &shutdown, false).await });

    // 1 MiB of patterned data, well above the 256 KiB ceiling.
    let payload: Vec<u8> = (0..(1024 * 1024)).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (mut peer_rd, mut peer_wr) = peer.split();
    let writer = async {
        peer_wr.write_all(&payload).await.unwrap();
        peer_wr.shutdown().await.unwrap();
    };
    let reader = async {
        let mut got = Vec::with_capacity(expected.len());
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = peer_rd.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        got
    };
    let (_, got) = tokio::join!(writer, reader);

    assert_eq!(got.len(), expected.len());
    assert_eq!(got, expected, "bytes through the child must be unchanged");
    let status = tokio::time::timeout(Duration::from_secs(10), bridge)
        .await
        .expect("bridge must finish")
        .unwrap()
        .unwrap();
    assert!(status.success());
}

// The child's exit status propagates.
#[tokio::test]
async fn test_child_exit_status_reported() {
    let (conn, peer) = conn_pair().await;
    let shutdown = Shutdown::new();
    let opts = rcat::config::ExecOptions {
        shell: Some("exit 3".into()),
        ..Default::default()
    };
    let session = ExecSession::spawn(&opts).unwrap();
    let status = session.bridge(conn, &shutdown, false).await.unwrap();
    assert_eq!(status.code(), Some(3));
    drop(peer);
}

// Shell mode pipes both directions through /bin/sh -c.
#[tokio::test]
async fn test_shell_mode_transforms_stream() {
    let (conn, mut peer) = conn_pair().await;
    let shutdown = Shutdown::new();
    let opts = rcat::config::ExecOptions {
        shell: Some("tr a-z A-Z".into()),
        ..Default::default()
    };
    let session = ExecSession::spawn(&opts).unwrap();
    let bridge = tokio::spawn(async move { session.bridge(conn, &shutdown, false).await });

    peer.write_all(b"shout this\n").await.unwrap();
    peer.shutdown().await.unwrap();

    let mut got = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = peer.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"SHOUT THIS\n");
    bridge.await.unwrap().unwrap();
}
