//! UDP pseudo-session: a datagram loop with a source-address client table.
//!
//! There is no accept; "connections" are interned source addresses. The
//! first datagram from a new source mints a client id and counts as a
//! connection. Unless `--recv-only`, every datagram is echoed back to its
//! source. Exec mode over UDP is unsupported.

use crate::net::connection::ConnError;
use crate::sink::Sinks;
use crate::types::Shutdown;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, info};

const DGRAM_BUF: usize = 65536;

#[derive(Debug, Clone, Copy)]
pub struct UdpServerOpts {
    pub recv_only: bool,
    pub keep_listening: bool,
    /// Resolved idle deadline (ms); <= 0 means none.
    pub idle_timeout_ms: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpStats {
    pub datagrams: u64,
    pub clients: u64,
    pub bytes: u64,
}

/// Serve datagrams until idle, shutdown, or (single-shot mode) the first
/// datagram has been handled.
pub async fn run_server<W>(
    socket: UdpSocket,
    opts: &UdpServerOpts,
    local_out: &mut W,
    sinks: &mut Sinks,
    shutdown: &Shutdown,
) -> Result<UdpStats, ConnError>
where
    W: AsyncWrite + Unpin,
{
    let mut clients: HashMap<SocketAddr, u64> = HashMap::new();
    let mut next_client: u64 = 1;
    let mut stats = UdpStats::default();
    let mut buf = vec![0u8; DGRAM_BUF];

    info!(
        "UDP server on {}",
        socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        if shutdown.is_requested() {
            break;
        }

        let recv = async { socket.recv_from(&mut buf).await };
        let (n, src) = tokio::select! {
            r = async {
                if opts.idle_timeout_ms > 0 {
                    tokio::time::timeout(
                        Duration::from_millis(opts.idle_timeout_ms as u64),
                        recv,
                    )
                    .await
                    .ok()
                } else {
                    Some(recv.await)
                }
            } => match r {
                None => {
                    debug!("UDP idle timeout");
                    break;
                }
                Some(Ok(pair)) => pair,
                Some(Err(e)) => return Err(e.into()),
            },
            _ = shutdown.wait() => break,
        };

        if let std::collections::hash_map::Entry::Vacant(e) = clients.entry(src) {
            e.insert(next_client);
            info!("UDP client #{} at {}", next_client, src);
            next_client += 1;
            stats.clients += 1;
        }

        stats.datagrams += 1;
        stats.bytes += n as u64;
        let data = &buf[..n];
        sinks.on_recv(data);
        local_out.write_all(data).await?;
        local_out.flush().await?;

        if !opts.recv_only {
            sinks.on_send(data);
            socket.send_to(data, src).await?;
        }

        if !opts.keep_listening {
            break;
        }
    }

    info!(
        "UDP server done: {} datagrams from {} clients",
        stats.datagrams, stats.clients
    );
    Ok(stats)
}

#[derive(Debug, Clone, Copy)]
pub struct UdpClientOpts {
    pub send_only: bool,
    pub recv_only: bool,
    pub crlf: bool,
    pub delay_ms: i64,
    /// <= 0 means none.
    pub idle_timeout_ms: i64,
}

/// Client side: local input becomes one datagram per read; received
/// datagrams go to local output. The socket must already be connected.
pub async fn run_client<R, W>(
    socket: UdpSocket,
    opts: &UdpClientOpts,
    mut local_in: R,
    mut local_out: W,
    sinks: &mut Sinks,
    shutdown: &Shutdown,
) -> Result<UdpStats, ConnError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = UdpStats::default();
    let mut rbuf = vec![0u8; DGRAM_BUF];
    let mut lbuf = vec![0u8; DGRAM_BUF];
    let mut local_eof = false;
    let mut last_activity = tokio::time::Instant::now();

    loop {
        if shutdown.is_requested() {
            break;
        }
        let idle_deadline = if opts.idle_timeout_ms > 0 {
            last_activity + Duration::from_millis(opts.idle_timeout_ms as u64)
        } else {
            tokio::time::Instant::now() + Duration::from_secs(3600)
        };

        tokio::select! {
            r = socket.recv(&mut rbuf), if !opts.send_only => {
                let n = r?;
                last_activity = tokio::time::Instant::now();
                stats.datagrams += 1;
                stats.bytes += n as u64;
                sinks.on_recv(&rbuf[..n]);
                local_out.write_all(&rbuf[..n]).await?;
                local_out.flush().await?;
            }

            r = local_in.read(&mut lbuf), if !opts.recv_only && !local_eof => {
                let n = r?;
                if n == 0 {
                    local_eof = true;
                    if opts.send_only {
                        break;
                    }
                    continue;
                }
                last_activity = tokio::time::Instant::now();
                let chunk = if opts.crlf {
                    let mut out = Vec::with_capacity(n + 8);
                    let mut prev = 0u8;
                    for &b in &lbuf[..n] {
                        if b == b'\n' && prev != b'\r' {
                            out.push(b'\r');
                        }
                        out.push(b);
                        prev = b;
                    }
                    out
                } else {
                    lbuf[..n].to_vec()
                };
                if opts.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(opts.delay_ms as u64)).await;
                }
                sinks.on_send(&chunk);
                socket.send(&chunk).await?;
            }

            _ = tokio::time::sleep_until(idle_deadline), if opts.idle_timeout_ms > 0 => {
                debug!("UDP client idle timeout");
                break;
            }

            _ = shutdown.wait() => break,
        }
    }
    Ok(stats)
}
