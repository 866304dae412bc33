//! Bidirectional transfer engine: connection ↔ local stdio.
//!
//! A single task multiplexes the remote connection and the local
//! source/sink, applying the CRLF and Telnet transforms, the outbound
//! delay throttle, the unified idle-timeout policy and the half-close
//! semantics of `--close-on-eof`. The process-wide shutdown flag is
//! checked on every readiness turn.

use crate::net::connection::{ConnError, Connection};
use crate::net::telnet::TelnetCodec;
use crate::sink::Sinks;
use crate::types::Shutdown;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

const IO_BUF: usize = 16 * 1024;

/// Which runtime is driving the transfer; selects the idle default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferContext {
    Client,
    TcpServer,
    UdpServer,
    UnixServer,
}

/// The single idle-timeout policy used by every path.
///
/// `explicit` is the user's `--idle-timeout` in ms: positive values win
/// everywhere, `-1` forces "no deadline", `0` means unset and picks the
/// per-context default. Non-TTY server input defaults to 30 s so piped
/// sessions cannot wedge forever.
pub fn idle_policy(ctx: TransferContext, explicit_ms: i64, local_is_tty: bool) -> i64 {
    if explicit_ms > 0 {
        return explicit_ms;
    }
    if explicit_ms < 0 {
        return -1;
    }
    match ctx {
        TransferContext::Client => -1,
        TransferContext::TcpServer | TransferContext::UnixServer => {
            if local_is_tty { -1 } else { 30_000 }
        }
        TransferContext::UdpServer => 30_000,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferOpts {
    pub send_only: bool,
    pub recv_only: bool,
    pub close_on_eof: bool,
    pub crlf: bool,
    pub telnet: bool,
    /// Outbound chunk throttle, ms. 0 disables.
    pub delay_ms: i64,
    /// Drain window after a half-close, ms.
    pub wait_time_ms: i64,
    /// Resolved idle deadline (`idle_policy`), ms; -1 means none.
    pub idle_timeout_ms: i64,
}

impl Default for TransferOpts {
    fn default() -> Self {
        Self {
            send_only: false,
            recv_only: false,
            close_on_eof: false,
            crlf: false,
            telnet: false,
            delay_ms: 0,
            wait_time_ms: 0,
            idle_timeout_ms: -1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransferSummary {
    /// Bytes received from the remote.
    pub bytes_in: u64,
    /// Bytes sent to the remote.
    pub bytes_out: u64,
}

/// Bare `\n` becomes `\r\n`; an existing `\r\n` stays untouched.
fn crlf_transform(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 8);
    let mut prev = 0u8;
    for &b in input {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Pump until EOF, idle deadline, or shutdown. Consumes and closes the
/// connection; the summary carries the byte counters.
pub async fn run<R, W>(
    mut conn: Connection,
    mut local_in: R,
    mut local_out: W,
    opts: &TransferOpts,
    sinks: &mut Sinks,
    shutdown: &Shutdown,
    preread: Vec<u8>,
) -> Result<TransferSummary, ConnError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = TransferSummary::default();
    let mut telnet = opts.telnet.then(TelnetCodec::new);

    // Early remote bytes (e.g. delivered by a proxy along with its reply).
    if !preread.is_empty() {
        summary.bytes_in += preread.len() as u64;
        sinks.on_recv(&preread);
        local_out.write_all(&preread).await?;
        local_out.flush().await?;
    }

    let (mut rd, mut wr) = tokio::io::split(conn);
    let mut rbuf = vec![0u8; IO_BUF];
    let mut lbuf = vec![0u8; IO_BUF];
    let mut local_eof = false;
    let mut last_activity = Instant::now();

    let result: Result<(), ConnError> = loop {
        if shutdown.is_requested() {
            break Ok(());
        }
        let idle_deadline = if opts.idle_timeout_ms > 0 {
            last_activity + Duration::from_millis(opts.idle_timeout_ms as u64)
        } else {
            // Unused; the arm below is disabled.
            Instant::now() + Duration::from_secs(3600)
        };

        tokio::select! {
            r = rd.read(&mut rbuf), if !opts.send_only => {
                let n = match r {
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                if n == 0 {
                    debug!("remote EOF after {} bytes in", summary.bytes_in);
                    break Ok(());
                }
                last_activity = Instant::now();
                let chunk = &rbuf[..n];
                let emit: Vec<u8>;
                if let Some(codec) = telnet.as_mut() {
                    let mut data = Vec::with_capacity(n);
                    let mut replies = Vec::new();
                    codec.decode(chunk, &mut data, &mut replies);
                    if !replies.is_empty() {
                        if let Err(e) = wr.write_all(&replies).await {
                            break Err(e.into());
                        }
                    }
                    emit = data;
                } else {
                    emit = chunk.to_vec();
                }
                if !emit.is_empty() {
                    summary.bytes_in += emit.len() as u64;
                    sinks.on_recv(&emit);
                    if let Err(e) = local_out.write_all(&emit).await {
                        break Err(e.into());
                    }
                    if let Err(e) = local_out.flush().await {
                        break Err(e.into());
                    }
                }
            }

            r = local_in.read(&mut lbuf), if !opts.recv_only && !local_eof => {
                let n = match r {
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                if n == 0 {
                    local_eof = true;
                    debug!("local EOF after {} bytes out", summary.bytes_out);
                    if opts.close_on_eof || opts.send_only {
                        if let Err(e) = wr.shutdown().await {
                            break Err(e.into());
                        }
                        if opts.send_only {
                            break Ok(());
                        }
                        break drain_remote(
                            &mut rd,
                            &mut local_out,
                            telnet.as_mut(),
                            sinks,
                            &mut summary,
                            opts.wait_time_ms,
                        )
                        .await;
                    }
                    // Without close-on-eof: keep relaying remote → local.
                    continue;
                }
                last_activity = Instant::now();
                let mut chunk = lbuf[..n].to_vec();
                if opts.crlf {
                    chunk = crlf_transform(&chunk);
                }
                if let Some(codec) = telnet.as_ref() {
                    let mut escaped = Vec::with_capacity(chunk.len());
                    codec.encode(&chunk, &mut escaped);
                    chunk = escaped;
                }
                if opts.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(opts.delay_ms as u64)).await;
                }
                if let Err(e) = wr.write_all(&chunk).await {
                    break Err(e.into());
                }
                summary.bytes_out += chunk.len() as u64;
                sinks.on_send(&chunk);
            }

            _ = tokio::time::sleep_until(idle_deadline), if opts.idle_timeout_ms > 0 => {
                debug!("idle timeout after {} ms", opts.idle_timeout_ms);
                break Ok(());
            }

            _ = shutdown.wait() => {
                break Ok(());
            }
        }
    };

    let _ = local_out.flush().await;
    conn = rd.unsplit(wr);
    conn.close_with_cleanup().await;
    result.map(|_| summary)
}

/// After a half-close, keep emitting remote data for up to `wait_ms`.
async fn drain_remote<W>(
    rd: &mut tokio::io::ReadHalf<Connection>,
    local_out: &mut W,
    mut telnet: Option<&mut TelnetCodec>,
    sinks: &mut Sinks,
    summary: &mut TransferSummary,
    wait_ms: i64,
) -> Result<(), ConnError>
where
    W: AsyncWrite + Unpin,
{
    if wait_ms <= 0 {
        return Ok(());
    }
    let deadline = Instant::now() + Duration::from_millis(wait_ms as u64);
    let mut buf = vec![0u8; IO_BUF];
    loop {
        let n = match tokio::time::timeout_at(deadline, rd.read(&mut buf)).await {
            Err(_) => return Ok(()),
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
        };
        let emit = match telnet.as_deref_mut() {
            Some(codec) => {
                let mut data = Vec::with_capacity(n);
                let mut ignored_replies = Vec::new();
                codec.decode(&buf[..n], &mut data, &mut ignored_replies);
                data
            }
            None => buf[..n].to_vec(),
        };
        if !emit.is_empty() {
            summary.bytes_in += emit.len() as u64;
            sinks.on_recv(&emit);
            local_out.write_all(&emit).await?;
            local_out.flush().await?;
        }
    }
}
