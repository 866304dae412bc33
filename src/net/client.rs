//! Client connect path: direct, proxied, TLS, UDP, Unix and zero-I/O.
//!
//! Connection establishment is layered in the proxy-then-TLS order: the
//! proxy tunnel carries the TLS handshake, which carries user bytes.

use crate::config::{Config, ProxyConfig, ProxyDns, ProxyKind, Transport};
use crate::error::{CatError, Result};
use crate::net::connection::Connection;
use crate::net::proxy::{self, ProxyTarget};
use crate::net::sockets;
use crate::net::tls;
use crate::net::transfer::{self, TransferContext, TransferOpts, idle_policy};
use crate::net::udp::{self, UdpClientOpts};
#[cfg(unix)]
use crate::net::unixsock;
use crate::net::dtls;
use crate::sink::Sinks;
use crate::types::{Shutdown, stdin_is_tty};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

pub async fn run_connect(cfg: &Config, shutdown: Arc<Shutdown>) -> Result<()> {
    match cfg.transport {
        Transport::Tcp => connect_stream(cfg, shutdown).await,
        Transport::Udp => connect_udp(cfg, shutdown).await,
        #[cfg(unix)]
        Transport::Unix => connect_unix(cfg, shutdown).await,
        #[cfg(not(unix))]
        Transport::Unix => Err(CatError::Config(
            "-U: unix sockets are unavailable on this platform".into(),
        )),
        Transport::Dtls => connect_dtls(cfg, shutdown).await,
        Transport::Sctp => Err(CatError::SctpUnsupported),
    }
}

fn transfer_opts(cfg: &Config) -> TransferOpts {
    TransferOpts {
        send_only: cfg.send_only,
        recv_only: cfg.recv_only,
        close_on_eof: cfg.close_on_eof,
        crlf: cfg.crlf,
        telnet: cfg.telnet,
        delay_ms: cfg.delay_ms,
        wait_time_ms: cfg.wait_time_ms,
        idle_timeout_ms: idle_policy(
            TransferContext::Client,
            cfg.idle_timeout_ms,
            stdin_is_tty(),
        ),
    }
}

async fn connect_stream(cfg: &Config, shutdown: Arc<Shutdown>) -> Result<()> {
    let host = cfg.host.as_deref().expect("validated");
    let (stream, preread) = match &cfg.proxy {
        Some(p) => establish_via_proxy(cfg, p, host).await?,
        None => (direct_connect(cfg, host).await?, Vec::new()),
    };

    if cfg.zero_io {
        info!("connection to {}:{} succeeded", host, cfg.port);
        return Ok(());
    }

    let conn = if cfg.tls.enabled {
        tls::connect_tls(stream, host, &cfg.tls).await?
    } else {
        Connection::Plain(stream)
    };

    if cfg.exec.is_active() {
        use crate::net::exec::{self, ExecSession};
        exec::check_security(false, true, cfg.allow_dangerous, cfg.require_allow_with_exec)?;
        let session = ExecSession::spawn(&cfg.exec)?;
        let status = session.bridge(conn, &shutdown, cfg.telnet).await?;
        info!("child exited with {}", status);
        return Ok(());
    }

    let mut sinks = Sinks::from_config(cfg)?;
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let summary = transfer::run(
        conn,
        stdin,
        stdout,
        &transfer_opts(cfg),
        &mut sinks,
        &shutdown,
        preread,
    )
    .await?;
    debug!(
        "session done ({} in / {} out)",
        summary.bytes_in, summary.bytes_out
    );
    Ok(())
}

/// Try every resolved address until one connects.
async fn direct_connect(cfg: &Config, host: &str) -> Result<TcpStream> {
    let addrs = resolve_target(cfg, host, cfg.port).await?;
    let mut last_err: Option<CatError> = None;
    for addr in addrs {
        match sockets::connect_tcp(
            addr,
            cfg.source_addr,
            cfg.source_port,
            cfg.connect_timeout_ms,
        )
        .await
        {
            Ok(stream) => {
                info!("connected to {}", addr);
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                last_err = Some(CatError::ConnectTimeout);
            }
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e.into());
            }
        }
    }
    Err(last_err.unwrap_or(CatError::ConnectTimeout))
}

async fn resolve_target(cfg: &Config, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    sockets::resolve(host, port, cfg.ipv4_only, cfg.ipv6_only, cfg.nodns)
        .await
        .map_err(|source| CatError::Resolution {
            host: host.to_string(),
            source,
        })
}

/// Connect to the proxy, run the protocol negotiation, and return the
/// tunneled stream plus any early bytes the proxy handed over.
async fn establish_via_proxy(
    cfg: &Config,
    p: &ProxyConfig,
    host: &str,
) -> Result<(TcpStream, Vec<u8>)> {
    let (proxy_host, proxy_port) = split_host_port(&p.addr)?;
    let proxy_addrs = resolve_target(cfg, &proxy_host, proxy_port).await?;

    let mut stream = {
        let mut last_err: Option<CatError> = None;
        let mut connected = None;
        for addr in proxy_addrs {
            match sockets::connect_tcp(
                addr,
                cfg.source_addr,
                cfg.source_port,
                cfg.connect_timeout_ms,
            )
            .await
            {
                Ok(s) => {
                    connected = Some(s);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    last_err = Some(CatError::ConnectTimeout)
                }
                Err(e) => last_err = Some(e.into()),
            }
        }
        connected.ok_or_else(|| last_err.unwrap_or(CatError::ConnectTimeout))?
    };
    debug!("connected to {} proxy at {}", proxy_kind_name(p.kind), p.addr);

    let target = proxy_target(cfg, p, host).await?;
    let auth = p.auth.as_ref().map(|(u, pw)| (u.as_str(), pw.as_str()));

    let preread = match p.kind {
        ProxyKind::Http => proxy::http_connect(&mut stream, &target, auth).await?,
        ProxyKind::Socks5 => {
            proxy::socks5_connect(&mut stream, &target, auth).await?;
            Vec::new()
        }
        ProxyKind::Socks4 => {
            let resolved: Vec<IpAddr> = match &target {
                ProxyTarget::Domain(h, _) => resolve_target(cfg, h, cfg.port)
                    .await?
                    .into_iter()
                    .map(|a| a.ip())
                    .collect(),
                ProxyTarget::Addr(a) => vec![a.ip()],
            };
            let v4 = proxy::socks4_target(&target, &resolved)?;
            let user_id = auth.map(|(u, _)| u).unwrap_or("");
            proxy::socks4_connect(&mut stream, v4, cfg.port, user_id).await?;
            Vec::new()
        }
    };

    info!("proxy tunnel to {}:{} established", host, cfg.port);
    Ok((stream, preread))
}

/// Where the target hostname gets resolved, per `--proxy-dns`.
async fn proxy_target(cfg: &Config, p: &ProxyConfig, host: &str) -> Result<ProxyTarget> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ProxyTarget::Addr(SocketAddr::new(ip, cfg.port)));
    }
    match p.dns {
        ProxyDns::None => Err(CatError::DnsDisabled(format!("proxy target {host}"))),
        ProxyDns::Local => {
            let addrs = resolve_target(cfg, host, cfg.port).await?;
            Ok(ProxyTarget::Addr(addrs[0]))
        }
        ProxyDns::Remote | ProxyDns::Both => {
            if p.kind == ProxyKind::Socks4 {
                // SOCKS4 has no domain addressing; fall back to local.
                warn!("SOCKS4 cannot resolve remotely; resolving {} locally", host);
            }
            Ok(ProxyTarget::Domain(host.to_string(), cfg.port))
        }
    }
}

fn proxy_kind_name(kind: ProxyKind) -> &'static str {
    match kind {
        ProxyKind::Http => "HTTP",
        ProxyKind::Socks4 => "SOCKS4",
        ProxyKind::Socks5 => "SOCKS5",
    }
}

pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // Bracketed IPv6 first, then the trailing-colon form.
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| CatError::Config(format!("--proxy: malformed address '{addr}'")))?;
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| CatError::Config(format!("--proxy: missing port in '{addr}'")))?;
        return Ok((host.to_string(), port));
    }
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| CatError::Config(format!("--proxy: missing port in '{addr}'")))?;
    let port = port
        .parse()
        .map_err(|_| CatError::Config(format!("--proxy: invalid port in '{addr}'")))?;
    Ok((host.to_string(), port))
}

async fn connect_udp(cfg: &Config, shutdown: Arc<Shutdown>) -> Result<()> {
    let host = cfg.host.as_deref().expect("validated");
    let addrs = resolve_target(cfg, host, cfg.port).await?;
    let target = addrs[0];

    let bind_ip = cfg.source_addr.unwrap_or(if target.is_ipv6() {
        IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
    });
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, cfg.source_port.unwrap_or(0))).await?;
    socket.connect(target).await?;
    info!("UDP peer {}", target);

    if cfg.zero_io {
        return Ok(());
    }

    let opts = UdpClientOpts {
        send_only: cfg.send_only,
        recv_only: cfg.recv_only,
        crlf: cfg.crlf,
        delay_ms: cfg.delay_ms,
        idle_timeout_ms: idle_policy(
            TransferContext::Client,
            cfg.idle_timeout_ms,
            stdin_is_tty(),
        ),
    };
    let mut sinks = Sinks::from_config(cfg)?;
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    udp::run_client(socket, &opts, stdin, stdout, &mut sinks, &shutdown).await?;
    Ok(())
}

#[cfg(unix)]
async fn connect_unix(cfg: &Config, shutdown: Arc<Shutdown>) -> Result<()> {
    let path = cfg
        .unix_path
        .as_ref()
        .ok_or_else(|| CatError::Config("-U: socket path missing".into()))?;
    let stream = unixsock::connect(path).await?;
    info!("connected to unix socket {}", path.display());

    if cfg.zero_io {
        return Ok(());
    }

    let conn = Connection::Unix(stream, None);
    let mut sinks = Sinks::from_config(cfg)?;
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    transfer::run(
        conn,
        stdin,
        stdout,
        &transfer_opts(cfg),
        &mut sinks,
        &shutdown,
        Vec::new(),
    )
    .await?;
    Ok(())
}

/// DTLS needs a datagram-security provider; none ships by default.
async fn connect_dtls(cfg: &Config, shutdown: Arc<Shutdown>) -> Result<()> {
    let host = cfg.host.as_deref().expect("validated");
    let addrs = resolve_target(cfg, host, cfg.port).await?;
    let target = addrs[0];
    let provider = dtls::default_provider()?;

    let bind_ip = if target.is_ipv6() {
        IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
    };
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
    socket.connect(target).await?;

    let mut session = dtls::DtlsSession::connect(socket, provider, cfg.dtls_mtu).await?;
    info!("DTLS connected to {} ({} retransmits)", target, session.retransmits());

    let mut sinks = Sinks::from_config(cfg)?;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut in_buf = vec![0u8; cfg.dtls_mtu];
    let mut out_buf = Vec::new();

    loop {
        if shutdown.is_requested() {
            break;
        }
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        tokio::select! {
            r = session.read_datagram(&mut out_buf), if !cfg.send_only => {
                let n = r?;
                sinks.on_recv(&out_buf[..n]);
                stdout.write_all(&out_buf[..n]).await?;
                stdout.flush().await?;
            }
            r = stdin.read(&mut in_buf), if !cfg.recv_only => {
                let n = r?;
                if n == 0 {
                    break;
                }
                sinks.on_send(&in_buf[..n]);
                session.write_datagram(&in_buf[..n]).await?;
            }
            _ = shutdown.wait() => break,
        }
    }
    session.close().await;
    Ok(())
}
