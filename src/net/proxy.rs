//! Outbound proxy traversal: HTTP CONNECT, SOCKS4 and SOCKS5.
//!
//! All three negotiations share the same contracts: the stream is already
//! connected to the proxy, every read step runs under a deadline, and on
//! success the stream is positioned exactly at the first user byte; no
//! reply bytes are left unconsumed. Each protocol reply code maps to a
//! distinct error kind.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Per-step read deadline during negotiation.
pub const STEP_TIMEOUT_MS: u64 = 30_000;

/// Bound on the HTTP CONNECT response (status line + headers).
pub const MAX_HTTP_RESPONSE: usize = 4096;

/// SOCKS5 reply codes 0x01..=0x08 (RFC 1928 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Reply {
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Other(u8),
}

impl Socks5Reply {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Socks5Reply::GeneralFailure,
            0x02 => Socks5Reply::NotAllowed,
            0x03 => Socks5Reply::NetworkUnreachable,
            0x04 => Socks5Reply::HostUnreachable,
            0x05 => Socks5Reply::ConnectionRefused,
            0x06 => Socks5Reply::TtlExpired,
            0x07 => Socks5Reply::CommandNotSupported,
            0x08 => Socks5Reply::AddressTypeNotSupported,
            other => Socks5Reply::Other(other),
        }
    }
}

impl std::fmt::Display for Socks5Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Socks5Reply::GeneralFailure => "general SOCKS server failure",
            Socks5Reply::NotAllowed => "connection not allowed by ruleset",
            Socks5Reply::NetworkUnreachable => "network unreachable",
            Socks5Reply::HostUnreachable => "host unreachable",
            Socks5Reply::ConnectionRefused => "connection refused by destination",
            Socks5Reply::TtlExpired => "TTL expired",
            Socks5Reply::CommandNotSupported => "command not supported",
            Socks5Reply::AddressTypeNotSupported => "address type not supported",
            Socks5Reply::Other(code) => return write!(f, "SOCKS5 reply code {code:#04x}"),
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy closed the connection during negotiation")]
    UnexpectedEof,

    #[error("proxy negotiation timed out")]
    Timeout,

    #[error("malformed proxy response: {0}")]
    Malformed(String),

    #[error("HTTP proxy returned status {0}")]
    HttpStatus(u16),

    #[error("HTTP proxy response exceeds {MAX_HTTP_RESPONSE} bytes")]
    HttpResponseTooLarge,

    #[error("SOCKS4 request rejected or failed (code {0})")]
    Socks4Rejected(u8),

    #[error("SOCKS5: {0}")]
    Socks5(Socks5Reply),

    #[error("proxy authentication failed")]
    AuthFailed,

    #[error("proxy accepted none of our authentication methods")]
    NoAcceptableAuth,

    #[error("SOCKS4 supports IPv4 targets only")]
    Socks4RequiresIpv4,

    #[error("target hostname exceeds 255 bytes")]
    DomainTooLong,

    #[error("io error during proxy negotiation: {0}")]
    Io(#[from] io::Error),
}

/// Destination as sent to the proxy: either an already-resolved address or
/// a domain for proxy-side resolution (`--proxy-dns remote`).
#[derive(Debug, Clone)]
pub enum ProxyTarget {
    Addr(SocketAddr),
    Domain(String, u16),
}

impl ProxyTarget {
    pub fn host_string(&self) -> String {
        match self {
            ProxyTarget::Addr(a) => a.ip().to_string(),
            ProxyTarget::Domain(h, _) => h.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ProxyTarget::Addr(a) => a.port(),
            ProxyTarget::Domain(_, p) => *p,
        }
    }
}

async fn step<F, T>(fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::time::timeout(Duration::from_millis(STEP_TIMEOUT_MS), fut)
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(ProxyError::from)
}

async fn read_exact_step<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), ProxyError>
where
    S: AsyncRead + Unpin,
{
    match step(stream.read_exact(buf)).await {
        Ok(_) => Ok(()),
        Err(ProxyError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(ProxyError::UnexpectedEof)
        }
        Err(e) => Err(e),
    }
}

/// HTTP CONNECT (RFC 9110 §9.3.6).
///
/// Scans for the blank line across arbitrarily fragmented reads; the
/// response is bounded at 4 KiB. Returns any bytes the proxy delivered
/// after the headers (early data from the target) for the caller to
/// prepend to its receive stream.
pub async fn http_connect<S>(
    stream: &mut S,
    target: &ProxyTarget,
    auth: Option<(&str, &str)>,
) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hostport = format!("{}:{}", target.host_string(), target.port());
    let mut request = format!("CONNECT {hostport} HTTP/1.1\r\nHost: {hostport}\r\n");
    if let Some((user, pass)) = auth {
        let token = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    step(stream.write_all(request.as_bytes())).await?;

    let mut response: Vec<u8> = Vec::with_capacity(512);
    let header_end = loop {
        if let Some(pos) = find_header_end(&response) {
            break pos;
        }
        if response.len() >= MAX_HTTP_RESPONSE {
            return Err(ProxyError::HttpResponseTooLarge);
        }
        let mut chunk = [0u8; 512];
        let n = step(stream.read(&mut chunk)).await?;
        if n == 0 {
            return Err(ProxyError::UnexpectedEof);
        }
        response.extend_from_slice(&chunk[..n]);
    };

    let status_line = response[..header_end]
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let status_line = std::str::from_utf8(status_line)
        .map_err(|_| ProxyError::Malformed("status line is not UTF-8".into()))?;

    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(ProxyError::Malformed(format!(
            "unexpected status line '{status_line}'"
        )));
    }
    let code: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::Malformed("missing status code".into()))?;
    if code != 200 {
        return Err(ProxyError::HttpStatus(code));
    }

    debug!("HTTP CONNECT to {} established", hostport);
    Ok(response.split_off(header_end + 4))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// SOCKS5 CONNECT (RFC 1928, auth per RFC 1929).
pub async fn socks5_connect<S>(
    stream: &mut S,
    target: &ProxyTarget,
    auth: Option<(&str, &str)>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Stage 1: method selection.
    let methods: &[u8] = if auth.is_some() { &[0x00, 0x02] } else { &[0x00] };
    let mut greeting = vec![0x05, methods.len() as u8];
    greeting.extend_from_slice(methods);
    step(stream.write_all(&greeting)).await?;

    let mut choice = [0u8; 2];
    read_exact_step(stream, &mut choice).await?;
    if choice[0] != 0x05 {
        return Err(ProxyError::Malformed(format!(
            "bad version {:#04x} in method selection",
            choice[0]
        )));
    }

    // Stage 2: username/password subnegotiation when selected.
    match choice[1] {
        0x00 => {}
        0x02 => {
            let (user, pass) = auth.ok_or(ProxyError::NoAcceptableAuth)?;
            if user.len() > 255 || pass.len() > 255 {
                return Err(ProxyError::AuthFailed);
            }
            let mut req = vec![0x01, user.len() as u8];
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            step(stream.write_all(&req)).await?;

            let mut resp = [0u8; 2];
            read_exact_step(stream, &mut resp).await?;
            if resp[1] != 0x00 {
                return Err(ProxyError::AuthFailed);
            }
        }
        0xFF => return Err(ProxyError::NoAcceptableAuth),
        other => {
            return Err(ProxyError::Malformed(format!(
                "proxy selected unknown method {other:#04x}"
            )));
        }
    }

    // Stage 3: CONNECT request.
    let mut request = vec![0x05, 0x01, 0x00];
    match target {
        ProxyTarget::Addr(SocketAddr::V4(a)) => {
            request.push(0x01);
            request.extend_from_slice(&a.ip().octets());
        }
        ProxyTarget::Addr(SocketAddr::V6(a)) => {
            request.push(0x04);
            request.extend_from_slice(&a.ip().octets());
        }
        ProxyTarget::Domain(host, _) => {
            if host.len() > 255 {
                return Err(ProxyError::DomainTooLong);
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    step(stream.write_all(&request)).await?;

    // Stage 4: reply header, then the bound address is consumed fully so
    // the stream is positioned at the first user byte.
    let mut head = [0u8; 4];
    read_exact_step(stream, &mut head).await?;
    if head[0] != 0x05 {
        return Err(ProxyError::Malformed(format!(
            "bad version {:#04x} in reply",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(ProxyError::Socks5(Socks5Reply::from_code(head[1])));
    }
    let bound_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            read_exact_step(stream, &mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(ProxyError::Malformed(format!(
                "unknown ATYP {other:#04x} in reply"
            )));
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    read_exact_step(stream, &mut bound).await?;

    debug!(
        "SOCKS5 CONNECT to {}:{} established",
        target.host_string(),
        target.port()
    );
    Ok(())
}

/// SOCKS4 CONNECT. IPv4 only; the caller resolves the target locally.
pub async fn socks4_connect<S>(
    stream: &mut S,
    addr: Ipv4Addr,
    port: u16,
    user_id: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&addr.octets());
    request.extend_from_slice(user_id.as_bytes());
    request.push(0x00);
    step(stream.write_all(&request)).await?;

    let mut reply = [0u8; 8];
    read_exact_step(stream, &mut reply).await?;
    if reply[1] != 90 {
        return Err(ProxyError::Socks4Rejected(reply[1]));
    }

    debug!("SOCKS4 CONNECT to {}:{} established", addr, port);
    Ok(())
}

/// Pick the SOCKS4 target address: the peer must be (or resolve to) IPv4.
pub fn socks4_target(target: &ProxyTarget, resolved: &[IpAddr]) -> Result<Ipv4Addr, ProxyError> {
    match target {
        ProxyTarget::Addr(SocketAddr::V4(a)) => Ok(*a.ip()),
        ProxyTarget::Addr(SocketAddr::V6(_)) => Err(ProxyError::Socks4RequiresIpv4),
        ProxyTarget::Domain(..) => resolved
            .iter()
            .find_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .ok_or(ProxyError::Socks4RequiresIpv4),
    }
}
