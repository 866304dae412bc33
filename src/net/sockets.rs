//! Socket setup and address resolution.
//!
//! Listeners are built through `socket2` so `SO_REUSEADDR`, `SO_REUSEPORT`
//! and `IPV6_V6ONLY` can be set before bind; outbound sockets use
//! `tokio::net::TcpSocket` which exposes source binds directly. Readiness
//! multiplexing itself is the runtime's job.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

/// Safe simultaneous-client ceiling on platforms whose fallback readiness
/// primitive is select() with a fixed FD_SETSIZE.
pub const SELECT_SAFE_CLIENT_CAP: usize = 20;

/// Warn when the configured client limit exceeds what select()-bound
/// platforms can actually service.
pub fn warn_client_cap(max_clients: usize) {
    if max_clients <= SELECT_SAFE_CLIENT_CAP {
        return;
    }
    if cfg!(windows) {
        warn!(
            "max_clients {} exceeds the platform-safe cap of {}; \
             connections beyond the cap may be starved",
            max_clients, SELECT_SAFE_CLIENT_CAP
        );
    } else {
        debug!("max_clients {} (native polling, no platform cap)", max_clients);
    }
}

/// Build a TCP listener with reuse options applied before bind.
///
/// `v6_only` matters for the dual-stack pair: the `::` listener must not
/// steal the IPv4 traffic that the `0.0.0.0` listener owns.
pub fn listen_tcp(addr: SocketAddr, v6_only: bool) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(v6_only)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}

/// The listen addresses implied by the configuration: two wildcard
/// listeners when neither family is forced and no bind host was given,
/// one socket otherwise.
pub fn listen_addrs(
    bind_host: Option<IpAddr>,
    port: u16,
    ipv4_only: bool,
    ipv6_only: bool,
) -> Vec<SocketAddr> {
    match bind_host {
        Some(ip) => vec![SocketAddr::new(ip, port)],
        None if ipv4_only => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)],
        None if ipv6_only => vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)],
        None => vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ],
    }
}

/// Connect with an optional source bind and a connect deadline.
/// `timeout_ms <= 0` waits indefinitely.
pub async fn connect_tcp(
    target: SocketAddr,
    source_addr: Option<IpAddr>,
    source_port: Option<u16>,
    timeout_ms: i64,
) -> io::Result<TcpStream> {
    let socket = if target.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };

    if source_addr.is_some() || source_port.is_some() {
        let ip = source_addr.unwrap_or(if target.is_ipv6() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let bind = SocketAddr::new(ip, source_port.unwrap_or(0));
        socket.set_reuseaddr(true)?;
        socket.bind(bind)?;
        debug!("bound source address {}", bind);
    }

    let fut = socket.connect(target);
    if timeout_ms > 0 {
        tokio::time::timeout(Duration::from_millis(timeout_ms as u64), fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    } else {
        fut.await
    }
}

/// Resolve `host:port` to candidate addresses, honoring family forcing and
/// `--nodns`. Resolution runs on the blocking pool; getaddrinfo has no
/// async form.
pub async fn resolve(
    host: &str,
    port: u16,
    ipv4_only: bool,
    ipv6_only: bool,
    nodns: bool,
) -> io::Result<Vec<SocketAddr>> {
    // Numeric addresses never touch the resolver.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return filter_family(vec![SocketAddr::new(ip, port)], ipv4_only, ipv6_only);
    }
    if nodns {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{host}: not a numeric address and --nodns is set"),
        ));
    }

    let lookup = format!("{host}:{port}");
    let addrs = tokio::task::spawn_blocking(move || -> io::Result<Vec<SocketAddr>> {
        Ok(lookup.to_socket_addrs()?.collect())
    })
    .await
    .map_err(|e| io::Error::other(e.to_string()))??;

    debug!("resolved {} to {} addresses", host, addrs.len());
    filter_family(addrs, ipv4_only, ipv6_only)
}

fn filter_family(
    mut addrs: Vec<SocketAddr>,
    ipv4_only: bool,
    ipv6_only: bool,
) -> io::Result<Vec<SocketAddr>> {
    if ipv4_only {
        addrs.retain(|a| a.is_ipv4());
    } else if ipv6_only {
        addrs.retain(|a| a.is_ipv6());
    }
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no usable address for the requested family",
        ));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dual_stack_default() {
        let addrs = listen_addrs(None, 9000, false, false);
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());
    }

    #[test]
    fn test_single_socket_when_family_forced() {
        assert_eq!(listen_addrs(None, 9000, true, false).len(), 1);
        assert_eq!(listen_addrs(None, 9000, false, true).len(), 1);
    }

    #[test]
    fn test_single_socket_with_bind_host() {
        let addrs = listen_addrs(Some("::1".parse().unwrap()), 9000, false, false);
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv6());
    }

    #[tokio::test]
    async fn test_resolve_numeric_skips_dns() {
        let addrs = resolve("127.0.0.1", 80, false, false, true).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_nodns_rejects_hostname() {
        let err = resolve("localhost", 80, false, false, true).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_family_filter() {
        let addrs = resolve("127.0.0.1", 80, false, true, false).await;
        assert!(addrs.is_err());
    }

    #[tokio::test]
    async fn test_listener_binds_ephemeral() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
