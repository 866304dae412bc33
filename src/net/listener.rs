//! Listener runtime: accept loops, the access gate, per-connection
//! dispatch into the transfer, exec, or relay engines.
//!
//! Dual-stack listening binds two sockets and accepts from whichever is
//! ready. Access control runs before any user byte is read. Workers are
//! detached tasks bounded by `max_conns`; with `max_conns == 0` handlers
//! run inline on the accept loop.

use crate::config::{Config, Transport};
use crate::error::{CatError, Result};
use crate::net::access::AccessList;
use crate::net::broker::{Relay, RelayConfig};
use crate::net::connection::Connection;
use crate::net::exec::ExecSession;
use crate::net::sockets;
use crate::net::tls;
use crate::net::transfer::{self, TransferContext, TransferOpts, idle_policy};
use crate::net::udp::{self, UdpServerOpts};
#[cfg(unix)]
use crate::net::unixsock;
use crate::net::{dtls, exec};
use crate::sink::Sinks;
use crate::types::{Shutdown, stdin_is_tty};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct ServerStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
}

pub struct Server {
    cfg: Arc<Config>,
    access: Arc<AccessList>,
    shutdown: Arc<Shutdown>,
    stats: Arc<ServerStats>,
    /// After the first connection, per-connection sinks reopen the output
    /// file in append mode so sessions do not clobber each other.
    sink_used: Arc<AtomicBool>,
}

impl Server {
    pub fn new(cfg: Arc<Config>, access: Arc<AccessList>, shutdown: Arc<Shutdown>) -> Self {
        Self {
            cfg,
            access,
            shutdown,
            stats: Arc::new(ServerStats::default()),
            sink_used: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub async fn run(&self) -> Result<()> {
        if self.cfg.exec.is_active() && self.cfg.transport != Transport::Udp {
            exec::check_security(
                true,
                self.access.allow_is_empty(),
                self.cfg.allow_dangerous,
                self.cfg.require_allow_with_exec,
            )?;
        }
        match self.cfg.transport {
            Transport::Tcp => self.run_tcp().await,
            Transport::Udp => self.run_udp().await,
            #[cfg(unix)]
            Transport::Unix => self.run_unix().await,
            #[cfg(not(unix))]
            Transport::Unix => Err(CatError::Config(
                "-U: unix sockets are unavailable on this platform".into(),
            )),
            Transport::Dtls => self.run_dtls().await,
            Transport::Sctp => Err(CatError::SctpUnsupported),
        }
    }

    /// Resolve the bind address(es): an explicit host gets exactly one
    /// socket, otherwise the family flags decide and the default is the
    /// dual-stack wildcard pair.
    async fn bind_addrs(&self) -> Result<Vec<SocketAddr>> {
        match &self.cfg.host {
            Some(host) => {
                let addrs = sockets::resolve(
                    host,
                    self.cfg.port,
                    self.cfg.ipv4_only,
                    self.cfg.ipv6_only,
                    self.cfg.nodns,
                )
                .await
                .map_err(|source| CatError::Resolution {
                    host: host.clone(),
                    source,
                })?;
                Ok(vec![addrs[0]])
            }
            None => Ok(sockets::listen_addrs(
                None,
                self.cfg.port,
                self.cfg.ipv4_only,
                self.cfg.ipv6_only,
            )),
        }
    }

    async fn run_tcp(&self) -> Result<()> {
        let addrs = self.bind_addrs().await?;
        let dual = addrs.len() == 2;
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            let listener = sockets::listen_tcp(*addr, dual && addr.is_ipv6())?;
            info!("listening on {}", listener.local_addr()?);
            listeners.push(listener);
        }

        if let Some(user) = &self.cfg.drop_user {
            drop_privileges(user)?;
        }

        let acceptor = match self.cfg.tls.enabled {
            true => Some(tls::build_acceptor(&self.cfg.tls)?),
            false => None,
        };

        let relay_tx = self.start_relay();
        let workers = (self.cfg.max_conns > 0)
            .then(|| Arc::new(Semaphore::new(self.cfg.max_conns)));

        loop {
            if self.shutdown.is_requested() {
                break;
            }
            let Some((stream, peer)) = self.accept_one(&listeners).await? else {
                break;
            };

            // Access control comes before any user byte is read.
            if !self.access.evaluate(peer.ip()).await {
                self.stats.rejected.fetch_add(1, Ordering::SeqCst);
                info!("rejected {} (access list)", peer);
                drop(stream);
                continue;
            }
            self.stats.accepted.fetch_add(1, Ordering::SeqCst);
            debug!("accepted {}", peer);

            let conn = match &acceptor {
                Some(a) => match tls::accept_with(a, stream).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("TLS accept from {} failed: {}", peer, e);
                        continue;
                    }
                },
                None => Connection::Plain(stream),
            };

            if let Some(rtx) = &relay_tx {
                // Relay mode: the reactor owns the connection from here.
                if rtx.send(conn).await.is_err() {
                    break;
                }
                continue;
            }

            if self.cfg.keep_listening {
                if let Some(sem) = &workers {
                    let permit = sem
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("worker semaphore closed");
                    let cfg = self.cfg.clone();
                    let shutdown = self.shutdown.clone();
                    let sink_used = self.sink_used.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_conn(conn, cfg, shutdown, sink_used, TransferContext::TcpServer)
                            .await;
                    });
                } else {
                    self.handle_inline(conn, TransferContext::TcpServer).await;
                }
                continue;
            }

            self.handle_inline(conn, TransferContext::TcpServer).await;
            break;
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn run_unix(&self) -> Result<()> {
        let path = self
            .cfg
            .unix_path
            .clone()
            .ok_or_else(|| CatError::Config("-U: socket path missing".into()))?;
        let listener = unixsock::bind_listener(&path)?;
        info!("listening on unix socket {}", path.display());
        if let Some(user) = &self.cfg.drop_user {
            drop_privileges(user)?;
        }

        let relay_tx = self.start_relay();

        loop {
            if self.shutdown.is_requested() {
                break;
            }
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = sleep_accept_timeout(self.cfg.accept_timeout_ms) => break,
                _ = self.shutdown.wait() => break,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("transient accept error: {}", e);
                    continue;
                }
                Err(e) => {
                    drop(listener);
                    unixsock::cleanup(&path);
                    return Err(e.into());
                }
            };
            self.stats.accepted.fetch_add(1, Ordering::SeqCst);
            let conn = Connection::Unix(stream, None);

            if let Some(rtx) = &relay_tx {
                if rtx.send(conn).await.is_err() {
                    break;
                }
                continue;
            }

            self.handle_inline(conn, TransferContext::UnixServer).await;
            if !self.cfg.keep_listening {
                break;
            }
        }

        drop(listener);
        unixsock::cleanup(&path);
        Ok(())
    }

    async fn run_udp(&self) -> Result<()> {
        if self.cfg.exec.is_active() {
            warn!("exec mode is not supported over UDP; serving without it");
        }
        let addr = self.bind_addrs().await?[0];
        let socket = UdpSocket::bind(addr).await?;
        if let Some(user) = &self.cfg.drop_user {
            drop_privileges(user)?;
        }
        let opts = UdpServerOpts {
            recv_only: self.cfg.recv_only,
            keep_listening: self.cfg.keep_listening,
            idle_timeout_ms: idle_policy(
                TransferContext::UdpServer,
                self.cfg.idle_timeout_ms,
                stdin_is_tty(),
            ),
        };
        let mut sinks = self.open_sinks();
        let mut stdout = tokio::io::stdout();
        udp::run_server(socket, &opts, &mut stdout, &mut sinks, &self.shutdown).await?;
        Ok(())
    }

    /// DTLS serving needs a datagram-security provider; none ships by
    /// default, so this reports the backend as unavailable.
    async fn run_dtls(&self) -> Result<()> {
        let addr = self.bind_addrs().await?[0];
        let socket = UdpSocket::bind(addr).await?;
        let provider = dtls::default_provider()?;

        // Peer the socket to the first client so the handshake can run.
        let mut probe = [0u8; 1];
        let (_, peer) = socket.peek_from(&mut probe).await?;
        socket.connect(peer).await?;
        let mut session =
            DtlsServerSession::handshake(socket, provider, self.cfg.dtls_mtu).await?;
        session.serve(self).await
    }

    /// Accept with dual-listener readiness, the accept timeout, and
    /// transient-error retry.
    async fn accept_one(
        &self,
        listeners: &[TcpListener],
    ) -> Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            let second = listeners.get(1);
            let accepted = tokio::select! {
                r = listeners[0].accept() => r,
                r = async { second.unwrap().accept().await }, if second.is_some() => r,
                _ = sleep_accept_timeout(self.cfg.accept_timeout_ms) => return Ok(None),
                _ = self.shutdown.wait() => return Ok(None),
            };
            match accepted {
                Ok(pair) => return Ok(Some(pair)),
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("transient accept error: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Spin up the relay reactor when broker/chat mode is on.
    fn start_relay(&self) -> Option<mpsc::Sender<Connection>> {
        if !self.cfg.relay_active() {
            return None;
        }
        sockets::warn_client_cap(self.cfg.max_clients);
        let relay = Relay::new(RelayConfig {
            chat: self.cfg.chat,
            max_clients: self.cfg.max_clients,
            max_nickname_len: self.cfg.chat_max_nickname_len,
            max_message_len: self.cfg.chat_max_message_len,
            idle_timeout_ms: self.cfg.idle_timeout_ms,
        });
        let (tx, rx) = mpsc::channel(32);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { relay.run(rx, shutdown).await });
        info!(
            "{} relay ready (max {} clients)",
            if self.cfg.chat { "chat" } else { "broker" },
            self.cfg.max_clients
        );
        Some(tx)
    }

    async fn handle_inline(&self, conn: Connection, ctx: TransferContext) {
        handle_conn(
            conn,
            self.cfg.clone(),
            self.shutdown.clone(),
            self.sink_used.clone(),
            ctx,
        )
        .await;
    }

    fn open_sinks(&self) -> Sinks {
        open_sinks(&self.cfg, &self.sink_used)
    }
}

/// DTLS per-session plumbing, separated so the handshake can be driven by
/// a provider in tests even though none ships in the default build.
struct DtlsServerSession {
    session: dtls::DtlsSession,
}

impl DtlsServerSession {
    async fn handshake(
        socket: UdpSocket,
        provider: Box<dyn dtls::DatagramProvider>,
        mtu: usize,
    ) -> Result<Self> {
        let session = dtls::DtlsSession::accept(socket, provider, mtu).await?;
        Ok(Self { session })
    }

    async fn serve(&mut self, server: &Server) -> Result<()> {
        let mut sinks = server.open_sinks();
        let mut stdout = tokio::io::stdout();
        let mut buf = Vec::new();
        loop {
            if server.shutdown.is_requested() {
                break;
            }
            tokio::select! {
                r = self.session.read_datagram(&mut buf) => {
                    let n = r?;
                    sinks.on_recv(&buf[..n]);
                    use tokio::io::AsyncWriteExt;
                    stdout.write_all(&buf[..n]).await.map_err(CatError::Io)?;
                    stdout.flush().await.map_err(CatError::Io)?;
                    if !server.cfg.recv_only {
                        self.session.write_datagram(&buf[..n]).await?;
                    }
                }
                _ = server.shutdown.wait() => break,
            }
        }
        self.session.close().await;
        Ok(())
    }
}

/// Drop to the named user after binding (possibly privileged) sockets.
#[cfg(unix)]
fn drop_privileges(user: &str) -> Result<()> {
    let name = std::ffi::CString::new(user)
        .map_err(|_| CatError::Policy(format!("--user: invalid name '{user}'")))?;
    unsafe {
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            return Err(CatError::Policy(format!("--user: unknown user '{user}'")));
        }
        if libc::setgid((*pw).pw_gid) != 0 || libc::setuid((*pw).pw_uid) != 0 {
            return Err(CatError::Policy(format!(
                "--user: cannot drop privileges to '{user}': {}",
                io::Error::last_os_error()
            )));
        }
    }
    info!("dropped privileges to {}", user);
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(user: &str) -> Result<()> {
    let _ = user;
    Err(CatError::Policy(
        "--user: privilege dropping is unavailable on this platform".into(),
    ))
}

/// Accept-timeout future: pending forever when disabled.
async fn sleep_accept_timeout(accept_timeout_ms: i64) {
    if accept_timeout_ms > 0 {
        tokio::time::sleep(Duration::from_millis(accept_timeout_ms as u64)).await;
    } else {
        std::future::pending::<()>().await;
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::WouldBlock
    )
}

fn open_sinks(cfg: &Config, used: &AtomicBool) -> Sinks {
    let mut cfg_view = cfg.clone();
    if used.swap(true, Ordering::SeqCst) {
        cfg_view.append_output = true;
    }
    match Sinks::from_config(&cfg_view) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot open output sinks: {}", e);
            Sinks::disabled()
        }
    }
}

/// Per-connection handler: owns the connection, sets up sinks, and runs
/// the exec bridge or the transfer engine.
async fn handle_conn(
    conn: Connection,
    cfg: Arc<Config>,
    shutdown: Arc<Shutdown>,
    sink_used: Arc<AtomicBool>,
    ctx: TransferContext,
) {
    let peer = conn.peer_desc();
    let mut sinks = open_sinks(&cfg, &sink_used);

    if cfg.exec.is_active() {
        let session = match ExecSession::spawn(&cfg.exec) {
            Ok(s) => s,
            Err(e) => {
                warn!("exec setup for {} failed: {}", peer, e);
                let mut conn = conn;
                conn.close().await;
                return;
            }
        };
        match session.bridge(conn, &shutdown, cfg.telnet).await {
            Ok(status) => info!("{}: child exited with {}", peer, status),
            Err(e) => warn!("{}: exec bridge failed: {}", peer, e),
        }
        return;
    }

    let opts = TransferOpts {
        send_only: cfg.send_only,
        recv_only: cfg.recv_only,
        close_on_eof: cfg.close_on_eof,
        crlf: cfg.crlf,
        telnet: cfg.telnet,
        delay_ms: cfg.delay_ms,
        wait_time_ms: cfg.wait_time_ms,
        idle_timeout_ms: idle_policy(ctx, cfg.idle_timeout_ms, stdin_is_tty()),
    };
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    match transfer::run(conn, stdin, stdout, &opts, &mut sinks, &shutdown, Vec::new()).await {
        Ok(summary) => info!(
            "{}: session done ({} in / {} out)",
            peer, summary.bytes_in, summary.bytes_out
        ),
        Err(e) => warn!("{}: transfer failed: {}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    fn server_cfg(port: u16) -> Config {
        Config {
            mode: Mode::Listen,
            port,
            ipv4_only: true,
            keep_listening: true,
            ..Config::default()
        }
    }

    fn build(cfg: Config, allow: &[&str], deny: &[&str]) -> (Server, Arc<Shutdown>) {
        let access = AccessList::new(
            allow.iter().map(|r| r.parse().unwrap()).collect(),
            deny.iter().map(|r| r.parse().unwrap()).collect(),
        );
        let shutdown = Shutdown::new();
        let server = Server::new(Arc::new(cfg), Arc::new(access), shutdown.clone());
        (server, shutdown)
    }

    #[tokio::test]
    async fn test_denied_peer_closed_before_any_read() {
        let cfg = {
            let mut c = server_cfg(0);
            c.broker = true;
            c.max_clients = 4;
            c
        };
        // 127.0.0.1 denied: connection must be closed without reading.
        let (server, shutdown) = build(cfg, &[], &["127.0.0.1"]);
        let stats = server.stats();

        // Bind manually to learn the port, then run the accept loop.
        let listener = sockets::listen_tcp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = listener.local_addr().unwrap();
        let sd = shutdown.clone();
        let loop_task = tokio::spawn(async move {
            let listeners = vec![listener];
            loop {
                let Ok(Some((stream, peer))) = server.accept_one(&listeners).await else {
                    break;
                };
                if !server.access.evaluate(peer.ip()).await {
                    server.stats.rejected.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                    continue;
                }
                server.stats.accepted.fetch_add(1, Ordering::SeqCst);
            }
        });

        use tokio::io::AsyncReadExt;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("expected prompt close")
            .unwrap();
        assert_eq!(n, 0);

        // Give the counter a moment.
        for _ in 0..50 {
            if stats.rejected.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.rejected.load(Ordering::SeqCst), 1);
        assert_eq!(stats.accepted.load(Ordering::SeqCst), 0);
        sd.request();
        loop_task.await.unwrap();
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::new(
            io::ErrorKind::Interrupted,
            "EINTR"
        )));
        assert!(is_transient_accept_error(&io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "ECONNABORTED"
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::AddrInUse,
            "EADDRINUSE"
        )));
    }

    #[tokio::test]
    async fn test_accept_timeout_returns_none() {
        let mut cfg = server_cfg(0);
        cfg.accept_timeout_ms = 100;
        let (server, _shutdown) = build(cfg, &[], &[]);
        let listener = sockets::listen_tcp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let start = std::time::Instant::now();
        let r = server.accept_one(&[listener]).await.unwrap();
        assert!(r.is_none());
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
