//! Broker/chat relay: one reactor coordinating every client.
//!
//! The listener hands accepted connections in over a channel. Each client
//! gets a dumb reader task and a writer task draining its bounded queue;
//! all policy (admission, the nickname protocol, fan-out, failure sweeps,
//! idle eviction) runs in the single relay loop, which gives per-sender
//! total order and line-atomic chat delivery for free.

use crate::net::connection::Connection;
use crate::net::pool::{CLIENT_QUEUE_DEPTH, ClientPool, ClientRecord};
use crate::types::Shutdown;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Relay coordination events from reader/writer tasks.
enum RelayEvent {
    Data(u64, Vec<u8>),
    Closed(u64),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub chat: bool,
    pub max_clients: usize,
    pub max_nickname_len: usize,
    pub max_message_len: usize,
    /// Idle eviction threshold; <= 0 disables the sweep.
    pub idle_timeout_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Chat mode: waiting for the first line (the nickname).
    Nick,
    Active,
}

struct ClientState {
    phase: Phase,
    line_buf: Vec<u8>,
}

/// Exclusion id that matches no client (ids start at 1): system broadcasts
/// go to everyone.
const NO_SENDER: u64 = 0;

pub struct Relay {
    cfg: RelayConfig,
    pool: Arc<ClientPool>,
}

impl Relay {
    pub fn new(cfg: RelayConfig) -> Self {
        let pool = Arc::new(ClientPool::new(cfg.max_clients));
        Self { cfg, pool }
    }

    /// Shared pool handle (stats, tests).
    pub fn pool(&self) -> Arc<ClientPool> {
        self.pool.clone()
    }

    /// Run until the connection source closes or shutdown is requested.
    pub async fn run(self, mut conns: mpsc::Receiver<Connection>, shutdown: Arc<Shutdown>) {
        let (events_tx, mut events_rx) = mpsc::channel::<RelayEvent>(256);
        let mut states: HashMap<u64, ClientState> = HashMap::new();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_conn = conns.recv() => match maybe_conn {
                    Some(conn) => self.admit(conn, &events_tx, &mut states).await,
                    None => break,
                },

                Some(ev) = events_rx.recv() => match ev {
                    RelayEvent::Data(id, bytes) => {
                        self.on_data(id, bytes, &mut states);
                    }
                    RelayEvent::Closed(id) => {
                        self.remove_client(id, &mut states, true);
                    }
                },

                _ = tick.tick() => {
                    if self.cfg.idle_timeout_ms > 0 {
                        for id in self.pool.idle_ids(self.cfg.idle_timeout_ms as u64) {
                            debug!("client #{} idle, closing", id);
                            self.remove_client(id, &mut states, true);
                        }
                    }
                }

                _ = shutdown.wait() => break,
            }
        }

        info!("relay shutting down, {} clients", self.pool.len());
        for rec in self.pool.drain() {
            if let Some(h) = rec.reader_abort {
                h.abort();
            }
        }
    }

    /// Admission control plus task wiring for one new connection.
    async fn admit(
        &self,
        mut conn: Connection,
        events_tx: &mpsc::Sender<RelayEvent>,
        states: &mut HashMap<u64, ClientState>,
    ) {
        let peer = conn.peer_desc();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(CLIENT_QUEUE_DEPTH);
        let id = match self.pool.insert(peer.clone(), tx) {
            Ok(id) => id,
            Err(e) => {
                info!("rejecting {}: {}", peer, e);
                conn.close().await;
                return;
            }
        };

        let (rd, wr) = tokio::io::split(conn);

        let writer_pool = self.pool.clone();
        let writer_events = events_tx.clone();
        tokio::spawn(client_writer(id, wr, rx, writer_pool, writer_events));

        let reader_events = events_tx.clone();
        let reader = tokio::spawn(client_reader(id, rd, reader_events));
        self.pool.set_reader_abort(id, reader.abort_handle());

        let phase = if self.cfg.chat { Phase::Nick } else { Phase::Active };
        states.insert(id, ClientState { phase, line_buf: Vec::new() });
        info!("client #{} connected from {} ({} total)", id, peer, self.pool.len());
    }

    fn on_data(&self, id: u64, bytes: Vec<u8>, states: &mut HashMap<u64, ClientState>) {
        self.pool.touch(id);
        self.pool.add_bytes_in(id, bytes.len() as u64);

        let Some(state) = states.get_mut(&id) else {
            return;
        };

        if state.phase == Phase::Nick {
            state.line_buf.extend_from_slice(&bytes);
            if let Some(pos) = state.line_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = state.line_buf.drain(..=pos).collect();
                let candidate = String::from_utf8_lossy(&line).trim().to_string();
                match self.pool.set_nickname(id, &candidate, self.cfg.max_nickname_len) {
                    Ok(()) => {
                        state.phase = Phase::Active;
                        info!("client #{} is now '{}'", id, candidate);
                        self.fanout(id, format!("*** {candidate} has joined\n").into_bytes());
                        self.sweep_failed(states);
                        // Bytes that followed the nickname line are the
                        // first chat payload.
                        if states.get(&id).is_some_and(|s| !s.line_buf.is_empty()) {
                            self.process_chat_lines(id, states);
                            self.sweep_failed(states);
                        }
                    }
                    Err(e) => {
                        if let Some(tx) = self.pool.sender(id) {
                            let _ = tx.try_send(format!("*** {e}\n").into_bytes());
                        }
                        info!("client #{} rejected: {}", id, e);
                        self.remove_client(id, states, false);
                    }
                }
            } else if state.line_buf.len() > self.cfg.max_nickname_len + 2 {
                if let Some(tx) = self.pool.sender(id) {
                    let _ = tx.try_send(b"*** nickname too long\n".to_vec());
                }
                self.remove_client(id, states, false);
            }
            return;
        }

        if self.cfg.chat {
            state.line_buf.extend_from_slice(&bytes);
            self.process_chat_lines(id, states);
        } else {
            // Broker mode: verbatim bytes to every other client.
            self.fanout(id, bytes);
        }
        self.sweep_failed(states);
    }

    /// Emit every complete line in the client's buffer, prefixed and
    /// capped. A recipient never sees a partial line.
    fn process_chat_lines(&self, id: u64, states: &mut HashMap<u64, ClientState>) {
        let nick = self.pool.nickname(id).unwrap_or_else(|| format!("client{id}"));
        let Some(state) = states.get_mut(&id) else {
            return;
        };
        loop {
            let flush_at = match state.line_buf.iter().position(|&b| b == b'\n') {
                Some(pos) => pos + 1,
                None if state.line_buf.len() >= self.cfg.max_message_len => {
                    // Cap exceeded with no newline: force a line break.
                    self.cfg.max_message_len
                }
                None => break,
            };
            let mut line: Vec<u8> = state.line_buf.drain(..flush_at).collect();
            while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
                line.pop();
            }
            line.truncate(self.cfg.max_message_len);
            let mut msg = Vec::with_capacity(line.len() + nick.len() + 4);
            msg.extend_from_slice(b"[");
            msg.extend_from_slice(nick.as_bytes());
            msg.extend_from_slice(b"] ");
            msg.extend_from_slice(&line);
            msg.push(b'\n');
            self.fanout(id, msg);
        }
    }

    /// Queue bytes to every active client except the sender. Congested or
    /// closed queues mark the recipient failed; the caller sweeps.
    fn fanout(&self, exclude: u64, bytes: Vec<u8>) {
        for (id, tx) in self.pool.targets(exclude) {
            match tx.try_send(bytes.clone()) {
                Ok(()) => self.pool.add_bytes_out(id, bytes.len() as u64),
                Err(TrySendError::Full(_)) => {
                    warn!("client #{} cannot keep up, dropping it", id);
                    self.pool.mark_failed(id);
                }
                Err(TrySendError::Closed(_)) => self.pool.mark_failed(id),
            }
        }
    }

    /// Remove all failed clients in one pool operation, announcing chat
    /// departures. Announcements can themselves mark more clients failed,
    /// so loop until the sweep comes back empty.
    fn sweep_failed(&self, states: &mut HashMap<u64, ClientState>) {
        loop {
            let failed = self.pool.take_failed();
            if failed.is_empty() {
                return;
            }
            for rec in failed {
                self.teardown(&rec, states);
                self.announce_left(&rec);
            }
        }
    }

    fn remove_client(
        &self,
        id: u64,
        states: &mut HashMap<u64, ClientState>,
        announce: bool,
    ) {
        let Some(rec) = self.pool.remove(id) else {
            states.remove(&id);
            return;
        };
        self.teardown(&rec, states);
        if announce {
            self.announce_left(&rec);
        }
        self.sweep_failed(states);
    }

    fn teardown(&self, rec: &ClientRecord, states: &mut HashMap<u64, ClientState>) {
        states.remove(&rec.id);
        if let Some(h) = &rec.reader_abort {
            h.abort();
        }
        info!("client #{} disconnected ({} left)", rec.id, self.pool.len());
    }

    fn announce_left(&self, rec: &ClientRecord) {
        if self.cfg.chat
            && let Some(nick) = &rec.nickname
        {
            self.fanout(NO_SENDER, format!("*** {nick} has left\n").into_bytes());
        }
    }
}

/// Dumb reader: bytes in, events out. All policy lives in the relay.
async fn client_reader(
    id: u64,
    mut rd: ReadHalf<Connection>,
    events: mpsc::Sender<RelayEvent>,
) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events.send(RelayEvent::Closed(id)).await;
                return;
            }
            Ok(n) => {
                if events.send(RelayEvent::Data(id, buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Writer: drain the bounded queue into the socket. A failed write marks
/// the client for the relay's atomic sweep.
async fn client_writer(
    id: u64,
    mut wr: WriteHalf<Connection>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    pool: Arc<ClientPool>,
    events: mpsc::Sender<RelayEvent>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = wr.write_all(&chunk).await {
            debug!("write to client #{} failed: {}", id, e);
            pool.mark_failed(id);
            let _ = events.send(RelayEvent::Closed(id)).await;
            return;
        }
    }
    // Queue closed: the relay removed this client; finish with a FIN.
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair(listener: &TcpListener) -> (Connection, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (Connection::Plain(server_side), client)
    }

    async fn read_some(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(Ok(n)) => buf[..n].to_vec(),
            _ => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_broker_fanout_excludes_sender() {
        let r = Relay::new(RelayConfig {
            chat: false,
            max_clients: 8,
            max_nickname_len: 32,
            max_message_len: 1024,
            idle_timeout_ms: 0,
        });
        let pool = r.pool();
        let (tx, rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();
        tokio::spawn({
            let sd = shutdown.clone();
            async move { r.run(rx, sd).await }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (conn_a, mut a) = tcp_pair(&listener).await;
        let (conn_b, mut b) = tcp_pair(&listener).await;
        tx.send(conn_a).await.unwrap();
        tx.send(conn_b).await.unwrap();

        // Wait until both are admitted.
        for _ in 0..50 {
            if pool.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.len(), 2);

        a.write_all(b"from a").await.unwrap();
        let got = read_some(&mut b).await;
        assert_eq!(got, b"from a");

        // The sender must never hear its own bytes back.
        b.write_all(b"from b").await.unwrap();
        let got_a = read_some(&mut a).await;
        assert_eq!(got_a, b"from b");
        shutdown.request();
    }

    #[tokio::test]
    async fn test_admission_closes_over_limit() {
        let r = Relay::new(RelayConfig {
            chat: false,
            max_clients: 1,
            max_nickname_len: 32,
            max_message_len: 1024,
            idle_timeout_ms: 0,
        });
        let pool = r.pool();
        let (tx, rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();
        tokio::spawn({
            let sd = shutdown.clone();
            async move { r.run(rx, sd).await }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (conn_a, _a) = tcp_pair(&listener).await;
        let (conn_b, mut b) = tcp_pair(&listener).await;
        tx.send(conn_a).await.unwrap();
        tx.send(conn_b).await.unwrap();

        // The second client gets a prompt EOF.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), b.read(&mut buf))
            .await
            .expect("no EOF within 2s")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(pool.len(), 1);
        shutdown.request();
    }

    #[tokio::test]
    async fn test_chat_nickname_conflict_rejected() {
        let r = Relay::new(RelayConfig {
            chat: true,
            max_clients: 8,
            max_nickname_len: 32,
            max_message_len: 1024,
            idle_timeout_ms: 0,
        });
        let pool = r.pool();
        let (tx, rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();
        tokio::spawn({
            let sd = shutdown.clone();
            async move { r.run(rx, sd).await }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (conn_a, mut a) = tcp_pair(&listener).await;
        let (conn_b, mut b) = tcp_pair(&listener).await;
        tx.send(conn_a).await.unwrap();
        tx.send(conn_b).await.unwrap();
        for _ in 0..50 {
            if pool.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        a.write_all(b"alice\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.write_all(b"ALICE\n").await.unwrap();

        // B gets a system error line and then EOF.
        let mut all = Vec::new();
        loop {
            let chunk = read_some(&mut b).await;
            if chunk.is_empty() {
                break;
            }
            all.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&all);
        assert!(text.starts_with("***"), "expected system line, got {text:?}");
        for _ in 0..50 {
            if pool.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.len(), 1);
        drop(a);
        shutdown.request();
    }
}
