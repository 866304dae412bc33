//! Broker client pool: records, admission and nickname bookkeeping.
//!
//! One mutex guards the whole table; every operation takes the lock
//! briefly and never performs I/O while holding it. Fan-out backpressure
//! runs through each record's bounded sender, whose `try_send` failure is
//! the congestion signal, so the relay never blocks on a slow client.

use crate::types::now_millis;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Outbound queue depth per client. Sustained overflow marks the client
/// failed rather than stalling the relay (head-of-line isolation).
pub const CLIENT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client pool is full ({0} clients)")]
    Full(usize),

    #[error("nickname '{0}' is already taken")]
    NicknameTaken(String),

    #[error("invalid nickname: {0}")]
    InvalidNickname(String),
}

/// Per-client record. The sender feeds the client's writer task; the abort
/// handle stops its reader on removal.
pub struct ClientRecord {
    pub id: u64,
    pub peer: String,
    pub connected_at: u64,
    pub last_activity: u64,
    pub nickname: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub failed: bool,
    pub tx: mpsc::Sender<Vec<u8>>,
    pub reader_abort: Option<AbortHandle>,
}

/// Externally visible snapshot of a client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: u64,
    pub peer: String,
    pub nickname: Option<String>,
    pub connected_at: u64,
    pub last_activity: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl From<&ClientRecord> for ClientInfo {
    fn from(r: &ClientRecord) -> Self {
        Self {
            id: r.id,
            peer: r.peer.clone(),
            nickname: r.nickname.clone(),
            connected_at: r.connected_at,
            last_activity: r.last_activity,
            bytes_in: r.bytes_in,
            bytes_out: r.bytes_out,
        }
    }
}

/// Nickname charset and reservation policy.
pub fn validate_nickname(nick: &str, max_len: usize) -> Result<(), PoolError> {
    if nick.is_empty() {
        return Err(PoolError::InvalidNickname("empty".into()));
    }
    if nick.len() > max_len {
        return Err(PoolError::InvalidNickname(format!(
            "longer than {max_len} bytes"
        )));
    }
    if nick.starts_with("***") {
        return Err(PoolError::InvalidNickname(
            "'***' prefix is reserved for system messages".into(),
        ));
    }
    if !nick
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(PoolError::InvalidNickname(
            "allowed characters are A-Z a-z 0-9 _ - .".into(),
        ));
    }
    Ok(())
}

pub struct ClientPool {
    max_clients: usize,
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, ClientRecord>>,
}

impl ClientPool {
    pub fn new(max_clients: usize) -> Self {
        Self {
            max_clients,
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Admission-checked insert; ids are monotone and never reused.
    pub fn insert(
        &self,
        peer: String,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<u64, PoolError> {
        let mut clients = self.clients.lock().unwrap();
        if clients.len() >= self.max_clients {
            return Err(PoolError::Full(clients.len()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = now_millis();
        clients.insert(
            id,
            ClientRecord {
                id,
                peer,
                connected_at: now,
                last_activity: now,
                nickname: None,
                bytes_in: 0,
                bytes_out: 0,
                failed: false,
                tx,
                reader_abort: None,
            },
        );
        Ok(id)
    }

    pub fn set_reader_abort(&self, id: u64, handle: AbortHandle) {
        if let Some(r) = self.clients.lock().unwrap().get_mut(&id) {
            r.reader_abort = Some(handle);
        }
    }

    /// Claim a nickname, enforcing case-insensitive uniqueness within the
    /// active pool.
    pub fn set_nickname(&self, id: u64, nick: &str, max_len: usize) -> Result<(), PoolError> {
        validate_nickname(nick, max_len)?;
        let mut clients = self.clients.lock().unwrap();
        let lower = nick.to_lowercase();
        if clients
            .values()
            .any(|r| r.id != id && r.nickname.as_deref().is_some_and(|n| n.to_lowercase() == lower))
        {
            return Err(PoolError::NicknameTaken(nick.to_string()));
        }
        if let Some(r) = clients.get_mut(&id) {
            r.nickname = Some(nick.to_string());
        }
        Ok(())
    }

    pub fn nickname(&self, id: u64) -> Option<String> {
        self.clients.lock().unwrap().get(&id).and_then(|r| r.nickname.clone())
    }

    /// Remove and return a record; the caller owns teardown (abort the
    /// reader, drop the sender).
    pub fn remove(&self, id: u64) -> Option<ClientRecord> {
        self.clients.lock().unwrap().remove(&id)
    }

    /// Remove every record marked failed, in one critical section.
    pub fn take_failed(&self) -> Vec<ClientRecord> {
        let mut clients = self.clients.lock().unwrap();
        let ids: Vec<u64> = clients
            .values()
            .filter(|r| r.failed)
            .map(|r| r.id)
            .collect();
        ids.into_iter().filter_map(|id| clients.remove(&id)).collect()
    }

    pub fn mark_failed(&self, id: u64) {
        if let Some(r) = self.clients.lock().unwrap().get_mut(&id) {
            r.failed = true;
        }
    }

    pub fn touch(&self, id: u64) {
        if let Some(r) = self.clients.lock().unwrap().get_mut(&id) {
            r.last_activity = now_millis();
        }
    }

    pub fn add_bytes_in(&self, id: u64, n: u64) {
        if let Some(r) = self.clients.lock().unwrap().get_mut(&id) {
            r.bytes_in += n;
        }
    }

    pub fn add_bytes_out(&self, id: u64, n: u64) {
        if let Some(r) = self.clients.lock().unwrap().get_mut(&id) {
            r.bytes_out += n;
        }
    }

    /// Sender for one client (system/error lines addressed to it alone).
    pub fn sender(&self, id: u64) -> Option<mpsc::Sender<Vec<u8>>> {
        self.clients.lock().unwrap().get(&id).map(|r| r.tx.clone())
    }

    /// Senders for a fan-out, excluding the originator.
    pub fn targets(&self, exclude: u64) -> Vec<(u64, mpsc::Sender<Vec<u8>>)> {
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.id != exclude && !r.failed)
            .map(|r| (r.id, r.tx.clone()))
            .collect()
    }

    /// Clients whose last activity is older than `idle_ms`.
    pub fn idle_ids(&self, idle_ms: u64) -> Vec<u64> {
        let cutoff = now_millis().saturating_sub(idle_ms);
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.last_activity < cutoff)
            .map(|r| r.id)
            .collect()
    }

    /// Drain everything (server shutdown).
    pub fn drain(&self) -> Vec<ClientRecord> {
        let mut clients = self.clients.lock().unwrap();
        clients.drain().map(|(_, r)| r).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.clients
            .lock()
            .unwrap()
            .values()
            .map(ClientInfo::from)
            .collect()
    }
}
