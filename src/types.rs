//! Process-wide primitives: wall clock helpers and the shutdown flag

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::info;

/// Current wall time in whole seconds since the epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current wall time in milliseconds since the epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Process-wide shutdown request.
///
/// Signal handlers only set the atomic flag; every reactor checks it after
/// each readiness turn and before any operation that could block forever.
/// The `Notify` lets select loops wake immediately instead of waiting for
/// their next poll deadline.
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request shutdown. Safe to call from any context, repeatedly.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested. Returns immediately if it already was.
    pub async fn wait(&self) {
        if self.is_requested() {
            return;
        }
        // Re-check after registering to avoid a lost wakeup between the load
        // and notified().
        let notified = self.notify.notified();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// Install SIGINT/SIGTERM handlers that set the shutdown flag.
///
/// The handler tasks do nothing but set the flag (async-signal-safe by
/// construction: tokio delivers signals on the runtime, not in handler
/// context).
#[cfg(unix)]
pub fn install_signal_handlers(shutdown: Arc<Shutdown>) {
    use tokio::signal::unix::{SignalKind, signal};

    let sd = shutdown.clone();
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        sigint.recv().await;
        info!("SIGINT received, shutting down");
        sd.request();
    });

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        sigterm.recv().await;
        info!("SIGTERM received, shutting down");
        shutdown.request();
    });
}

#[cfg(not(unix))]
pub fn install_signal_handlers(shutdown: Arc<Shutdown>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.request();
        }
    });
}

/// True when stdin is a terminal. Windows has no TTY detection here; the
/// transfer engine treats it as non-TTY.
#[cfg(unix)]
pub fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

#[cfg(not(unix))]
pub fn stdin_is_tty() -> bool {
    false
}
