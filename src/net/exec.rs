//! Exec bridge: connection ↔ child process stdio.
//!
//! One reactor task multiplexes the socket, child stdout, child stderr and
//! the child-stdin drain, so every pump stops the moment the loop stops
//! polling it. That makes the cleanup ordering structural: pipe handles
//! are dropped first, the child is reaped last, and no pipe fd is ever
//! read after the reap.
//!
//! Flow control is hysteresis over the aggregate buffered bytes: reading
//! from the socket pauses at `pause_pct` of the cap and resumes at
//! `resume_pct`, so a stalled child cannot balloon memory and a draining
//! one does not flap the pump.

use crate::config::ExecOptions;
use crate::net::connection::{ConnError, Connection};
use crate::net::telnet::{TelnetCodec, server_preamble};
use crate::types::Shutdown;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL when a deadline fires.
const TERM_GRACE_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn child process: {0}")]
    Spawn(io::Error),

    #[error("exec requires an allow list (--require-allow-with-exec is set)")]
    RequireAllow,

    #[error("refusing exec without an allow list; pass --allow-dangerous to override")]
    DangerousWithoutAllow,

    #[error("execution timeout after {0} ms")]
    ExecutionTimeout(u64),

    #[error("idle timeout after {0} ms")]
    IdleTimeout(u64),

    #[error("no traffic within {0} ms of connecting")]
    ConnectionTimeout(u64),

    #[error("failed to reap child process: {0}")]
    Wait(io::Error),

    #[error("connection error: {0}")]
    Conn(#[from] ConnError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Exec security gate. Serving a shell to unfiltered peers is the classic
/// footgun, so listen-mode exec demands an allow list unless the operator
/// explicitly accepts the risk.
pub fn check_security(
    server_mode: bool,
    allow_list_empty: bool,
    allow_dangerous: bool,
    require_allow: bool,
) -> Result<(), ExecError> {
    if !server_mode || !allow_list_empty {
        return Ok(());
    }
    if require_allow {
        return Err(ExecError::RequireAllow);
    }
    if !allow_dangerous {
        return Err(ExecError::DangerousWithoutAllow);
    }
    warn!("════════════════════════════════════════════════════════════");
    warn!("  DANGER: exec is exposed with NO access restrictions");
    warn!("  Any peer that can connect can run the configured command.");
    warn!("════════════════════════════════════════════════════════════");
    Ok(())
}

/// Hysteresis thresholds over the aggregate buffer cap.
#[derive(Debug, Clone)]
pub struct FlowState {
    pause_at: usize,
    resume_at: usize,
    paused: bool,
}

impl FlowState {
    /// Caller guarantees `0 < resume < pause <= 1` (validated at config
    /// time).
    pub fn new(cap: usize, pause_pct: f64, resume_pct: f64) -> Self {
        Self {
            pause_at: (cap as f64 * pause_pct) as usize,
            resume_at: (cap as f64 * resume_pct) as usize,
            paused: false,
        }
    }

    /// Feed the current aggregate buffered byte count; returns whether the
    /// socket→child pump must be paused.
    pub fn update(&mut self, total_buffered: usize) -> bool {
        if self.paused {
            if total_buffered <= self.resume_at {
                self.paused = false;
            }
        } else if total_buffered >= self.pause_at {
            self.paused = true;
        }
        self.paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

/// A spawned child wired for bridging.
#[derive(Debug)]
pub struct ExecSession {
    child: Child,
    flow: FlowState,
    opts: ExecOptions,
}

impl ExecSession {
    /// Spawn the program (or `/bin/sh -c` for shell mode) with pipes per
    /// the redirect flags.
    pub fn spawn(opts: &ExecOptions) -> Result<Self, ExecError> {
        let mut cmd = match &opts.shell {
            Some(line) => {
                let mut c = Command::new("/bin/sh");
                c.arg("-c").arg(line);
                c
            }
            None => {
                let mut c = Command::new(&opts.program[0]);
                c.args(&opts.program[1..]);
                c
            }
        };
        cmd.stdin(stdio_for(opts.redirect_stdin))
            .stdout(stdio_for(opts.redirect_stdout))
            .stderr(stdio_for(opts.redirect_stderr))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(ExecError::Spawn)?;
        info!(
            "spawned {} (pid {:?})",
            opts.shell.as_deref().unwrap_or(&opts.program[0]),
            child.id()
        );
        Ok(Self {
            child,
            flow: FlowState::new(opts.max_buffer, opts.pause_pct, opts.resume_pct),
            opts: opts.clone(),
        })
    }

    /// Run the pumps until the child's output is drained or a deadline
    /// fires, then reap. Returns the child's exit status.
    pub async fn bridge(
        mut self,
        conn: Connection,
        shutdown: &Shutdown,
        telnet: bool,
    ) -> Result<ExitStatus, ExecError> {
        let mut stdin = self.child.stdin.take();
        let mut stdout = self.child.stdout.take();
        let mut stderr = self.child.stderr.take();

        let (mut rd, mut wr) = tokio::io::split(conn);
        let mut codec = telnet.then(TelnetCodec::new);
        if telnet {
            wr.write_all(&server_preamble()).await.map_err(ConnError::from)?;
        }

        let started = Instant::now();
        let mut last_activity = Instant::now();
        let mut seen_traffic = false;

        let mut sock_buf = vec![0u8; 8 * 1024];
        let mut out_buf = vec![0u8; self.opts.stdout_buf];
        let mut err_buf = vec![0u8; self.opts.stderr_buf];
        let mut stdin_q: Vec<u8> = Vec::with_capacity(self.opts.stdin_buf);
        let mut sock_eof = stdin.is_none();
        let mut peer_gone = false;

        enum Fired {
            Execution,
            Idle,
            Connection,
        }

        let exit_reason: Option<ExecError> = loop {
            if shutdown.is_requested() {
                break None;
            }
            // A pump is live while its pipe end is still open.
            let stdout_live = stdout.is_some();
            let stderr_live = stderr.is_some();
            let piped_output = self.opts.redirect_stdout || self.opts.redirect_stderr;
            if piped_output && !stdout_live && !stderr_live {
                // All child output drained; the bridge is done.
                break None;
            }
            if !piped_output && sock_eof && stdin.is_none() {
                // Nothing left to pump in either direction.
                break None;
            }

            // Deadline selection: the nearest enabled timer wins.
            let mut next: Option<(Instant, Fired)> = None;
            let mut consider = |at: Instant, kind: Fired| match &next {
                Some((cur, _)) if *cur <= at => {}
                _ => next = Some((at, kind)),
            };
            if self.opts.execution_timeout_ms > 0 {
                consider(
                    started + Duration::from_millis(self.opts.execution_timeout_ms),
                    Fired::Execution,
                );
            }
            if self.opts.idle_timeout_ms > 0 {
                consider(
                    last_activity + Duration::from_millis(self.opts.idle_timeout_ms),
                    Fired::Idle,
                );
            }
            if self.opts.connection_timeout_ms > 0 && !seen_traffic {
                consider(
                    started + Duration::from_millis(self.opts.connection_timeout_ms),
                    Fired::Connection,
                );
            }
            let deadline = next
                .as_ref()
                .map(|(at, _)| *at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let room = self.opts.stdin_buf.saturating_sub(stdin_q.len());
            let can_read_sock = stdin.is_some()
                && !sock_eof
                && !peer_gone
                && !self.flow.is_paused()
                && room > 0;
            let read_len = room.min(sock_buf.len());

            let can_drain_stdin = stdin.is_some() && !stdin_q.is_empty();
            let drain_chunk: Vec<u8> = if can_drain_stdin {
                stdin_q[..stdin_q.len().min(4096)].to_vec()
            } else {
                Vec::new()
            };

            tokio::select! {
                r = rd.read(&mut sock_buf[..read_len]), if can_read_sock => {
                    match r {
                        Ok(0) => {
                            sock_eof = true;
                            debug!("peer closed input; draining stdin queue");
                            if stdin_q.is_empty() {
                                stdin = None;
                            }
                        }
                        Ok(n) => {
                            seen_traffic = true;
                            last_activity = Instant::now();
                            if let Some(c) = codec.as_mut() {
                                let mut data = Vec::with_capacity(n);
                                let mut replies = Vec::new();
                                c.decode(&sock_buf[..n], &mut data, &mut replies);
                                if !replies.is_empty()
                                    && let Err(e) = wr.write_all(&replies).await
                                {
                                    peer_gone = true;
                                    debug!("telnet reply failed: {}", e);
                                }
                                stdin_q.extend_from_slice(&data);
                            } else {
                                stdin_q.extend_from_slice(&sock_buf[..n]);
                            }
                            self.flow.update(stdin_q.len());
                        }
                        Err(e) => {
                            debug!("socket read failed: {}", e);
                            sock_eof = true;
                            if stdin_q.is_empty() {
                                stdin = None;
                            }
                        }
                    }
                }

                r = async { stdin.as_mut().unwrap().write(&drain_chunk).await },
                    if can_drain_stdin =>
                {
                    match r {
                        Ok(n) => {
                            stdin_q.drain(..n);
                            last_activity = Instant::now();
                            self.flow.update(stdin_q.len());
                            if stdin_q.is_empty() && sock_eof {
                                // Drop closes the pipe; the child sees EOF.
                                stdin = None;
                            }
                        }
                        Err(e) => {
                            debug!("child stdin write failed: {}", e);
                            stdin_q.clear();
                            stdin = None;
                        }
                    }
                }

                r = async { stdout.as_mut().unwrap().read(&mut out_buf).await },
                    if stdout_live =>
                {
                    match r {
                        Ok(0) => stdout = None,
                        Ok(n) => {
                            seen_traffic = true;
                            last_activity = Instant::now();
                            if let Err(e) = wr.write_all(&out_buf[..n]).await {
                                debug!("socket write failed: {}", e);
                                peer_gone = true;
                                stdout = None;
                                stderr = None;
                            }
                        }
                        Err(e) => {
                            debug!("child stdout read failed: {}", e);
                            stdout = None;
                        }
                    }
                }

                r = async { stderr.as_mut().unwrap().read(&mut err_buf).await },
                    if stderr_live =>
                {
                    match r {
                        Ok(0) => stderr = None,
                        Ok(n) => {
                            seen_traffic = true;
                            last_activity = Instant::now();
                            if let Err(e) = wr.write_all(&err_buf[..n]).await {
                                debug!("socket write failed: {}", e);
                                peer_gone = true;
                                stdout = None;
                                stderr = None;
                            }
                        }
                        Err(e) => {
                            debug!("child stderr read failed: {}", e);
                            stderr = None;
                        }
                    }
                }

                _ = tokio::time::sleep_until(deadline), if next.is_some() => {
                    let err = match next.map(|(_, k)| k).unwrap() {
                        Fired::Execution => {
                            ExecError::ExecutionTimeout(self.opts.execution_timeout_ms)
                        }
                        Fired::Idle => ExecError::IdleTimeout(self.opts.idle_timeout_ms),
                        Fired::Connection => {
                            ExecError::ConnectionTimeout(self.opts.connection_timeout_ms)
                        }
                    };
                    break Some(err);
                }

                _ = shutdown.wait() => {
                    break None;
                }
            }
        };

        // Cleanup ordering contract: stop the pumps (drop every pipe end we
        // still hold), only then reap the child.
        drop(stdin);
        drop(stdout);
        drop(stderr);

        let mut conn = rd.unsplit(wr);
        conn.close().await;

        match exit_reason {
            Some(err) => {
                self.terminate_child().await;
                let _ = self.child.wait().await;
                Err(err)
            }
            None => {
                let piped_output = self.opts.redirect_stdout || self.opts.redirect_stderr;
                let status = if !piped_output && !shutdown.is_requested() {
                    // Output goes to the local terminal; let the child run
                    // to completion.
                    self.child.wait().await.map_err(ExecError::Wait)?
                } else {
                    // The child may still be running if the peer vanished
                    // or shutdown was requested; TERM/KILL after a grace
                    // period.
                    match tokio::time::timeout(
                        Duration::from_millis(TERM_GRACE_MS),
                        self.child.wait(),
                    )
                    .await
                    {
                        Ok(result) => result.map_err(ExecError::Wait)?,
                        Err(_) => {
                            self.terminate_child().await;
                            self.child.wait().await.map_err(ExecError::Wait)?
                        }
                    }
                };
                debug!("child exited with {}", status);
                Ok(status)
            }
        }
    }

    /// SIGTERM, a 250 ms grace wait, then SIGKILL.
    async fn terminate_child(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(Duration::from_millis(TERM_GRACE_MS), self.child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
        let _ = self.child.kill().await;
    }
}

fn stdio_for(redirect: bool) -> Stdio {
    if redirect { Stdio::piped() } else { Stdio::inherit() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    fn exec_opts(program: &[&str]) -> ExecOptions {
        ExecOptions {
            program: program.iter().map(|s| s.to_string()).collect(),
            ..ExecOptions::default()
        }
    }

    async fn conn_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (Connection::Plain(server_side), client)
    }

    #[test]
    fn test_flow_hysteresis() {
        let mut flow = FlowState::new(1000, 0.85, 0.60);
        assert!(!flow.update(0));
        assert!(!flow.update(849));
        // Crossing pause threshold.
        assert!(flow.update(850));
        // Stays paused between the thresholds.
        assert!(flow.update(700));
        assert!(flow.update(601));
        // Resumes at or below 60%.
        assert!(!flow.update(600));
        // And does not flap right back.
        assert!(!flow.update(700));
        assert!(flow.update(901));
    }

    #[test]
    fn test_security_gate() {
        // Client-side exec is unrestricted.
        assert!(check_security(false, true, false, false).is_ok());
        // Server-side with an allow list is fine.
        assert!(check_security(true, false, false, false).is_ok());
        // Server-side without one is refused by default.
        assert!(matches!(
            check_security(true, true, false, false),
            Err(ExecError::DangerousWithoutAllow)
        ));
        // --require-allow-with-exec is an even harder refusal.
        assert!(matches!(
            check_security(true, true, true, true),
            Err(ExecError::RequireAllow)
        ));
        // --allow-dangerous overrides the default refusal.
        assert!(check_security(true, true, true, false).is_ok());
    }

    #[tokio::test]
    async fn test_echo_child_output_reaches_socket() {
        let (conn, mut peer) = conn_pair().await;
        let shutdown = Shutdown::new();
        let session = ExecSession::spawn(&exec_opts(&["/bin/echo", "hi there"])).unwrap();

        let bridge = tokio::spawn(async move {
            session.bridge(conn, &shutdown, false).await
        });

        let mut data = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = peer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        assert_eq!(data, b"hi there\n");

        let status = bridge.await.unwrap().unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_socket_input_reaches_child() {
        let (conn, mut peer) = conn_pair().await;
        let shutdown = Shutdown::new();
        // cat echoes stdin back to stdout.
        let session = ExecSession::spawn(&exec_opts(&["/bin/cat"])).unwrap();

        let bridge = tokio::spawn(async move {
            session.bridge(conn, &shutdown, false).await
        });

        peer.write_all(b"through the child").await.unwrap();
        peer.shutdown().await.unwrap();

        let mut data = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = peer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        assert_eq!(data, b"through the child");

        let status = bridge.await.unwrap().unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_stderr_is_bridged() {
        let (conn, mut peer) = conn_pair().await;
        let shutdown = Shutdown::new();
        let opts = ExecOptions {
            shell: Some("echo oops 1>&2".into()),
            ..ExecOptions::default()
        };
        let session = ExecSession::spawn(&opts).unwrap();
        let bridge = tokio::spawn(async move {
            session.bridge(conn, &shutdown, false).await
        });

        let mut data = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = peer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        assert_eq!(data, b"oops\n");
        bridge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_immediate_exit_no_panic() {
        // The documented crash class: child exits before any traffic and
        // the peer disconnects right away.
        let (conn, peer) = conn_pair().await;
        let shutdown = Shutdown::new();
        let session = ExecSession::spawn(&exec_opts(&["/bin/true"])).unwrap();
        drop(peer);

        let start = std::time::Instant::now();
        let status = session.bridge(conn, &shutdown, false).await.unwrap();
        assert!(status.success());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_execution_timeout_kills_child() {
        let (conn, peer) = conn_pair().await;
        let shutdown = Shutdown::new();
        let mut opts = exec_opts(&["/bin/sleep", "30"]);
        opts.execution_timeout_ms = 200;
        let session = ExecSession::spawn(&opts).unwrap();

        let start = std::time::Instant::now();
        let err = session.bridge(conn, &shutdown, false).await.unwrap_err();
        assert!(matches!(err, ExecError::ExecutionTimeout(200)));
        assert!(start.elapsed() < Duration::from_secs(5));
        drop(peer);
    }

    #[tokio::test]
    async fn test_idle_timeout_fires_without_traffic() {
        let (conn, peer) = conn_pair().await;
        let shutdown = Shutdown::new();
        let mut opts = exec_opts(&["/bin/sleep", "30"]);
        opts.idle_timeout_ms = 150;
        let session = ExecSession::spawn(&opts).unwrap();

        let err = session.bridge(conn, &shutdown, false).await.unwrap_err();
        assert!(matches!(err, ExecError::IdleTimeout(150)));
        drop(peer);
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let err = ExecSession::spawn(&exec_opts(&["/no/such/binary/xyz"])).unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
    }
}
