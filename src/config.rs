//! Runtime configuration record produced by the CLI layer.
//!
//! The `Config` is a plain value type: the startup path owns it for the
//! whole process and the core receives borrows. Validation happens once,
//! up front, and names the offending field so the CLI can exit with a
//! precise diagnostic.

use std::net::IpAddr;
use std::path::PathBuf;

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Connect,
    Listen,
}

/// Wire transport. TLS over TCP is a separate toggle (`TlsOptions::enabled`);
/// DTLS is its own transport because it changes the socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Sctp,
    Unix,
    Dtls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks4,
    Socks5,
}

/// Where hostname resolution happens when traversing a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyDns {
    None,
    Local,
    #[default]
    Remote,
    Both,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `host:port` of the proxy itself.
    pub addr: String,
    pub kind: ProxyKind,
    /// `user:pass` credentials, if any.
    pub auth: Option<(String, String)>,
    pub dns: ProxyDns,
}

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub verify: bool,
    pub trustfile: Option<PathBuf>,
    pub crl: Option<PathBuf>,
    pub ciphers: Vec<String>,
    pub servername: Option<String>,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Program + args (`-e prog arg...`). Mutually exclusive with `shell`.
    pub program: Vec<String>,
    /// Shell command line (`-c "cmd"`), run via `/bin/sh -c`.
    pub shell: Option<String>,
    pub redirect_stdin: bool,
    pub redirect_stdout: bool,
    pub redirect_stderr: bool,
    pub stdin_buf: usize,
    pub stdout_buf: usize,
    pub stderr_buf: usize,
    /// Aggregate ceiling across all three buffers.
    pub max_buffer: usize,
    /// Hysteresis thresholds as fractions of `max_buffer`.
    pub pause_pct: f64,
    pub resume_pct: f64,
    /// Wall-time limit since spawn. 0 disables.
    pub execution_timeout_ms: u64,
    /// No-traffic limit, reset on any byte moved. 0 disables.
    pub idle_timeout_ms: u64,
    /// Limit until the first byte of traffic. 0 disables.
    pub connection_timeout_ms: u64,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            program: Vec::new(),
            shell: None,
            redirect_stdin: true,
            redirect_stdout: true,
            redirect_stderr: true,
            stdin_buf: 32 * 1024,
            stdout_buf: 64 * 1024,
            stderr_buf: 32 * 1024,
            max_buffer: 256 * 1024,
            pause_pct: 0.85,
            resume_pct: 0.60,
            execution_timeout_ms: 0,
            idle_timeout_ms: 0,
            connection_timeout_ms: 0,
        }
    }
}

impl ExecOptions {
    pub fn is_active(&self) -> bool {
        !self.program.is_empty() || self.shell.is_some()
    }
}

/// Hex-dump destination: disabled, stderr, or a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HexDump {
    #[default]
    Off,
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub transport: Transport,

    // Addressing
    pub host: Option<String>,
    pub port: u16,
    pub source_addr: Option<IpAddr>,
    pub source_port: Option<u16>,
    pub ipv4_only: bool,
    pub ipv6_only: bool,
    pub unix_path: Option<PathBuf>,

    // Timers, milliseconds. -1 means "no deadline" where the engine
    // documents it; 0 means "unset / use the default policy".
    pub connect_timeout_ms: i64,
    pub accept_timeout_ms: i64,
    pub idle_timeout_ms: i64,
    pub wait_time_ms: i64,
    pub delay_ms: i64,

    // Transfer modes
    pub send_only: bool,
    pub recv_only: bool,
    pub close_on_eof: bool,
    pub crlf: bool,
    pub telnet: bool,

    // Server behavior
    pub keep_listening: bool,
    /// Per-connection worker threshold: 0 runs handlers inline.
    pub max_conns: usize,
    pub broker: bool,
    pub chat: bool,
    pub max_clients: usize,
    pub chat_max_nickname_len: usize,
    pub chat_max_message_len: usize,

    pub exec: ExecOptions,
    pub tls: TlsOptions,
    /// DTLS path MTU.
    pub dtls_mtu: usize,
    pub proxy: Option<ProxyConfig>,

    // Access control inputs; parsed into an AccessList at startup.
    pub allow_rules: Vec<String>,
    pub deny_rules: Vec<String>,
    pub allow_file: Option<PathBuf>,
    pub deny_file: Option<PathBuf>,

    // Security
    pub allow_dangerous: bool,
    pub require_allow_with_exec: bool,
    pub drop_user: Option<String>,

    // Misc
    pub zero_io: bool,
    pub nodns: bool,
    pub output_file: Option<PathBuf>,
    pub append_output: bool,
    pub hex_dump: HexDump,
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Connect,
            transport: Transport::Tcp,
            host: None,
            port: 0,
            source_addr: None,
            source_port: None,
            ipv4_only: false,
            ipv6_only: false,
            unix_path: None,
            connect_timeout_ms: 10_000,
            accept_timeout_ms: 0,
            idle_timeout_ms: 0,
            wait_time_ms: 0,
            delay_ms: 0,
            send_only: false,
            recv_only: false,
            close_on_eof: false,
            crlf: false,
            telnet: false,
            keep_listening: false,
            max_conns: 0,
            broker: false,
            chat: false,
            max_clients: 16,
            chat_max_nickname_len: 32,
            chat_max_message_len: 1024,
            exec: ExecOptions::default(),
            tls: TlsOptions::default(),
            dtls_mtu: 1200,
            proxy: None,
            allow_rules: Vec::new(),
            deny_rules: Vec::new(),
            allow_file: None,
            deny_file: None,
            allow_dangerous: false,
            require_allow_with_exec: false,
            drop_user: None,
            zero_io: false,
            nodns: false,
            output_file: None,
            append_output: false,
            hex_dump: HexDump::Off,
            verbosity: 1,
        }
    }
}

impl Config {
    pub fn relay_active(&self) -> bool {
        self.broker || self.chat
    }

    /// Validate cross-field constraints. The returned string names the
    /// offending field first so the CLI diagnostic is precise.
    pub fn validate(&self) -> Result<(), String> {
        if self.transport == Transport::Sctp {
            return Err("--sctp: SCTP is not supported on this platform".into());
        }
        if self.ipv4_only && self.ipv6_only {
            return Err("-4/-6: cannot force both address families".into());
        }
        if self.send_only && self.recv_only {
            return Err("--send-only/--recv-only: mutually exclusive".into());
        }
        if self.relay_active() {
            if self.exec.is_active() {
                return Err("--broker/--chat: cannot be combined with exec mode".into());
            }
            if self.transport == Transport::Udp || self.transport == Transport::Dtls {
                return Err("--broker/--chat: requires a stream transport".into());
            }
            if self.mode != Mode::Listen {
                return Err("--broker/--chat: only valid in listen mode".into());
            }
            if self.max_clients == 0 {
                return Err("--max-clients: must be at least 1".into());
            }
        }
        if !self.exec.program.is_empty() && self.exec.shell.is_some() {
            return Err("-e/-c: mutually exclusive".into());
        }
        if self.exec.is_active() {
            let e = &self.exec;
            if !(e.resume_pct > 0.0 && e.resume_pct < e.pause_pct && e.pause_pct <= 1.0) {
                return Err(format!(
                    "flow thresholds: need 0 < resume ({}) < pause ({}) <= 1",
                    e.resume_pct, e.pause_pct
                ));
            }
            if e.stdin_buf == 0 || e.stdout_buf == 0 || e.stderr_buf == 0 || e.max_buffer == 0 {
                return Err("exec buffers: sizes must be non-zero".into());
            }
        }
        if self.transport == Transport::Dtls && !(296..=65507).contains(&self.dtls_mtu) {
            return Err(format!(
                "--mtu: {} outside the valid range 296..=65507",
                self.dtls_mtu
            ));
        }
        if self.tls.enabled && self.transport != Transport::Tcp {
            return Err("--ssl: TLS applies to TCP only (use --dtls for datagram TLS)".into());
        }
        if self.proxy.is_some() && self.mode == Mode::Listen {
            return Err("--proxy: only valid in connect mode".into());
        }
        if self.transport == Transport::Unix && self.unix_path.is_none() {
            return Err("-U: a socket path is required for Unix transport".into());
        }
        if self.mode == Mode::Connect
            && self.transport != Transport::Unix
            && self.host.is_none()
        {
            return Err("host: a destination host is required in connect mode".into());
        }
        if self.chat {
            if self.chat_max_nickname_len == 0 || self.chat_max_message_len == 0 {
                return Err("chat limits: nickname and message caps must be non-zero".into());
            }
        }
        if self.tls.enabled && self.mode == Mode::Listen && self.tls.cert.is_none() {
            return Err("--ssl-cert: a certificate is required for a TLS server".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_listen() -> Config {
        Config {
            mode: Mode::Listen,
            port: 4000,
            ..Config::default()
        }
    }

    #[test]
    fn test_broker_exec_conflict() {
        let mut cfg = base_listen();
        cfg.broker = true;
        cfg.exec.program = vec!["/bin/true".into()];
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("--broker"));
    }

    #[test]
    fn test_broker_udp_conflict() {
        let mut cfg = base_listen();
        cfg.chat = true;
        cfg.transport = Transport::Udp;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sctp_rejected() {
        let mut cfg = base_listen();
        cfg.transport = Transport::Sctp;
        assert!(cfg.validate().unwrap_err().contains("--sctp"));
    }

    #[test]
    fn test_flow_threshold_ordering() {
        let mut cfg = base_listen();
        cfg.exec.program = vec!["/bin/cat".into()];
        cfg.exec.pause_pct = 0.5;
        cfg.exec.resume_pct = 0.6;
        assert!(cfg.validate().is_err());
        cfg.exec.resume_pct = 0.3;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_mtu_range() {
        let mut cfg = Config {
            mode: Mode::Connect,
            transport: Transport::Dtls,
            host: Some("localhost".into()),
            ..Config::default()
        };
        cfg.dtls_mtu = 100;
        assert!(cfg.validate().is_err());
        cfg.dtls_mtu = 1200;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_connect_requires_host() {
        let cfg = Config::default();
        assert!(cfg.validate().unwrap_err().contains("host"));
    }

    #[test]
    fn test_broker_valid_on_unix() {
        let mut cfg = base_listen();
        cfg.broker = true;
        cfg.transport = Transport::Unix;
        cfg.unix_path = Some("/tmp/x.sock".into());
        assert!(cfg.validate().is_ok());
    }
}
