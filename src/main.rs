//! rcat command line: argument parsing, logging setup, mode dispatch.

use clap::{ArgAction, Parser};
use rcat::config::{
    Config, ExecOptions, HexDump, Mode, ProxyConfig, ProxyDns, ProxyKind, TlsOptions, Transport,
};
use rcat::error::{CatError, EXIT_CONFIG};
use rcat::net::client;
use rcat::net::listener::Server;
use rcat::types::{Shutdown, install_signal_handlers};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "rcat",
    version,
    about = "rcat: a modern netcat",
    long_about = "Connect, listen, and broker byte streams over TCP, UDP and Unix \
                  sockets, with TLS, proxies, exec bridging and a chat relay."
)]
struct Args {
    /// Destination host (connect mode) or bind address (listen mode)
    host: Option<String>,

    /// Destination port (connect mode)
    port: Option<u16>,

    /// Listen for inbound connections
    #[arg(short = 'l', long)]
    listen: bool,

    /// Use UDP instead of TCP
    #[arg(short = 'u', long)]
    udp: bool,

    /// Use SCTP (not supported on this platform)
    #[arg(long)]
    sctp: bool,

    /// Use a Unix domain socket at PATH
    #[arg(short = 'U', long, value_name = "PATH")]
    unix_socket: Option<PathBuf>,

    /// Use DTLS over UDP
    #[arg(long)]
    dtls: bool,

    /// DTLS path MTU (296..=65507)
    #[arg(long, default_value_t = 1200, value_name = "BYTES")]
    mtu: usize,

    /// Port: the listen port in listen mode, the source port otherwise
    #[arg(short = 'p', long = "port", value_name = "PORT", id = "port_flag")]
    port_flag: Option<u16>,

    /// Source address for outbound connections
    #[arg(short = 's', long, value_name = "ADDR")]
    source: Option<IpAddr>,

    /// Force IPv4
    #[arg(short = '4')]
    ipv4: bool,

    /// Force IPv6
    #[arg(short = '6')]
    ipv6: bool,

    /// Connect timeout in milliseconds
    #[arg(long, default_value_t = 10_000, value_name = "MS")]
    connect_timeout: i64,

    /// Accept timeout in milliseconds (0 = none)
    #[arg(long, default_value_t = 0, value_name = "MS")]
    accept_timeout: i64,

    /// Idle timeout in milliseconds (-1 = never, 0 = default policy)
    #[arg(long, default_value_t = 0, value_name = "MS")]
    idle_timeout: i64,

    /// Linger this long for remote data after local EOF
    #[arg(short = 'w', long = "wait", default_value_t = 0, value_name = "MS")]
    wait_time: i64,

    /// Delay between outbound chunks (traffic shaping)
    #[arg(short = 'd', long = "delay", default_value_t = 0, value_name = "MS")]
    delay: i64,

    /// Only send; ignore remote data
    #[arg(long)]
    send_only: bool,

    /// Only receive; ignore local input
    #[arg(long)]
    recv_only: bool,

    /// Half-close the connection when local input reaches EOF
    #[arg(long)]
    close_on_eof: bool,

    /// Translate bare LF to CRLF on output
    #[arg(long)]
    crlf: bool,

    /// Answer Telnet negotiations
    #[arg(long)]
    telnet: bool,

    /// Keep listening after a connection completes
    #[arg(short = 'k', long)]
    keep_listening: bool,

    /// Detached worker tasks per connection (0 = handle inline)
    #[arg(long, default_value_t = 0, value_name = "N")]
    max_conns: usize,

    /// Relay raw bytes between all connected clients
    #[arg(long)]
    broker: bool,

    /// Line-oriented relay with nicknames
    #[arg(long)]
    chat: bool,

    /// Client limit for broker/chat mode
    #[arg(long, default_value_t = 16, value_name = "N")]
    max_clients: usize,

    /// Nickname length cap in chat mode
    #[arg(long, default_value_t = 32, value_name = "BYTES")]
    max_nickname_len: usize,

    /// Message length cap in chat mode
    #[arg(long, default_value_t = 1024, value_name = "BYTES")]
    max_message_len: usize,

    /// Run PROG (with whitespace-separated args) bridged to the socket
    #[arg(short = 'e', long = "exec", value_name = "PROG [ARGS]")]
    exec: Option<String>,

    /// Run CMD through /bin/sh -c bridged to the socket
    #[arg(short = 'c', long = "sh-exec", value_name = "CMD")]
    sh_exec: Option<String>,

    /// Leave the child's stdin on the terminal instead of the socket
    #[arg(long)]
    no_redirect_stdin: bool,

    /// Leave the child's stdout on the terminal instead of the socket
    #[arg(long)]
    no_redirect_stdout: bool,

    /// Leave the child's stderr on the terminal instead of the socket
    #[arg(long)]
    no_redirect_stderr: bool,

    /// Child stdin buffer capacity
    #[arg(long, default_value_t = 32 * 1024, value_name = "BYTES")]
    exec_stdin_buf: usize,

    /// Child stdout read capacity
    #[arg(long, default_value_t = 64 * 1024, value_name = "BYTES")]
    exec_stdout_buf: usize,

    /// Child stderr read capacity
    #[arg(long, default_value_t = 32 * 1024, value_name = "BYTES")]
    exec_stderr_buf: usize,

    /// Aggregate exec buffer ceiling
    #[arg(long, default_value_t = 256 * 1024, value_name = "BYTES")]
    exec_max_buffer: usize,

    /// Pause reading the socket at this fraction of the ceiling
    #[arg(long, default_value_t = 0.85, value_name = "FRACTION")]
    exec_pause_pct: f64,

    /// Resume reading the socket at this fraction of the ceiling
    #[arg(long, default_value_t = 0.60, value_name = "FRACTION")]
    exec_resume_pct: f64,

    /// Kill the child after this much wall time (0 = never)
    #[arg(long, default_value_t = 0, value_name = "MS")]
    exec_timeout: u64,

    /// Kill the child after this long without traffic (0 = never)
    #[arg(long, default_value_t = 0, value_name = "MS")]
    exec_idle_timeout: u64,

    /// Kill the child if no traffic arrives at all within this (0 = never)
    #[arg(long, default_value_t = 0, value_name = "MS")]
    exec_connection_timeout: u64,

    /// Allow rule (IP, CIDR, or hostname); repeatable
    #[arg(long = "allow", action = ArgAction::Append, value_name = "RULE")]
    allow: Vec<String>,

    /// Alias of --allow; repeatable
    #[arg(long = "allow-ip", action = ArgAction::Append, value_name = "RULE")]
    allow_ip: Vec<String>,

    /// Deny rule; repeatable, deny always wins
    #[arg(long = "deny", action = ArgAction::Append, value_name = "RULE")]
    deny: Vec<String>,

    /// Alias of --deny; repeatable
    #[arg(long = "deny-ip", action = ArgAction::Append, value_name = "RULE")]
    deny_ip: Vec<String>,

    /// File of allow rules, one per line
    #[arg(long, value_name = "FILE")]
    allowfile: Option<PathBuf>,

    /// File of deny rules, one per line
    #[arg(long, value_name = "FILE")]
    denyfile: Option<PathBuf>,

    /// Enable TLS
    #[arg(long = "ssl")]
    ssl: bool,

    /// Certificate chain (PEM)
    #[arg(long = "ssl-cert", value_name = "FILE")]
    ssl_cert: Option<PathBuf>,

    /// Private key (PEM)
    #[arg(long = "ssl-key", value_name = "FILE")]
    ssl_key: Option<PathBuf>,

    /// Verify peer certificates
    #[arg(long = "ssl-verify")]
    ssl_verify: bool,

    /// Trust anchors (PEM) instead of the built-in roots
    #[arg(long = "ssl-trustfile", value_name = "FILE")]
    ssl_trustfile: Option<PathBuf>,

    /// Certificate revocation list (PEM)
    #[arg(long = "ssl-crl", value_name = "FILE")]
    ssl_crl: Option<PathBuf>,

    /// Restrict cipher suites (comma-separated rustls names)
    #[arg(long = "ssl-ciphers", value_name = "LIST")]
    ssl_ciphers: Option<String>,

    /// SNI name to present (defaults to the target host)
    #[arg(long = "ssl-servername", value_name = "NAME")]
    ssl_servername: Option<String>,

    /// ALPN protocols (comma-separated)
    #[arg(long = "ssl-alpn", value_name = "LIST")]
    ssl_alpn: Option<String>,

    /// Traverse this proxy (host:port)
    #[arg(long, value_name = "HOST:PORT")]
    proxy: Option<String>,

    /// Proxy protocol
    #[arg(long, value_name = "TYPE", default_value = "http")]
    proxy_type: String,

    /// Proxy credentials as user:pass
    #[arg(long, value_name = "USER:PASS")]
    proxy_auth: Option<String>,

    /// Where to resolve target hostnames
    #[arg(long, value_name = "MODE", default_value = "remote")]
    proxy_dns: String,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Errors only
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Hex-dump traffic to stderr, or to FILE when given
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "-")]
    hex_dump: Option<String>,

    /// Log received bytes to FILE
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// Append to the output file instead of truncating
    #[arg(long)]
    append: bool,

    /// Permit exec without an allow list
    #[arg(long)]
    allow_dangerous: bool,

    /// Refuse exec unless an allow list is configured
    #[arg(long)]
    require_allow_with_exec: bool,

    /// Drop privileges to this user after binding
    #[arg(long, value_name = "NAME")]
    user: Option<String>,

    /// Zero-I/O scan: connect, report, close
    #[arg(short = 'z')]
    zero_io: bool,

    /// Never resolve hostnames
    #[arg(long)]
    nodns: bool,
}

impl Args {
    fn into_config(self) -> Result<Config, String> {
        let mode = if self.listen { Mode::Listen } else { Mode::Connect };
        let transport = if self.unix_socket.is_some() {
            Transport::Unix
        } else if self.dtls {
            Transport::Dtls
        } else if self.sctp {
            Transport::Sctp
        } else if self.udp {
            Transport::Udp
        } else {
            Transport::Tcp
        };

        // `rcat -l 4000` puts the port in the host position.
        let mut host = self.host;
        let mut positional_port = self.port;
        if mode == Mode::Listen
            && positional_port.is_none()
            && let Some(h) = &host
            && let Ok(p) = h.parse::<u16>()
        {
            positional_port = Some(p);
            host = None;
        }

        let (port, source_port) = match mode {
            Mode::Listen => (
                self.port_flag.or(positional_port).unwrap_or(0),
                None,
            ),
            Mode::Connect => (
                positional_port.unwrap_or(0),
                self.port_flag,
            ),
        };
        if port == 0 && transport != Transport::Unix {
            return Err("port: a port is required".into());
        }

        let proxy = match self.proxy {
            Some(addr) => {
                let kind = match self.proxy_type.as_str() {
                    "http" => ProxyKind::Http,
                    "socks4" => ProxyKind::Socks4,
                    "socks5" => ProxyKind::Socks5,
                    other => return Err(format!("--proxy-type: unknown type '{other}'")),
                };
                let dns = match self.proxy_dns.as_str() {
                    "none" => ProxyDns::None,
                    "local" => ProxyDns::Local,
                    "remote" => ProxyDns::Remote,
                    "both" => ProxyDns::Both,
                    other => return Err(format!("--proxy-dns: unknown mode '{other}'")),
                };
                let auth = match self.proxy_auth {
                    Some(a) => {
                        let (u, p) = a
                            .split_once(':')
                            .ok_or("--proxy-auth: expected user:pass")?;
                        Some((u.to_string(), p.to_string()))
                    }
                    None => None,
                };
                Some(ProxyConfig { addr, kind, auth, dns })
            }
            None => None,
        };

        let split_list = |s: Option<String>| -> Vec<String> {
            s.map(|v| v.split(',').map(|x| x.trim().to_string()).collect())
                .unwrap_or_default()
        };

        let mut allow_rules = self.allow;
        allow_rules.extend(self.allow_ip);
        let mut deny_rules = self.deny;
        deny_rules.extend(self.deny_ip);

        let exec_given = self.exec.is_some();
        let exec = ExecOptions {
            program: self
                .exec
                .map(|e| e.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            shell: self.sh_exec,
            redirect_stdin: !self.no_redirect_stdin,
            redirect_stdout: !self.no_redirect_stdout,
            redirect_stderr: !self.no_redirect_stderr,
            stdin_buf: self.exec_stdin_buf,
            stdout_buf: self.exec_stdout_buf,
            stderr_buf: self.exec_stderr_buf,
            max_buffer: self.exec_max_buffer,
            pause_pct: self.exec_pause_pct,
            resume_pct: self.exec_resume_pct,
            execution_timeout_ms: self.exec_timeout,
            idle_timeout_ms: self.exec_idle_timeout,
            connection_timeout_ms: self.exec_connection_timeout,
        };
        if exec.program.is_empty() && exec_given {
            return Err("-e: empty program".into());
        }

        Ok(Config {
            mode,
            transport,
            host,
            port,
            source_addr: self.source,
            source_port,
            ipv4_only: self.ipv4,
            ipv6_only: self.ipv6,
            unix_path: self.unix_socket,
            connect_timeout_ms: self.connect_timeout,
            accept_timeout_ms: self.accept_timeout,
            idle_timeout_ms: self.idle_timeout,
            wait_time_ms: self.wait_time,
            delay_ms: self.delay,
            send_only: self.send_only,
            recv_only: self.recv_only,
            close_on_eof: self.close_on_eof,
            crlf: self.crlf,
            telnet: self.telnet,
            keep_listening: self.keep_listening,
            max_conns: self.max_conns,
            broker: self.broker,
            chat: self.chat,
            max_clients: self.max_clients,
            chat_max_nickname_len: self.max_nickname_len,
            chat_max_message_len: self.max_message_len,
            exec,
            tls: TlsOptions {
                enabled: self.ssl,
                cert: self.ssl_cert,
                key: self.ssl_key,
                verify: self.ssl_verify,
                trustfile: self.ssl_trustfile,
                crl: self.ssl_crl,
                ciphers: split_list(self.ssl_ciphers),
                servername: self.ssl_servername,
                alpn: split_list(self.ssl_alpn),
            },
            dtls_mtu: self.mtu,
            proxy,
            allow_rules,
            deny_rules,
            allow_file: self.allowfile,
            deny_file: self.denyfile,
            allow_dangerous: self.allow_dangerous,
            require_allow_with_exec: self.require_allow_with_exec,
            drop_user: self.user,
            zero_io: self.zero_io,
            nodns: self.nodns,
            output_file: self.output,
            append_output: self.append,
            hex_dump: match self.hex_dump {
                None => HexDump::Off,
                Some(s) if s == "-" => HexDump::Stderr,
                Some(s) => HexDump::File(PathBuf::from(s)),
            },
            verbosity: if self.quiet { 0 } else { 1 + self.verbose },
        })
    }
}

fn init_logging(quiet: bool, verbose: u8) {
    let directive = match (quiet, verbose) {
        (true, _) => "rcat=error",
        (false, 0) => "rcat=warn",
        (false, 1) => "rcat=info",
        (false, 2) => "rcat=debug",
        (false, _) => "rcat=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("static directive")),
        )
        // stdout carries session data; diagnostics go to stderr.
        .with_writer(std::io::stderr)
        .init();
}

fn fail(err: CatError, verbose: bool) -> ExitCode {
    eprintln!("rcat: {err}");
    if verbose && let Some(hint) = err.remediation() {
        eprintln!("rcat: hint: {hint}");
    }
    ExitCode::from(err.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.quiet, args.verbose);

    let cfg = match args.into_config() {
        Ok(cfg) => cfg,
        Err(msg) => {
            eprintln!("rcat: {msg}");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };
    if let Err(msg) = cfg.validate() {
        eprintln!("rcat: {msg}");
        return ExitCode::from(EXIT_CONFIG as u8);
    }
    let verbose = cfg.verbosity >= 2;

    let access = match rcat::net::AccessList::from_sources(
        &cfg.allow_rules,
        &cfg.deny_rules,
        cfg.allow_file.as_deref(),
        cfg.deny_file.as_deref(),
    ) {
        Ok(list) => list,
        Err(e) => return fail(CatError::Access(e), verbose),
    };

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    let cfg = Arc::new(cfg);
    let result = match cfg.mode {
        Mode::Listen => {
            let server = Server::new(cfg.clone(), Arc::new(access), shutdown);
            server.run().await
        }
        Mode::Connect => client::run_connect(&cfg, shutdown).await,
    };

    match result {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(e) => fail(e, verbose),
    }
}
