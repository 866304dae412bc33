//! Top-level error taxonomy and process exit codes

use crate::net::access::AccessError;
use crate::net::connection::ConnError;
use crate::net::exec::ExecError;
use crate::net::proxy::ProxyError;
use crate::net::tls::TlsError;
#[cfg(unix)]
use crate::net::unixsock::UnixSockError;
use std::io;

/// Exit codes are part of the CLI contract and stable across releases.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_NETWORK: i32 = 2;
pub const EXIT_SECURITY: i32 = 3;
pub const EXIT_CHILD: i32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum CatError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot resolve {host}: {source}")]
    Resolution { host: String, source: io::Error },

    #[error("{0} requires DNS resolution but --nodns is set")]
    DnsDisabled(String),

    #[error("network error: {0}")]
    Io(#[from] io::Error),

    #[error("connection error: {0}")]
    Conn(#[from] ConnError),

    #[error("connection timed out")]
    ConnectTimeout,

    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("access error: {0}")]
    Access(#[from] AccessError),

    #[error("exec error: {0}")]
    Exec(#[from] ExecError),

    #[cfg(unix)]
    #[error(transparent)]
    Unix(#[from] UnixSockError),

    #[error("security policy violation: {0}")]
    Policy(String),

    #[error("SCTP is not supported on this platform")]
    SctpUnsupported,
}

impl CatError {
    /// Map to the documented exit-code table.
    pub fn exit_code(&self) -> i32 {
        match self {
            CatError::Config(_) | CatError::SctpUnsupported => EXIT_CONFIG,
            CatError::Resolution { .. }
            | CatError::DnsDisabled(_)
            | CatError::Io(_)
            | CatError::Conn(_)
            | CatError::ConnectTimeout
            | CatError::Proxy(_)
            | CatError::Tls(_) => EXIT_NETWORK,
            #[cfg(unix)]
            CatError::Unix(e) => match e {
                UnixSockError::InvalidPath(_) => EXIT_CONFIG,
                _ => EXIT_NETWORK,
            },
            CatError::Access(e) => match e {
                AccessError::Denied(_) => EXIT_SECURITY,
                _ => EXIT_CONFIG,
            },
            CatError::Policy(_) => EXIT_SECURITY,
            CatError::Exec(e) => match e {
                // Policy-level exec failures are security violations, not
                // child failures.
                ExecError::RequireAllow | ExecError::DangerousWithoutAllow => EXIT_SECURITY,
                _ => EXIT_CHILD,
            },
        }
    }

    /// One-line remediation hint shown at verbose level.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            CatError::Config(_) => Some("run with --help for the option reference"),
            CatError::Resolution { .. } => {
                Some("check the hostname spelling and your DNS configuration")
            }
            CatError::Io(_) | CatError::Conn(_) => {
                Some("check the address, port, permissions and that the peer is reachable")
            }
            CatError::ConnectTimeout => Some("raise --connect-timeout or check connectivity"),
            CatError::Proxy(_) => Some("verify the proxy address, type and credentials"),
            CatError::Tls(_) => {
                Some("check certificate/key paths, trust settings and the server name")
            }
            CatError::Access(_) => Some("inspect your --allow/--deny rules"),
            CatError::Exec(_) => Some("check the program path and exec-related limits"),
            CatError::Policy(_) => {
                Some("add an allow list, or pass --allow-dangerous if you accept the risk")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatError>;
