//! Networking core: the connection abstraction, terminal engines and
//! server runtimes.

pub mod access;
pub mod broker;
pub mod client;
pub mod connection;
pub mod dtls;
pub mod exec;
pub mod listener;
pub mod pool;
pub mod proxy;
pub mod sockets;
pub mod telnet;
pub mod tls;
pub mod transfer;
pub mod udp;
#[cfg(unix)]
pub mod unixsock;

// Re-exports
pub use access::{AccessError, AccessList, AccessRule, DNS_CACHE_TTL_SECS, DnsCache};
pub use broker::{Relay, RelayConfig};
pub use connection::{ConnError, ConnKind, Connection};
pub use dtls::{DEFAULT_MTU, DatagramProvider, DtlsSession, DtlsState};
pub use exec::{ExecError, ExecSession, FlowState, check_security};
pub use listener::{Server, ServerStats};
pub use pool::{ClientInfo, ClientPool, ClientRecord, PoolError, validate_nickname};
pub use proxy::{ProxyError, ProxyTarget, Socks5Reply};
pub use telnet::TelnetCodec;
pub use tls::{TlsError, accept_tls, connect_tls};
pub use transfer::{TransferContext, TransferOpts, TransferSummary, idle_policy};
pub use udp::{UdpClientOpts, UdpServerOpts, UdpStats};
