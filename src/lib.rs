//! rcat: a modern netcat.
//!
//! Byte-stream plumbing over TCP, UDP and Unix domain sockets with
//! optional TLS, outbound proxy traversal, exec/shell bridging, access
//! control, and a multi-client broker/chat relay.

pub mod config;
pub mod error;
pub mod net;
pub mod sink;
pub mod types;

pub use config::{Config, Mode, Transport};
pub use error::{CatError, EXIT_CHILD, EXIT_CONFIG, EXIT_NETWORK, EXIT_OK, EXIT_SECURITY, Result};
pub use net::{AccessList, Connection, Relay, RelayConfig, Server};
pub use types::{Shutdown, install_signal_handlers};
