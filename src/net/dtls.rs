//! Datagram TLS session: state machine and transport, provider pluggable.
//!
//! The cryptographic backend is a provider behind `DatagramProvider`; this
//! module owns everything else: the session state machine, MTU policy,
//! datagram-boundary preservation and handshake retransmission. No provider
//! is compiled in by default: `default_provider()` reports the backend as
//! unavailable and the CLI surfaces that as a TLS error.

use crate::net::tls::TlsError;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Default path MTU for handshake flights and sealed records.
pub const DEFAULT_MTU: usize = 1200;
/// Valid MTU range: IPv4 minimum reassembly size up to the UDP maximum.
pub const MTU_MIN: usize = 296;
pub const MTU_MAX: usize = 65507;

/// Initial handshake retransmission timeout; doubles per attempt.
const RETRANSMIT_BASE_MS: u64 = 1_000;
/// Retransmission attempts before the handshake is abandoned.
const MAX_RETRANSMITS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    Initial,
    CookieExchange,
    Handshake,
    Connected,
    Closing,
    Closed,
}

impl std::fmt::Display for DtlsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DtlsState::Initial => "initial",
            DtlsState::CookieExchange => "cookie_exchange",
            DtlsState::Handshake => "handshake",
            DtlsState::Connected => "connected",
            DtlsState::Closing => "closing",
            DtlsState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// What the provider wants the session to do next.
pub enum ProviderStep {
    /// Transmit these flights and move to the given state.
    Send(Vec<Vec<u8>>, DtlsState),
    /// Handshake complete; the session is connected.
    Established,
    /// Nothing to transmit; keep waiting.
    Continue,
}

/// The crypto backend contract. Implementations handle record protection
/// and flight construction; the session drives timing and the socket.
pub trait DatagramProvider: Send {
    /// Client-side first flight.
    fn initiate(&mut self) -> Result<ProviderStep, TlsError>;
    /// A handshake datagram arrived.
    fn on_datagram(&mut self, payload: &[u8]) -> Result<ProviderStep, TlsError>;
    /// Retransmission timer fired; reproduce the last flight.
    fn on_retransmit(&mut self) -> Result<ProviderStep, TlsError>;
    /// Protect one application datagram.
    fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>, TlsError>;
    /// Unprotect one datagram; `None` for non-application records.
    fn open(&mut self, wire: &[u8]) -> Result<Option<Vec<u8>>, TlsError>;
    /// Close-notify record, if the provider produces one.
    fn close_record(&mut self) -> Option<Vec<u8>>;
}

/// The backend shipped by default: none.
pub fn default_provider() -> Result<Box<dyn DatagramProvider>, TlsError> {
    Err(TlsError::NotAvailable)
}

/// Clamp-or-reject MTU validation.
pub fn validate_mtu(mtu: usize) -> Result<usize, TlsError> {
    if (MTU_MIN..=MTU_MAX).contains(&mtu) {
        Ok(mtu)
    } else {
        Err(TlsError::Config(format!(
            "MTU {mtu} outside {MTU_MIN}..={MTU_MAX}"
        )))
    }
}

/// A connected DTLS session over a (connected) UDP socket.
///
/// Reads and writes preserve datagram boundaries: one `write` seals one
/// record, one `read` opens one record.
pub struct DtlsSession {
    socket: UdpSocket,
    provider: Box<dyn DatagramProvider>,
    state: DtlsState,
    mtu: usize,
    retransmits: u64,
}

impl DtlsSession {
    /// Client-side handshake: drive the provider from `Initial` until it
    /// reports `Established`, retransmitting on timeout.
    pub async fn connect(
        socket: UdpSocket,
        provider: Box<dyn DatagramProvider>,
        mtu: usize,
    ) -> Result<Self, TlsError> {
        let mut session = Self {
            socket,
            provider,
            state: DtlsState::Initial,
            mtu: validate_mtu(mtu)?,
            retransmits: 0,
        };
        let step = session.provider.initiate()?;
        session.apply(step).await?;
        session.run_handshake().await?;
        Ok(session)
    }

    /// Server-side handshake: wait for the client's first flight. The
    /// provider is expected to route through `CookieExchange` before
    /// admitting handshake state, per the DoS-resistant DTLS pattern.
    pub async fn accept(
        socket: UdpSocket,
        provider: Box<dyn DatagramProvider>,
        mtu: usize,
    ) -> Result<Self, TlsError> {
        let mut session = Self {
            socket,
            provider,
            state: DtlsState::Initial,
            mtu: validate_mtu(mtu)?,
            retransmits: 0,
        };
        session.run_handshake().await?;
        Ok(session)
    }

    async fn run_handshake(&mut self) -> Result<(), TlsError> {
        let mut attempt: u32 = 0;
        let mut buf = vec![0u8; self.mtu];
        while self.state != DtlsState::Connected {
            let timeout = Duration::from_millis(RETRANSMIT_BASE_MS << attempt.min(5));
            match tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    attempt = 0;
                    let step = self.provider.on_datagram(&buf[..n])?;
                    self.apply(step).await?;
                }
                Ok(Err(e)) => return Err(TlsError::Handshake(e)),
                Err(_) => {
                    attempt += 1;
                    if attempt > MAX_RETRANSMITS {
                        return Err(TlsError::Handshake(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "DTLS handshake timed out",
                        )));
                    }
                    self.retransmits += 1;
                    trace!("DTLS retransmit #{} in state {}", self.retransmits, self.state);
                    let step = self.provider.on_retransmit()?;
                    self.apply(step).await?;
                }
            }
        }
        debug!(
            "DTLS handshake complete ({} retransmits, mtu {})",
            self.retransmits, self.mtu
        );
        Ok(())
    }

    async fn apply(&mut self, step: ProviderStep) -> Result<(), TlsError> {
        match step {
            ProviderStep::Send(flights, next_state) => {
                for flight in flights {
                    if flight.len() > self.mtu {
                        return Err(TlsError::Config(format!(
                            "provider flight of {} bytes exceeds MTU {}",
                            flight.len(),
                            self.mtu
                        )));
                    }
                    self.socket
                        .send(&flight)
                        .await
                        .map_err(TlsError::Handshake)?;
                }
                self.state = next_state;
            }
            ProviderStep::Established => {
                self.state = DtlsState::Connected;
            }
            ProviderStep::Continue => {}
        }
        Ok(())
    }

    /// Receive and unprotect one datagram. Returns 0-length only for an
    /// empty application record; non-application records are skipped.
    pub async fn read_datagram(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let mut buf = vec![0u8; MTU_MAX];
        loop {
            let n = self
                .socket
                .recv(&mut buf)
                .await
                .map_err(TlsError::Handshake)?;
            if let Some(plain) = self.provider.open(&buf[..n])? {
                out.clear();
                out.extend_from_slice(&plain);
                return Ok(plain.len());
            }
        }
    }

    /// Protect and send one datagram; the record must fit the MTU.
    pub async fn write_datagram(&mut self, data: &[u8]) -> Result<(), TlsError> {
        let record = self.provider.seal(data)?;
        if record.len() > self.mtu {
            return Err(TlsError::Config(format!(
                "sealed record of {} bytes exceeds MTU {}",
                record.len(),
                self.mtu
            )));
        }
        self.socket
            .send(&record)
            .await
            .map_err(TlsError::Handshake)?;
        Ok(())
    }

    /// Send close-notify best-effort and mark the session closed.
    pub async fn close(&mut self) {
        if self.state == DtlsState::Closed {
            return;
        }
        self.state = DtlsState::Closing;
        if let Some(record) = self.provider.close_record() {
            let _ = self.socket.send(&record).await;
        }
        self.state = DtlsState::Closed;
    }

    pub fn state(&self) -> DtlsState {
        self.state
    }

    /// Handshake retransmission counter.
    pub fn retransmits(&self) -> u64 {
        self.retransmits
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}
