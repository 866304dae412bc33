//! Minimal Telnet codec: IAC escaping and answer-only option negotiation.
//!
//! Every DO is refused with WONT and every WILL with DONT, which keeps the
//! remote side in plain NVT mode. Subnegotiation blocks are skipped. The
//! exec path sends a small server-side preamble before the pumps start.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    /// Saw IAC + one of WILL/WONT/DO/DONT; next byte is the option.
    Opt(u8),
    Subneg,
    SubnegIac,
}

/// Stateful decoder; one instance per connection direction pair.
pub struct TelnetCodec {
    state: State,
}

impl TelnetCodec {
    pub fn new() -> Self {
        Self { state: State::Data }
    }

    /// Decode inbound bytes: application data goes to `out`, protocol
    /// answers (refusals) to `replies` for the caller to send back.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &b in input {
            match self.state {
                State::Data => {
                    if b == IAC {
                        self.state = State::Iac;
                    } else {
                        out.push(b);
                    }
                }
                State::Iac => match b {
                    IAC => {
                        // Escaped 0xFF literal.
                        out.push(IAC);
                        self.state = State::Data;
                    }
                    WILL | WONT | DO | DONT => {
                        self.state = State::Opt(b);
                    }
                    SB => {
                        self.state = State::Subneg;
                    }
                    _ => {
                        // Bare command (NOP, AYT, ...): swallow.
                        self.state = State::Data;
                    }
                },
                State::Opt(cmd) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, b]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, b]),
                        // DONT/WONT acknowledge our refusals; no answer.
                        _ => {}
                    }
                    self.state = State::Data;
                }
                State::Subneg => {
                    if b == IAC {
                        self.state = State::SubnegIac;
                    }
                }
                State::SubnegIac => {
                    if b == SE {
                        self.state = State::Data;
                    } else {
                        self.state = State::Subneg;
                    }
                }
            }
        }
    }

    /// Encode outbound application data, escaping 0xFF.
    pub fn encode(&self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if b == IAC {
                out.push(IAC);
            }
            out.push(b);
        }
    }
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side negotiation sent before the exec pumps: we take over echo
/// and suppress go-ahead, which is what a shell bridge expects.
pub fn server_preamble() -> Vec<u8> {
    vec![IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA]
}
