// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

//! Just enough Telnet (RFC 854) to front a device console.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;

pub const OPT_BINARY: u8 = 0;
pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_NAWS: u8 = 31;

/// Liveness probe.
pub const IAC_NOP: [u8; 2] = [IAC, NOP];

/// What a fresh client is told when it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelnetOptions {
    pub echo: bool,
    pub suppress_go_ahead: bool,
    pub binary: bool,
    pub naws: bool,
}

impl Default for TelnetOptions {
    fn default() -> Self {
        Self {
            echo: true,
            suppress_go_ahead: true,
            binary: true,
            naws: true,
        }
    }
}

impl TelnetOptions {
    pub fn none() -> Self {
        Self {
            echo: false,
            suppress_go_ahead: false,
            binary: false,
            naws: false,
        }
    }

    pub fn negotiation(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.echo {
            out.extend_from_slice(&[IAC, WILL, OPT_ECHO]);
        }
        if self.suppress_go_ahead {
            out.extend_from_slice(&[IAC, WILL, OPT_SGA]);
        }
        if self.binary {
            out.extend_from_slice(&[IAC, WILL, OPT_BINARY, IAC, DO, OPT_BINARY]);
        }
        if self.naws {
            out.extend_from_slice(&[IAC, DO, OPT_NAWS]);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Option,
    Sub,
    SubIac,
}

/// Splits client input into payload and swallowed command sequences.
/// Keeps state across reads so sequences may straddle buffer boundaries.
#[derive(Debug)]
pub struct TelnetParser {
    state: State,
    sub: Vec<u8>,
    window: Option<(u16, u16)>,
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetParser {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            sub: Vec::new(),
            window: None,
        }
    }

    /// Last window size reported through NAWS, as (width, height).
    pub fn window(&self) -> Option<(u16, u16)> {
        self.window
    }

    pub fn feed(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            self.state = match (self.state, b) {
                (State::Data, IAC) => State::Iac,
                (State::Data, _) => {
                    out.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    out.push(IAC);
                    State::Data
                }
                (State::Iac, WILL | WONT | DO | DONT) => State::Option,
                (State::Iac, SB) => {
                    self.sub.clear();
                    State::Sub
                }
                (State::Iac, _) => State::Data,
                (State::Option, _) => State::Data,
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => {
                    self.sub.push(b);
                    State::Sub
                }
                (State::SubIac, SE) => {
                    self.finish_sub();
                    State::Data
                }
                (State::SubIac, IAC) => {
                    self.sub.push(IAC);
                    State::Sub
                }
                (State::SubIac, _) => State::Sub,
            };
        }
        out
    }

    fn finish_sub(&mut self) {
        if let [OPT_NAWS, w0, w1, h0, h1] = self.sub[..] {
            self.window = Some((u16::from_be_bytes([w0, w1]), u16::from_be_bytes([h0, h1])));
        }
        self.sub.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_data_passes_through() {
        let mut p = TelnetParser::new();
        assert_eq!(p.feed(b"show ip route\r\n"), b"show ip route\r\n");
    }

    #[test]
    fn negotiation_is_swallowed() {
        let mut p = TelnetParser::new();
        let input = [b'a', IAC, DO, OPT_ECHO, b'b', IAC, WONT, OPT_SGA, IAC, NOP, b'c'];
        assert_eq!(p.feed(&input), b"abc");
    }

    #[test]
    fn escaped_iac_is_literal() {
        let mut p = TelnetParser::new();
        assert_eq!(p.feed(&[1, IAC, IAC, 2]), vec![1, 255, 2]);
    }

    #[test]
    fn naws_across_reads() {
        let mut p = TelnetParser::new();
        assert!(p.feed(&[IAC, SB, OPT_NAWS, 0, 80]).is_empty());
        assert!(p.feed(&[0, 24, IAC]).is_empty());
        assert_eq!(p.feed(&[SE, b'x']), b"x");
        assert_eq!(p.window(), Some((80, 24)));
    }

    #[test]
    fn opening_negotiation() {
        assert!(TelnetOptions::none().negotiation().is_empty());
        let bytes = TelnetOptions::default().negotiation();
        assert_eq!(&bytes[..3], &[IAC, WILL, OPT_ECHO]);
        assert_eq!(&bytes[bytes.len() - 3..], &[IAC, DO, OPT_NAWS]);
    }
}
