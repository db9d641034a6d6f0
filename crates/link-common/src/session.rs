// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Identity of one logical client, minted by the Portal's session registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Link-level frames (handshake, heartbeat) carry the nil id.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session, per-direction envelope ordinal. The first envelope in either direction is
/// sequence 1; `Sequence::ZERO` means "nothing yet" when used as a watermark.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Sequence {
        Sequence(self.0 + 1)
    }
}

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Telnet,
    TelnetTls,
    Ssh,
    Web,
}

impl TransportKind {
    pub const ALL: [TransportKind; 4] = [
        TransportKind::Telnet,
        TransportKind::TelnetTls,
        TransportKind::Ssh,
        TransportKind::Web,
    ];

    /// Only transports with a resume token survive a dropped connection as `detached`.
    /// Telnet has no such token, so its sessions close outright.
    pub fn supports_resume(&self) -> bool {
        matches!(self, TransportKind::Ssh | TransportKind::Web)
    }

    pub fn id_str(&self) -> &'static str {
        match self {
            TransportKind::Telnet => "telnet",
            TransportKind::TelnetTls => "telnet-tls",
            TransportKind::Ssh => "ssh",
            TransportKind::Web => "web",
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id_str())
    }
}

/// Lifecycle of a session as seen by the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Attached,
    Detached,
    Closed,
}

impl LinkState {
    /// The session state machine. `Closed` is terminal.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Connecting, Attached)
                | (Connecting, Closed)
                | (Attached, Detached)
                | (Attached, Closed)
                | (Detached, Attached)
                | (Detached, Closed)
        )
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, LinkState::Closed)
    }
}

impl Display for LinkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::Connecting => "connecting",
            LinkState::Attached => "attached",
            LinkState::Detached => "detached",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorDepth {
    #[default]
    None,
    Standard,
    EightBit,
    TrueColor,
}

/// Negotiated feature flags for a session. Only the owning adapter changes these; the Link
/// Client reads them when deciding how to route outbound envelopes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub color: ColorDepth,
    pub utf8: bool,
    /// Structured out-of-band messages (GMCP on telnet, JSON frames on the web).
    pub oob: bool,
    pub mssp: bool,
    pub compression: bool,
    pub naws: bool,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub terminal_type: Option<String>,
    pub vt100: bool,
    pub screen_reader: bool,
    pub mouse_tracking: bool,
    pub osc_color_palette: bool,
    pub proxy: bool,
    pub mnes: bool,
    pub mslp: bool,
    pub encryption: bool,
}

impl Capabilities {
    /// What a transport without negotiation (SSH) gets.
    pub fn minimal() -> Self {
        Self {
            color: ColorDepth::Standard,
            utf8: true,
            ..Default::default()
        }
    }

    /// Browsers render everything; the client can still narrow this down.
    pub fn web_defaults() -> Self {
        Self {
            color: ColorDepth::TrueColor,
            utf8: true,
            oob: true,
            ..Default::default()
        }
    }

    /// Color support only ever increases through negotiation.
    pub fn raise_color(&mut self, depth: ColorDepth) {
        if depth > self.color {
            self.color = depth;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(LinkState::Connecting, LinkState::Attached, true; "connecting to attached")]
    #[test_case(LinkState::Connecting, LinkState::Closed, true; "connecting to closed")]
    #[test_case(LinkState::Connecting, LinkState::Detached, false; "connecting cannot detach")]
    #[test_case(LinkState::Attached, LinkState::Detached, true; "attached to detached")]
    #[test_case(LinkState::Detached, LinkState::Attached, true; "resume")]
    #[test_case(LinkState::Detached, LinkState::Closed, true; "grace expiry")]
    #[test_case(LinkState::Closed, LinkState::Attached, false; "closed is terminal")]
    #[test_case(LinkState::Attached, LinkState::Attached, false; "no self transition")]
    fn test_state_machine(from: LinkState, to: LinkState, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_resume_policy() {
        assert!(!TransportKind::Telnet.supports_resume());
        assert!(!TransportKind::TelnetTls.supports_resume());
        assert!(TransportKind::Ssh.supports_resume());
        assert!(TransportKind::Web.supports_resume());
    }

    #[test]
    fn test_color_only_raises() {
        let mut caps = Capabilities::default();
        caps.raise_color(ColorDepth::EightBit);
        caps.raise_color(ColorDepth::Standard);
        assert_eq!(caps.color, ColorDepth::EightBit);
    }
}
