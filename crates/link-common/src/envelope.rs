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

use crate::errors::LinkError;
use crate::session::{Capabilities, Sequence, SessionId, TransportKind};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    Text = 0,
    OutOfBand = 1,
    Control = 2,
}

impl EnvelopeKind {
    pub fn from_u8(kind: u8) -> Option<Self> {
        match kind {
            0 => Some(EnvelopeKind::Text),
            1 => Some(EnvelopeKind::OutOfBand),
            2 => Some(EnvelopeKind::Control),
            _ => None,
        }
    }
}

/// A structured out-of-band message, e.g. a GMCP `Package.Message {json}` pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OobMessage {
    pub package: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl OobMessage {
    pub fn new(package: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            package: package.into(),
            data,
        }
    }

    /// Parse the GMCP wire form: a package name, optionally followed by whitespace and JSON.
    pub fn from_gmcp(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (package, rest) = match raw.split_once(char::is_whitespace) {
            Some((package, rest)) => (package, rest.trim()),
            None => (raw, ""),
        };
        let data = if rest.is_empty() {
            serde_json::Value::Null
        } else {
            // Some clients send bare words rather than JSON; keep them as a string.
            serde_json::from_str(rest).unwrap_or_else(|_| serde_json::Value::String(rest.into()))
        };
        Some(Self::new(package, data))
    }

    pub fn to_gmcp(&self) -> String {
        if self.data.is_null() {
            self.package.clone()
        } else {
            format!("{} {}", self.package, self.data)
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The client's transport dropped; it may come back with its resume token.
    TransportLost,
    /// The Game was unreachable past the configured maximum outage.
    LinkOutage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Logout,
    TransportClosed,
    HandshakeFailed,
    Overflow,
    IdleTimeout,
    GraceExpired,
    BackpressureTimeout,
    GameRequested,
    Refused,
    Shutdown,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Logout => "logged out",
            CloseReason::TransportClosed => "connection closed",
            CloseReason::HandshakeFailed => "handshake failed",
            CloseReason::Overflow => "input line too long",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::GraceExpired => "reconnect window expired",
            CloseReason::BackpressureTimeout => "stalled waiting for the game",
            CloseReason::GameRequested => "disconnected by the game",
            CloseReason::Refused => "connection refused",
            CloseReason::Shutdown => "server shutting down",
        };
        f.write_str(s)
    }
}

/// Session lifecycle and link-status messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Connected {
        transport: TransportKind,
        remote_address: IpAddr,
        hostname: Option<String>,
        capabilities: Capabilities,
    },
    Resumed {
        transport: TransportKind,
        remote_address: IpAddr,
    },
    Detached {
        reason: DetachReason,
    },
    Closed {
        reason: CloseReason,
    },
    Capabilities {
        capabilities: Capabilities,
    },
    Overflow {
        limit: usize,
    },
    /// The Game refused a command (lock evaluation failed); shown to the client.
    Denied {
        reason: String,
    },
    /// The Game asks the Portal to close this session.
    Disconnect {
        reason: String,
    },
    Notice {
        text: String,
    },
    ResumeFailed {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Text(Bytes),
    OutOfBand(OobMessage),
    Control(ControlMessage),
}

impl Payload {
    pub fn text(line: impl Into<String>) -> Self {
        Payload::Text(Bytes::from(line.into()))
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Payload::Text(_) => EnvelopeKind::Text,
            Payload::OutOfBand(_) => EnvelopeKind::OutOfBand,
            Payload::Control(_) => EnvelopeKind::Control,
        }
    }

    pub fn encode(&self) -> Result<Bytes, LinkError> {
        match self {
            Payload::Text(bytes) => Ok(bytes.clone()),
            Payload::OutOfBand(oob) => Ok(Bytes::from(serde_json::to_vec(oob)?)),
            Payload::Control(control) => Ok(Bytes::from(serde_json::to_vec(control)?)),
        }
    }

    pub fn decode(kind: EnvelopeKind, bytes: Bytes) -> Result<Self, LinkError> {
        match kind {
            EnvelopeKind::Text => Ok(Payload::Text(bytes)),
            EnvelopeKind::OutOfBand => Ok(Payload::OutOfBand(serde_json::from_slice(&bytes)?)),
            EnvelopeKind::Control => Ok(Payload::Control(serde_json::from_slice(&bytes)?)),
        }
    }
}

/// The normalized unit of data crossing the Link.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub session_id: SessionId,
    pub sequence: Sequence,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(session_id: SessionId, sequence: Sequence, payload: Payload) -> Self {
        Self {
            session_id,
            sequence,
            payload,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    /// The text of a text-line envelope, decoded lossily.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        match &self.payload {
            Payload::Text(bytes) => Some(String::from_utf8_lossy(bytes)),
            _ => None,
        }
    }
}
