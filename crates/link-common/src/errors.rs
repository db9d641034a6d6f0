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

use crate::session::{LinkState, SessionId};
use std::time::Duration;

/// Failures of the Link itself. Any of these tears down the Link connection (and triggers
/// the reconnect path), but never closes client sessions.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame payload of {length} bytes exceeds the maximum of {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unable to (de)serialize frame payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("peer speaks link protocol version {theirs}, we speak {ours}")]
    VersionMismatch { ours: u16, theirs: u16 },
    #[error("unexpected frame during {0}")]
    UnexpectedFrame(&'static str),
    #[error("no heartbeat reply within {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("link connection closed by peer")]
    Closed,
}

/// The per-connection error taxonomy. Every one of these is isolated to the session it names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("transport handshake failed: {0}")]
    TransportHandshake(String),
    #[error("input exceeded {limit} bytes without a line delimiter")]
    FrameOverflow { limit: usize },
    #[error("game link unavailable: {0}")]
    LinkUnavailable(String),
    #[error("session {session_id} stalled on backpressure for {waited:?}")]
    BackpressureTimeout {
        session_id: SessionId,
        waited: Duration,
    },
    #[error("session {session_id}: invalid transition {from} -> {to}")]
    InvalidStateTransition {
        session_id: SessionId,
        from: LinkState,
        to: LinkState,
    },
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("cannot resume session {session_id}: {reason}")]
    ResumeRejected {
        session_id: SessionId,
        reason: String,
    },
    #[error("session limit of {limit} reached")]
    TooManySessions { limit: usize },
}
