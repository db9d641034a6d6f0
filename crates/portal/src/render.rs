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

//! Shaping game output for a particular client's capabilities.

use link_common::{Capabilities, CloseReason, ColorDepth, ControlMessage};
use regex::Regex;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
        .unwrap_or_else(|e| panic!("ANSI escape pattern: {e}"))
});

/// Decode game text for a client: escapes stripped when it has no color, non-ASCII replaced
/// when it cannot take UTF-8.
pub fn adapt_text(bytes: &[u8], capabilities: &Capabilities) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = if capabilities.color == ColorDepth::None {
        ANSI_ESCAPE.replace_all(&text, "")
    } else {
        text
    };
    if capabilities.utf8 {
        text.into_owned()
    } else {
        text.chars()
            .map(|c| if c.is_ascii() { c } else { '?' })
            .collect()
    }
}

/// Text for a line-oriented terminal: every LF preceded by exactly one CR, runs of CR collapsed,
/// and the whole thing terminated with CRLF unless it already ends a line.
pub fn terminal_line(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    let mut after_cr = false;
    for byte in text.bytes() {
        match byte {
            b'\r' => {
                if !after_cr {
                    out.push(b'\r');
                }
                after_cr = true;
            }
            b'\n' => {
                if !after_cr {
                    out.push(b'\r');
                }
                out.push(b'\n');
                after_cr = false;
            }
            _ => {
                out.push(byte);
                after_cr = false;
            }
        }
    }
    if !out.ends_with(b"\n") {
        if !after_cr {
            out.push(b'\r');
        }
        out.push(b'\n');
    }
    out
}

/// Control messages from the Game that are meant to be seen by the player.
pub fn control_text(message: &ControlMessage) -> Option<String> {
    match message {
        ControlMessage::Denied { reason } => Some(reason.clone()),
        ControlMessage::Notice { text } => Some(text.clone()),
        ControlMessage::Disconnect { reason } if !reason.is_empty() => Some(reason.clone()),
        ControlMessage::ResumeFailed { reason } => {
            Some(format!("*** Unable to resume session: {reason} ***"))
        }
        _ => None,
    }
}

/// Last words to a client whose session is closing.
pub fn close_notice(reason: CloseReason) -> Option<&'static str> {
    match reason {
        CloseReason::Overflow => Some("*** Input line too long; disconnecting. ***"),
        CloseReason::IdleTimeout => Some("*** Idle too long; disconnecting. ***"),
        CloseReason::GraceExpired => {
            Some("*** Lost connection to the game; session closed. ***")
        }
        CloseReason::BackpressureTimeout => {
            Some("*** The game is not keeping up; disconnecting. ***")
        }
        CloseReason::Refused => Some("*** Too many connections; try again later. ***"),
        CloseReason::Shutdown => Some("*** The server is shutting down. ***"),
        CloseReason::Logout
        | CloseReason::TransportClosed
        | CloseReason::HandshakeFailed
        | CloseReason::GameRequested => None,
    }
}
