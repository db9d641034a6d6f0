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

//! Vocabulary shared by both ends of the Link: session identity, capabilities,
//! the envelope model, the wire framing, and the replay buffer used to survive
//! a Link reconnect.

pub use backoff::Backoff;
pub use envelope::{
    CloseReason, ControlMessage, DetachReason, Envelope, EnvelopeKind, OobMessage, Payload,
};
pub use errors::{LinkError, SessionError};
pub use frame::{Hello, LINK_PROTOCOL_VERSION, LinkCodec, LinkFrame, Welcome};
pub use outbox::Outbox;
pub use session::{Capabilities, ColorDepth, LinkState, Sequence, SessionId, TransportKind};

mod backoff;
mod envelope;
mod errors;
mod frame;
mod outbox;
mod session;
pub mod tracing;

/// Default maximum payload size of a single Link frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;
