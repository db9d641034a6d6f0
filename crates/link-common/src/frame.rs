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

//! Link framing. Every unit on the wire is
//! `kind:u8 | session_id:[u8;16] | sequence:u64 | payload_len:u32 | payload`, big-endian.
//! Kinds 0..=2 are session envelopes; the rest are link-level frames.

use crate::envelope::{Envelope, EnvelopeKind, Payload};
use crate::errors::LinkError;
use crate::session::{Sequence, SessionId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

pub const LINK_PROTOCOL_VERSION: u16 = 1;

const HEADER_LEN: usize = 1 + 16 + 8 + 4;

const KIND_HELLO: u8 = 16;
const KIND_WELCOME: u8 = 17;
const KIND_ACK: u8 = 18;
const KIND_RELEASE: u8 = 19;
const KIND_RELEASED: u8 = 20;
const KIND_PING: u8 = 21;
const KIND_PONG: u8 = 22;

/// Sent by the Portal when the Link (re)connects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u16,
    pub portal_id: Uuid,
    /// Highest game->client sequence the Portal has handed to each session's adapter.
    pub delivered: Vec<(SessionId, Sequence)>,
}

/// The Game's reply to `Hello`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub version: u16,
    pub game_id: Uuid,
    /// Highest client->game sequence the Dispatcher has acknowledged, per session.
    pub acknowledged: Vec<(SessionId, Sequence)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LinkFrame {
    Envelope(Envelope),
    Hello(Hello),
    Welcome(Welcome),
    /// Cumulative acknowledgement of everything up to and including `sequence`.
    Ack {
        session_id: SessionId,
        sequence: Sequence,
    },
    /// The session is closed and fully acknowledged; the Game may forget it.
    Release { session_id: SessionId },
    /// The Game has forgotten the session; the Portal may release its registry entry.
    Released { session_id: SessionId },
    Ping(u64),
    Pong(u64),
}

pub struct LinkCodec {
    max_frame_length: usize,
}

impl LinkCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for LinkCodec {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_LENGTH)
    }
}

/// Writes nothing when the length does not fit the header's 32-bit field.
fn put_header(
    buf: &mut BytesMut,
    kind: u8,
    session_id: &SessionId,
    sequence: u64,
    payload_len: usize,
) -> Result<(), LinkError> {
    let wire_len = u32::try_from(payload_len).map_err(|_| LinkError::FrameTooLarge {
        length: payload_len,
        max: u32::MAX as usize,
    })?;
    buf.reserve(HEADER_LEN + payload_len);
    buf.put_u8(kind);
    buf.put_slice(session_id.as_bytes());
    buf.put_u64(sequence);
    buf.put_u32(wire_len);
    Ok(())
}

impl Decoder for LinkCodec {
    type Item = LinkFrame;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([src[25], src[26], src[27], src[28]]) as usize;
        if payload_len > self.max_frame_length {
            return Err(LinkError::FrameTooLarge {
                length: payload_len,
                max: self.max_frame_length,
            });
        }
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        let kind = src.get_u8();
        let mut id = [0u8; 16];
        src.copy_to_slice(&mut id);
        let session_id = SessionId::from_bytes(id);
        let sequence = src.get_u64();
        let _ = src.get_u32();
        let payload: Bytes = src.split_to(payload_len).freeze();

        if let Some(envelope_kind) = EnvelopeKind::from_u8(kind) {
            if session_id.is_nil() {
                return Err(LinkError::MalformedFrame(
                    "session envelope without a session id".to_string(),
                ));
            }
            let payload = Payload::decode(envelope_kind, payload)?;
            return Ok(Some(LinkFrame::Envelope(Envelope::new(
                session_id,
                Sequence(sequence),
                payload,
            ))));
        }

        let frame = match kind {
            KIND_HELLO => LinkFrame::Hello(serde_json::from_slice(&payload)?),
            KIND_WELCOME => LinkFrame::Welcome(serde_json::from_slice(&payload)?),
            KIND_ACK => LinkFrame::Ack {
                session_id,
                sequence: Sequence(sequence),
            },
            KIND_RELEASE => LinkFrame::Release { session_id },
            KIND_RELEASED => LinkFrame::Released { session_id },
            KIND_PING => LinkFrame::Ping(sequence),
            KIND_PONG => LinkFrame::Pong(sequence),
            other => return Err(LinkError::UnknownFrameKind(other)),
        };
        Ok(Some(frame))
    }
}

impl Encoder<LinkFrame> for LinkCodec {
    type Error = LinkError;

    fn encode(&mut self, frame: LinkFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let nil = SessionId::nil();
        let (kind, session_id, sequence, payload) = match frame {
            LinkFrame::Envelope(envelope) => (
                envelope.kind() as u8,
                envelope.session_id,
                envelope.sequence.0,
                envelope.payload.encode()?,
            ),
            LinkFrame::Hello(hello) => (KIND_HELLO, nil, 0, Bytes::from(serde_json::to_vec(&hello)?)),
            LinkFrame::Welcome(welcome) => (
                KIND_WELCOME,
                nil,
                0,
                Bytes::from(serde_json::to_vec(&welcome)?),
            ),
            LinkFrame::Ack {
                session_id,
                sequence,
            } => (KIND_ACK, session_id, sequence.0, Bytes::new()),
            LinkFrame::Release { session_id } => (KIND_RELEASE, session_id, 0, Bytes::new()),
            LinkFrame::Released { session_id } => (KIND_RELEASED, session_id, 0, Bytes::new()),
            LinkFrame::Ping(nonce) => (KIND_PING, nil, nonce, Bytes::new()),
            LinkFrame::Pong(nonce) => (KIND_PONG, nil, nonce, Bytes::new()),
        };

        if payload.len() > self.max_frame_length {
            return Err(LinkError::FrameTooLarge {
                length: payload.len(),
                max: self.max_frame_length,
            });
        }
        put_header(dst, kind, &session_id, sequence, payload.len())?;
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ControlMessage, OobMessage};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn encode(frame: LinkFrame) -> BytesMut {
        let mut codec = LinkCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_envelope_header_layout() {
        let session_id = SessionId::new();
        let buf = encode(LinkFrame::Envelope(Envelope::new(
            session_id,
            Sequence(7),
            Payload::text("look"),
        )));
        assert_eq!(buf.len(), HEADER_LEN + 4);
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[1..17], session_id.as_bytes());
        assert_eq!(&buf[17..25], &7u64.to_be_bytes());
        assert_eq!(&buf[25..29], &4u32.to_be_bytes());
        assert_eq!(&buf[29..], b"look");
    }

    #[test]
    fn test_decode_across_partial_reads() {
        let session_id = SessionId::new();
        let frame = LinkFrame::Envelope(Envelope::new(
            session_id,
            Sequence(3),
            Payload::OutOfBand(OobMessage::new("Char.Vitals", json!({"hp": 10}))),
        ));
        let mut wire = encode(frame.clone());
        wire.extend_from_slice(&encode(LinkFrame::Ping(99)));

        let mut codec = LinkCodec::default();
        let mut buf = BytesMut::new();
        let mut frames = vec![];
        // Feed a byte at a time.
        for byte in wire.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![frame, LinkFrame::Ping(99)]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_frames() {
        let session_id = SessionId::new();
        let hello = LinkFrame::Hello(Hello {
            version: LINK_PROTOCOL_VERSION,
            portal_id: Uuid::new_v4(),
            delivered: vec![(session_id, Sequence(12))],
        });
        let mut codec = LinkCodec::default();
        let mut buf = encode(hello.clone());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(hello));

        let ack = LinkFrame::Ack {
            session_id,
            sequence: Sequence(4),
        };
        let mut buf = encode(ack.clone());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ack));
    }

    #[test]
    fn test_control_envelope() {
        let frame = LinkFrame::Envelope(Envelope::new(
            SessionId::new(),
            Sequence(1),
            Payload::Control(ControlMessage::Denied {
                reason: "You can't go that way.".to_string(),
            }),
        ));
        let mut codec = LinkCodec::default();
        let mut buf = encode(frame.clone());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = LinkCodec::new(8);
        let mut buf = BytesMut::new();
        put_header(&mut buf, 0, &SessionId::new(), 1, 9).unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(LinkError::FrameTooLarge { length: 9, max: 8 })
        ));

        let mut out = BytesMut::new();
        let result = codec.encode(
            LinkFrame::Envelope(Envelope::new(
                SessionId::new(),
                Sequence(1),
                Payload::text("far too long"),
            )),
            &mut out,
        );
        assert!(matches!(result, Err(LinkError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_unknown_kind_and_nil_session() {
        let mut codec = LinkCodec::default();
        let mut buf = BytesMut::new();
        put_header(&mut buf, 99, &SessionId::nil(), 0, 0).unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(LinkError::UnknownFrameKind(99))
        ));

        let mut buf = BytesMut::new();
        put_header(&mut buf, 0, &SessionId::nil(), 1, 0).unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(LinkError::MalformedFrame(_))
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_length_beyond_the_header_field_is_refused() {
        let mut buf = BytesMut::new();
        let too_long = u32::MAX as usize + 1;
        assert!(matches!(
            put_header(&mut buf, 0, &SessionId::nil(), 1, too_long),
            Err(LinkError::FrameTooLarge { length, max })
                if length == too_long && max == u32::MAX as usize
        ));
        assert!(buf.is_empty());
    }
}
