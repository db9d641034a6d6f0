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

//! Telnet wire codec: separates application lines from IAC command sequences on the way in,
//! escapes and optionally MCCP2-compresses on the way out. Once a client starts MCCP3 its
//! input is inflated before parsing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;
use std::mem;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_NAWS: u8 = 31;
pub const OPT_MSSP: u8 = 70;
pub const OPT_MCCP2: u8 = 86;
pub const OPT_MCCP3: u8 = 87;
pub const OPT_GMCP: u8 = 201;

/// What the decoder yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    /// One line of application data, delimiters stripped, decoded lossily.
    Line(String),
    Negotiate { command: u8, option: u8 },
    Subnegotiation { option: u8, data: Bytes },
    /// A bare IAC command such as NOP, AYT or GA.
    Command(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetFrame {
    /// Application bytes, already line-terminated; IAC is escaped on the way out.
    Data(Bytes),
    Negotiate { command: u8, option: u8 },
    Subnegotiation { option: u8, data: Bytes },
    /// Announce MCCP2 and compress everything written after it.
    StartCompression,
}

#[derive(Debug, thiserror::Error)]
pub enum TelnetCodecError {
    #[error("input exceeded {limit} bytes without a line delimiter")]
    LineTooLong { limit: usize },
    #[error("client compressed input is corrupt: {0}")]
    Inflate(#[from] flate2::DecompressError),
    #[error("client took no output for {0:?}")]
    WriteStalled(Duration),
    #[error("telnet I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ParseState {
    Data,
    Iac,
    Negotiate(u8),
    SubOption,
    Sub(u8),
    SubIac(u8),
}

pub struct TelnetCodec {
    state: ParseState,
    line: BytesMut,
    sub: BytesMut,
    max_line_length: usize,
    compressor: Option<Compress>,
    decompressor: Option<Decompress>,
    /// Inflated client input not yet parsed.
    inflated: BytesMut,
}

impl TelnetCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            state: ParseState::Data,
            line: BytesMut::new(),
            sub: BytesMut::new(),
            max_line_length,
            compressor: None,
            decompressor: None,
            inflated: BytesMut::new(),
        }
    }

    pub fn is_compressing(&self) -> bool {
        self.compressor.is_some()
    }

    pub fn is_decompressing(&self) -> bool {
        self.decompressor.is_some()
    }

    /// Move everything in `buf` through the client's zlib stream into `self.inflated`. When the
    /// stream ends, bytes after it stay in `buf` as plain input.
    fn inflate(&mut self, buf: &mut BytesMut) -> Result<(), TelnetCodecError> {
        let Some(decompressor) = self.decompressor.as_mut() else {
            return Ok(());
        };
        let mut out = Vec::with_capacity(buf.len() * 2 + 64);
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(256));
            }
            let before_in = decompressor.total_in();
            let before_out = decompressor.total_out();
            let status = decompressor.decompress_vec(&buf[..], &mut out, FlushDecompress::Sync)?;
            buf.advance((decompressor.total_in() - before_in) as usize);
            if status == Status::StreamEnd {
                self.decompressor = None;
                break;
            }
            let progressed =
                decompressor.total_in() != before_in || decompressor.total_out() != before_out;
            if !progressed || (buf.is_empty() && out.len() < out.capacity()) {
                break;
            }
        }
        self.inflated.extend_from_slice(&out);
        Ok(())
    }

    fn push_data(&mut self, byte: u8) -> Result<(), TelnetCodecError> {
        if self.line.len() >= self.max_line_length {
            self.line.clear();
            return Err(TelnetCodecError::LineTooLong {
                limit: self.max_line_length,
            });
        }
        self.line.put_u8(byte);
        Ok(())
    }

    fn push_sub(&mut self, byte: u8) -> Result<(), TelnetCodecError> {
        if self.sub.len() >= self.max_line_length {
            self.sub.clear();
            return Err(TelnetCodecError::LineTooLong {
                limit: self.max_line_length,
            });
        }
        self.sub.put_u8(byte);
        Ok(())
    }

    fn take_line(&mut self) -> String {
        let mut line = self.line.split();
        while line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8_lossy(&line).into_owned()
    }

    fn write_out(&mut self, raw: &[u8], dst: &mut BytesMut) -> Result<(), TelnetCodecError> {
        match self.compressor.as_mut() {
            None => dst.extend_from_slice(raw),
            Some(compressor) => deflate(compressor, raw, dst)?,
        }
        Ok(())
    }
}

/// Compress `input` with a sync flush so the client can decode everything written so far.
fn deflate(compressor: &mut Compress, input: &[u8], dst: &mut BytesMut) -> io::Result<()> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut consumed = 0;
    loop {
        if out.capacity() - out.len() < 64 {
            out.reserve(out.capacity().max(256));
        }
        let before = compressor.total_in();
        compressor
            .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
            .map_err(io::Error::other)?;
        consumed += (compressor.total_in() - before) as usize;
        if consumed >= input.len() && out.len() < out.capacity() {
            break;
        }
    }
    dst.extend_from_slice(&out);
    Ok(())
}

fn escape_iac(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
}

impl TelnetCodec {
    fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<TelnetEvent>, TelnetCodecError> {
        while buf.has_remaining() {
            let byte = buf.get_u8();
            match self.state {
                ParseState::Data => match byte {
                    IAC => self.state = ParseState::Iac,
                    b'\n' => return Ok(Some(TelnetEvent::Line(self.take_line()))),
                    // CR NUL is how some clients send a bare carriage return.
                    0 => {}
                    _ => self.push_data(byte)?,
                },
                ParseState::Iac => match byte {
                    IAC => {
                        self.state = ParseState::Data;
                        self.push_data(IAC)?;
                    }
                    WILL | WONT | DO | DONT => self.state = ParseState::Negotiate(byte),
                    SB => self.state = ParseState::SubOption,
                    command => {
                        self.state = ParseState::Data;
                        return Ok(Some(TelnetEvent::Command(command)));
                    }
                },
                ParseState::Negotiate(command) => {
                    self.state = ParseState::Data;
                    return Ok(Some(TelnetEvent::Negotiate {
                        command,
                        option: byte,
                    }));
                }
                ParseState::SubOption => {
                    self.sub.clear();
                    self.state = ParseState::Sub(byte);
                }
                ParseState::Sub(option) => {
                    if byte == IAC {
                        self.state = ParseState::SubIac(option);
                    } else {
                        self.push_sub(byte)?;
                    }
                }
                ParseState::SubIac(option) => match byte {
                    SE => {
                        self.state = ParseState::Data;
                        if option == OPT_MCCP3 && self.decompressor.is_none() {
                            // Everything after this subnegotiation is compressed.
                            self.decompressor = Some(Decompress::new(true));
                            self.sub.clear();
                            return Ok(Some(TelnetEvent::Subnegotiation {
                                option,
                                data: Bytes::new(),
                            }));
                        }
                        return Ok(Some(TelnetEvent::Subnegotiation {
                            option,
                            data: self.sub.split().freeze(),
                        }));
                    }
                    IAC => {
                        self.state = ParseState::Sub(option);
                        self.push_sub(IAC)?;
                    }
                    // Unterminated subnegotiation; drop it and take this as the command.
                    WILL | WONT | DO | DONT => {
                        self.sub.clear();
                        self.state = ParseState::Negotiate(byte);
                    }
                    command => {
                        self.sub.clear();
                        self.state = ParseState::Data;
                        return Ok(Some(TelnetEvent::Command(command)));
                    }
                },
            }
        }
        Ok(None)
    }
}

impl Decoder for TelnetCodec {
    type Item = TelnetEvent;
    type Error = TelnetCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.decompressor.is_some() {
            if let Err(e) = self.inflate(buf) {
                self.decompressor = None;
                return Err(e);
            }
        }
        if !self.inflated.is_empty() {
            let mut inflated = mem::take(&mut self.inflated);
            let parsed = self.parse(&mut inflated);
            self.inflated = inflated;
            if let Some(event) = parsed? {
                return Ok(Some(event));
            }
        }
        if self.decompressor.is_some() {
            return Ok(None);
        }
        self.parse(buf)
    }
}

impl Encoder<TelnetFrame> for TelnetCodec {
    type Error = TelnetCodecError;

    fn encode(&mut self, frame: TelnetFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut raw = Vec::new();
        match frame {
            TelnetFrame::Data(data) => escape_iac(&data, &mut raw),
            TelnetFrame::Negotiate { command, option } => {
                raw.extend_from_slice(&[IAC, command, option]);
            }
            TelnetFrame::Subnegotiation { option, data } => {
                raw.extend_from_slice(&[IAC, SB, option]);
                escape_iac(&data, &mut raw);
                raw.extend_from_slice(&[IAC, SE]);
            }
            TelnetFrame::StartCompression => {
                if self.compressor.is_none() {
                    dst.extend_from_slice(&[IAC, SB, OPT_MCCP2, IAC, SE]);
                    self.compressor = Some(Compress::new(Compression::new(9), true));
                }
                return Ok(());
            }
        }
        self.write_out(&raw, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut TelnetCodec, input: &[u8]) -> Vec<TelnetEvent> {
        let mut buf = BytesMut::from(input);
        let mut events = vec![];
        while let Some(event) = codec.decode(&mut buf).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_lines_and_commands_interleave() {
        let mut codec = TelnetCodec::new(1024);
        let events = decode_all(
            &mut codec,
            &[
                b'l', b'o', IAC, WILL, OPT_NAWS, b'o', b'k', b'\r', b'\n', IAC, NOP, b'x', b'\n',
            ],
        );
        assert_eq!(
            events,
            vec![
                TelnetEvent::Negotiate {
                    command: WILL,
                    option: OPT_NAWS
                },
                TelnetEvent::Line("look".into()),
                TelnetEvent::Command(NOP),
                TelnetEvent::Line("x".into()),
            ]
        );
    }

    #[test]
    fn test_partial_input_waits() {
        let mut codec = TelnetCodec::new(1024);
        assert!(decode_all(&mut codec, b"say hel").is_empty());
        assert!(decode_all(&mut codec, &[IAC]).is_empty());
        assert_eq!(
            decode_all(&mut codec, &[IAC, b'l', b'o', b'\n']),
            vec![TelnetEvent::Line("say hel\u{fffd}lo".into())]
        );
    }

    #[test]
    fn test_subnegotiation_unescapes_iac() {
        let mut codec = TelnetCodec::new(1024);
        let events = decode_all(
            &mut codec,
            &[IAC, SB, OPT_NAWS, 0, 80, IAC, IAC, 0, 24, IAC, SE],
        );
        assert_eq!(
            events,
            vec![TelnetEvent::Subnegotiation {
                option: OPT_NAWS,
                data: Bytes::from_static(&[0, 80, IAC, 0, 24]),
            }]
        );
    }

    #[test]
    fn test_overlong_line_is_an_error() {
        let mut codec = TelnetCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TelnetCodecError::LineTooLong { limit: 8 })
        ));
    }

    #[test]
    fn test_data_escapes_iac() {
        let mut codec = TelnetCodec::new(1024);
        let mut dst = BytesMut::new();
        codec
            .encode(
                TelnetFrame::Data(Bytes::from_static(&[b'a', IAC, b'b'])),
                &mut dst,
            )
            .unwrap();
        assert_eq!(&dst[..], &[b'a', IAC, IAC, b'b']);
    }

    #[test]
    fn test_compression_starts_after_announcement() {
        let mut codec = TelnetCodec::new(1024);
        let mut dst = BytesMut::new();
        codec.encode(TelnetFrame::StartCompression, &mut dst).unwrap();
        assert_eq!(&dst[..], &[IAC, SB, OPT_MCCP2, IAC, SE]);
        assert!(codec.is_compressing());

        let mut compressed = BytesMut::new();
        codec
            .encode(
                TelnetFrame::Data(Bytes::from_static(b"hello, world\r\n")),
                &mut compressed,
            )
            .unwrap();
        let mut decompress = Decompress::new(true);
        let mut out = Vec::with_capacity(256);
        decompress
            .decompress_vec(&compressed, &mut out, FlushDecompress::Sync)
            .unwrap();
        assert_eq!(out, b"hello, world\r\n");
    }

    fn deflate_client(input: &[u8], finish: bool) -> Vec<u8> {
        let mut compress = Compress::new(Compression::default(), true);
        let mut out = Vec::with_capacity(input.len() + 256);
        let flush = if finish {
            FlushCompress::Finish
        } else {
            FlushCompress::Sync
        };
        compress.compress_vec(input, &mut out, flush).unwrap();
        out
    }

    #[test]
    fn test_client_input_is_inflated_after_mccp3_starts() {
        let mut codec = TelnetCodec::new(1024);
        let mut input = vec![b'h', b'i', b'\n', IAC, SB, OPT_MCCP3, IAC, SE];
        input.extend(deflate_client(b"look\r\nsay a\xc3b\n", false));
        let events = decode_all(&mut codec, &input);
        assert_eq!(
            events,
            vec![
                TelnetEvent::Line("hi".into()),
                TelnetEvent::Subnegotiation {
                    option: OPT_MCCP3,
                    data: Bytes::new(),
                },
                TelnetEvent::Line("look".into()),
                TelnetEvent::Line("say a\u{fffd}b".into()),
            ]
        );
        assert!(codec.is_decompressing());
    }

    #[test]
    fn test_plain_input_resumes_when_the_client_stream_ends() {
        let mut codec = TelnetCodec::new(1024);
        let mut input = vec![IAC, SB, OPT_MCCP3, IAC, SE];
        input.extend(deflate_client(b"north\n", true));
        input.extend_from_slice(b"south\n");
        let events = decode_all(&mut codec, &input);
        assert_eq!(
            events,
            vec![
                TelnetEvent::Subnegotiation {
                    option: OPT_MCCP3,
                    data: Bytes::new(),
                },
                TelnetEvent::Line("north".into()),
                TelnetEvent::Line("south".into()),
            ]
        );
        assert!(!codec.is_decompressing());
    }

    #[test]
    fn test_compressed_input_split_across_reads() {
        let mut codec = TelnetCodec::new(1024);
        let compressed = deflate_client(b"one\ntwo\n", false);
        let (head, tail) = compressed.split_at(compressed.len() / 2);
        let mut buf = BytesMut::from(&[IAC, SB, OPT_MCCP3, IAC, SE][..]);
        buf.extend_from_slice(head);
        let mut events = vec![];
        while let Some(event) = codec.decode(&mut buf).unwrap() {
            events.push(event);
        }
        buf.extend_from_slice(tail);
        while let Some(event) = codec.decode(&mut buf).unwrap() {
            events.push(event);
        }
        assert_eq!(
            &events[1..],
            &[
                TelnetEvent::Line("one".into()),
                TelnetEvent::Line("two".into())
            ]
        );
    }

    #[test]
    fn test_corrupt_compressed_input_is_an_error() {
        let mut codec = TelnetCodec::new(1024);
        let mut buf = BytesMut::from(&[IAC, SB, OPT_MCCP3, IAC, SE, 0xde, 0xad, 0xbe, 0xef][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Ok(Some(TelnetEvent::Subnegotiation { option: OPT_MCCP3, .. }))
        ));
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TelnetCodecError::Inflate(_))
        ));
        assert!(!codec.is_decompressing());
    }
}
