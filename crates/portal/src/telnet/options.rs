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

//! Telnet option negotiation, kept free of I/O: feed it what the client sent, write back what
//! it returns.

use super::codec::{
    DO, DONT, OPT_GMCP, OPT_MCCP2, OPT_MCCP3, OPT_MSSP, OPT_NAWS, OPT_TTYPE, TelnetFrame, WILL,
    WONT,
};
use bytes::{BufMut, Bytes, BytesMut};
use link_common::{Capabilities, ColorDepth, OobMessage};
use std::collections::HashSet;
use tracing::{debug, trace};

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;
const MSSP_VAR: u8 = 1;
const MSSP_VAL: u8 = 2;

/// Clients known to render 256 colors regardless of what their terminal type claims.
const EIGHT_BIT_CLIENTS: &[&str] = &[
    "ATLANTIS",
    "CMUD",
    "KILDCLIENT",
    "MUDLET",
    "MUSHCLIENT",
    "PUTTY",
    "BEIP",
    "POTATO",
    "TINYFUGUE",
];

const MTTS_ANSI: u32 = 1;
const MTTS_VT100: u32 = 2;
const MTTS_UTF8: u32 = 4;
const MTTS_256_COLORS: u32 = 8;
const MTTS_MOUSE_TRACKING: u32 = 16;
const MTTS_OSC_COLOR_PALETTE: u32 = 32;
const MTTS_SCREEN_READER: u32 = 64;
const MTTS_PROXY: u32 = 128;
const MTTS_TRUECOLOR: u32 = 256;
const MTTS_MNES: u32 = 512;
const MTTS_MSLP: u32 = 1024;
const MTTS_ENCRYPTION: u32 = 2048;

#[derive(Clone, Debug, Default)]
pub struct NegotiationConfig {
    pub enable_compression: bool,
    pub mssp: Vec<(String, String)>,
}

pub struct Negotiator {
    config: NegotiationConfig,
    capabilities: Capabilities,
    /// Options we offered or requested and are still waiting to hear about.
    pending: HashSet<u8>,
    ttype_requests: u8,
    ttype_last: Option<String>,
    changed: bool,
}

impl Negotiator {
    pub fn new(config: NegotiationConfig) -> Self {
        Self {
            config,
            capabilities: Capabilities::default(),
            pending: HashSet::new(),
            ttype_requests: 0,
            ttype_last: None,
            changed: false,
        }
    }

    /// Our opening offers.
    pub fn start(&mut self) -> Vec<TelnetFrame> {
        let mut offers = vec![
            (DO, OPT_NAWS),
            (DO, OPT_TTYPE),
            (WILL, OPT_MSSP),
            (WILL, OPT_GMCP),
        ];
        if self.config.enable_compression {
            offers.push((WILL, OPT_MCCP2));
            offers.push((WILL, OPT_MCCP3));
        }
        offers
            .into_iter()
            .map(|(command, option)| {
                self.pending.insert(option);
                TelnetFrame::Negotiate { command, option }
            })
            .collect()
    }

    /// True once every offer has been answered and terminal-type probing is done.
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn capabilities_mut(&mut self) -> &mut Capabilities {
        &mut self.capabilities
    }

    /// Whether capabilities changed since the last call.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub fn handle_negotiate(&mut self, command: u8, option: u8) -> Vec<TelnetFrame> {
        trace!(command, option, "Telnet negotiation");
        let offered = self.pending.remove(&option);
        match (command, option) {
            (WILL, OPT_NAWS) => {
                self.set(|c| c.naws = true);
                vec![]
            }
            (WILL, OPT_TTYPE) => {
                // Still pending until the terminal-type rounds finish.
                self.pending.insert(OPT_TTYPE);
                vec![self.request_ttype()]
            }
            (WONT, OPT_NAWS | OPT_TTYPE) => vec![],
            (DO, OPT_MSSP) => {
                self.set(|c| c.mssp = true);
                self.mssp_frame().into_iter().collect()
            }
            (DO, OPT_GMCP) => {
                self.set(|c| c.oob = true);
                vec![]
            }
            (DO, OPT_MCCP2) if self.config.enable_compression => {
                self.set(|c| c.compression = true);
                vec![TelnetFrame::StartCompression]
            }
            // The client starts its own stream with IAC SB MCCP3 IAC SE; the codec handles that.
            (DO, OPT_MCCP3) if self.config.enable_compression => vec![],
            (DONT, OPT_MSSP | OPT_GMCP | OPT_MCCP2 | OPT_MCCP3) => vec![],
            // Anything else, or an unsolicited request, is refused.
            (WILL, _) if !offered => vec![TelnetFrame::Negotiate {
                command: DONT,
                option,
            }],
            (DO, _) if !offered => vec![TelnetFrame::Negotiate {
                command: WONT,
                option,
            }],
            _ => vec![],
        }
    }

    /// Returns frames to send and, for GMCP, the decoded message.
    pub fn handle_subnegotiation(
        &mut self,
        option: u8,
        data: &[u8],
    ) -> (Vec<TelnetFrame>, Option<OobMessage>) {
        match option {
            OPT_NAWS if data.len() == 4 => {
                let width = u16::from_be_bytes([data[0], data[1]]);
                let height = u16::from_be_bytes([data[2], data[3]]);
                self.set(|c| {
                    c.width = Some(width);
                    c.height = Some(height);
                });
                (vec![], None)
            }
            OPT_TTYPE if data.first() == Some(&TTYPE_IS) => {
                let answer = String::from_utf8_lossy(&data[1..]).into_owned();
                (self.handle_ttype(answer), None)
            }
            OPT_GMCP => (vec![], OobMessage::from_gmcp(&String::from_utf8_lossy(data))),
            OPT_MCCP3 => {
                debug!("Client input is now compressed");
                (vec![], None)
            }
            _ => {
                debug!(option, "Ignoring subnegotiation");
                (vec![], None)
            }
        }
    }

    /// Wrap an outbound out-of-band message for the wire, if the client speaks GMCP.
    pub fn gmcp_frame(&self, message: &OobMessage) -> Option<TelnetFrame> {
        self.capabilities.oob.then(|| TelnetFrame::Subnegotiation {
            option: OPT_GMCP,
            data: Bytes::from(message.to_gmcp()),
        })
    }

    fn set(&mut self, update: impl FnOnce(&mut Capabilities)) {
        let before = self.capabilities.clone();
        update(&mut self.capabilities);
        if before != self.capabilities {
            self.changed = true;
        }
    }

    fn request_ttype(&mut self) -> TelnetFrame {
        self.ttype_requests += 1;
        TelnetFrame::Subnegotiation {
            option: OPT_TTYPE,
            data: Bytes::from_static(&[TTYPE_SEND]),
        }
    }

    /// Three rounds: client name, terminal type, then the MTTS bitfield. A client that repeats
    /// itself has nothing more to say.
    fn handle_ttype(&mut self, answer: String) -> Vec<TelnetFrame> {
        if self.ttype_last.as_deref() == Some(answer.as_str()) {
            self.pending.remove(&OPT_TTYPE);
            return vec![];
        }
        match self.ttype_requests {
            1 => {
                self.client_name(&answer);
                self.ttype_last = Some(answer);
                vec![self.request_ttype()]
            }
            2 => {
                self.terminal_type(&answer);
                self.ttype_last = Some(answer);
                vec![self.request_ttype()]
            }
            _ => {
                self.mtts(&answer);
                self.pending.remove(&OPT_TTYPE);
                vec![]
            }
        }
    }

    fn client_name(&mut self, answer: &str) {
        let (name, version) = match answer.split_once(' ') {
            Some((name, version)) => (name, Some(version)),
            None => (answer, None),
        };
        let eight_bit = EIGHT_BIT_CLIENTS.contains(&name.to_uppercase().as_str());
        self.set(|c| {
            c.client_name = Some(name.to_string());
            c.client_version = version.map(str::to_string);
            // Anything answering TTYPE handles basic ANSI.
            c.raise_color(ColorDepth::Standard);
            if eight_bit {
                c.raise_color(ColorDepth::EightBit);
            }
        });
    }

    fn terminal_type(&mut self, answer: &str) {
        let upper = answer.to_uppercase();
        let first = upper.split_once('-').map_or(upper.as_str(), |(first, _)| first);
        self.set(|c| {
            c.terminal_type = Some(answer.to_string());
            if upper.ends_with("-256COLOR") || first == "XTERM" {
                c.raise_color(ColorDepth::EightBit);
            }
            if first == "VT100" {
                c.vt100 = true;
            }
        });
    }

    fn mtts(&mut self, answer: &str) {
        let Some(bits) = answer
            .strip_prefix("MTTS ")
            .and_then(|n| n.trim().parse::<u32>().ok())
        else {
            return;
        };
        self.set(|c| {
            if bits & MTTS_ANSI != 0 {
                c.raise_color(ColorDepth::Standard);
            }
            if bits & MTTS_256_COLORS != 0 {
                c.raise_color(ColorDepth::EightBit);
            }
            if bits & MTTS_TRUECOLOR != 0 {
                c.raise_color(ColorDepth::TrueColor);
            }
            c.utf8 |= bits & MTTS_UTF8 != 0;
            c.vt100 |= bits & MTTS_VT100 != 0;
            c.mouse_tracking |= bits & MTTS_MOUSE_TRACKING != 0;
            c.osc_color_palette |= bits & MTTS_OSC_COLOR_PALETTE != 0;
            c.screen_reader |= bits & MTTS_SCREEN_READER != 0;
            c.proxy |= bits & MTTS_PROXY != 0;
            c.mnes |= bits & MTTS_MNES != 0;
            c.mslp |= bits & MTTS_MSLP != 0;
            c.encryption |= bits & MTTS_ENCRYPTION != 0;
        });
    }

    fn mssp_frame(&self) -> Option<TelnetFrame> {
        if self.config.mssp.is_empty() {
            return None;
        }
        let mut data = BytesMut::new();
        for (name, value) in &self.config.mssp {
            data.put_u8(MSSP_VAR);
            data.put_slice(name.as_bytes());
            data.put_u8(MSSP_VAL);
            data.put_slice(value.as_bytes());
        }
        Some(TelnetFrame::Subnegotiation {
            option: OPT_MSSP,
            data: data.freeze(),
        })
    }
}
