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

use crate::link_server::LinkServerConfig;
use clap_derive::Parser;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct Args {
    #[arg(
        long,
        value_name = "link-address",
        help = "Address to accept the portal link on",
        default_value = "127.0.0.1:7999"
    )]
    pub link_address: String,

    #[arg(
        long,
        help = "Envelopes buffered ahead of the dispatcher before the link stops reading",
        default_value = "1024"
    )]
    pub dispatch_queue: usize,

    #[arg(
        long,
        help = "Unacknowledged output envelopes per session before sends wait",
        default_value = "256"
    )]
    pub high_watermark: usize,

    #[arg(
        long,
        help = "Seconds a send may wait on a stalled session before failing",
        default_value = "60"
    )]
    pub max_pause_secs: u64,

    #[arg(
        long,
        help = "Portal heartbeat interval in seconds; three silent intervals drop the link",
        default_value = "10"
    )]
    pub heartbeat_secs: u64,

    #[arg(
        long,
        help = "Largest link frame accepted, in bytes",
        default_value = "16777216"
    )]
    pub max_frame_length: usize,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,

    #[arg(long, help = "Yaml config file to use, overrides values in CLI args")]
    pub config_file: Option<String>,
}

impl Args {
    pub fn server_config(&self) -> LinkServerConfig {
        LinkServerConfig {
            max_frame_length: self.max_frame_length,
            dispatch_queue: self.dispatch_queue,
            high_watermark: self.high_watermark.max(1),
            max_pause: Duration::from_secs(self.max_pause_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_secs.max(1) * 3),
            ..Default::default()
        }
    }
}
