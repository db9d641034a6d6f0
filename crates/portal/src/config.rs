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

use crate::context::AdapterConfig;
use crate::link_client::LinkClientConfig;
use crate::registry::RegistryConfig;
use crate::trusted_proxy::TrustedProxies;
use clap_derive::Parser;
use link_common::TransportKind;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest accepted reconnect_max_ms.
const MIN_RECONNECT_MAX_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("low_watermark ({low}) must be below high_watermark ({high})")]
    InvalidWatermarks { low: usize, high: usize },
    #[error("invalid trusted proxy entry {0:?}")]
    InvalidTrustedProxy(String),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("reconnect_initial_ms ({initial}) exceeds reconnect_max_ms ({max})")]
    InvalidBackoff { initial: u64, max: u64 },
    #[error("reconnect_max_ms ({max}) must be at least {floor}")]
    ReconnectMaxTooSmall { max: u64, floor: u64 },
    #[error("{transport} listener needs {what}")]
    MissingFile {
        transport: TransportKind,
        what: &'static str,
    },
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct Args {
    #[arg(
        long,
        value_name = "external-address",
        help = "Address all client listeners bind to",
        default_value = "0.0.0.0"
    )]
    pub external_address: String,

    #[arg(long, help = "Plain telnet port (0 disables)", default_value = "7000")]
    pub telnet_port: u16,

    #[arg(long, help = "TLS telnet port (0 disables)", default_value = "0")]
    pub telnet_tls_port: u16,

    #[arg(long, help = "SSH port (0 disables)", default_value = "0")]
    pub ssh_port: u16,

    #[arg(long, help = "Web client (websocket) port (0 disables)", default_value = "8080")]
    pub web_port: u16,

    #[arg(long, help = "PEM certificate chain for TLS telnet")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, help = "PEM private key for TLS telnet")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, help = "OpenSSH private host key for the SSH listener")]
    pub ssh_host_key: Option<PathBuf>,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Peers (addresses or CIDR networks) whose forwarded-address headers are trusted"
    )]
    pub trusted_proxies: Vec<String>,

    #[arg(long, help = "Reverse-resolve client addresses", default_value = "false")]
    pub resolve_hostnames: bool,

    #[arg(
        long,
        value_name = "link-address",
        help = "Address of the game's link server",
        default_value = "127.0.0.1:7999"
    )]
    pub link_address: String,

    #[arg(
        long,
        help = "Unacknowledged envelopes per session before its transport is paused",
        default_value = "256"
    )]
    pub high_watermark: usize,

    #[arg(
        long,
        help = "Depth a paused session must drain to before reading resumes",
        default_value = "64"
    )]
    pub low_watermark: usize,

    #[arg(long, help = "First link reconnect delay in milliseconds", default_value = "250")]
    pub reconnect_initial_ms: u64,

    #[arg(long, help = "Largest link reconnect delay in milliseconds", default_value = "10000")]
    pub reconnect_max_ms: u64,

    #[arg(long, help = "Give up on the link after this many failed attempts")]
    pub max_reconnect_attempts: Option<u32>,

    #[arg(
        long,
        help = "Seconds the link may be down before attached sessions are detached",
        default_value = "30"
    )]
    pub max_outage_secs: u64,

    #[arg(long, help = "Seconds a detached session may be resumed", default_value = "300")]
    pub grace_window_secs: u64,

    #[arg(long, help = "Seconds of client inactivity before a session is closed", default_value = "3600")]
    pub idle_timeout_secs: u64,

    #[arg(
        long,
        help = "Seconds a session may stay paused by backpressure before it is closed",
        default_value = "60"
    )]
    pub max_pause_secs: u64,

    #[arg(
        long,
        help = "Seconds a client may refuse output before its connection is dropped",
        default_value = "30"
    )]
    pub write_timeout_secs: u64,

    #[arg(long, help = "Capability negotiation budget in milliseconds", default_value = "500")]
    pub negotiation_timeout_ms: u64,

    #[arg(long, help = "Longest client input line in bytes", default_value = "16384")]
    pub max_line_length: usize,

    #[arg(long, help = "Live sessions allowed at once", default_value = "4096")]
    pub max_sessions: usize,

    #[arg(long, help = "Largest link frame in bytes", default_value = "16777216")]
    pub max_frame_length: usize,

    #[arg(long, help = "Link heartbeat interval in seconds", default_value = "10")]
    pub heartbeat_secs: u64,

    #[arg(long, help = "Offer MCCP2 compression to telnet clients", default_value = "true", action = clap::ArgAction::Set)]
    pub enable_compression: bool,

    /// Advertised to MSSP clients; only settable from the config file.
    #[arg(skip)]
    #[serde(default)]
    pub mssp: BTreeMap<String, String>,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,

    #[arg(long, help = "Yaml config file to use, overrides values in CLI args")]
    pub config_file: Option<String>,
}

/// Everything the Portal needs at runtime, validated.
#[derive(Clone, Debug)]
pub struct PortalSettings {
    pub listeners: Vec<(TransportKind, SocketAddr)>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub ssh_host_key: Option<PathBuf>,
    pub trusted_proxies: TrustedProxies,
    pub registry: RegistryConfig,
    pub link: LinkClientConfig,
    pub adapter: AdapterConfig,
}

impl Args {
    pub fn settings(&self) -> Result<PortalSettings, ConfigError> {
        if self.low_watermark >= self.high_watermark {
            return Err(ConfigError::InvalidWatermarks {
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }
        for (name, value) in [
            ("max_line_length", self.max_line_length),
            ("max_sessions", self.max_sessions),
            ("max_frame_length", self.max_frame_length),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        for (name, value) in [
            ("heartbeat_secs", self.heartbeat_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("reconnect_initial_ms", self.reconnect_initial_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.reconnect_max_ms < MIN_RECONNECT_MAX_MS {
            return Err(ConfigError::ReconnectMaxTooSmall {
                max: self.reconnect_max_ms,
                floor: MIN_RECONNECT_MAX_MS,
            });
        }
        if self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(ConfigError::InvalidBackoff {
                initial: self.reconnect_initial_ms,
                max: self.reconnect_max_ms,
            });
        }

        let external: IpAddr = self
            .external_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.external_address.clone()))?;
        if self.link_address.trim().is_empty() {
            return Err(ConfigError::InvalidAddress(self.link_address.clone()));
        }

        let listeners: Vec<(TransportKind, SocketAddr)> = [
            (TransportKind::Telnet, self.telnet_port),
            (TransportKind::TelnetTls, self.telnet_tls_port),
            (TransportKind::Ssh, self.ssh_port),
            (TransportKind::Web, self.web_port),
        ]
        .into_iter()
        .filter(|(_, port)| *port != 0)
        .map(|(transport, port)| (transport, SocketAddr::new(external, port)))
        .collect();

        for (transport, _) in &listeners {
            match transport {
                TransportKind::TelnetTls if self.tls_cert.is_none() || self.tls_key.is_none() => {
                    return Err(ConfigError::MissingFile {
                        transport: *transport,
                        what: "tls_cert and tls_key",
                    });
                }
                TransportKind::Ssh if self.ssh_host_key.is_none() => {
                    return Err(ConfigError::MissingFile {
                        transport: *transport,
                        what: "ssh_host_key",
                    });
                }
                _ => {}
            }
        }

        let heartbeat = Duration::from_secs(self.heartbeat_secs);
        Ok(PortalSettings {
            listeners,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            ssh_host_key: self.ssh_host_key.clone(),
            trusted_proxies: TrustedProxies::parse(&self.trusted_proxies)?,
            registry: RegistryConfig {
                max_sessions: self.max_sessions,
                grace_window: Duration::from_secs(self.grace_window_secs),
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            },
            link: LinkClientConfig {
                link_address: self.link_address.clone(),
                high_watermark: self.high_watermark,
                low_watermark: self.low_watermark,
                reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
                reconnect_max: Duration::from_millis(self.reconnect_max_ms),
                max_reconnect_attempts: self.max_reconnect_attempts,
                max_outage: Duration::from_secs(self.max_outage_secs),
                heartbeat,
                handshake_timeout: heartbeat,
                max_frame_length: self.max_frame_length,
            },
            adapter: AdapterConfig {
                max_line_length: self.max_line_length,
                negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms),
                max_pause: Duration::from_secs(self.max_pause_secs),
                write_timeout: Duration::from_secs(self.write_timeout_secs),
                enable_compression: self.enable_compression,
                mssp: self
                    .mssp
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                resolve_hostnames: self.resolve_hostnames,
            },
        })
    }
}
