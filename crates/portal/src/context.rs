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

use crate::link_client::LinkClient;
use crate::registry::{SessionRegistry, resolve_hostname};
use crate::trusted_proxy::TrustedProxies;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Settings shared by every protocol adapter.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub max_line_length: usize,
    /// How long a telnet client gets to answer our option offers before we attach anyway.
    pub negotiation_timeout: Duration,
    pub max_pause: Duration,
    /// A client that accepts no output for this long is treated as gone.
    pub write_timeout: Duration,
    pub enable_compression: bool,
    pub mssp: Vec<(String, String)>,
    pub resolve_hostnames: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_line_length: 16 * 1024,
            negotiation_timeout: Duration::from_millis(500),
            max_pause: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
            enable_compression: true,
            mssp: vec![],
            resolve_hostnames: false,
        }
    }
}

/// Everything a connection handler needs, cloned cheaply into each connection task.
#[derive(Clone)]
pub struct PortalContext {
    pub registry: Arc<SessionRegistry>,
    pub link: LinkClient,
    pub adapter: AdapterConfig,
    pub trusted_proxies: Arc<TrustedProxies>,
}

impl PortalContext {
    pub fn new(link: LinkClient, adapter: AdapterConfig, trusted_proxies: TrustedProxies) -> Self {
        Self {
            registry: link.registry().clone(),
            link,
            adapter,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }

    /// Reverse DNS for the peer, when enabled. Failures are not an error.
    pub async fn hostname_for(&self, addr: IpAddr) -> Option<String> {
        if !self.adapter.resolve_hostnames {
            return None;
        }
        match resolve_hostname(addr).await {
            Ok(hostname) => Some(hostname),
            Err(e) => {
                debug!(%addr, error = %e, "Reverse lookup failed");
                None
            }
        }
    }
}
