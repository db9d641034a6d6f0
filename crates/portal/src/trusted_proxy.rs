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

use axum::http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

use crate::config::ConfigError;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// The set of immediate peers allowed to tell us who the real client is. Empty by default,
/// which means forwarded-address headers are never believed.
#[derive(Clone, Debug, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNet>,
}

impl TrustedProxies {
    /// Accepts bare addresses (`127.0.0.1`, `::1`) and CIDR networks (`10.0.0.0/8`).
    pub fn parse<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut networks = vec![];
        for entry in entries {
            let entry = entry.as_ref().trim();
            let network = match IpNet::from_str(entry) {
                Ok(network) => network,
                Err(_) => IpAddr::from_str(entry)
                    .map(IpNet::from)
                    .map_err(|_| ConfigError::InvalidTrustedProxy(entry.to_string()))?,
            };
            networks.push(network);
        }
        Ok(Self { networks })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.networks.iter().any(|n| n.contains(&addr))
    }

    /// The address to record for a connection whose immediate peer is `peer`. Headers are
    /// consulted only when `peer` is trusted; `X-Forwarded-For` is walked right to left,
    /// skipping further trusted hops, and the first untrusted address is the client.
    pub fn resolve(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        let peer = peer.to_canonical();
        if !self.contains(peer) {
            return peer;
        }

        let forwarded: Vec<IpAddr> = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(parse_forwarded_addr)
            .collect();
        if !forwarded.is_empty() {
            return forwarded
                .iter()
                .rev()
                .find(|addr| !self.contains(**addr))
                .or_else(|| forwarded.first())
                .copied()
                .unwrap_or(peer);
        }

        headers
            .get(X_REAL_IP)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_forwarded_addr)
            .unwrap_or(peer)
    }
}

/// Forwarded entries may carry a port (`1.2.3.4:5678`, `[::1]:80`).
fn parse_forwarded_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if let Ok(addr) = IpAddr::from_str(raw) {
        return Some(addr.to_canonical());
    }
    if let Ok(sock) = std::net::SocketAddr::from_str(raw) {
        return Some(sock.ip().to_canonical());
    }
    raw.strip_prefix('[')
        .and_then(|r| r.split(']').next())
        .and_then(|r| IpAddr::from_str(r).ok())
        .map(|a| a.to_canonical())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn headers(forwarded: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(forwarded).unwrap());
        headers
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_trusted_peer_forwards_client_address() {
        let proxies = TrustedProxies::parse(["127.0.0.1"]).unwrap();
        assert_eq!(
            proxies.resolve(ip("127.0.0.1"), &headers("203.0.113.5")),
            ip("203.0.113.5")
        );
    }

    #[test]
    fn test_untrusted_peer_header_is_ignored() {
        let proxies = TrustedProxies::parse(["127.0.0.1"]).unwrap();
        assert_eq!(
            proxies.resolve(ip("198.51.100.7"), &headers("203.0.113.5")),
            ip("198.51.100.7")
        );
    }

    #[test]
    fn test_empty_set_never_trusts() {
        let proxies = TrustedProxies::default();
        assert_eq!(
            proxies.resolve(ip("127.0.0.1"), &headers("203.0.113.5")),
            ip("127.0.0.1")
        );
    }

    #[test_case("203.0.113.5, 10.0.0.2", "203.0.113.5"; "skips trusted hops")]
    #[test_case("6.6.6.6, 203.0.113.5", "203.0.113.5"; "spoofed leftmost entry ignored")]
    #[test_case("10.0.0.3, 10.0.0.2", "10.0.0.3"; "all trusted falls back to leftmost")]
    #[test_case("garbage", "10.0.0.1"; "unparseable uses peer")]
    #[test_case("203.0.113.5:4711", "203.0.113.5"; "port is stripped")]
    fn test_forwarded_chain(header: &str, expected: &str) {
        let proxies = TrustedProxies::parse(["10.0.0.0/8"]).unwrap();
        assert_eq!(proxies.resolve(ip("10.0.0.1"), &headers(header)), ip(expected));
    }

    #[test]
    fn test_ipv4_mapped_peer_matches() {
        let proxies = TrustedProxies::parse(["127.0.0.1"]).unwrap();
        assert!(proxies.contains(ip("::ffff:127.0.0.1")));
    }

    #[test]
    fn test_invalid_entry() {
        assert!(TrustedProxies::parse(["not-an-ip"]).is_err());
    }
}
