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

//! The Portal side of the Portal/Game split: client-facing listeners and protocol adapters,
//! the session registry, and the Link Client that carries session traffic to the Game.

pub mod config;
mod context;
mod link_client;
pub mod listeners;
mod registry;
pub mod render;
mod session;
pub mod ssh;
pub mod telnet;
pub mod tls;
mod trusted_proxy;
pub mod web;

pub use context::{AdapterConfig, PortalContext};
pub use link_client::{LINK_RESTORED_NOTICE, LinkClient, LinkClientConfig, LinkStatus};
pub use listeners::{Listeners, ListenersClient, TransportSecrets};
pub use registry::{RegistryConfig, SessionRecord, SessionRegistry, resolve_hostname};
pub use session::{SessionEvent, SessionInput, SessionOutput, SessionPort};
pub use trusted_proxy::TrustedProxies;
