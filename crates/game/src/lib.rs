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

//! The Game side of the Portal/Game split: the Link Server, which owns the reliable session
//! channel from the game's point of view, and the Dispatcher contract that game logic
//! implements to receive session traffic.

pub mod args;
mod dispatcher;
mod link_server;

pub use dispatcher::{Dispatcher, EchoDispatcher, run_dispatcher};
pub use link_server::{DispatchReceiver, LinkServer, LinkServerConfig};
