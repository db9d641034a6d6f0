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

//! The adapter-facing handle on an attached session.

use crate::link_client::LinkClient;
use link_common::{
    Capabilities, CloseReason, ControlMessage, LinkState, OobMessage, Payload, Sequence,
    SessionError, SessionId,
};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// What an adapter's output side sees next.
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    Output(Payload),
    /// The session is closed; nothing more will arrive.
    Closed(Option<CloseReason>),
}

/// Split into halves so an adapter can read transport input and write game output from the
/// same `select!`.
pub struct SessionPort {
    pub input: SessionInput,
    pub output: SessionOutput,
}

impl SessionPort {
    pub(crate) fn new(
        link: LinkClient,
        session_id: SessionId,
        outbound: mpsc::UnboundedReceiver<Payload>,
        flow: watch::Receiver<bool>,
        state: watch::Receiver<LinkState>,
        max_pause: Duration,
    ) -> Self {
        Self {
            input: SessionInput {
                link: link.clone(),
                session_id,
                flow,
                max_pause,
                paused_since: None,
            },
            output: SessionOutput {
                link,
                session_id,
                outbound,
                open: true,
                state,
            },
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.input.session_id
    }
}

pub struct SessionInput {
    link: LinkClient,
    session_id: SessionId,
    flow: watch::Receiver<bool>,
    max_pause: Duration,
    paused_since: Option<Instant>,
}

impl SessionInput {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn submit(&self, payload: Payload) -> Result<Sequence, SessionError> {
        self.link.submit(self.session_id, payload)
    }

    pub fn submit_line(&self, line: impl Into<String>) -> Result<Sequence, SessionError> {
        self.submit(Payload::text(line))
    }

    pub fn submit_oob(&self, message: OobMessage) -> Result<Sequence, SessionError> {
        self.submit(Payload::OutOfBand(message))
    }

    pub fn submit_control(&self, message: ControlMessage) -> Result<Sequence, SessionError> {
        self.submit(Payload::Control(message))
    }

    pub fn update_capabilities(&self, capabilities: Capabilities) -> Result<(), SessionError> {
        self.link.update_capabilities(self.session_id, capabilities)
    }

    /// Adapters must not read from their transport while this is true.
    pub fn is_paused(&self) -> bool {
        !*self.flow.borrow()
    }

    /// Wait for the backlog to drain below the low watermark. A session stays paused at most
    /// `max_pause` in total per stall before this gives up.
    pub async fn wait_resumed(&mut self) -> Result<(), SessionError> {
        let since = *self.paused_since.get_or_insert_with(Instant::now);
        let deadline = since + self.max_pause;
        match tokio::time::timeout_at(deadline, self.flow.wait_for(|open| *open)).await {
            Ok(Ok(_)) => {
                self.paused_since = None;
                Ok(())
            }
            Ok(Err(_)) => Err(SessionError::LinkUnavailable(
                "session no longer routed".to_string(),
            )),
            Err(_) => Err(SessionError::BackpressureTimeout {
                session_id: self.session_id,
                waited: self.max_pause,
            }),
        }
    }

    pub fn transport_lost(&self) {
        self.link.transport_lost(self.session_id);
    }

    pub fn close(&self, reason: CloseReason) {
        self.link.close_session(self.session_id, reason);
    }
}

pub struct SessionOutput {
    link: LinkClient,
    session_id: SessionId,
    outbound: mpsc::UnboundedReceiver<Payload>,
    open: bool,
    state: watch::Receiver<LinkState>,
}

impl SessionOutput {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Game output queued for this session is always drained before a close is reported.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            if let Some(payload) = self.try_recv() {
                return SessionEvent::Output(payload);
            }
            if *self.state.borrow_and_update() == LinkState::Closed {
                return self.closed();
            }
            select! {
                payload = self.outbound.recv(), if self.open => match payload {
                    Some(payload) => return SessionEvent::Output(payload),
                    None => self.open = false,
                },
                changed = self.state.changed() => {
                    if changed.is_err() {
                        return self.closed();
                    }
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        if !self.open {
            return None;
        }
        match self.outbound.try_recv() {
            Ok(payload) => Some(payload),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.open = false;
                None
            }
        }
    }

    fn closed(&self) -> SessionEvent {
        SessionEvent::Closed(
            self.link
                .registry()
                .get(self.session_id)
                .and_then(|record| record.close_reason),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_client::LinkClientConfig;
    use crate::registry::{RegistryConfig, SessionRegistry};
    use link_common::TransportKind;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn port(config: LinkClientConfig, max_pause: Duration) -> (LinkClient, SessionPort) {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let link = LinkClient::new(config, registry);
        let (session_id, _) = link
            .registry()
            .register(TransportKind::Telnet, IpAddr::V4(Ipv4Addr::LOCALHOST), None)
            .unwrap();
        let port = link
            .connect(session_id, Capabilities::minimal(), max_pause)
            .unwrap();
        (link, port)
    }

    #[tokio::test]
    async fn test_close_is_reported_after_pending_output() {
        let (_link, mut port) = port(LinkClientConfig::default(), Duration::from_secs(1));
        port.input.close(CloseReason::Logout);
        assert_eq!(
            port.output.next_event().await,
            SessionEvent::Closed(Some(CloseReason::Logout))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_session_times_out() {
        let config = LinkClientConfig {
            high_watermark: 2,
            low_watermark: 1,
            ..Default::default()
        };
        let (_link, mut port) = port(config, Duration::from_secs(5));
        port.input.submit_line("one").unwrap();
        assert!(port.input.is_paused());
        assert_eq!(
            port.input.wait_resumed().await,
            Err(SessionError::BackpressureTimeout {
                session_id: port.session_id(),
                waited: Duration::from_secs(5),
            })
        );
    }
}
