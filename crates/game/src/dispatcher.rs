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

use crate::link_server::{DispatchReceiver, LinkServer};
use link_common::{ControlMessage, Envelope, OobMessage, Payload, SessionId};
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info, warn};

/// The game's entry point for session traffic. Envelopes arrive in order per session with
/// Link replays already removed; `run_dispatcher` acknowledges each one once `dispatch`
/// returns, which is what allows the Portal to discard it.
pub trait Dispatcher: Send {
    fn dispatch(
        &mut self,
        link: &LinkServer,
        session_id: SessionId,
        envelope: Envelope,
    ) -> impl Future<Output = Result<(), eyre::Report>> + Send;
}

/// Shown to a client whose input the game failed to process.
pub const DISPATCH_FAILED_NOTICE: &str = "*** Your command could not be processed. ***";

/// Drive `dispatcher` until the Link Server is dropped. A failed dispatch is reported to the
/// client before the envelope is acknowledged.
pub async fn run_dispatcher<D: Dispatcher>(
    link: LinkServer,
    mut incoming: DispatchReceiver,
    mut dispatcher: D,
) {
    while let Some((session_id, envelope)) = incoming.recv().await {
        let sequence = envelope.sequence;
        if let Err(e) = dispatcher.dispatch(&link, session_id, envelope).await {
            warn!(%session_id, %sequence, error = ?e, "Dispatch failed");
            let notice = Payload::Control(ControlMessage::Notice {
                text: DISPATCH_FAILED_NOTICE.to_string(),
            });
            if let Err(e) = link.send(session_id, notice).await {
                debug!(%session_id, error = %e, "Unable to report dispatch failure");
            }
        }
        link.acknowledge(session_id, sequence);
    }
    info!("Dispatcher stopped");
}

/// A minimal game: greets new connections and echoes whatever they type.
#[derive(Default)]
pub struct EchoDispatcher {
    players: HashMap<SessionId, Player>,
}

struct Player {
    lines: usize,
}

impl EchoDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> usize {
        self.players.len()
    }

    async fn command(
        &mut self,
        link: &LinkServer,
        session_id: SessionId,
        line: &str,
    ) -> Result<(), eyre::Report> {
        let line = line.trim();
        if let Some(player) = self.players.get_mut(&session_id) {
            player.lines += 1;
        }
        match line {
            "quit" | "@quit" => {
                link.send(session_id, Payload::text("Goodbye.")).await?;
                link.disconnect(session_id, "quit").await?;
            }
            _ if line.starts_with("@shutdown") => {
                link.deny(session_id, "You are not allowed to do that.")
                    .await?;
            }
            "" => {}
            _ => {
                link.send(session_id, Payload::text(format!("You say, \"{line}\"")))
                    .await?;
            }
        }
        Ok(())
    }
}

impl Dispatcher for EchoDispatcher {
    async fn dispatch(
        &mut self,
        link: &LinkServer,
        session_id: SessionId,
        envelope: Envelope,
    ) -> Result<(), eyre::Report> {
        match envelope.payload {
            Payload::Text(bytes) => {
                let line = String::from_utf8_lossy(&bytes).into_owned();
                self.command(link, session_id, &line).await?;
            }
            Payload::OutOfBand(oob) => {
                if oob.package == "Core.Ping" {
                    link.send(
                        session_id,
                        Payload::OutOfBand(OobMessage::new("Core.Ping", serde_json::Value::Null)),
                    )
                    .await?;
                } else {
                    debug!(%session_id, package = %oob.package, "Ignoring out-of-band message");
                }
            }
            Payload::Control(ControlMessage::Connected {
                transport,
                remote_address,
                hostname,
                ..
            }) => {
                info!(%session_id, %transport, %remote_address, ?hostname, "Player connected");
                self.players.insert(session_id, Player { lines: 0 });
                link.send(session_id, Payload::text("Welcome! Type 'quit' to leave."))
                    .await?;
            }
            Payload::Control(ControlMessage::Resumed { transport, .. }) => {
                info!(%session_id, %transport, "Player resumed");
                link.send(session_id, Payload::text("Welcome back.")).await?;
            }
            Payload::Control(ControlMessage::Closed { reason }) => {
                if let Some(player) = self.players.remove(&session_id) {
                    info!(%session_id, %reason, lines = player.lines, "Player left");
                }
            }
            Payload::Control(other) => {
                debug!(%session_id, ?other, "Session control");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_server::LinkServerConfig;
    use link_common::Sequence;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct BrokenDispatcher;

    impl Dispatcher for BrokenDispatcher {
        async fn dispatch(
            &mut self,
            _link: &LinkServer,
            _session_id: SessionId,
            _envelope: Envelope,
        ) -> Result<(), eyre::Report> {
            Err(eyre::eyre!("verb raised an error"))
        }
    }

    #[tokio::test]
    async fn test_failed_dispatch_tells_the_client_then_acknowledges() {
        let (server, incoming) = LinkServer::new(LinkServerConfig::default());
        let session_id = SessionId::new();
        server
            .receive_envelope(Envelope::new(
                session_id,
                Sequence(1),
                Payload::text("frobnicate"),
            ))
            .await
            .unwrap();
        tokio::spawn(run_dispatcher(server.clone(), incoming, BrokenDispatcher));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while server.watermarks(session_id).map(|w| w.1) != Some(Sequence(1)) {
            assert!(tokio::time::Instant::now() < deadline, "never acknowledged");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The notice is queued for the Portal before the acknowledgement.
        assert_eq!(
            server.watermarks(session_id),
            Some((Sequence(1), Sequence(1), 1))
        );
    }
}
