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

//! The Game-side end of the Link. It keeps, per session, the highest client->game sequence
//! handed to the Dispatcher (for de-duplication), the highest one the Dispatcher acknowledged
//! (reported to the Portal on reconnect), and an outbox of game->client envelopes that stay
//! buffered until the Portal acknowledges them.

use futures_util::{SinkExt, StreamExt};
use link_common::{
    CloseReason, ControlMessage, Envelope, Hello, LINK_PROTOCOL_VERSION, LinkCodec, LinkError,
    LinkFrame, Outbox, Payload, Sequence, SessionError, SessionId, Welcome,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct LinkServerConfig {
    pub max_frame_length: usize,
    /// Capacity of the queue feeding the Dispatcher. When it is full the server stops reading
    /// from the Link, which pushes back on the Portal through TCP flow control.
    pub dispatch_queue: usize,
    /// Maximum unacknowledged game->client envelopes buffered per session.
    pub high_watermark: usize,
    /// How long `send` waits for room under the high watermark before giving up.
    pub max_pause: Duration,
    pub handshake_timeout: Duration,
    /// Silence from the Portal for this long tears the link down.
    pub heartbeat_timeout: Duration,
}

impl Default for LinkServerConfig {
    fn default() -> Self {
        Self {
            max_frame_length: link_common::DEFAULT_MAX_FRAME_LENGTH,
            dispatch_queue: 1024,
            high_watermark: 256,
            max_pause: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

struct GameSession {
    delivered: Sequence,
    acknowledged: Sequence,
    outbox: Outbox,
}

impl GameSession {
    fn new(session_id: SessionId) -> Self {
        Self {
            delivered: Sequence::ZERO,
            acknowledged: Sequence::ZERO,
            outbox: Outbox::new(session_id),
        }
    }
}

#[derive(Default)]
struct ServerState {
    sessions: HashMap<SessionId, GameSession>,
    /// Sessions whose outbox has something not yet written.
    dirty: HashSet<SessionId>,
    /// Link-level frames waiting to be written (acks, pongs, released).
    control: VecDeque<LinkFrame>,
    /// Bumped on every accepted handshake; a connection whose epoch is stale stops writing.
    epoch: u64,
    connected: bool,
}

struct Inner {
    config: LinkServerConfig,
    game_id: Uuid,
    state: Mutex<ServerState>,
    wake: Notify,
    capacity: Notify,
    dispatch: mpsc::Sender<(SessionId, Envelope)>,
}

/// Handle to the Link Server. Cheap to clone; all clones share the same session tables.
#[derive(Clone)]
pub struct LinkServer {
    inner: Arc<Inner>,
}

/// The Dispatcher's input: `(session_id, envelope)` pairs, in arrival order per session, with
/// duplicates from Link replays already removed.
pub struct DispatchReceiver {
    rx: mpsc::Receiver<(SessionId, Envelope)>,
}

impl DispatchReceiver {
    pub async fn recv(&mut self) -> Option<(SessionId, Envelope)> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl futures_util::Stream<Item = (SessionId, Envelope)> {
        futures_util::stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
    }
}

type LinkTransport = Framed<TcpStream, LinkCodec>;

impl LinkServer {
    pub fn new(config: LinkServerConfig) -> (Self, DispatchReceiver) {
        let (tx, rx) = mpsc::channel(config.dispatch_queue.max(1));
        let server = Self {
            inner: Arc::new(Inner {
                config,
                game_id: Uuid::new_v4(),
                state: Mutex::new(ServerState::default()),
                wake: Notify::new(),
                capacity: Notify::new(),
                dispatch: tx,
            }),
        };
        (server, DispatchReceiver { rx })
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.state().sessions.keys().copied().collect()
    }

    /// `(delivered, acknowledged, unacknowledged output)` for a session.
    pub fn watermarks(&self, session_id: SessionId) -> Option<(Sequence, Sequence, usize)> {
        self.state()
            .sessions
            .get(&session_id)
            .map(|s| (s.delivered, s.acknowledged, s.outbox.depth()))
    }

    /// Record that the Dispatcher has processed everything up to `sequence` for a session.
    /// This is the only source of the acknowledgement watermark reported to the Portal.
    pub fn acknowledge(&self, session_id: SessionId, sequence: Sequence) {
        let mut state = self.state();
        let ServerState {
            sessions, control, ..
        } = &mut *state;
        let Some(session) = sessions.get_mut(&session_id) else {
            trace!(%session_id, "Acknowledgement for a released session");
            return;
        };
        let sequence = if sequence > session.delivered {
            warn!(%session_id, %sequence, delivered = %session.delivered, "Acknowledgement beyond what was delivered");
            session.delivered
        } else {
            sequence
        };
        if sequence > session.acknowledged {
            session.acknowledged = sequence;
            control.push_back(LinkFrame::Ack {
                session_id,
                sequence,
            });
            drop(state);
            self.inner.wake.notify_one();
        }
    }

    /// Queue output for a session. Waits (bounded by `max_pause`) while the session has
    /// `high_watermark` envelopes awaiting acknowledgement; output is never dropped.
    pub async fn send(
        &self,
        session_id: SessionId,
        payload: Payload,
    ) -> Result<Sequence, SessionError> {
        let max_pause = self.inner.config.max_pause;
        let deadline = Instant::now() + max_pause;
        loop {
            let notified = self.inner.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                let Some(session) = state.sessions.get_mut(&session_id) else {
                    return Err(SessionError::UnknownSession(session_id));
                };
                if session.outbox.depth() < self.inner.config.high_watermark {
                    let sequence = session.outbox.push(payload);
                    state.dirty.insert(session_id);
                    drop(state);
                    self.inner.wake.notify_one();
                    return Ok(sequence);
                }
            }
            debug!(%session_id, "Session output at high watermark, waiting for acknowledgements");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SessionError::BackpressureTimeout {
                    session_id,
                    waited: max_pause,
                });
            }
        }
    }

    /// Tell the client a command was refused by the access-control evaluator.
    pub async fn deny(
        &self,
        session_id: SessionId,
        reason: impl Into<String>,
    ) -> Result<Sequence, SessionError> {
        self.send(
            session_id,
            Payload::Control(ControlMessage::Denied {
                reason: reason.into(),
            }),
        )
        .await
    }

    /// Ask the Portal to close a session.
    pub async fn disconnect(
        &self,
        session_id: SessionId,
        reason: impl Into<String>,
    ) -> Result<Sequence, SessionError> {
        self.send(
            session_id,
            Payload::Control(ControlMessage::Disconnect {
                reason: reason.into(),
            }),
        )
        .await
    }

    /// Accept Portal connections until `shutdown` flips. A new connection supersedes the
    /// current one; session state carries over to it.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), LinkError> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Link server listening");
        let mut current: Option<watch::Sender<bool>> = None;
        loop {
            select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(?e, "Link accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    if let Some(previous) = current.take() {
                        info!(%peer_addr, "New portal link supersedes the current one");
                        let _ = previous.send(true);
                    }
                    let (kill_tx, kill_rx) = watch::channel(false);
                    current = Some(kill_tx);
                    let server = self.clone();
                    tokio::spawn(async move {
                        match server.run_connection(stream, kill_rx).await {
                            Ok(()) => info!(%peer_addr, "Portal link closed"),
                            Err(e) => warn!(%peer_addr, error = %e, "Portal link failed"),
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("Link server shutting down");
                    if let Some(current) = current.take() {
                        let _ = current.send(true);
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn run_connection(
        &self,
        stream: TcpStream,
        kill: watch::Receiver<bool>,
    ) -> Result<(), LinkError> {
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, LinkCodec::new(self.inner.config.max_frame_length));

        let handshake_timeout = self.inner.config.handshake_timeout;
        let hello = match tokio::time::timeout(handshake_timeout, framed.next()).await {
            Err(_) => return Err(LinkError::HandshakeTimeout(handshake_timeout)),
            Ok(None) => return Err(LinkError::Closed),
            Ok(Some(frame)) => match frame? {
                LinkFrame::Hello(hello) => hello,
                _ => return Err(LinkError::UnexpectedFrame("handshake")),
            },
        };
        if hello.version != LINK_PROTOCOL_VERSION {
            return Err(LinkError::VersionMismatch {
                ours: LINK_PROTOCOL_VERSION,
                theirs: hello.version,
            });
        }

        let (epoch, welcome, orphaned) = self.accept_hello(&hello);
        tokio::time::timeout(handshake_timeout, framed.send(LinkFrame::Welcome(welcome)))
            .await
            .map_err(|_| LinkError::HandshakeTimeout(handshake_timeout))??;
        info!(portal_id = %hello.portal_id, sessions = hello.delivered.len(), "Portal link established");

        for envelope in orphaned {
            // The Portal no longer knows these sessions (it restarted); tell the game they are gone.
            if self
                .inner
                .dispatch
                .send((envelope.session_id, envelope))
                .await
                .is_err()
            {
                return Err(LinkError::Closed);
            }
        }

        let result = self.connection_loop(&mut framed, epoch, kill).await;
        {
            let mut state = self.state();
            if state.epoch == epoch {
                state.connected = false;
            }
        }
        result
    }

    fn accept_hello(&self, hello: &Hello) -> (u64, Welcome, Vec<Envelope>) {
        let mut state = self.state();
        state.epoch += 1;
        state.connected = true;
        state.control.clear();

        let known: HashSet<SessionId> = hello.delivered.iter().map(|(s, _)| *s).collect();
        let orphaned_ids: Vec<SessionId> = state
            .sessions
            .keys()
            .filter(|session_id| !known.contains(session_id))
            .copied()
            .collect();
        let mut orphaned = Vec::with_capacity(orphaned_ids.len());
        for session_id in orphaned_ids {
            if let Some(session) = state.sessions.remove(&session_id) {
                debug!(%session_id, "Dropping session unknown to the portal");
                state.dirty.remove(&session_id);
                orphaned.push(Envelope::new(
                    session_id,
                    session.delivered.next(),
                    Payload::Control(ControlMessage::Closed {
                        reason: CloseReason::TransportClosed,
                    }),
                ));
            }
        }

        for (session_id, delivered) in &hello.delivered {
            let session = state
                .sessions
                .entry(*session_id)
                .or_insert_with(|| GameSession::new(*session_id));
            let resend = session.outbox.rewind(*delivered);
            if resend > 0 {
                debug!(%session_id, resend, watermark = %delivered, "Replaying output after reconnect");
                state.dirty.insert(*session_id);
            }
        }

        let acknowledged = state
            .sessions
            .iter()
            .map(|(session_id, session)| (*session_id, session.acknowledged))
            .collect();
        let welcome = Welcome {
            version: LINK_PROTOCOL_VERSION,
            game_id: self.inner.game_id,
            acknowledged,
        };
        (state.epoch, welcome, orphaned)
    }

    async fn connection_loop(
        &self,
        framed: &mut LinkTransport,
        epoch: u64,
        mut kill: watch::Receiver<bool>,
    ) -> Result<(), LinkError> {
        let heartbeat_timeout = self.inner.config.heartbeat_timeout;
        self.flush(framed, epoch).await?;
        let mut last_seen = Instant::now();
        loop {
            select! {
                frame = framed.next() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    last_seen = Instant::now();
                    self.handle_frame(frame?).await?;
                    self.flush(framed, epoch).await?;
                }
                _ = self.inner.wake.notified() => {
                    self.flush(framed, epoch).await?;
                }
                _ = tokio::time::sleep_until(last_seen + heartbeat_timeout) => {
                    return Err(LinkError::HeartbeatTimeout(heartbeat_timeout));
                }
                _ = kill.changed() => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame(&self, frame: LinkFrame) -> Result<(), LinkError> {
        match frame {
            LinkFrame::Envelope(envelope) => self.receive_envelope(envelope).await,
            LinkFrame::Ack {
                session_id,
                sequence,
            } => {
                let released = self
                    .state()
                    .sessions
                    .get_mut(&session_id)
                    .map(|s| s.outbox.acknowledge(sequence))
                    .unwrap_or(0);
                if released > 0 {
                    self.inner.capacity.notify_waiters();
                }
                Ok(())
            }
            LinkFrame::Release { session_id } => {
                let mut state = self.state();
                state.sessions.remove(&session_id);
                state.dirty.remove(&session_id);
                state.control.push_back(LinkFrame::Released { session_id });
                drop(state);
                debug!(%session_id, "Session released");
                self.inner.capacity.notify_waiters();
                Ok(())
            }
            LinkFrame::Ping(nonce) => {
                self.state().control.push_back(LinkFrame::Pong(nonce));
                Ok(())
            }
            LinkFrame::Hello(_)
            | LinkFrame::Welcome(_)
            | LinkFrame::Released { .. }
            | LinkFrame::Pong(_) => Err(LinkError::UnexpectedFrame("established link")),
        }
    }

    pub(crate) async fn receive_envelope(&self, envelope: Envelope) -> Result<(), LinkError> {
        let session_id = envelope.session_id;
        {
            let mut state = self.state();
            let ServerState {
                sessions, control, ..
            } = &mut *state;
            let session = sessions
                .entry(session_id)
                .or_insert_with(|| GameSession::new(session_id));
            if envelope.sequence <= session.delivered {
                trace!(%session_id, sequence = %envelope.sequence, "Dropping replayed duplicate");
                if envelope.sequence <= session.acknowledged {
                    control.push_back(LinkFrame::Ack {
                        session_id,
                        sequence: session.acknowledged,
                    });
                }
                return Ok(());
            }
            if envelope.sequence != session.delivered.next() {
                warn!(%session_id, sequence = %envelope.sequence, delivered = %session.delivered, "Sequence gap on link");
            }
            session.delivered = envelope.sequence;
        }
        if self
            .inner
            .dispatch
            .send((session_id, envelope))
            .await
            .is_err()
        {
            warn!("Dispatcher has gone away");
            return Err(LinkError::Closed);
        }
        Ok(())
    }

    async fn flush(&self, framed: &mut LinkTransport, epoch: u64) -> Result<(), LinkError> {
        let frames = {
            let mut state = self.state();
            if state.epoch != epoch {
                // Superseded; let the current connection pick up whatever woke us.
                self.inner.wake.notify_one();
                return Err(LinkError::Closed);
            }
            let ServerState {
                sessions,
                dirty,
                control,
                ..
            } = &mut *state;
            let mut frames: Vec<LinkFrame> = control.drain(..).collect();
            for session_id in dirty.drain() {
                if let Some(session) = sessions.get_mut(&session_id) {
                    frames.extend(
                        session
                            .outbox
                            .take_unsent()
                            .into_iter()
                            .map(LinkFrame::Envelope),
                    );
                }
            }
            frames
        };
        if frames.is_empty() {
            return Ok(());
        }
        write_frames(framed, frames, self.inner.config.heartbeat_timeout).await
    }
}

/// Feed and flush `frames`; a Portal that takes nothing for `stall` is as good as silent.
async fn write_frames(
    framed: &mut LinkTransport,
    frames: Vec<LinkFrame>,
    stall: Duration,
) -> Result<(), LinkError> {
    let write = async {
        for frame in frames {
            framed.feed(frame).await?;
        }
        SinkExt::<LinkFrame>::flush(framed).await
    };
    match tokio::time::timeout(stall, write).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::HeartbeatTimeout(stall)),
    }
}
