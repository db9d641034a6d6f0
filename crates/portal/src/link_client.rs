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

//! The Portal's end of the Link. Client->game envelopes are sequenced here, one `Outbox` per
//! session, and stay buffered until the Game acknowledges them; game->client envelopes are
//! de-duplicated against a per-session delivered watermark and handed to the session's
//! adapter. The connection task reconnects with bounded exponential backoff and, after each
//! handshake, resends exactly what the Game has not acknowledged.

use crate::registry::SessionRegistry;
use crate::session::SessionPort;
use futures_util::{SinkExt, StreamExt};
use link_common::{
    Backoff, Capabilities, CloseReason, ControlMessage, DetachReason, Envelope, Hello,
    LINK_PROTOCOL_VERSION, LinkCodec, LinkError, LinkFrame, LinkState, Outbox, Payload, Sequence,
    SessionError, SessionId, TransportKind, Welcome,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub const LINK_RESTORED_NOTICE: &str = "*** Connection to the game restored. ***";

#[derive(Clone, Debug)]
pub struct LinkClientConfig {
    pub link_address: String,
    /// Unacknowledged envelopes per session at which its adapter stops reading.
    pub high_watermark: usize,
    /// Depth the backlog must drain to before reading resumes.
    pub low_watermark: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: Option<u32>,
    /// Link downtime after which attached sessions are marked detached.
    pub max_outage: Duration,
    pub heartbeat: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for LinkClientConfig {
    fn default() -> Self {
        Self {
            link_address: "127.0.0.1:7999".to_string(),
            high_watermark: 256,
            low_watermark: 64,
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            max_reconnect_attempts: None,
            max_outage: Duration::from_secs(30),
            heartbeat: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_frame_length: link_common::DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Handshaking,
    Established,
}

struct ClientSession {
    outbox: Outbox,
    /// Highest game->client sequence handed to the adapter (or deliberately skipped).
    delivered: Sequence,
    route: Option<mpsc::UnboundedSender<Payload>>,
    /// Game output received while no adapter is attached, held unacknowledged.
    parked: VecDeque<Envelope>,
    /// `true` while the adapter may read from its transport.
    flow: watch::Sender<bool>,
    oob: bool,
    closing: Option<CloseReason>,
    release_sent: bool,
}

impl ClientSession {
    fn new(session_id: SessionId, oob: bool) -> (Self, mpsc::UnboundedReceiver<Payload>) {
        let (route_tx, route_rx) = mpsc::unbounded_channel();
        let (flow, _) = watch::channel(true);
        let session = Self {
            outbox: Outbox::new(session_id),
            delivered: Sequence::ZERO,
            route: Some(route_tx),
            parked: VecDeque::new(),
            flow,
            oob,
            closing: None,
            release_sent: false,
        };
        (session, route_rx)
    }

    /// Returns whether the delivered watermark moved.
    fn deliver(&mut self, envelope: Envelope) -> bool {
        if self.route.is_none() || !self.parked.is_empty() {
            self.parked.push_back(envelope);
            return false;
        }
        self.hand_over(envelope)
    }

    fn hand_over(&mut self, envelope: Envelope) -> bool {
        let Envelope {
            session_id,
            sequence,
            payload,
        } = envelope;
        if matches!(payload, Payload::OutOfBand(_)) && !self.oob {
            trace!(%session_id, %sequence, "Skipping out-of-band output for a client without oob");
        } else if let Some(route) = &self.route
            && let Err(mpsc::error::SendError(payload)) = route.send(payload)
        {
            self.route = None;
            self.parked
                .push_front(Envelope::new(session_id, sequence, payload));
            return false;
        }
        self.delivered = sequence;
        true
    }

    fn flush_parked(&mut self) -> bool {
        let mut advanced = false;
        while self.route.is_some() {
            let Some(envelope) = self.parked.pop_front() else {
                break;
            };
            if !self.hand_over(envelope) {
                break;
            }
            advanced = true;
        }
        advanced
    }

    fn is_duplicate(&self, sequence: Sequence) -> bool {
        sequence <= self.delivered || self.parked.back().is_some_and(|e| e.sequence >= sequence)
    }

    fn ready_to_release(&self) -> bool {
        self.closing.is_some() && self.outbox.is_drained() && !self.release_sent
    }
}

struct ClientState {
    sessions: HashMap<SessionId, ClientSession>,
    dirty: HashSet<SessionId>,
    acks: HashSet<SessionId>,
    control: VecDeque<LinkFrame>,
    status: LinkStatus,
    down_since: Option<Instant>,
    outage_declared: bool,
    game_id: Option<Uuid>,
    nonce: u64,
}

struct Inner {
    config: LinkClientConfig,
    portal_id: Uuid,
    registry: Arc<SessionRegistry>,
    state: Mutex<ClientState>,
    wake: Notify,
    drained: Notify,
    status: watch::Sender<LinkStatus>,
}

type LinkTransport = Framed<TcpStream, LinkCodec>;

#[derive(Clone)]
pub struct LinkClient {
    inner: Arc<Inner>,
}

impl LinkClient {
    pub fn new(config: LinkClientConfig, registry: Arc<SessionRegistry>) -> Self {
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                portal_id: Uuid::new_v4(),
                registry,
                state: Mutex::new(ClientState {
                    sessions: HashMap::new(),
                    dirty: HashSet::new(),
                    acks: HashSet::new(),
                    control: VecDeque::new(),
                    status: LinkStatus::Disconnected,
                    down_since: Some(Instant::now()),
                    outage_declared: false,
                    game_id: None,
                    nonce: 0,
                }),
                wake: Notify::new(),
                drained: Notify::new(),
                status,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &LinkClientConfig {
        &self.inner.config
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// `(unacknowledged client->game, delivered game->client)` for a session.
    pub fn session_watermarks(&self, session_id: SessionId) -> Option<(usize, Sequence)> {
        self.state()
            .sessions
            .get(&session_id)
            .map(|s| (s.outbox.depth(), s.delivered))
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    /// Attach a freshly negotiated session and announce it to the Game.
    pub fn connect(
        &self,
        session_id: SessionId,
        capabilities: Capabilities,
        max_pause: Duration,
    ) -> Result<SessionPort, SessionError> {
        let record = self
            .inner
            .registry
            .attach(session_id, capabilities.clone())?;
        let state_rx = self
            .inner
            .registry
            .subscribe(session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;

        let (route_rx, flow_rx) = {
            let mut state = self.state();
            let (mut session, route_rx) = ClientSession::new(session_id, capabilities.oob);
            session
                .outbox
                .push(Payload::Control(ControlMessage::Connected {
                    transport: record.transport,
                    remote_address: record.remote_address,
                    hostname: record.hostname.clone(),
                    capabilities,
                }));
            let flow_rx = session.flow.subscribe();
            state.sessions.insert(session_id, session);
            state.dirty.insert(session_id);
            (route_rx, flow_rx)
        };
        self.inner.wake.notify_one();
        info!(%session_id, transport = %record.transport, remote_address = %record.remote_address, "Session attached");
        Ok(SessionPort::new(
            self.clone(),
            session_id,
            route_rx,
            flow_rx,
            state_rx,
            max_pause,
        ))
    }

    /// Re-attach a detached session to a new connection.
    pub fn resume(
        &self,
        session_id: SessionId,
        transport: TransportKind,
        remote_address: IpAddr,
        max_pause: Duration,
    ) -> Result<SessionPort, SessionError> {
        self.inner.registry.resume(session_id, transport)?;
        let state_rx = self
            .inner
            .registry
            .subscribe(session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;

        let (route_rx, flow_rx) = {
            let mut state = self.state();
            let ClientState { sessions, dirty, acks, .. } = &mut *state;
            let Some(session) = sessions.get_mut(&session_id) else {
                drop(state);
                warn!(%session_id, "Resumed session has no link state");
                self.close_session(session_id, CloseReason::Refused);
                return Err(SessionError::ResumeRejected {
                    session_id,
                    reason: "session is no longer known to the link".to_string(),
                });
            };
            let (route_tx, route_rx) = mpsc::unbounded_channel();
            session.route = Some(route_tx);
            if session.flush_parked() {
                acks.insert(session_id);
            }
            session
                .outbox
                .push(Payload::Control(ControlMessage::Resumed {
                    transport,
                    remote_address,
                }));
            dirty.insert(session_id);
            (route_rx, session.flow.subscribe())
        };
        self.inner.wake.notify_one();
        Ok(SessionPort::new(
            self.clone(),
            session_id,
            route_rx,
            flow_rx,
            state_rx,
            max_pause,
        ))
    }

    /// Queue client input for the Game. Never refuses for depth; crossing the high watermark
    /// pauses the session's reader instead.
    pub fn submit(&self, session_id: SessionId, payload: Payload) -> Result<Sequence, SessionError> {
        let activity = !matches!(payload, Payload::Control(_));
        let high_watermark = self.inner.config.high_watermark;
        let sequence = {
            let mut state = self.state();
            let Some(session) = state
                .sessions
                .get_mut(&session_id)
                .filter(|s| s.closing.is_none())
            else {
                return Err(SessionError::UnknownSession(session_id));
            };
            let sequence = session.outbox.push(payload);
            if session.outbox.depth() >= high_watermark && *session.flow.borrow() {
                debug!(%session_id, depth = session.outbox.depth(), "Session at high watermark, pausing input");
                session.flow.send_replace(false);
            }
            state.dirty.insert(session_id);
            sequence
        };
        if activity {
            self.inner.registry.touch(session_id);
        }
        self.inner.wake.notify_one();
        Ok(sequence)
    }

    pub fn update_capabilities(
        &self,
        session_id: SessionId,
        capabilities: Capabilities,
    ) -> Result<(), SessionError> {
        self.inner
            .registry
            .update_capabilities(session_id, capabilities.clone())?;
        {
            let mut state = self.state();
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return Err(SessionError::UnknownSession(session_id));
            };
            session.oob = capabilities.oob;
            session
                .outbox
                .push(Payload::Control(ControlMessage::Capabilities { capabilities }));
            state.dirty.insert(session_id);
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// The adapter's transport is gone. Resumable sessions detach; the rest close.
    pub fn transport_lost(&self, session_id: SessionId) {
        match self
            .inner
            .registry
            .detach(session_id, DetachReason::TransportLost)
        {
            Ok(LinkState::Detached) => {
                {
                    let mut state = self.state();
                    let Some(session) = state.sessions.get_mut(&session_id) else {
                        return;
                    };
                    session.route = None;
                    session
                        .outbox
                        .push(Payload::Control(ControlMessage::Detached {
                            reason: DetachReason::TransportLost,
                        }));
                    state.dirty.insert(session_id);
                }
                self.inner.wake.notify_one();
                info!(%session_id, "Session detached");
            }
            Ok(_) => self.close_session(session_id, CloseReason::TransportClosed),
            Err(e) => {
                debug!(%session_id, error = %e, "Transport lost for a session that cannot detach");
                self.close_session(session_id, CloseReason::TransportClosed);
            }
        }
    }

    /// Close a session and start its release: the Game is told, and once everything queued
    /// for it is acknowledged the Game is asked to drop it. The registry entry goes away only
    /// when the Game confirms.
    pub fn close_session(&self, session_id: SessionId, reason: CloseReason) {
        if let Err(e) = self.inner.registry.close(session_id, reason) {
            debug!(%session_id, error = %e, "Close of unknown session");
        }
        let found = {
            let mut state = self.state();
            let ClientState {
                sessions,
                dirty,
                acks,
                ..
            } = &mut *state;
            match sessions.get_mut(&session_id) {
                Some(session) => {
                    if session.closing.is_none() {
                        session.closing = Some(reason);
                        session.route = None;
                        if let Some(last) = session.parked.back() {
                            session.delivered = last.sequence;
                            acks.insert(session_id);
                        }
                        session.parked.clear();
                        session
                            .outbox
                            .push(Payload::Control(ControlMessage::Closed { reason }));
                        session.flow.send_replace(true);
                        dirty.insert(session_id);
                    }
                    true
                }
                None => false,
            }
        };
        if found {
            self.inner.wake.notify_one();
        } else if self.inner.registry.release(session_id).is_err() {
            trace!(%session_id, "Nothing to release");
        }
    }

    /// Close every live session, e.g. on shutdown.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let live: Vec<SessionId> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|r| r.link_state != LinkState::Closed)
            .map(|r| r.session_id)
            .collect();
        for session_id in &live {
            self.close_session(*session_id, reason);
        }
        live.len()
    }

    /// Wait until every session has been released by the Game.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state().sessions.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Declare a Link outage once the link has been down longer than `max_outage`: attached
    /// sessions become detached. Returns the sessions affected.
    pub fn check_outage(&self, now: Instant) -> Vec<SessionId> {
        {
            let mut state = self.state();
            if state.outage_declared || state.status == LinkStatus::Established {
                return vec![];
            }
            let Some(since) = state.down_since else {
                return vec![];
            };
            if now.saturating_duration_since(since) < self.inner.config.max_outage {
                return vec![];
            }
            state.outage_declared = true;
        }
        let detached = self
            .inner
            .registry
            .detach_all_attached(DetachReason::LinkOutage);
        warn!(sessions = detached.len(), "Link to game down past the outage limit; sessions detached");
        detached
    }

    /// Periodically expire sessions (grace window, idle timeout) and watch for link outages.
    pub async fn run_sweeper(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let now = Instant::now();
            for (session_id, reason) in self.inner.registry.sweep(now) {
                self.close_session(session_id, reason);
            }
            self.check_outage(now);
        }
    }

    fn set_status(&self, status: LinkStatus) {
        {
            let mut state = self.state();
            state.status = status;
            if status != LinkStatus::Established && state.down_since.is_none() {
                state.down_since = Some(Instant::now());
            }
        }
        self.inner.status.send_replace(status);
    }

    /// Maintain the Link until `shutdown` flips. Returns an error only when reconnect attempts
    /// are exhausted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), LinkError> {
        let config = self.inner.config.clone();
        let mut backoff = Backoff::new(
            config.reconnect_initial,
            config.reconnect_max,
            config.max_reconnect_attempts,
        );
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.open(&config).await {
                Ok(mut framed) => {
                    backoff.reset();
                    info!(link_address = %config.link_address, "Link to game established");
                    let result = self.connection_loop(&mut framed, &mut shutdown).await;
                    self.set_status(LinkStatus::Disconnected);
                    match result {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!(error = %e, "Link to game lost"),
                    }
                }
                Err(e) => {
                    self.set_status(LinkStatus::Disconnected);
                    debug!(error = %e, attempts = backoff.attempts(), "Link connection attempt failed");
                }
            }
            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.attempts(), "Giving up on the link to the game");
                return Err(LinkError::Closed);
            };
            select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn open(&self, config: &LinkClientConfig) -> Result<LinkTransport, LinkError> {
        let stream = tokio::time::timeout(
            config.handshake_timeout,
            TcpStream::connect(&config.link_address),
        )
        .await
        .map_err(|_| LinkError::HandshakeTimeout(config.handshake_timeout))??;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, LinkCodec::new(config.max_frame_length));
        self.handshake(&mut framed).await?;
        Ok(framed)
    }

    async fn handshake(&self, framed: &mut LinkTransport) -> Result<(), LinkError> {
        self.set_status(LinkStatus::Handshaking);
        let hello = {
            let state = self.state();
            Hello {
                version: LINK_PROTOCOL_VERSION,
                portal_id: self.inner.portal_id,
                delivered: state
                    .sessions
                    .iter()
                    .map(|(session_id, session)| (*session_id, session.delivered))
                    .collect(),
            }
        };
        let timeout = self.inner.config.handshake_timeout;
        tokio::time::timeout(timeout, framed.send(LinkFrame::Hello(hello)))
            .await
            .map_err(|_| LinkError::HandshakeTimeout(timeout))??;
        let welcome = match tokio::time::timeout(timeout, framed.next()).await {
            Err(_) => return Err(LinkError::HandshakeTimeout(timeout)),
            Ok(None) => return Err(LinkError::Closed),
            Ok(Some(frame)) => match frame? {
                LinkFrame::Welcome(welcome) => welcome,
                _ => return Err(LinkError::UnexpectedFrame("handshake")),
            },
        };
        if welcome.version != LINK_PROTOCOL_VERSION {
            return Err(LinkError::VersionMismatch {
                ours: LINK_PROTOCOL_VERSION,
                theirs: welcome.version,
            });
        }
        self.establish(welcome);
        Ok(())
    }

    /// Apply the Game's acknowledged watermarks: everything at or below is dropped, everything
    /// above is queued for resending in original order.
    fn establish(&self, welcome: Welcome) {
        let acknowledged: HashMap<SessionId, Sequence> = welcome.acknowledged.into_iter().collect();
        let outage_ended = {
            let mut state = self.state();
            let restarted = state.game_id.is_some_and(|id| id != welcome.game_id);
            if restarted {
                warn!(game_id = %welcome.game_id, "Game restarted; re-announcing sessions");
            }
            state.game_id = Some(welcome.game_id);
            state.control.clear();
            state.acks.clear();

            let ClientState {
                sessions,
                dirty,
                control,
                ..
            } = &mut *state;
            for (session_id, session) in sessions.iter_mut() {
                if restarted {
                    let discarded = session.outbox.depth();
                    session.outbox.acknowledge(session.outbox.last_assigned());
                    session.delivered = Sequence::ZERO;
                    session.parked.clear();
                    if discarded > 0 {
                        debug!(%session_id, discarded, "Dropping input addressed to the previous game instance");
                    }
                    if session.closing.is_none()
                        && let Some(record) = self.inner.registry.get(*session_id)
                    {
                        session
                            .outbox
                            .push(Payload::Control(ControlMessage::Connected {
                                transport: record.transport,
                                remote_address: record.remote_address,
                                hostname: record.hostname,
                                capabilities: record.capabilities,
                            }));
                    }
                } else {
                    let watermark = acknowledged
                        .get(session_id)
                        .copied()
                        .unwrap_or(Sequence::ZERO);
                    let resend = session.outbox.rewind(watermark);
                    if resend > 0 {
                        debug!(%session_id, resend, %watermark, "Resending unacknowledged input");
                    }
                }
                session.release_sent = false;
                if session.outbox.has_unsent() {
                    dirty.insert(*session_id);
                }
                if session.ready_to_release() {
                    control.push_back(LinkFrame::Release {
                        session_id: *session_id,
                    });
                    session.release_sent = true;
                }
            }
            state.status = LinkStatus::Established;
            state.down_since = None;
            std::mem::take(&mut state.outage_declared)
        };
        self.inner.status.send_replace(LinkStatus::Established);

        if outage_ended {
            let reattached = self.inner.registry.reattach_outage_detached();
            info!(sessions = reattached.len(), "Link outage over; sessions reattached");
            let state = self.state();
            for session_id in reattached {
                if let Some(route) = state.sessions.get(&session_id).and_then(|s| s.route.as_ref()) {
                    let _ = route.send(Payload::Control(ControlMessage::Notice {
                        text: LINK_RESTORED_NOTICE.to_string(),
                    }));
                }
            }
        }
    }

    async fn connection_loop(
        &self,
        framed: &mut LinkTransport,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), LinkError> {
        let heartbeat = self.inner.config.heartbeat;
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_seen = Instant::now();
        self.flush(framed).await?;
        loop {
            select! {
                frame = framed.next() => {
                    let Some(frame) = frame else {
                        return Err(LinkError::Closed);
                    };
                    last_seen = Instant::now();
                    self.handle_frame(frame?)?;
                }
                _ = self.inner.wake.notified() => {}
                _ = ticker.tick() => {
                    // Two heartbeats without hearing from the Game.
                    if last_seen.elapsed() > heartbeat * 2 {
                        return Err(LinkError::HeartbeatTimeout(heartbeat * 2));
                    }
                    let mut state = self.state();
                    state.nonce += 1;
                    let nonce = state.nonce;
                    state.control.push_back(LinkFrame::Ping(nonce));
                }
                _ = shutdown.changed() => {
                    self.flush(framed).await?;
                    return Ok(());
                }
            }
            self.flush(framed).await?;
        }
    }

    fn handle_frame(&self, frame: LinkFrame) -> Result<(), LinkError> {
        match frame {
            LinkFrame::Envelope(envelope) => {
                if let Some(session_id) = self.receive_envelope(envelope) {
                    info!(%session_id, "Game requested disconnect of a detached session");
                    self.close_session(session_id, CloseReason::GameRequested);
                }
            }
            LinkFrame::Ack {
                session_id,
                sequence,
            } => {
                let low_watermark = self.inner.config.low_watermark;
                let mut state = self.state();
                let ClientState {
                    sessions, control, ..
                } = &mut *state;
                if let Some(session) = sessions.get_mut(&session_id) {
                    session.outbox.acknowledge(sequence);
                    if !*session.flow.borrow() && session.outbox.depth() <= low_watermark {
                        debug!(%session_id, depth = session.outbox.depth(), "Session drained to low watermark, resuming input");
                        session.flow.send_replace(true);
                    }
                    if session.ready_to_release() {
                        control.push_back(LinkFrame::Release { session_id });
                        session.release_sent = true;
                    }
                }
            }
            LinkFrame::Released { session_id } => {
                let removed = {
                    let mut state = self.state();
                    state.dirty.remove(&session_id);
                    state.acks.remove(&session_id);
                    match state.sessions.get(&session_id) {
                        Some(session) if session.closing.is_some() => {
                            state.sessions.remove(&session_id).is_some()
                        }
                        _ => false,
                    }
                };
                if removed {
                    if let Err(e) = self.inner.registry.release(session_id) {
                        warn!(%session_id, error = %e, "Registry refused release");
                    }
                    self.inner.drained.notify_waiters();
                }
            }
            LinkFrame::Pong(_) => {}
            LinkFrame::Hello(_)
            | LinkFrame::Welcome(_)
            | LinkFrame::Release { .. }
            | LinkFrame::Ping(_) => return Err(LinkError::UnexpectedFrame("established link")),
        }
        Ok(())
    }

    /// Returns a session id if the envelope requires closing a session with no adapter.
    fn receive_envelope(&self, envelope: Envelope) -> Option<SessionId> {
        let session_id = envelope.session_id;
        let sequence = envelope.sequence;
        let mut state = self.state();
        let ClientState {
            sessions,
            acks,
            control,
            ..
        } = &mut *state;
        let Some(session) = sessions.get_mut(&session_id) else {
            debug!(%session_id, %sequence, "Output for a released session");
            control.push_back(LinkFrame::Ack {
                session_id,
                sequence,
            });
            return None;
        };
        if session.is_duplicate(sequence) {
            trace!(%session_id, %sequence, "Dropping replayed duplicate output");
            acks.insert(session_id);
            return None;
        }
        if session.closing.is_some() {
            session.delivered = sequence;
            acks.insert(session_id);
            return None;
        }
        if sequence != session.delivered.next() && session.parked.is_empty() {
            warn!(%session_id, %sequence, delivered = %session.delivered, "Sequence gap in game output");
        }
        let disconnect = matches!(
            envelope.payload,
            Payload::Control(ControlMessage::Disconnect { .. })
        );
        let unrouted = session.route.is_none();
        if session.deliver(envelope) {
            acks.insert(session_id);
        }
        (disconnect && unrouted).then_some(session_id)
    }

    async fn flush(&self, framed: &mut LinkTransport) -> Result<(), LinkError> {
        let frames = {
            let mut state = self.state();
            let ClientState {
                sessions,
                dirty,
                acks,
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
            for session_id in acks.drain() {
                if let Some(session) = sessions.get(&session_id) {
                    frames.push(LinkFrame::Ack {
                        session_id,
                        sequence: session.delivered,
                    });
                }
            }
            frames
        };
        if frames.is_empty() {
            return Ok(());
        }
        write_frames(framed, frames, self.inner.config.heartbeat * 2).await
    }
}

/// Feed and flush `frames`. A Game that takes nothing for `stall` is treated like one that
/// stopped answering heartbeats.
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
