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

//! The Portal's single authority over session lifecycle. Every component holds only the
//! `SessionId` and asks the registry to move a session through its state machine; each
//! entry serializes its own transitions and publishes them on a watch channel, so a reader
//! can never observe two transitions out of order.

use link_common::{
    Capabilities, CloseReason, DetachReason, LinkState, SessionError, SessionId, TransportKind,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Live (non-closed) sessions allowed at once.
    pub max_sessions: usize,
    /// How long a detached session may be resumed.
    pub grace_window: Duration,
    /// Attached sessions with no client activity for this long are closed.
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4096,
            grace_window: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

/// A point-in-time copy of a session's canonical record.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub transport: TransportKind,
    pub remote_address: IpAddr,
    pub hostname: Option<String>,
    pub capabilities: Capabilities,
    pub link_state: LinkState,
    pub detach_reason: Option<DetachReason>,
    pub close_reason: Option<CloseReason>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub detached_at: Option<Instant>,
}

struct SessionEntry {
    record: Mutex<SessionRecord>,
    state: watch::Sender<LinkState>,
}

impl SessionEntry {
    fn lock(&self) -> MutexGuard<'_, SessionRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: papaya::HashMap<SessionId, Arc<SessionEntry>>,
    live: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: papaya::HashMap::new(),
            live: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create a session in `connecting` after a successful transport handshake. The id is
    /// minted here but the Game hears about it only once the session attaches.
    pub fn register(
        &self,
        transport: TransportKind,
        remote_address: IpAddr,
        hostname: Option<String>,
    ) -> Result<(SessionId, watch::Receiver<LinkState>), SessionError> {
        let limit = self.config.max_sessions;
        if self.live.fetch_add(1, Ordering::SeqCst) >= limit {
            self.live.fetch_sub(1, Ordering::SeqCst);
            warn!(%transport, %remote_address, limit, "Refusing connection, session limit reached");
            return Err(SessionError::TooManySessions { limit });
        }

        let session_id = SessionId::new();
        let now = Instant::now();
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let entry = Arc::new(SessionEntry {
            record: Mutex::new(SessionRecord {
                session_id,
                transport,
                remote_address,
                hostname,
                capabilities: Capabilities::default(),
                link_state: LinkState::Connecting,
                detach_reason: None,
                close_reason: None,
                connected_at: now,
                last_activity: now,
                detached_at: None,
            }),
            state: state_tx,
        });
        self.sessions.pin().insert(session_id, entry);
        debug!(%session_id, %transport, %remote_address, "Session registered");
        Ok((session_id, state_rx))
    }

    fn entry(&self, session_id: SessionId) -> Result<Arc<SessionEntry>, SessionError> {
        self.sessions
            .pin()
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::UnknownSession(session_id))
    }

    /// Validate and apply one transition. Must be called with the entry's record locked.
    fn apply(
        &self,
        entry: &SessionEntry,
        record: &mut SessionRecord,
        to: LinkState,
        now: Instant,
    ) -> Result<LinkState, SessionError> {
        let from = record.link_state;
        if !from.can_transition_to(to) {
            warn!(session_id = %record.session_id, %from, %to, "Rejected invalid session state transition");
            return Err(SessionError::InvalidStateTransition {
                session_id: record.session_id,
                from,
                to,
            });
        }
        record.link_state = to;
        match to {
            LinkState::Attached => {
                record.detach_reason = None;
                record.detached_at = None;
                record.last_activity = now;
            }
            LinkState::Detached => {
                record.detached_at = Some(now);
            }
            LinkState::Closed => {
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
            LinkState::Connecting => {}
        }
        entry.state.send_replace(to);
        debug!(session_id = %record.session_id, %from, %to, "Session transition");
        Ok(from)
    }

    /// Request a raw transition. Returns the prior state.
    pub fn transition(&self, session_id: SessionId, to: LinkState) -> Result<LinkState, SessionError> {
        let entry = self.entry(session_id)?;
        let mut record = entry.lock();
        self.apply(&entry, &mut record, to, Instant::now())
    }

    /// `connecting` -> `attached`, recording the negotiated capabilities.
    pub fn attach(
        &self,
        session_id: SessionId,
        capabilities: Capabilities,
    ) -> Result<SessionRecord, SessionError> {
        let entry = self.entry(session_id)?;
        let mut record = entry.lock();
        if record.link_state != LinkState::Connecting {
            let from = record.link_state;
            warn!(%session_id, %from, "Attach of a session that is not connecting");
            return Err(SessionError::InvalidStateTransition {
                session_id,
                from,
                to: LinkState::Attached,
            });
        }
        record.capabilities = capabilities;
        self.apply(&entry, &mut record, LinkState::Attached, Instant::now())?;
        Ok(record.clone())
    }

    /// The session's transport went away, or the Link has been down too long. Transports
    /// without resume close instead of detaching when their connection is lost. Returns the
    /// state the session ended up in.
    pub fn detach(
        &self,
        session_id: SessionId,
        reason: DetachReason,
    ) -> Result<LinkState, SessionError> {
        let entry = self.entry(session_id)?;
        let mut record = entry.lock();
        let now = Instant::now();
        let resumable = record.transport.supports_resume();

        if reason == DetachReason::TransportLost
            && (!resumable || record.link_state == LinkState::Connecting)
        {
            if record.link_state != LinkState::Closed {
                record.close_reason = Some(CloseReason::TransportClosed);
            }
            self.apply(&entry, &mut record, LinkState::Closed, now)?;
            return Ok(LinkState::Closed);
        }

        if record.link_state == LinkState::Detached && reason == DetachReason::TransportLost {
            // Already detached by a link outage; its connection has now gone too, which makes
            // it resumable.
            record.detach_reason = Some(reason);
            return Ok(LinkState::Detached);
        }

        self.apply(&entry, &mut record, LinkState::Detached, now)?;
        record.detach_reason = Some(reason);
        Ok(LinkState::Detached)
    }

    /// `detached` -> `attached` for a client presenting a prior session id.
    pub fn resume(
        &self,
        session_id: SessionId,
        transport: TransportKind,
    ) -> Result<SessionRecord, SessionError> {
        let reject = |reason: &str| {
            warn!(%session_id, %transport, reason, "Resume rejected");
            SessionError::ResumeRejected {
                session_id,
                reason: reason.to_string(),
            }
        };
        let entry = self
            .entry(session_id)
            .map_err(|_| reject("unknown session"))?;
        let mut record = entry.lock();
        if !transport.supports_resume() || record.transport != transport {
            return Err(reject("transport cannot resume this session"));
        }
        match record.link_state {
            LinkState::Detached => {}
            LinkState::Closed => return Err(reject("session is closed")),
            LinkState::Connecting | LinkState::Attached => {
                return Err(reject("session is not detached"));
            }
        }
        if record.detach_reason != Some(DetachReason::TransportLost) {
            return Err(reject("session is still held by its connection"));
        }
        let now = Instant::now();
        let expired = record
            .detached_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.grace_window);
        if expired {
            return Err(reject("grace window expired"));
        }
        self.apply(&entry, &mut record, LinkState::Attached, now)?;
        info!(%session_id, %transport, "Session resumed");
        Ok(record.clone())
    }

    /// Close a session. Returns `false` if it was already closed.
    pub fn close(&self, session_id: SessionId, reason: CloseReason) -> Result<bool, SessionError> {
        let entry = self.entry(session_id)?;
        let mut record = entry.lock();
        if record.link_state == LinkState::Closed {
            return Ok(false);
        }
        record.close_reason = Some(reason);
        self.apply(&entry, &mut record, LinkState::Closed, Instant::now())?;
        info!(%session_id, %reason, "Session closed");
        Ok(true)
    }

    pub fn update_capabilities(
        &self,
        session_id: SessionId,
        capabilities: Capabilities,
    ) -> Result<(), SessionError> {
        let entry = self.entry(session_id)?;
        let mut record = entry.lock();
        if record.link_state == LinkState::Closed {
            return Err(SessionError::UnknownSession(session_id));
        }
        record.capabilities = capabilities;
        Ok(())
    }

    /// Note client activity for idle accounting.
    pub fn touch(&self, session_id: SessionId) {
        if let Ok(entry) = self.entry(session_id) {
            entry.lock().last_activity = Instant::now();
        }
    }

    pub fn get(&self, session_id: SessionId) -> Option<SessionRecord> {
        self.entry(session_id).ok().map(|e| e.lock().clone())
    }

    pub fn subscribe(&self, session_id: SessionId) -> Option<watch::Receiver<LinkState>> {
        self.entry(session_id).ok().map(|e| e.state.subscribe())
    }

    pub fn snapshot(&self) -> Vec<SessionRecord> {
        let sessions = self.sessions.pin();
        sessions.iter().map(|(_, e)| e.lock().clone()).collect()
    }

    /// Close detached sessions whose grace window has lapsed and sessions idle past the idle
    /// timeout. Returns what was closed.
    pub fn sweep(&self, now: Instant) -> Vec<(SessionId, CloseReason)> {
        let mut closed = vec![];
        let sessions = self.sessions.pin();
        for (session_id, entry) in sessions.iter() {
            let mut record = entry.lock();
            let reason = match record.link_state {
                LinkState::Detached => record
                    .detached_at
                    .filter(|at| now.saturating_duration_since(*at) >= self.config.grace_window)
                    .map(|_| CloseReason::GraceExpired),
                LinkState::Connecting | LinkState::Attached => {
                    (now.saturating_duration_since(record.last_activity)
                        >= self.config.idle_timeout)
                        .then_some(CloseReason::IdleTimeout)
                }
                LinkState::Closed => None,
            };
            let Some(reason) = reason else {
                continue;
            };
            record.close_reason = Some(reason);
            if self.apply(entry, &mut record, LinkState::Closed, now).is_ok() {
                info!(%session_id, %reason, "Session expired");
                closed.push((*session_id, reason));
            }
        }
        closed
    }

    /// The Link has been unavailable past the maximum outage: every attached session becomes
    /// detached (never closed).
    pub fn detach_all_attached(&self, reason: DetachReason) -> Vec<SessionId> {
        let mut detached = vec![];
        let sessions = self.sessions.pin();
        let now = Instant::now();
        for (session_id, entry) in sessions.iter() {
            let mut record = entry.lock();
            if record.link_state != LinkState::Attached {
                continue;
            }
            if self.apply(entry, &mut record, LinkState::Detached, now).is_ok() {
                record.detach_reason = Some(reason);
                detached.push(*session_id);
            }
        }
        detached
    }

    /// The Link is back: sessions detached only because of the outage (whose connections are
    /// still open) become attached again.
    pub fn reattach_outage_detached(&self) -> Vec<SessionId> {
        let mut reattached = vec![];
        let sessions = self.sessions.pin();
        let now = Instant::now();
        for (session_id, entry) in sessions.iter() {
            let mut record = entry.lock();
            if record.link_state != LinkState::Detached
                || record.detach_reason != Some(DetachReason::LinkOutage)
            {
                continue;
            }
            if self.apply(entry, &mut record, LinkState::Attached, now).is_ok() {
                reattached.push(*session_id);
            }
        }
        reattached
    }

    /// Drop a closed session's entry. Only called once the Link confirms nothing further is
    /// owed for it.
    pub fn release(&self, session_id: SessionId) -> Result<(), SessionError> {
        let entry = self.entry(session_id)?;
        let state = entry.lock().link_state;
        if state != LinkState::Closed {
            warn!(%session_id, %state, "Refusing to release a live session");
            return Err(SessionError::InvalidStateTransition {
                session_id,
                from: state,
                to: LinkState::Closed,
            });
        }
        self.sessions.pin().remove(&session_id);
        debug!(%session_id, "Session released");
        Ok(())
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Reverse DNS for a client address. Failures are not errors for the session; the caller
/// falls back to the bare address.
pub async fn resolve_hostname(ip: IpAddr) -> Result<String, eyre::Error> {
    let resolver = hickory_resolver::TokioResolver::builder_tokio()?.build();
    let response = resolver.reverse_lookup(ip).await?;
    if let Some(name) = response.iter().next() {
        Ok(name.to_string().trim_end_matches('.').to_string())
    } else {
        Err(eyre::eyre!("No PTR record found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn registry() -> SessionRegistry {
        SessionRegistry::new(RegistryConfig::default())
    }

    fn attached(registry: &SessionRegistry, transport: TransportKind) -> SessionId {
        let (session_id, _) = registry.register(transport, LOCALHOST, None).unwrap();
        registry
            .attach(session_id, Capabilities::minimal())
            .unwrap();
        session_id
    }

    #[test]
    fn test_telnet_disconnect_closes_directly() {
        let registry = registry();
        let session_id = attached(&registry, TransportKind::Telnet);
        assert_eq!(
            registry.detach(session_id, DetachReason::TransportLost),
            Ok(LinkState::Closed)
        );
        let record = registry.get(session_id).unwrap();
        assert_eq!(record.link_state, LinkState::Closed);
        assert_eq!(record.close_reason, Some(CloseReason::TransportClosed));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_web_disconnect_detaches_and_resumes() {
        let registry = registry();
        let session_id = attached(&registry, TransportKind::Web);
        assert_eq!(
            registry.detach(session_id, DetachReason::TransportLost),
            Ok(LinkState::Detached)
        );
        let record = registry.resume(session_id, TransportKind::Web).unwrap();
        assert_eq!(record.link_state, LinkState::Attached);
        assert_eq!(record.detach_reason, None);
    }

    #[test]
    fn test_resume_after_grace_window_is_rejected() {
        let registry = SessionRegistry::new(RegistryConfig {
            grace_window: Duration::ZERO,
            ..Default::default()
        });
        let session_id = attached(&registry, TransportKind::Web);
        registry
            .detach(session_id, DetachReason::TransportLost)
            .unwrap();
        assert!(matches!(
            registry.resume(session_id, TransportKind::Web),
            Err(SessionError::ResumeRejected { .. })
        ));
        // Still detached; the sweeper is what closes it.
        assert_eq!(
            registry.get(session_id).unwrap().link_state,
            LinkState::Detached
        );
        assert_eq!(
            registry.sweep(Instant::now()),
            vec![(session_id, CloseReason::GraceExpired)]
        );
    }

    #[test]
    fn test_resume_rejects_other_transport_and_unknown_ids() {
        let registry = registry();
        let session_id = attached(&registry, TransportKind::Ssh);
        registry
            .detach(session_id, DetachReason::TransportLost)
            .unwrap();
        assert!(registry.resume(session_id, TransportKind::Web).is_err());
        assert!(registry.resume(SessionId::new(), TransportKind::Ssh).is_err());
        assert!(registry.resume(session_id, TransportKind::Ssh).is_ok());
    }

    #[test]
    fn test_invalid_transition_leaves_state_alone() {
        let registry = registry();
        let (session_id, state) = registry
            .register(TransportKind::Web, LOCALHOST, None)
            .unwrap();
        assert!(matches!(
            registry.transition(session_id, LinkState::Detached),
            Err(SessionError::InvalidStateTransition {
                from: LinkState::Connecting,
                to: LinkState::Detached,
                ..
            })
        ));
        assert_eq!(*state.borrow(), LinkState::Connecting);
        registry.close(session_id, CloseReason::Logout).unwrap();
        assert!(registry.transition(session_id, LinkState::Attached).is_err());
        assert_eq!(*state.borrow(), LinkState::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = registry();
        let session_id = attached(&registry, TransportKind::Telnet);
        assert_eq!(registry.close(session_id, CloseReason::Logout), Ok(true));
        assert_eq!(registry.close(session_id, CloseReason::Shutdown), Ok(false));
        assert_eq!(
            registry.get(session_id).unwrap().close_reason,
            Some(CloseReason::Logout)
        );
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_session_limit() {
        let registry = SessionRegistry::new(RegistryConfig {
            max_sessions: 2,
            ..Default::default()
        });
        let first = attached(&registry, TransportKind::Telnet);
        attached(&registry, TransportKind::Telnet);
        assert_eq!(
            registry
                .register(TransportKind::Telnet, LOCALHOST, None)
                .map(|(id, _)| id),
            Err(SessionError::TooManySessions { limit: 2 })
        );
        registry.close(first, CloseReason::Logout).unwrap();
        assert!(
            registry
                .register(TransportKind::Telnet, LOCALHOST, None)
                .is_ok()
        );
    }

    #[test]
    fn test_release_only_closed() {
        let registry = registry();
        let session_id = attached(&registry, TransportKind::Telnet);
        assert!(registry.release(session_id).is_err());
        assert!(registry.get(session_id).is_some());
        registry.close(session_id, CloseReason::Logout).unwrap();
        registry.release(session_id).unwrap();
        assert!(registry.get(session_id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_idle_sweep() {
        let registry = SessionRegistry::new(RegistryConfig {
            idle_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        let session_id = attached(&registry, TransportKind::Telnet);
        assert!(registry.sweep(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(
            registry.sweep(later),
            vec![(session_id, CloseReason::IdleTimeout)]
        );
        assert!(registry.sweep(later).is_empty());
    }

    #[test]
    fn test_link_outage_detaches_and_recovers() {
        let registry = registry();
        let telnet = attached(&registry, TransportKind::Telnet);
        let web = attached(&registry, TransportKind::Web);
        let mut detached = registry.detach_all_attached(DetachReason::LinkOutage);
        detached.sort();
        let mut expected = vec![telnet, web];
        expected.sort();
        assert_eq!(detached, expected);
        assert_eq!(
            registry.get(telnet).unwrap().link_state,
            LinkState::Detached
        );

        // An outage-detached session cannot be stolen by a resume.
        assert!(registry.resume(web, TransportKind::Web).is_err());

        // The web client drops during the outage; it stays detached and becomes resumable.
        assert_eq!(
            registry.detach(web, DetachReason::TransportLost),
            Ok(LinkState::Detached)
        );

        assert_eq!(registry.reattach_outage_detached(), vec![telnet]);
        assert_eq!(registry.get(telnet).unwrap().link_state, LinkState::Attached);
        assert_eq!(registry.get(web).unwrap().link_state, LinkState::Detached);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            max_sessions: 100,
            ..Default::default()
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| {
                            registry
                                .register(TransportKind::Telnet, LOCALHOST, None)
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(registry.live_count(), 100);
    }
}
