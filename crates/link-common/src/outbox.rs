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

use crate::envelope::{Envelope, Payload};
use crate::session::{Sequence, SessionId};
use std::collections::VecDeque;

/// One direction of one session's traffic over the Link: sequence assignment, the queue of
/// envelopes not yet written, and the `pending_ack` backlog kept for replay after a reconnect.
///
/// Nothing leaves an `Outbox` except by cumulative acknowledgement.
#[derive(Debug)]
pub struct Outbox {
    session_id: SessionId,
    last_assigned: Sequence,
    acknowledged: Sequence,
    unsent: VecDeque<Envelope>,
    in_flight: VecDeque<Envelope>,
}

impl Outbox {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            last_assigned: Sequence::ZERO,
            acknowledged: Sequence::ZERO,
            unsent: VecDeque::new(),
            in_flight: VecDeque::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Assign the next sequence to `payload` and queue it for sending.
    pub fn push(&mut self, payload: Payload) -> Sequence {
        let sequence = self.last_assigned.next();
        self.last_assigned = sequence;
        self.unsent
            .push_back(Envelope::new(self.session_id, sequence, payload));
        sequence
    }

    /// Move everything queued into the in-flight backlog, returning copies to write, in order.
    pub fn take_unsent(&mut self) -> Vec<Envelope> {
        let mut out = Vec::with_capacity(self.unsent.len());
        while let Some(envelope) = self.unsent.pop_front() {
            out.push(envelope.clone());
            self.in_flight.push_back(envelope);
        }
        out
    }

    /// Drop everything up to and including `up_to`. Stale acknowledgements are ignored.
    /// Returns the number of envelopes released.
    pub fn acknowledge(&mut self, up_to: Sequence) -> usize {
        if up_to <= self.acknowledged {
            return 0;
        }
        self.acknowledged = up_to.min(self.last_assigned);
        let mut released = 0;
        while self
            .in_flight
            .front()
            .is_some_and(|e| e.sequence <= self.acknowledged)
        {
            self.in_flight.pop_front();
            released += 1;
        }
        while self
            .unsent
            .front()
            .is_some_and(|e| e.sequence <= self.acknowledged)
        {
            self.unsent.pop_front();
            released += 1;
        }
        released
    }

    /// After a reconnect: the peer reports the highest sequence it acknowledged. Everything at
    /// or below it is dropped; everything above it goes back to the head of the send queue in
    /// original order. Returns how many envelopes will be resent.
    pub fn rewind(&mut self, watermark: Sequence) -> usize {
        self.acknowledge(watermark);
        let mut requeue = std::mem::take(&mut self.in_flight);
        requeue.append(&mut self.unsent);
        self.unsent = requeue;
        self.unsent.len()
    }

    /// Total envelopes not yet acknowledged, sent or not.
    pub fn depth(&self) -> usize {
        self.unsent.len() + self.in_flight.len()
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.depth() == 0
    }

    pub fn last_assigned(&self) -> Sequence {
        self.last_assigned
    }

    pub fn acknowledged(&self) -> Sequence {
        self.acknowledged
    }
}
