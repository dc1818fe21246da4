/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Heartbeat emission and observation.
//!
//! ```text
//!  HeartbeatEmitter ──tick()──► HeartbeatMessage ──(transport)──► HeartbeatObserver ──► LivenessLedger
//!        │                                                              │
//!        └─► heart_beat variable = <id>.<tick>                           └─ own id / foreign group: dropped
//! ```
//!
//! On the wire a heartbeat is a structured record carrying identity and tick
//! separately.  The exposed `heart_beat` variable keeps the packed
//! `<id>.<tick>` scalar for clients that display it.

pub mod transport;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::liveness::{CouplerId, LivenessLedger};

// ── Pub/Sub identity ──────────────────────────────────────────────────────────

/// Identifiers that must agree between the publishing and the subscribing
/// side of cooperating couplers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PubSubIds {
    pub publisher_id: u16,
    pub writer_group_id: u16,
    pub dataset_writer_id: u16,
}

impl Default for PubSubIds {
    fn default() -> Self {
        Self {
            publisher_id: 2234,
            writer_group_id: 100,
            dataset_writer_id: 62541,
        }
    }
}

// ── HeartbeatValue ────────────────────────────────────────────────────────────

/// Identity and tick count of one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatValue {
    pub coupler_id: CouplerId,
    pub tick: u64,
}

impl HeartbeatValue {
    /// The single-scalar `<id>.<tick>` form, e.g. id 2 tick 7 → `2.7`.
    ///
    /// Lossy for large ticks (`f32` precision); only the integer part is
    /// guaranteed to round-trip.
    pub fn to_packed(self) -> f32 {
        format!("{}.{}", self.coupler_id.0, self.tick)
            .parse::<f32>()
            .unwrap_or(self.coupler_id.0 as f32)
    }
}

impl fmt::Display for HeartbeatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.coupler_id, self.tick)
    }
}

// ── HeartbeatMessage ──────────────────────────────────────────────────────────

/// One heartbeat datagram as carried by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub publisher_id: u16,
    pub writer_group_id: u16,
    pub dataset_writer_id: u16,
    pub coupler_id: CouplerId,
    pub tick: u64,
}

impl HeartbeatMessage {
    pub fn new(ids: PubSubIds, value: HeartbeatValue) -> Self {
        Self {
            publisher_id: ids.publisher_id,
            writer_group_id: ids.writer_group_id,
            dataset_writer_id: ids.dataset_writer_id,
            coupler_id: value.coupler_id,
            tick: value.tick,
        }
    }

    pub fn value(&self) -> HeartbeatValue {
        HeartbeatValue {
            coupler_id: self.coupler_id,
            tick: self.tick,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    fn matches(&self, ids: &PubSubIds) -> bool {
        self.publisher_id == ids.publisher_id
            && self.writer_group_id == ids.writer_group_id
            && self.dataset_writer_id == ids.dataset_writer_id
    }
}

// ── HeartbeatEmitter ──────────────────────────────────────────────────────────

/// Produces this coupler's heartbeats, one per timer firing.
#[derive(Debug, Clone)]
pub struct HeartbeatEmitter {
    identity: CouplerId,
    ids: PubSubIds,
    ticks: u64,
}

impl HeartbeatEmitter {
    pub fn new(identity: CouplerId, ids: PubSubIds) -> Self {
        Self {
            identity,
            ids,
            ticks: 0,
        }
    }

    /// Advance the tick counter and build the heartbeat to publish.
    pub fn tick(&mut self) -> HeartbeatMessage {
        self.ticks = self.ticks.wrapping_add(1);
        let value = self.value();
        trace!(heart_beat = %value, "heartbeat");
        HeartbeatMessage::new(self.ids, value)
    }

    /// The most recently emitted value (tick `0` before the first firing).
    pub fn value(&self) -> HeartbeatValue {
        HeartbeatValue {
            coupler_id: self.identity,
            tick: self.ticks,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

// ── HeartbeatObserver ─────────────────────────────────────────────────────────

/// What the observer did with one received heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A peer's heartbeat was recorded in the ledger.
    Recorded(CouplerId),
    /// Our own heartbeat came back; not recorded.
    OwnHeartbeat,
    /// Published under different pub/sub identifiers; not recorded.
    ForeignGroup,
}

/// Feeds received heartbeats into the [`LivenessLedger`].
#[derive(Debug, Clone)]
pub struct HeartbeatObserver {
    own_id: CouplerId,
    ids: PubSubIds,
}

impl HeartbeatObserver {
    pub fn new(own_id: CouplerId, ids: PubSubIds) -> Self {
        Self { own_id, ids }
    }

    pub fn observe(
        &self,
        msg: &HeartbeatMessage,
        now_millis: u64,
        ledger: &mut LivenessLedger,
    ) -> Observation {
        if !msg.matches(&self.ids) {
            return Observation::ForeignGroup;
        }
        if msg.coupler_id == self.own_id {
            return Observation::OwnHeartbeat;
        }
        trace!(coupler_id = %msg.coupler_id, at = now_millis, "HEART BEAT");
        ledger.record_seen(msg.coupler_id, now_millis);
        Observation::Recorded(msg.coupler_id)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
