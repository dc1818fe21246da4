/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Coupler identity and the liveness ledger.
//!
//! The ledger maps a remote [`CouplerId`] to the wall-clock time (ms since
//! the Unix epoch) at which its last heartbeat was observed.  Records are
//! created on the first observation, replaced on every later one, and never
//! removed: "no record" is a meaningful state ("never seen").

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── CouplerId ─────────────────────────────────────────────────────────────────

/// Identity of one coupler on the keep-alive network.
///
/// `0` is reserved: in a dependency list it marks an unused slot, and it is
/// never recorded in the ledger as a real peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CouplerId(pub u32);

impl CouplerId {
    /// The reserved "no dependency configured" value.
    pub const UNUSED: CouplerId = CouplerId(0);

    pub fn is_unused(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CouplerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for CouplerId {
    fn from(v: u32) -> Self {
        CouplerId(v)
    }
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
///
/// A clock set before 1970 yields `0` rather than an error; the failover
/// comparison only ever looks at differences between two readings.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── LivenessLedger ────────────────────────────────────────────────────────────

/// Last-seen table keyed by coupler identity.
#[derive(Debug, Default, Clone)]
pub struct LivenessLedger {
    last_seen: HashMap<CouplerId, u64>,
}

impl LivenessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` was seen at `at_millis`, replacing any earlier record.
    pub fn record_seen(&mut self, id: CouplerId, at_millis: u64) {
        self.last_seen.insert(id, at_millis);
    }

    /// Timestamp of the most recent [`record_seen`](Self::record_seen) for
    /// `id`, or `None` if it was never seen.
    pub fn last_seen(&self, id: CouplerId) -> Option<u64> {
        self.last_seen.get(&id).copied()
    }

    /// Number of distinct couplers ever seen.
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
