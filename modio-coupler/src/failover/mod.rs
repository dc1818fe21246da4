/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Failover controller: liveness state machine and safe-mode driver.
//!
//! Each watched dependency carries its own [`LivenessState`]:
//!
//! ```text
//!                    heartbeat within timeout
//!   NoInitialHeartbeat ───────────────────────► Up ◄──────┐
//!                                               │         │ heartbeat within
//!                             delta > timeout   ▼         │ timeout (recovered)
//!                                              Down ──────┘
//! ```
//!
//! The coupler is in safe mode while **any** dependency is `Down`.  Safe mode
//! is entered on the first dependency going down (relays forced off, bus
//! writes suppressed) and left once none is `Down` any more.  A dependency
//! that was never heard from does not force safe mode on its own.
//!
//! The controller is evaluated on a fixed period; `now` is passed in by the
//! caller so every tick is deterministic under test.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::hardware::{BusError, I2cBus, RelayBoards};
use crate::liveness::{CouplerId, LivenessLedger};

// ── LivenessState ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LivenessState {
    /// No heartbeat has ever been recorded for this dependency.
    #[default]
    NoInitialHeartbeat,
    /// Last heartbeat is within the timeout window.
    Up,
    /// Last heartbeat is older than the timeout window.
    Down,
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessState::NoInitialHeartbeat => write!(f, "NO_INITIAL_HEARTBEAT"),
            LivenessState::Up => write!(f, "UP"),
            LivenessState::Down => write!(f, "DOWN"),
        }
    }
}

/// A per-dependency state change observed during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    NoInitialHeartbeat { id: CouplerId },
    InitialHeartbeat { id: CouplerId },
    Down { id: CouplerId, delta_ms: u64 },
    Recovered { id: CouplerId, safe_mode_count: u32 },
}

/// Result of one controller tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub transitions: Vec<Transition>,
    pub entered_safe_mode: bool,
    pub left_safe_mode: bool,
}

// ── FailoverController ────────────────────────────────────────────────────────

pub struct FailoverController {
    /// Watched dependencies, unused slots and duplicates removed.
    dependencies: Vec<CouplerId>,
    timeout_ms: u64,
    states: BTreeMap<CouplerId, LivenessState>,
    safe_mode: bool,
    /// Number of entries into safe mode since startup.
    safe_mode_counter: u32,
}

impl FailoverController {
    pub fn new(dependencies: &[CouplerId], timeout_ms: u64) -> Self {
        let mut watched = Vec::new();
        for id in dependencies {
            if !id.is_unused() && !watched.contains(id) {
                watched.push(*id);
            }
        }
        let states = watched
            .iter()
            .map(|id| (*id, LivenessState::NoInitialHeartbeat))
            .collect();
        Self {
            dependencies: watched,
            timeout_ms,
            states,
            safe_mode: false,
            safe_mode_counter: 0,
        }
    }

    pub fn dependencies(&self) -> &[CouplerId] {
        &self.dependencies
    }

    pub fn is_watching(&self) -> bool {
        !self.dependencies.is_empty()
    }

    pub fn state(&self, id: CouplerId) -> Option<LivenessState> {
        self.states.get(&id).copied()
    }

    pub fn states(&self) -> &BTreeMap<CouplerId, LivenessState> {
        &self.states
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    pub fn safe_mode_counter(&self) -> u32 {
        self.safe_mode_counter
    }

    /// Classify one dependency at `now`.  The boundary is inclusive: a
    /// heartbeat exactly `timeout_ms` old still counts as up.
    pub fn classify(&self, last_seen: Option<u64>, now: u64) -> (LivenessState, u64) {
        match last_seen {
            None => (LivenessState::NoInitialHeartbeat, 0),
            Some(seen) => {
                let delta = now.saturating_sub(seen);
                if delta > self.timeout_ms {
                    (LivenessState::Down, delta)
                } else {
                    (LivenessState::Up, delta)
                }
            }
        }
    }

    /// Evaluate every dependency against the ledger and drive safe mode.
    ///
    /// # Errors
    /// A fatal bus error raised while shutting the relays off.  Safe mode is
    /// in force even when this happens.
    pub fn tick<B: I2cBus>(
        &mut self,
        ledger: &LivenessLedger,
        now: u64,
        boards: &mut RelayBoards<B>,
    ) -> Result<TickOutcome, BusError> {
        let mut outcome = TickOutcome::default();

        for id in &self.dependencies {
            let (next, delta) = self.classify(ledger.last_seen(*id), now);
            let prev = self.states.get(id).copied().unwrap_or_default();

            match (prev, next) {
                (LivenessState::NoInitialHeartbeat, LivenessState::NoInitialHeartbeat)
                | (LivenessState::Up, LivenessState::Up)
                | (LivenessState::Down, LivenessState::Down) => {}
                (_, LivenessState::NoInitialHeartbeat) => {
                    info!(coupler_id = %id, "NO INITIAL HEART BEAT");
                    outcome
                        .transitions
                        .push(Transition::NoInitialHeartbeat { id: *id });
                }
                (_, LivenessState::Down) => {
                    warn!(coupler_id = %id, delta_ms = delta, "DOWN");
                    outcome.transitions.push(Transition::Down {
                        id: *id,
                        delta_ms: delta,
                    });
                }
                (LivenessState::NoInitialHeartbeat, LivenessState::Up) => {
                    info!(coupler_id = %id, "INITIAL HEART BEAT received");
                    outcome
                        .transitions
                        .push(Transition::InitialHeartbeat { id: *id });
                }
                (LivenessState::Down, LivenessState::Up) => {
                    info!(
                        coupler_id = %id,
                        "UP (recovered {} times)", self.safe_mode_counter
                    );
                    outcome.transitions.push(Transition::Recovered {
                        id: *id,
                        safe_mode_count: self.safe_mode_counter,
                    });
                }
            }
            self.states.insert(*id, next);
        }

        let any_down = self.states.values().any(|s| *s == LivenessState::Down);

        if any_down && !self.safe_mode {
            self.safe_mode = true;
            self.safe_mode_counter += 1;
            outcome.entered_safe_mode = true;
            boards.enter_safe_mode()?;
        } else if !any_down && self.safe_mode {
            self.safe_mode = false;
            outcome.left_safe_mode = true;
            boards.leave_safe_mode();
        }

        Ok(outcome)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
