/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! MOD-IO coupler – I2C relay/IO boards with heartbeat-driven failover
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── config/         – CLI + YAML configuration, hex lists, validation
//! ├── hardware/       – relay boards, register map, virtual/safe mode
//! │   ├── bus         – I2cBus trait, Linux i2c-dev, recording bus
//! │   └── error       – BusError (fatal vs. transfer failures)
//! ├── liveness/       – CouplerId, last-seen ledger
//! ├── heartbeat/      – emitter, observer, wire message
//! │   └── transport   – UDP multicast publisher / subscriber tasks
//! ├── failover/       – per-dependency liveness state machine
//! ├── binding/        – exposed variables and generic read/write dispatch
//! ├── pulse           – diagnostic GPIO pulse
//! └── coupler         – the actor tying it all together
//! ```

pub mod binding;
pub mod config;
pub mod coupler;
pub mod failover;
pub mod hardware;
pub mod heartbeat;
pub mod liveness;
pub mod pulse;
