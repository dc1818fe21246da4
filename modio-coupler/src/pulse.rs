/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Diagnostic pulse output.
//!
//! Toggles a sysfs GPIO value file so heartbeat arrival or relay writes can
//! be timed with a scope.  Not safety relevant: every failure is logged at
//! `debug` and otherwise ignored.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PulseMode {
    #[default]
    Off,
    /// Toggle once per accepted peer heartbeat.
    KeepAlive,
    /// Toggle once per write to `i2c0.relay0`.
    Relay0,
}

#[derive(Debug)]
pub struct DiagnosticPulse {
    mode: PulseMode,
    gpio: Option<PathBuf>,
    level: bool,
    toggles: u64,
}

impl DiagnosticPulse {
    pub fn new(mode: PulseMode, gpio: Option<PathBuf>) -> Self {
        Self {
            mode,
            gpio,
            level: false,
            toggles: 0,
        }
    }

    pub fn toggles(&self) -> u64 {
        self.toggles
    }

    pub fn on_heartbeat(&mut self) {
        if self.mode == PulseMode::KeepAlive {
            self.toggle();
        }
    }

    pub fn on_relay_write(&mut self, board: usize, channel: usize) {
        if self.mode == PulseMode::Relay0 && board == 0 && channel == 0 {
            self.toggle();
        }
    }

    fn toggle(&mut self) {
        self.level = !self.level;
        self.toggles += 1;
        let Some(path) = &self.gpio else {
            return;
        };
        let value = if self.level { "1" } else { "0" };
        if let Err(e) = std::fs::write(path, value) {
            debug!(gpio = %path.display(), "pulse write failed: {e}");
        }
    }
}
