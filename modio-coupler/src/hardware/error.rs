/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for I2C bus transactions.
//!
//! The split between fatal and non-fatal variants is what the relay layer
//! acts on:
//!
//! | Variant | Fatal | Consequence |
//! |---|---|---|
//! | `Open` | yes | coupler stops: relay state on the wire is unknown |
//! | `Address` | yes | coupler stops: relay state on the wire is unknown |
//! | `Transfer` | no | logged; reads report `0` |
//! | `NoSuchBoard` | no | caller asked for a board that is not configured |
//! | `SafeMode` | no | relay write refused while a dependency is down |

use std::path::PathBuf;

use thiserror::Error;

/// Failure of one bus transaction.
#[derive(Debug, Error)]
pub enum BusError {
    /// The i2c-dev character device could not be opened.
    #[error("cannot open I2C device {}: {source}", device.display())]
    Open {
        device: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The `I2C_SLAVE` ioctl rejected the slave address.
    #[error("cannot address I2C slave {addr:#04x}: {source}")]
    Address {
        addr: u16,
        #[source]
        source: std::io::Error,
    },

    /// The write or read itself failed or was short.
    #[error("I2C transfer with slave {addr:#04x} failed: {reason}")]
    Transfer { addr: u16, reason: String },

    /// Board index outside the configured slave address list.
    #[error("no I2C board configured at index {board}")]
    NoSuchBoard { board: usize },

    /// Relay outputs stay off until every watched coupler is back.
    #[error("relay write to board {board} refused in SAFE MODE")]
    SafeMode { board: usize },
}

impl BusError {
    /// `true` when the coupler can no longer claim to know its relay state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Open { .. } | BusError::Address { .. })
    }
}
