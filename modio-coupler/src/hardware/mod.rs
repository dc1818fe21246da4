/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Relay/IO hardware abstraction for Olimex MOD-IO boards on I2C.
//!
//! [`RelayBoards`] turns logical channel operations into bus transactions:
//!
//! ```text
//! set_relay_bits(board, mask)     ──►  write  [0x10, mask, 0x65]
//! read_digital_inputs(board)      ──►  write  [0x20]          read 1 byte
//! read_analog_channel(board, reg) ──►  write  [reg=0x30..33]  read 2 bytes
//! ```
//!
//! When the effective virtual mode is on (operator-configured *or* entered by
//! the failover controller) no transaction reaches the bus: writes succeed
//! immediately and reads return `0`.  The one exception is a board whose
//! last zero write did not go through: shutdown keeps retrying it until the
//! bus confirms the relays are off.
//!
//! While SAFE MODE is active relay writes are refused, so the in-memory
//! bitmask always matches what the board was last told (all off).
//!
//! # Ownership model
//! `RelayBoards` owns the bus, the configured slave addresses and the relay
//! bitmask of every board.  It is owned by the coupler actor, so every
//! mutation is serialised without locking.

pub mod bus;
pub mod error;

pub use bus::{I2cBus, LinuxI2cBus, RecordingBus};
pub use error::BusError;

use tracing::{debug, error, info, warn};

// ── Board register map ────────────────────────────────────────────────────────

/// Relay output register (one bit per relay).
pub const REG_RELAYS: u8 = 0x10;
/// Digital input register (one bit per opto-isolated input).
pub const REG_DIGITAL_INPUTS: u8 = 0x20;
/// First analog input register; channel `n` lives at `REG_ANALOG_BASE + n`.
pub const REG_ANALOG_BASE: u8 = 0x30;
/// Trailing byte the board expects after a relay write.  Its value is ignored.
pub const RELAY_WRITE_FILLER: u8 = 0x65;
/// The board ADC is 10 bits wide.
pub const ANALOG_MASK: u16 = 0x03FF;

pub const RELAYS_PER_BOARD: usize = 4;
pub const DIGITAL_INPUTS_PER_BOARD: usize = 4;
pub const ANALOG_INPUTS_PER_BOARD: usize = 4;

/// Capacity of the slave address list.
pub const MAX_BOARDS: usize = 8;

/// Register address for analog channel `channel` (0-based).
pub fn analog_register(channel: usize) -> u8 {
    REG_ANALOG_BASE + channel as u8
}

// ── ModeFlags ─────────────────────────────────────────────────────────────────

/// The two reasons the coupler may be running without touching hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeFlags {
    /// Requested by the operator at startup (`--mode 1`); never changes.
    pub configured_virtual: bool,
    /// Entered by the failover controller while a dependency is down.
    pub safe_mode: bool,
}

impl ModeFlags {
    /// The process-wide virtual mode flag: no bus transaction while `true`.
    pub fn is_virtual(&self) -> bool {
        self.configured_virtual || self.safe_mode
    }
}

// ── RelayBoards ───────────────────────────────────────────────────────────────

/// All configured MOD-IO boards behind one bus.
pub struct RelayBoards<B: I2cBus> {
    bus: B,
    /// Slave address of each configured board; index = board number.
    addresses: Vec<u16>,
    /// Relay bitmask of each board, bit *k* = relay *k* energised.
    relay_state: Vec<u8>,
    /// Boards whose last zero write failed; the relays may still be on.
    unconfirmed: Vec<bool>,
    mode: ModeFlags,
}

impl<B: I2cBus> RelayBoards<B> {
    /// Create the board set.  Zero entries in `addresses` are unused slots
    /// and are dropped; the remaining boards are numbered in list order.
    pub fn new(bus: B, addresses: &[u16], configured_virtual: bool) -> Self {
        let addresses: Vec<u16> = addresses.iter().copied().filter(|a| *a != 0).collect();
        let relay_state = vec![0; addresses.len()];
        let unconfirmed = vec![false; addresses.len()];
        Self {
            bus,
            addresses,
            relay_state,
            unconfirmed,
            mode: ModeFlags {
                configured_virtual,
                safe_mode: false,
            },
        }
    }

    /// Number of configured (non-zero) boards.
    pub fn board_count(&self) -> usize {
        self.addresses.len()
    }

    pub fn address(&self, board: usize) -> Option<u16> {
        self.addresses.get(board).copied()
    }

    pub fn mode(&self) -> ModeFlags {
        self.mode
    }

    pub fn is_virtual(&self) -> bool {
        self.mode.is_virtual()
    }

    /// In-memory relay bitmask of `board`.
    pub fn relay_state(&self, board: usize) -> Option<u8> {
        self.relay_state.get(board).copied()
    }

    pub fn relay_states(&self) -> &[u8] {
        &self.relay_state
    }

    /// Boards that may still have energised relays after a failed shutdown.
    pub fn unconfirmed_boards(&self) -> Vec<usize> {
        (0..self.unconfirmed.len()).filter(|b| self.unconfirmed[*b]).collect()
    }

    fn slave(&self, board: usize) -> Result<u16, BusError> {
        self.address(board).ok_or(BusError::NoSuchBoard { board })
    }

    /// Write `mask` to the relay register of slave `addr`, regardless of mode.
    /// `Ok(false)` means the transfer failed and was swallowed.
    fn write_relay_register(
        &mut self,
        board: usize,
        addr: u16,
        mask: u8,
    ) -> Result<bool, BusError> {
        match self.bus.write(addr, &[REG_RELAYS, mask, RELAY_WRITE_FILLER]) {
            Ok(()) => {
                debug!(board = board, addr = addr, mask = mask, "relays set");
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(board = board, "relay write failed: {e}");
                Ok(false)
            }
        }
    }

    // ── Bus operations ────────────────────────────────────────────────────────

    /// Push `mask` to the relay register of `board`.
    ///
    /// # Errors
    /// Only fatal bus errors (open / addressing) and unknown boards are
    /// returned; a failed transfer is logged and swallowed.
    pub fn set_relay_bits(&mut self, board: usize, mask: u8) -> Result<(), BusError> {
        let addr = self.slave(board)?;
        if self.is_virtual() {
            return Ok(());
        }
        self.write_relay_register(board, addr, mask)?;
        Ok(())
    }

    /// Read the digital input register of `board` (`0` in virtual mode or
    /// on a failed transfer).
    pub fn read_digital_inputs(&mut self, board: usize) -> Result<u8, BusError> {
        let addr = self.slave(board)?;
        if self.is_virtual() {
            return Ok(0);
        }
        let mut buf = [0u8; 1];
        match self.bus.write_read(addr, &[REG_DIGITAL_INPUTS], &mut buf) {
            Ok(()) => Ok(buf[0]),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(board = board, "digital input read failed: {e}");
                Ok(0)
            }
        }
    }

    /// Read one 10-bit analog channel (`0` in virtual mode or on a failed
    /// transfer).  The board answers low byte first.
    pub fn read_analog_channel(&mut self, board: usize, register: u8) -> Result<u16, BusError> {
        let addr = self.slave(board)?;
        if self.is_virtual() {
            return Ok(0);
        }
        let mut buf = [0u8; 2];
        match self.bus.write_read(addr, &[register], &mut buf) {
            Ok(()) => Ok(((u16::from(buf[1]) << 8) | u16::from(buf[0])) & ANALOG_MASK),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(board = board, register = register, "analog input read failed: {e}");
                Ok(0)
            }
        }
    }

    /// Energise or release one relay and push the board's new bitmask.
    ///
    /// Returns the updated bitmask.  Other channels and other boards are
    /// untouched.
    ///
    /// # Errors
    /// [`BusError::SafeMode`] while SAFE MODE is active; the bitmask is left
    /// as it is.
    pub fn apply_relay_channel(
        &mut self,
        board: usize,
        channel: usize,
        on: bool,
    ) -> Result<u8, BusError> {
        self.slave(board)?;
        debug_assert!(channel < RELAYS_PER_BOARD);
        if self.mode.safe_mode {
            return Err(BusError::SafeMode { board });
        }
        let bit = 1u8 << channel;
        let state = &mut self.relay_state[board];
        if on {
            *state |= bit;
        } else {
            *state &= !bit;
        }
        let mask = *state;
        self.set_relay_bits(board, mask)?;
        Ok(mask)
    }

    /// De-energise every relay of every configured board.
    ///
    /// Every board is attempted even when an earlier one fails.  In SAFE MODE
    /// only boards left unconfirmed by a previous shutdown are written again.
    ///
    /// # Errors
    /// The first fatal bus error, after all boards have been attempted.
    pub fn safe_shutdown_all(&mut self) -> Result<(), BusError> {
        let mut first_fatal = None;
        for board in 0..self.addresses.len() {
            self.relay_state[board] = 0;
            if self.mode.configured_virtual || (self.mode.safe_mode && !self.unconfirmed[board]) {
                continue;
            }
            let addr = self.addresses[board];
            match self.write_relay_register(board, addr, 0x00) {
                Ok(delivered) => self.unconfirmed[board] = !delivered,
                Err(e) => {
                    error!(board = board, addr = addr, "cannot force relays off: {e}");
                    self.unconfirmed[board] = true;
                    if first_fatal.is_none() {
                        first_fatal = Some(e);
                    }
                }
            }
        }
        debug!(boards = self.addresses.len(), "safe shutdown of all boards");
        match first_fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Mode transitions ──────────────────────────────────────────────────────

    /// Shut every relay off, then stop talking to hardware.
    pub fn enter_safe_mode(&mut self) -> Result<(), BusError> {
        warn!("Go to SAFE MODE");
        let shutdown = self.safe_shutdown_all();
        // Even if the shutdown failed fatally, no relay write may go out.
        self.mode.safe_mode = true;
        shutdown
    }

    /// Resume normal operation.  Operator-configured virtual mode stays.
    pub fn leave_safe_mode(&mut self) {
        info!("Go to NORMAL MODE");
        self.mode.safe_mode = false;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
