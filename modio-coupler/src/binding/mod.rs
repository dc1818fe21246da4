/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Variable binding layer.
//!
//! Maps the exposed process variables onto [`RelayBoards`] operations.  One
//! generic read and one generic write path serve every channel; the channel
//! is identified by a [`VariableId`] instead of a dedicated callback each.
//!
//! | Name                 | Type    | Access     | Backed by                         |
//! |----------------------|---------|------------|-----------------------------------|
//! | `i2c<b>.relay<c>`    | Int32   | read/write | in-memory relay bitmask           |
//! | `i2c<b>.in<c>`       | Boolean | read       | digital input register            |
//! | `i2c<b>.ain<c>`      | UInt32  | read       | analog input register `0x30 + c`  |
//! | `heart_beat`         | Float   | read/write | heartbeat emitter (`<id>.<tick>`) |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hardware::{
    analog_register, BusError, I2cBus, RelayBoards, ANALOG_INPUTS_PER_BOARD,
    DIGITAL_INPUTS_PER_BOARD, RELAYS_PER_BOARD,
};

pub const HEART_BEAT: &str = "heart_beat";

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("variable '{0}' is read-only")]
    ReadOnly(String),

    #[error("variable '{name}' expects a {expected} value")]
    TypeMismatch { name: String, expected: DataType },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("coupler is not running")]
    Halted,
}

// ── Identifiers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Relay,
    DigitalInput,
    AnalogInput,
}

impl ChannelKind {
    fn prefix(self) -> &'static str {
        match self {
            ChannelKind::Relay => "relay",
            ChannelKind::DigitalInput => "in",
            ChannelKind::AnalogInput => "ain",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ChannelKind::Relay => "Relay",
            ChannelKind::DigitalInput => "Digital Input",
            ChannelKind::AnalogInput => "Analog Input",
        }
    }

    pub fn channels_per_board(self) -> usize {
        match self {
            ChannelKind::Relay => RELAYS_PER_BOARD,
            ChannelKind::DigitalInput => DIGITAL_INPUTS_PER_BOARD,
            ChannelKind::AnalogInput => ANALOG_INPUTS_PER_BOARD,
        }
    }

    pub fn data_type(self) -> DataType {
        match self {
            ChannelKind::Relay => DataType::Int32,
            ChannelKind::DigitalInput => DataType::Boolean,
            ChannelKind::AnalogInput => DataType::UInt32,
        }
    }

    pub fn access(self) -> Access {
        match self {
            ChannelKind::Relay => Access::ReadWrite,
            ChannelKind::DigitalInput | ChannelKind::AnalogInput => Access::ReadOnly,
        }
    }
}

/// Parsed form of an exposed variable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableId {
    Channel {
        board: usize,
        channel: usize,
        kind: ChannelKind,
    },
    HeartBeat,
}

impl VariableId {
    pub fn data_type(&self) -> DataType {
        match self {
            VariableId::Channel { kind, .. } => kind.data_type(),
            VariableId::HeartBeat => DataType::Float,
        }
    }

    pub fn access(&self) -> Access {
        match self {
            VariableId::Channel { kind, .. } => kind.access(),
            VariableId::HeartBeat => Access::ReadWrite,
        }
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableId::Channel {
                board,
                channel,
                kind,
            } => write!(f, "i2c{board}.{}{channel}", kind.prefix()),
            VariableId::HeartBeat => f.write_str(HEART_BEAT),
        }
    }
}

impl FromStr for VariableId {
    type Err = BindingError;

    /// Accepts `heart_beat` and `i2c<board>.<relay|in|ain><channel>`.
    /// Range checks against the configured boards happen at dispatch.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || BindingError::UnknownVariable(s.to_string());
        if s == HEART_BEAT {
            return Ok(VariableId::HeartBeat);
        }
        let (board, rest) = s
            .strip_prefix("i2c")
            .and_then(|r| r.split_once('.'))
            .ok_or_else(unknown)?;
        let board: usize = board.parse().map_err(|_| unknown())?;

        let (kind, channel) = if let Some(c) = rest.strip_prefix("relay") {
            (ChannelKind::Relay, c)
        } else if let Some(c) = rest.strip_prefix("ain") {
            (ChannelKind::AnalogInput, c)
        } else if let Some(c) = rest.strip_prefix("in") {
            (ChannelKind::DigitalInput, c)
        } else {
            return Err(unknown());
        };
        if channel.is_empty() || !channel.bytes().all(|b| b.is_ascii_digit()) {
            return Err(unknown());
        }
        let channel: usize = channel.parse().map_err(|_| unknown())?;

        Ok(VariableId::Channel {
            board,
            channel,
            kind,
        })
    }
}

// ── Values and descriptors ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int32,
    Boolean,
    UInt32,
    Float,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Int32 => "Int32",
            DataType::Boolean => "Boolean",
            DataType::UInt32 => "UInt32",
            DataType::Float => "Float",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    Int32(i32),
    Boolean(bool),
    UInt32(u32),
    Float(f32),
}

impl VariableValue {
    pub fn data_type(&self) -> DataType {
        match self {
            VariableValue::Int32(_) => DataType::Int32,
            VariableValue::Boolean(_) => DataType::Boolean,
            VariableValue::UInt32(_) => DataType::UInt32,
            VariableValue::Float(_) => DataType::Float,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Int32(v) => write!(f, "{v}"),
            VariableValue::Boolean(v) => write!(f, "{v}"),
            VariableValue::UInt32(v) => write!(f, "{v}"),
            VariableValue::Float(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub description: String,
    pub data_type: DataType,
    pub access: Access,
}

/// Every variable exposed for `board_count` configured boards, board by
/// board, followed by `heart_beat`.
pub fn catalogue(board_count: usize) -> Vec<VariableDescriptor> {
    let mut out = Vec::new();
    for board in 0..board_count {
        for kind in [
            ChannelKind::Relay,
            ChannelKind::DigitalInput,
            ChannelKind::AnalogInput,
        ] {
            for channel in 0..kind.channels_per_board() {
                let id = VariableId::Channel {
                    board,
                    channel,
                    kind,
                };
                out.push(VariableDescriptor {
                    name: id.to_string(),
                    description: format!("I2C{board} / {} {channel}", kind.label()),
                    data_type: kind.data_type(),
                    access: kind.access(),
                });
            }
        }
    }
    out.push(VariableDescriptor {
        name: HEART_BEAT.to_string(),
        description: "Heart beat (<id>.<tick>)".to_string(),
        data_type: DataType::Float,
        access: Access::ReadWrite,
    });
    out
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

fn check_range<B: I2cBus>(
    boards: &RelayBoards<B>,
    board: usize,
    channel: usize,
    kind: ChannelKind,
) -> Result<(), BindingError> {
    if board >= boards.board_count() || channel >= kind.channels_per_board() {
        let id = VariableId::Channel {
            board,
            channel,
            kind,
        };
        return Err(BindingError::UnknownVariable(id.to_string()));
    }
    Ok(())
}

/// Read one channel variable.
///
/// Relays report the in-memory bitmask, never the hardware.  Inputs are
/// read from the board and come back as `false`/`0` in virtual mode.
pub fn read_channel<B: I2cBus>(
    boards: &mut RelayBoards<B>,
    board: usize,
    channel: usize,
    kind: ChannelKind,
) -> Result<VariableValue, BindingError> {
    check_range(boards, board, channel, kind)?;
    let value = match kind {
        ChannelKind::Relay => {
            let mask = boards.relay_state(board).unwrap_or(0);
            VariableValue::Int32(i32::from((mask >> channel) & 1))
        }
        ChannelKind::DigitalInput => {
            if boards.is_virtual() {
                VariableValue::Boolean(false)
            } else {
                let reg = boards.read_digital_inputs(board)?;
                VariableValue::Boolean(reg & (1 << channel) != 0)
            }
        }
        ChannelKind::AnalogInput => {
            let raw = boards.read_analog_channel(board, analog_register(channel))?;
            VariableValue::UInt32(u32::from(raw))
        }
    };
    Ok(value)
}

/// Write one channel variable.  Only relays are writable; a value `> 0`
/// energises the relay.  Returns the board's new relay bitmask.
pub fn write_channel<B: I2cBus>(
    boards: &mut RelayBoards<B>,
    board: usize,
    channel: usize,
    kind: ChannelKind,
    value: VariableValue,
) -> Result<u8, BindingError> {
    check_range(boards, board, channel, kind)?;
    let id = VariableId::Channel {
        board,
        channel,
        kind,
    };
    if kind.access() == Access::ReadOnly {
        return Err(BindingError::ReadOnly(id.to_string()));
    }
    let VariableValue::Int32(v) = value else {
        return Err(BindingError::TypeMismatch {
            name: id.to_string(),
            expected: DataType::Int32,
        });
    };
    Ok(boards.apply_relay_channel(board, channel, v > 0)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::bus::InjectedFault;
    use crate::hardware::{RecordingBus, REG_DIGITAL_INPUTS};

    fn boards(addresses: &[u16], virtual_mode: bool) -> (RelayBoards<RecordingBus>, RecordingBus) {
        let rec = RecordingBus::new();
        (RelayBoards::new(rec.clone(), addresses, virtual_mode), rec)
    }

    // ── Names ─────────────────────────────────────────────────────────────────

    #[test]
    fn names_parse_and_print() {
        for name in ["i2c0.relay2", "i2c1.in3", "i2c7.ain0", "heart_beat"] {
            let id: VariableId = name.parse().unwrap();
            assert_eq!(id.to_string(), name);
        }
        assert_eq!(
            "i2c1.ain2".parse::<VariableId>().unwrap(),
            VariableId::Channel {
                board: 1,
                channel: 2,
                kind: ChannelKind::AnalogInput
            }
        );
    }

    #[test]
    fn bad_names_are_unknown() {
        let bad = [
            "",
            "i2c",
            "i2c0",
            "i2c0.relay",
            "i2cx.relay0",
            "i2c0.out1",
            "i2c0.in+1",
            "spi0.relay0",
        ];
        for name in bad {
            assert!(
                matches!(name.parse::<VariableId>(), Err(BindingError::UnknownVariable(_))),
                "{name} should not parse"
            );
        }
    }

    #[test]
    fn catalogue_lists_every_channel_then_heart_beat() {
        let cat = catalogue(2);
        assert_eq!(cat.len(), 2 * 12 + 1);
        assert_eq!(cat[0].name, "i2c0.relay0");
        assert_eq!(cat[2].description, "I2C0 / Relay 2");
        assert_eq!(cat[4].name, "i2c0.in0");
        assert_eq!(cat[4].access, Access::ReadOnly);
        assert_eq!(cat[8].data_type, DataType::UInt32);
        assert_eq!(cat[12].name, "i2c1.relay0");
        assert_eq!(cat.last().unwrap().name, HEART_BEAT);
        assert_eq!(catalogue(0).len(), 1);
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    #[test]
    fn relay_read_comes_from_memory() {
        let (mut b, rec) = boards(&[0x58], false);
        b.apply_relay_channel(0, 3, true).unwrap();
        rec.clear();
        assert_eq!(
            read_channel(&mut b, 0, 3, ChannelKind::Relay).unwrap(),
            VariableValue::Int32(1)
        );
        assert_eq!(
            read_channel(&mut b, 0, 2, ChannelKind::Relay).unwrap(),
            VariableValue::Int32(0)
        );
        assert_eq!(rec.transaction_count(), 0);
    }

    #[test]
    fn digital_input_extracts_its_bit() {
        let (mut b, rec) = boards(&[0x58], false);
        rec.respond(0x58, REG_DIGITAL_INPUTS, &[0b0100]);
        assert_eq!(
            read_channel(&mut b, 0, 2, ChannelKind::DigitalInput).unwrap(),
            VariableValue::Boolean(true)
        );
        assert_eq!(
            read_channel(&mut b, 0, 1, ChannelKind::DigitalInput).unwrap(),
            VariableValue::Boolean(false)
        );
    }

    #[test]
    fn virtual_inputs_read_false_and_zero() {
        let (mut b, rec) = boards(&[0x58], true);
        rec.respond(0x58, REG_DIGITAL_INPUTS, &[0xFF]);
        assert_eq!(
            read_channel(&mut b, 0, 0, ChannelKind::DigitalInput).unwrap(),
            VariableValue::Boolean(false)
        );
        assert_eq!(
            read_channel(&mut b, 0, 0, ChannelKind::AnalogInput).unwrap(),
            VariableValue::UInt32(0)
        );
        assert_eq!(rec.transaction_count(), 0);
    }

    #[test]
    fn analog_read_uses_channel_register() {
        let (mut b, rec) = boards(&[0x58, 0x59], false);
        rec.respond(0x59, 0x33, &[0xFF, 0x03]);
        assert_eq!(
            read_channel(&mut b, 1, 3, ChannelKind::AnalogInput).unwrap(),
            VariableValue::UInt32(1023)
        );
    }

    #[test]
    fn fatal_read_error_propagates() {
        let (mut b, rec) = boards(&[0x58], false);
        rec.inject(Some(InjectedFault::Open));
        assert!(matches!(
            read_channel(&mut b, 0, 0, ChannelKind::DigitalInput),
            Err(BindingError::Bus(_))
        ));
    }

    #[test]
    fn out_of_range_channel_is_unknown() {
        let (mut b, _) = boards(&[0x58], false);
        assert!(matches!(
            read_channel(&mut b, 1, 0, ChannelKind::Relay),
            Err(BindingError::UnknownVariable(n)) if n == "i2c1.relay0"
        ));
        assert!(matches!(
            read_channel(&mut b, 0, 4, ChannelKind::AnalogInput),
            Err(BindingError::UnknownVariable(_))
        ));
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    #[test]
    fn relay_write_sets_and_clears_bit() {
        let (mut b, rec) = boards(&[0x58], false);
        let mask = write_channel(&mut b, 0, 1, ChannelKind::Relay, VariableValue::Int32(5))
            .unwrap();
        assert_eq!(mask, 0b0010);
        let mask = write_channel(&mut b, 0, 1, ChannelKind::Relay, VariableValue::Int32(0))
            .unwrap();
        assert_eq!(mask, 0);
        let mask = write_channel(&mut b, 0, 0, ChannelKind::Relay, VariableValue::Int32(-1))
            .unwrap();
        assert_eq!(mask, 0, "negative values release the relay");
        assert_eq!(rec.transaction_count(), 3);
    }

    #[test]
    fn relay_write_in_safe_mode_is_refused() {
        let (mut b, rec) = boards(&[0x58], false);
        b.enter_safe_mode().unwrap();
        rec.clear();
        assert!(matches!(
            write_channel(&mut b, 0, 2, ChannelKind::Relay, VariableValue::Int32(1)),
            Err(BindingError::Bus(BusError::SafeMode { board: 0 }))
        ));
        assert_eq!(
            read_channel(&mut b, 0, 2, ChannelKind::Relay).unwrap(),
            VariableValue::Int32(0)
        );
        assert_eq!(rec.transaction_count(), 0);
    }

    #[test]
    fn virtual_relay_write_touches_memory_only() {
        let (mut b, rec) = boards(&[0x58, 0x59], true);
        write_channel(&mut b, 1, 0, ChannelKind::Relay, VariableValue::Int32(1)).unwrap();
        assert_eq!(b.relay_state(1), Some(1));
        write_channel(&mut b, 1, 0, ChannelKind::Relay, VariableValue::Int32(0)).unwrap();
        assert_eq!(b.relay_state(1), Some(0));
        assert_eq!(rec.transaction_count(), 0);
    }

    #[test]
    fn inputs_are_read_only() {
        let (mut b, _) = boards(&[0x58], false);
        assert!(matches!(
            write_channel(&mut b, 0, 0, ChannelKind::DigitalInput, VariableValue::Boolean(true)),
            Err(BindingError::ReadOnly(n)) if n == "i2c0.in0"
        ));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let (mut b, rec) = boards(&[0x58], false);
        assert!(matches!(
            write_channel(&mut b, 0, 0, ChannelKind::Relay, VariableValue::Boolean(true)),
            Err(BindingError::TypeMismatch {
                expected: DataType::Int32,
                ..
            })
        ));
        assert_eq!(b.relay_state(0), Some(0));
        assert_eq!(rec.transaction_count(), 0);
    }
}
