/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! I2C transport seam.
//!
//! [`I2cBus`] is the only way the relay layer reaches hardware.  Two
//! implementations exist:
//!
//! * [`LinuxI2cBus`] – the Linux i2c-dev interface.  Each transaction opens
//!   the character device, selects the slave with `I2C_SLAVE`, performs the
//!   transfer and closes the descriptor again.
//! * [`RecordingBus`] – off-target stand-in that records every transaction
//!   and can be scripted to return read bytes or to fail.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::error::BusError;

/// Synchronous I2C master operations used by the relay layer.
pub trait I2cBus: Send {
    /// Write `bytes` to the slave at `addr`.
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BusError>;

    /// Write `bytes` (a register select) to `addr`, then fill `buf` from it.
    fn write_read(&mut self, addr: u16, bytes: &[u8], buf: &mut [u8]) -> Result<(), BusError>;
}

// ── Linux i2c-dev ─────────────────────────────────────────────────────────────

/// `I2C_SLAVE` request number from `<linux/i2c-dev.h>`.
const I2C_SLAVE: u16 = 0x0703;

mod ioctl {
    nix::ioctl_write_int_bad!(i2c_set_slave, super::I2C_SLAVE);
}

/// i2c-dev backed bus, e.g. `/dev/i2c-1`.
#[derive(Debug, Clone)]
pub struct LinuxI2cBus {
    device: PathBuf,
}

impl LinuxI2cBus {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }

    /// Open the device and select `addr`.  The slave stays selected until
    /// the returned file is dropped.
    fn open_slave(&self, addr: u16) -> Result<File, BusError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|source| BusError::Open {
                device: self.device.clone(),
                source,
            })?;

        // SAFETY: the descriptor is owned by `file` and stays open for the
        // duration of the call; I2C_SLAVE takes the address by value.
        let slave = nix::libc::c_int::from(addr);
        let selected = unsafe { ioctl::i2c_set_slave(file.as_raw_fd(), slave) };
        selected.map_err(|errno| BusError::Address {
            addr,
            source: std::io::Error::from(errno),
        })?;

        Ok(file)
    }
}

impl I2cBus for LinuxI2cBus {
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BusError> {
        let mut file = self.open_slave(addr)?;
        trace!(addr = addr, bytes = ?bytes, "i2c write");
        match file.write(bytes) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => Err(BusError::Transfer {
                addr,
                reason: format!("short write ({n} of {} bytes)", bytes.len()),
            }),
            Err(e) => Err(BusError::Transfer {
                addr,
                reason: e.to_string(),
            }),
        }
    }

    fn write_read(&mut self, addr: u16, bytes: &[u8], buf: &mut [u8]) -> Result<(), BusError> {
        let mut file = self.open_slave(addr)?;
        trace!(addr = addr, bytes = ?bytes, read_len = buf.len(), "i2c write/read");
        match file.write(bytes) {
            Ok(n) if n == bytes.len() => {}
            Ok(n) => {
                return Err(BusError::Transfer {
                    addr,
                    reason: format!("short register select ({n} of {} bytes)", bytes.len()),
                })
            }
            Err(e) => {
                return Err(BusError::Transfer {
                    addr,
                    reason: e.to_string(),
                })
            }
        }
        match file.read(buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(n) => Err(BusError::Transfer {
                addr,
                reason: format!("short read ({n} of {} bytes)", buf.len()),
            }),
            Err(e) => Err(BusError::Transfer {
                addr,
                reason: e.to_string(),
            }),
        }
    }
}

// ── Recording bus ─────────────────────────────────────────────────────────────

/// One transaction as seen by a [`RecordingBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Write { addr: u16, bytes: Vec<u8> },
    WriteRead { addr: u16, bytes: Vec<u8>, read_len: usize },
}

/// Failure injected into every subsequent [`RecordingBus`] transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Open,
    Address,
    Transfer,
}

#[derive(Debug, Default)]
struct Recording {
    transactions: Vec<Transaction>,
    /// (slave, register) → bytes returned by a read.
    responses: HashMap<(u16, u8), Vec<u8>>,
    fault: Option<InjectedFault>,
    /// Faults that only hit one slave address.
    slave_faults: HashMap<u16, InjectedFault>,
}

/// In-memory bus for running without hardware.
///
/// Clones share the same recording, so a test can keep one handle while the
/// relay layer owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes to hand back when `register` of slave `addr` is read.
    pub fn respond(&self, addr: u16, register: u8, bytes: &[u8]) {
        self.lock().responses.insert((addr, register), bytes.to_vec());
    }

    /// Make every following transaction fail with `fault` (`None` heals).
    pub fn inject(&self, fault: Option<InjectedFault>) {
        self.lock().fault = fault;
    }

    /// Make transactions with slave `addr` fail with `fault` (`None` heals).
    pub fn inject_for(&self, addr: u16, fault: Option<InjectedFault>) {
        let mut rec = self.lock();
        match fault {
            Some(f) => rec.slave_faults.insert(addr, f),
            None => rec.slave_faults.remove(&addr),
        };
    }

    /// Snapshot of all transactions so far, oldest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock().transactions.clone()
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    pub fn clear(&self) {
        self.lock().transactions.clear();
    }

    fn check_fault(rec: &Recording, addr: u16) -> Result<(), BusError> {
        match rec.slave_faults.get(&addr).copied().or(rec.fault) {
            None => Ok(()),
            Some(InjectedFault::Open) => Err(BusError::Open {
                device: PathBuf::from("recording"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            Some(InjectedFault::Address) => Err(BusError::Address {
                addr,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            }),
            Some(InjectedFault::Transfer) => Err(BusError::Transfer {
                addr,
                reason: "injected transfer fault".into(),
            }),
        }
    }
}

impl I2cBus for RecordingBus {
    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), BusError> {
        let mut rec = self.lock();
        rec.transactions.push(Transaction::Write {
            addr,
            bytes: bytes.to_vec(),
        });
        Self::check_fault(&rec, addr)
    }

    fn write_read(&mut self, addr: u16, bytes: &[u8], buf: &mut [u8]) -> Result<(), BusError> {
        let mut rec = self.lock();
        rec.transactions.push(Transaction::WriteRead {
            addr,
            bytes: bytes.to_vec(),
            read_len: buf.len(),
        });
        Self::check_fault(&rec, addr)?;

        buf.fill(0);
        if let Some(register) = bytes.first() {
            if let Some(resp) = rec.responses.get(&(addr, *register)) {
                let n = resp.len().min(buf.len());
                buf[..n].copy_from_slice(&resp[..n]);
            }
        }
        Ok(())
    }
}
