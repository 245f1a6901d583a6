//! System bus: flat RAM with memory-mapped peripheral windows in front.
//!
//! The bus is consulted uniformly for every load, store, and fetch the engine
//! performs. An access whose address falls inside a registered window is
//! dispatched to that window's [`Peripheral`]; every other access goes to
//! [`Ram`]. Windows may not overlap.

use crate::resources::ram::{OutOfBounds, Ram};
use std::fmt;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// A non-empty range in a 32-bit address space bounded inclusively below and
/// above.
///
/// Enforces the invariant that `self.start() <= self.end()`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl Display for AddressRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}]", self.start, self.end)
    }
}

impl AddressRange {
    pub fn new(start: u32, end: u32) -> Result<Self, InvalidBoundsError> {
        (start <= end)
            .then_some(Self { start, end })
            .ok_or(InvalidBoundsError { start, end })
    }

    pub fn start(self) -> u32 {
        self.start
    }

    pub fn end(self) -> u32 {
        self.end
    }

    /// Returns `true` if `address` falls within this range.
    pub fn contains(self, address: u32) -> bool {
        self.start <= address && address <= self.end
    }

    /// Returns `true` if any address is in both `self` and `other`.
    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Error, Debug)]
#[error("invalid address range bounds: start ({start:#x}) is greater than end ({end:#x})")]
pub struct InvalidBoundsError {
    start: u32,
    end: u32,
}

/// A device mapped into the physical address space.
///
/// Word accesses are the native granularity; the provided byte accessors fan
/// out through [`Peripheral::read_word`] / [`Peripheral::write_word`] on a
/// read-modify-write basis. Devices whose registers have read side effects
/// (e.g. a FIFO pop on read) should override the byte accessors if sub-word
/// guest accesses are expected.
///
/// `offset` is relative to the start of the window the peripheral is mapped
/// at, so a device does not need to know its own base address.
pub trait Peripheral {
    /// Read the 32-bit register at word-aligned `offset`.
    fn read_word(&mut self, offset: u32) -> u32;

    /// Write the 32-bit register at word-aligned `offset`.
    fn write_word(&mut self, offset: u32, value: u32);

    fn read_byte(&mut self, offset: u32) -> u8 {
        (self.read_word(offset & !0x3) >> ((offset & 0x3) * 8)) as u8
    }

    fn write_byte(&mut self, offset: u32, value: u8) {
        let shift = (offset & 0x3) * 8;
        let old = self.read_word(offset & !0x3);
        let new = (old & !(0xFF << shift)) | ((value as u32) << shift);
        self.write_word(offset & !0x3, new);
    }

    /// Returns `true` while this device has an interrupt asserted.
    ///
    /// Polled by the engine between instructions; a `true` result is
    /// reflected as `mip.MEIP`.
    fn irq_pending(&self) -> bool {
        false
    }
}

struct Window {
    range: AddressRange,
    peripheral: Box<dyn Peripheral>,
}

/// Registering a peripheral window can fail if it collides with an existing
/// one; overlapping windows are a configuration error, not a runtime
/// condition.
#[derive(Error, Debug)]
#[error("peripheral window {new} overlaps already mapped window {existing}")]
pub struct OverlappingWindowError {
    pub new: AddressRange,
    pub existing: AddressRange,
}

/// Single master interface over the entire 32-bit physical address space.
///
/// Values are serialized in little-endian byte order on all paths. Accesses
/// that miss every peripheral window fall through to RAM, whose bounds check
/// is the only source of access faults.
pub struct SystemBus {
    ram: Ram,
    windows: Vec<Window>,
}

impl fmt::Debug for SystemBus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemBus")
            .field("ram_len", &self.ram.len())
            .field(
                "windows",
                &self.windows.iter().map(|w| w.range).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl SystemBus {
    pub fn new(ram: Ram) -> Self {
        Self {
            ram,
            windows: Vec::new(),
        }
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    /// Maps `peripheral` at `range`. The window shadows RAM at the same
    /// addresses for as long as it is mapped.
    pub fn map(
        &mut self,
        range: AddressRange,
        peripheral: Box<dyn Peripheral>,
    ) -> Result<(), OverlappingWindowError> {
        if let Some(existing) = self.windows.iter().find(|w| w.range.overlaps(range)) {
            return Err(OverlappingWindowError {
                new: range,
                existing: existing.range,
            });
        }
        self.windows.push(Window { range, peripheral });
        Ok(())
    }

    /// Returns the peripheral whose window contains `addr`, along with the
    /// offset of `addr` within that window.
    fn window_at<'a>(&'a mut self, addr: u32) -> Option<(&'a mut (dyn Peripheral + 'a), u32)> {
        self.windows
            .iter_mut()
            .find(|w| w.range.contains(addr))
            .map(move |w| (&mut *w.peripheral as &mut dyn Peripheral, addr - w.range.start()))
    }

    /// Returns `true` if any mapped peripheral has an interrupt asserted.
    pub fn irq_pending(&self) -> bool {
        self.windows.iter().any(|w| w.peripheral.irq_pending())
    }

    pub fn load_u8(&mut self, addr: u32) -> Result<u8, OutOfBounds> {
        match self.window_at(addr) {
            Some((p, offset)) => Ok(p.read_byte(offset)),
            None => self.ram.load_u8(addr),
        }
    }

    pub fn load_i8(&mut self, addr: u32) -> Result<i8, OutOfBounds> {
        Ok(self.load_u8(addr)? as i8)
    }

    pub fn load_u16(&mut self, addr: u32) -> Result<u16, OutOfBounds> {
        match self.window_at(addr) {
            Some((p, offset)) => {
                let lo = p.read_byte(offset) as u16;
                let hi = p.read_byte(offset + 1) as u16;
                Ok(hi << 8 | lo)
            }
            None => self.ram.load_u16(addr),
        }
    }

    pub fn load_i16(&mut self, addr: u32) -> Result<i16, OutOfBounds> {
        Ok(self.load_u16(addr)? as i16)
    }

    pub fn load_u32(&mut self, addr: u32) -> Result<u32, OutOfBounds> {
        match self.window_at(addr) {
            Some((p, offset)) if offset & 0x3 == 0 => Ok(p.read_word(offset)),
            Some((p, offset)) => {
                let mut value = 0;
                for i in 0..4 {
                    value |= (p.read_byte(offset + i) as u32) << (i * 8);
                }
                Ok(value)
            }
            None => self.ram.load_u32(addr),
        }
    }

    pub fn store_u8(&mut self, addr: u32, value: u8) -> Result<(), OutOfBounds> {
        match self.window_at(addr) {
            Some((p, offset)) => {
                p.write_byte(offset, value);
                Ok(())
            }
            None => self.ram.store_u8(addr, value),
        }
    }

    pub fn store_u16(&mut self, addr: u32, value: u16) -> Result<(), OutOfBounds> {
        match self.window_at(addr) {
            Some((p, offset)) => {
                p.write_byte(offset, value as u8);
                p.write_byte(offset + 1, (value >> 8) as u8);
                Ok(())
            }
            None => self.ram.store_u16(addr, value),
        }
    }

    pub fn store_u32(&mut self, addr: u32, value: u32) -> Result<(), OutOfBounds> {
        match self.window_at(addr) {
            Some((p, offset)) if offset & 0x3 == 0 => {
                p.write_word(offset, value);
                Ok(())
            }
            Some((p, offset)) => {
                for i in 0..4 {
                    p.write_byte(offset + i, (value >> (i * 8)) as u8);
                }
                Ok(())
            }
            None => self.ram.store_u32(addr, value),
        }
    }
}
