//! Machine timer: the `mtime`/`mtimecmp` pair driving the machine timer
//! interrupt.
//!
//! > Platforms provide a real-time counter, exposed as a memory-mapped
//! > machine-mode read-write register, mtime. mtime must increment at
//! > constant frequency [...]. Platforms provide a 64-bit memory-mapped
//! > machine-mode timer compare register (mtimecmp). A machine timer
//! > interrupt becomes pending whenever mtime contains a value greater than
//! > or equal to mtimecmp.
//!
//! `mtime` advances once per retired instruction. The comparator is never
//! written directly: guest writes stage one 32-bit half at a time, and the
//! 64-bit comparator only latches when the *complement* half sees a write
//! (in either order). Software therefore never observes a torn comparator
//! and does not need to suppress interrupts around an update.

/// Physical address of the memory-mapped `mtime` register (8 bytes, LE).
pub const MTIME_ADDRESS: u32 = 0x0200_BFF8;

/// Physical address of the memory-mapped `mtimecmp` register (8 bytes, LE).
pub const MTIMECMP_ADDRESS: u32 = 0x0200_4000;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MachineTimer {
    mtime: u64,
    mtimecmp: u64,
    staged_cmp_low: Option<u32>,
    staged_cmp_high: Option<u32>,
}

impl Default for MachineTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineTimer {
    /// Create a timer in its reset state.
    ///
    /// The comparator resets to `u64::MAX` so the timer interrupt stays
    /// deasserted until the guest programs a deadline.
    pub fn new() -> Self {
        Self {
            mtime: 0,
            mtimecmp: u64::MAX,
            staged_cmp_low: None,
            staged_cmp_high: None,
        }
    }

    /// Advances `mtime` by one. Called once per retired instruction.
    pub fn tick(&mut self) {
        self.mtime = self.mtime.wrapping_add(1);
    }

    /// Returns `true` while the machine timer interrupt condition holds.
    pub fn mtip(&self) -> bool {
        self.mtime >= self.mtimecmp
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    pub fn mtimecmp(&self) -> u64 {
        self.mtimecmp
    }

    pub fn set_mtime_low(&mut self, value: u32) {
        self.mtime = self.mtime & 0xFFFF_FFFF_0000_0000 | value as u64;
    }

    pub fn set_mtime_high(&mut self, value: u32) {
        self.mtime = self.mtime & 0x0000_0000_FFFF_FFFF | (value as u64) << 32;
    }

    /// Stages the low half of the comparator; latches if the high half is
    /// already staged.
    pub fn write_mtimecmp_low(&mut self, value: u32) {
        self.staged_cmp_low = Some(value);
        self.try_latch();
    }

    /// Stages the high half of the comparator; latches if the low half is
    /// already staged.
    pub fn write_mtimecmp_high(&mut self, value: u32) {
        self.staged_cmp_high = Some(value);
        self.try_latch();
    }

    fn try_latch(&mut self) {
        if let (Some(low), Some(high)) = (self.staged_cmp_low, self.staged_cmp_high) {
            self.mtimecmp = (high as u64) << 32 | low as u64;
            self.staged_cmp_low = None;
            self.staged_cmp_high = None;
        }
    }

    /// The low comparator half as seen by a read-modify-write sequence:
    /// staged if a half-write is in flight, latched otherwise.
    fn cmp_low_view(&self) -> u32 {
        self.staged_cmp_low.unwrap_or(self.mtimecmp as u32)
    }

    fn cmp_high_view(&self) -> u32 {
        self.staged_cmp_high.unwrap_or((self.mtimecmp >> 32) as u32)
    }

    /// Returns `true` if `addr` falls in either memory-mapped register.
    pub fn mmio_contains(&self, addr: u32) -> bool {
        (MTIME_ADDRESS..MTIME_ADDRESS + 8).contains(&addr)
            || (MTIMECMP_ADDRESS..MTIMECMP_ADDRESS + 8).contains(&addr)
    }

    /// Word read from a memory-mapped register; `addr` must satisfy
    /// [`MachineTimer::mmio_contains`] after word alignment.
    pub fn mmio_read_u32(&self, addr: u32) -> u32 {
        match addr & !0x3 {
            MTIME_ADDRESS => self.mtime as u32,
            a if a == MTIME_ADDRESS + 4 => (self.mtime >> 32) as u32,
            MTIMECMP_ADDRESS => self.mtimecmp as u32,
            a if a == MTIMECMP_ADDRESS + 4 => (self.mtimecmp >> 32) as u32,
            _ => 0,
        }
    }

    /// Word write to a memory-mapped register. `mtime` halves take effect
    /// immediately; `mtimecmp` halves go through the staging latch.
    pub fn mmio_write_u32(&mut self, addr: u32, value: u32) {
        match addr & !0x3 {
            MTIME_ADDRESS => self.set_mtime_low(value),
            a if a == MTIME_ADDRESS + 4 => self.set_mtime_high(value),
            MTIMECMP_ADDRESS => self.write_mtimecmp_low(value),
            a if a == MTIMECMP_ADDRESS + 4 => self.write_mtimecmp_high(value),
            _ => {}
        }
    }

    /// Byte read fan-out over [`MachineTimer::mmio_read_u32`].
    pub fn mmio_read_u8(&self, addr: u32) -> u8 {
        (self.mmio_read_u32(addr & !0x3) >> ((addr & 0x3) * 8)) as u8
    }

    /// Byte write fan-out. Read-modify-write against the staged view of
    /// `mtimecmp` so a comparator update assembled byte-wise still latches
    /// only once the other half is written.
    pub fn mmio_write_u8(&mut self, addr: u32, value: u8) {
        let old = match addr & !0x3 {
            MTIMECMP_ADDRESS => self.cmp_low_view(),
            a if a == MTIMECMP_ADDRESS + 4 => self.cmp_high_view(),
            aligned => self.mmio_read_u32(aligned),
        };
        let shift = (addr & 0x3) * 8;
        let new = (old & !(0xFF << shift)) | ((value as u32) << shift);
        self.mmio_write_u32(addr & !0x3, new);
    }
}
