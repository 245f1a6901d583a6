//! Control and status registers for a machine-mode-only hart.
//!
//! Specifier constants for all supported CSRs, the backing storage, and the
//! engine-level read/write dispatch. Every supported CSR carries a write
//! mask; writes to the read-only portion of a writable CSR are silently
//! dropped, while writes addressed at a fully read-only CSR are rejected so
//! the caller can raise an illegal-instruction exception.

use super::Engine;
use bitvec::order::Lsb0;
use bitvec::view::BitView;
use thiserror::Error;

/// `mstatus` MIE (M-mode Interrupt Enable) bit.
pub const MSTATUS_MIE: u32 = 1 << 3;
/// `mstatus` MPIE (M-mode Previous Interrupt Enable) bit.
pub const MSTATUS_MPIE: u32 = 1 << 7;
/// `mstatus` MPP field, hardwired to machine level.
pub const MSTATUS_MPP: u32 = 0b11 << 11;

/// General 12-bit value representing a CSR specifier. Note that this can hold
/// any 12-bit value, even if the value represents an unsupported CSR.
pub type CsrSpecifier = u16;

/// Machine status register.
pub const MSTATUS: CsrSpecifier = 0x300;
/// Machine ISA register. Only the C bit is writable here.
pub const MISA: CsrSpecifier = 0x301;
/// Machine interrupt-enable register.
pub const MIE: CsrSpecifier = 0x304;
/// Machine trap-handler base address.
pub const MTVEC: CsrSpecifier = 0x305;
/// Machine scratch register for trap handlers.
pub const MSCRATCH: CsrSpecifier = 0x340;
/// Machine exception program counter.
pub const MEPC: CsrSpecifier = 0x341;
/// Machine trap cause.
pub const MCAUSE: CsrSpecifier = 0x342;
/// Machine bad address or instruction.
pub const MTVAL: CsrSpecifier = 0x343;
/// Machine interrupt-pending register.
pub const MIP: CsrSpecifier = 0x344;
/// Machine cycle counter.
pub const MCYCLE: CsrSpecifier = 0xB00;
/// Machine instructions-retired counter.
pub const MINSTRET: CsrSpecifier = 0xB02;
/// Upper 32 bits of [`MCYCLE`], RV32 only.
pub const MCYCLEH: CsrSpecifier = 0xB80;
/// Upper 32 bits of [`MINSTRET`], RV32 only.
pub const MINSTRETH: CsrSpecifier = 0xB82;

// Custom machine-mode CSR bindings for the machine timer, so bare-metal
// guests can program it without touching the memory-mapped window.
/// Low half of `mtime` (read-only custom CSR).
pub const MTIME: CsrSpecifier = 0x7C0;
/// High half of `mtime` (read-only custom CSR).
pub const MTIMEH: CsrSpecifier = 0x7C1;
/// Low half of `mtimecmp` (write goes through the both-halves latch).
pub const MTIMECMP: CsrSpecifier = 0x7C2;
/// High half of `mtimecmp` (write goes through the both-halves latch).
pub const MTIMECMPH: CsrSpecifier = 0x7C3;

/// Machine software interrupt bit in `mip`/`mie`.
pub const MSIP_MASK: u32 = 1 << 3;
/// Machine timer interrupt bit in `mip`/`mie`.
pub const MTIP_MASK: u32 = 1 << 7;
/// Machine external interrupt bit in `mip`/`mie`.
pub const MEIP_MASK: u32 = 1 << 11;

/// `misa` bit for the A (atomic) extension.
pub const MISA_A: u32 = 1;
/// `misa` bit for the C (compressed) extension. The only writable bit.
pub const MISA_C: u32 = 1 << 2;
/// `misa` bit for the I (base integer) extension.
pub const MISA_I: u32 = 1 << 8;
/// `misa` bit for the M (multiply/divide) extension.
pub const MISA_M: u32 = 1 << 12;
/// `misa` MXL field value for XLEN=32.
pub const MISA_MXL32: u32 = 1 << 30;

/// The machine status register, restricted to the fields a machine-mode-only
/// hart actually has: MIE and MPIE are writable state, MPP reads as hardwired
/// machine level, everything else is zero.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Status {
    mstatus: u32,
}

impl Status {
    const WRITABLE: u32 = MSTATUS_MIE | MSTATUS_MPIE;

    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[3]
    }

    /// Sets the MIE (M-mode Interrupt Enable) bit to `value`.
    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(3, value);
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is
    /// set.
    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[7]
    }

    /// Sets the MPIE (M-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(7, value);
    }

    /// The architectural read view: stored bits plus MPP hardwired to `0b11`
    /// (machine), the only privilege level that exists here.
    pub fn read(&self) -> u32 {
        self.mstatus | MSTATUS_MPP
    }

    /// Masked write; non-writable bits are silently ignored.
    pub fn write(&mut self, value: u32, mask: u32) {
        let mask = mask & Self::WRITABLE;
        self.mstatus = self.mstatus & !mask | value & mask;
    }
}

/// Backing storage for the supported CSRs.
///
/// `mip.MTIP` is not stored: it is composed live from the machine timer on
/// every read (see [`Engine::read_csr`]). `mip.MEIP` is refreshed from the
/// bus interrupt lines between instructions.
#[derive(Debug, Clone)]
pub struct Csrs {
    pub(super) status: Status,
    pub(super) misa: u32,
    pub(super) mie: u32,
    pub(super) mtvec: u32,
    pub(super) mscratch: u32,
    pub(super) mepc: u32,
    pub(super) mcause: u32,
    pub(super) mtval: u32,
    /// Stored `mip` bits (MSIP, MEIP). MTIP is derived.
    pub(super) mip: u32,
    pub(super) mcycle: u64,
    pub(super) minstret: u64,
}

impl Csrs {
    pub fn new(compressed: bool) -> Self {
        let mut misa = MISA_MXL32 | MISA_I | MISA_M | MISA_A;
        if compressed {
            misa |= MISA_C;
        }
        Self {
            status: Status::new(),
            misa,
            mie: 0,
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            mip: 0,
            mcycle: 0,
            minstret: 0,
        }
    }
}

/// Errors that can occur when attempting to access a CSR.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrAccessError {
    #[error("unsupported CSR: {0:#05X}")]
    CsrUnsupported(CsrSpecifier),
}

/// Errors that can occur when attempting to write to a CSR.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrWriteError {
    /// A non-write specific access error. See [`CsrAccessError`].
    #[error("{0}")]
    AccessError(#[from] CsrAccessError),
    /// Attempt to write to a read-only register.
    #[error("writing to read-only CSR is invalid")]
    WriteToReadOnly,
}

impl Engine {
    /// Read the value of a CSR by its specifier.
    ///
    /// Reads never have guest-visible side effects in this implementation,
    /// but several registers are composed live: `mip` folds in the timer's
    /// MTIP line, and the timer CSRs read through to the timer itself.
    pub fn read_csr(&self, specifier: CsrSpecifier) -> Result<u32, CsrAccessError> {
        match specifier {
            MSTATUS => Ok(self.csrs.status.read()),
            MISA => Ok(self.csrs.misa),
            MIE => Ok(self.csrs.mie),
            MTVEC => Ok(self.csrs.mtvec),
            MSCRATCH => Ok(self.csrs.mscratch),
            MEPC => Ok(self.csrs.mepc),
            MCAUSE => Ok(self.csrs.mcause),
            MTVAL => Ok(self.csrs.mtval),
            MIP => Ok(self.mip()),
            MCYCLE => Ok(self.csrs.mcycle as u32),
            MCYCLEH => Ok((self.csrs.mcycle >> 32) as u32),
            MINSTRET => Ok(self.csrs.minstret as u32),
            MINSTRETH => Ok((self.csrs.minstret >> 32) as u32),
            MTIME => Ok(self.timer.mtime() as u32),
            MTIMEH => Ok((self.timer.mtime() >> 32) as u32),
            MTIMECMP => Ok(self.timer.mtimecmp() as u32),
            MTIMECMPH => Ok((self.timer.mtimecmp() >> 32) as u32),
            _ => Err(CsrAccessError::CsrUnsupported(specifier)),
        }
    }

    /// Write `value` to a CSR under `mask`.
    ///
    /// Only the bits selected by `mask` are taken from `value`; the rest keep
    /// their old state. This directly models the CSRRS/CSRRC set/clear
    /// behavior with `mask = rs1` and `value = all-ones`/`all-zeros`.
    pub fn write_csr(
        &mut self,
        specifier: CsrSpecifier,
        value: u32,
        mask: u32,
    ) -> Result<(), CsrWriteError> {
        match specifier {
            MSTATUS => self.csrs.status.write(value, mask),
            MISA => {
                let old = self.csrs.misa;
                let new = old & !(mask & MISA_C) | value & mask & MISA_C;
                self.set_rvc_enabled(new & MISA_C != 0);
            }
            MIE => {
                let mask = mask & (MSIP_MASK | MTIP_MASK | MEIP_MASK);
                self.csrs.mie = self.csrs.mie & !mask | value & mask;
            }
            MTVEC => self.csrs.mtvec = self.csrs.mtvec & !mask | value & mask,
            MSCRATCH => self.csrs.mscratch = self.csrs.mscratch & !mask | value & mask,
            MEPC => {
                self.csrs.mepc = self.csrs.mepc & !mask | value & mask;
                // An IALIGN=16 implementation masks only bit 0.
                self.csrs.mepc &= !0b1;
            }
            MCAUSE => self.csrs.mcause = self.csrs.mcause & !mask | value & mask,
            MTVAL => self.csrs.mtval = self.csrs.mtval & !mask | value & mask,
            MIP => {
                // MTIP and MEIP track their interrupt sources; only the
                // software interrupt bit is directly writable.
                let mask = mask & MSIP_MASK;
                self.csrs.mip = self.csrs.mip & !mask | value & mask;
            }
            MCYCLE => {
                let low = self.csrs.mcycle as u32 & !mask | value & mask;
                self.csrs.mcycle = self.csrs.mcycle & 0xFFFF_FFFF_0000_0000 | low as u64;
            }
            MCYCLEH => {
                let high = (self.csrs.mcycle >> 32) as u32 & !mask | value & mask;
                self.csrs.mcycle = self.csrs.mcycle & 0xFFFF_FFFF | (high as u64) << 32;
            }
            MINSTRET => {
                let low = self.csrs.minstret as u32 & !mask | value & mask;
                self.csrs.minstret = self.csrs.minstret & 0xFFFF_FFFF_0000_0000 | low as u64;
            }
            MINSTRETH => {
                let high = (self.csrs.minstret >> 32) as u32 & !mask | value & mask;
                self.csrs.minstret = self.csrs.minstret & 0xFFFF_FFFF | (high as u64) << 32;
            }
            MTIME | MTIMEH => return Err(CsrWriteError::WriteToReadOnly),
            MTIMECMP => {
                let value = self.timer.mtimecmp() as u32 & !mask | value & mask;
                self.timer.write_mtimecmp_low(value);
            }
            MTIMECMPH => {
                let value = (self.timer.mtimecmp() >> 32) as u32 & !mask | value & mask;
                self.timer.write_mtimecmp_high(value);
            }
            _ => return Err(CsrAccessError::CsrUnsupported(specifier).into()),
        }
        Ok(())
    }

    /// The live `mip` view: stored bits plus MTIP from the timer.
    pub fn mip(&self) -> u32 {
        let mut mip = self.csrs.mip;
        mip.view_bits_mut::<Lsb0>().set(7, self.timer.mtip());
        mip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Config;

    fn engine() -> Engine {
        Engine::new(Config {
            ram_size: 0x1000,
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    fn test_misa_reports_imac() {
        let engine = engine();
        assert_eq!(
            MISA_MXL32 | MISA_I | MISA_M | MISA_A | MISA_C,
            engine.read_csr(MISA).unwrap()
        );
    }

    #[test]
    fn test_mstatus_write_mask() {
        let mut engine = engine();
        // Only MIE and MPIE are writable; MPP always reads as machine.
        engine.write_csr(MSTATUS, !0, !0).unwrap();
        assert_eq!(
            MSTATUS_MIE | MSTATUS_MPIE | MSTATUS_MPP,
            engine.read_csr(MSTATUS).unwrap()
        );
    }

    #[test]
    fn test_mepc_low_bit_clears() {
        let mut engine = engine();
        engine.write_csr(MEPC, 0x1003, !0).unwrap();
        assert_eq!(0x1002, engine.read_csr(MEPC).unwrap());
    }

    #[test]
    fn test_mip_only_msip_writable() {
        let mut engine = engine();
        engine.write_csr(MIP, !0, !0).unwrap();
        assert_eq!(MSIP_MASK, engine.read_csr(MIP).unwrap());
        engine.write_csr(MIP, 0, !0).unwrap();
        assert_eq!(0, engine.read_csr(MIP).unwrap());
    }

    #[test]
    fn test_mtime_csr_is_read_only() {
        let mut engine = engine();
        assert_eq!(
            Err(CsrWriteError::WriteToReadOnly),
            engine.write_csr(MTIME, 5, !0)
        );
        assert_eq!(
            Err(CsrWriteError::WriteToReadOnly),
            engine.write_csr(MTIMEH, 5, !0)
        );
    }

    #[test]
    fn test_mtimecmp_csr_halves_latch() {
        let mut engine = engine();
        engine.write_csr(MTIMECMP, 100, !0).unwrap();
        // Staged only: the comparator still reads its reset value.
        assert_eq!(u32::MAX, engine.read_csr(MTIMECMP).unwrap());
        engine.write_csr(MTIMECMPH, 0, !0).unwrap();
        assert_eq!(100, engine.read_csr(MTIMECMP).unwrap());
        assert_eq!(0, engine.read_csr(MTIMECMPH).unwrap());
    }

    #[test]
    fn test_unsupported_csr() {
        let mut engine = engine();
        assert_eq!(
            Err(CsrAccessError::CsrUnsupported(0x123)),
            engine.read_csr(0x123)
        );
        assert!(engine.write_csr(0x123, 0, !0).is_err());
    }
}
