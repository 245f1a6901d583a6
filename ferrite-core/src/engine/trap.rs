//! Trap delivery: synchronous exceptions, asynchronous interrupts, `mret`,
//! and the host-bridge escape hatch.

use super::{Engine, EngineError};
use crate::engine::csr::{MEIP_MASK, MSIP_MASK, MTIP_MASK};
use log::trace;
use std::fmt;

/// Syscall numbers at or above this value in `a7` are host calls even when
/// the guest has installed its own trap handler, so harness and debug
/// conventions keep working underneath a guest OS.
pub const DEBUG_BRIDGE_BASE: u32 = 0xFFFF_0000;

/// Result of executing a single instruction. [`Ok`] if execution went normal,
/// [`Err`] if an exception occurred.
pub type ExecutionResult = Result<(), Exception>;

/// A synchronous exception, together with the value that will land in
/// `mtval` should it be delivered architecturally.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exception {
    /// A control-flow target (or the pc itself) violates the current
    /// instruction alignment.
    InstructionAddressMisaligned { target: u32 },
    /// Instruction fetch from an address outside RAM.
    InstructionAccessFault { addr: u32 },
    /// Unrecognized opcode, reserved encoding, or inaccessible CSR.
    IllegalInstruction { inst: u32 },
    /// `ebreak`.
    Breakpoint,
    /// Load from an address outside RAM.
    LoadAccessFault { addr: u32 },
    /// AMO at an address that is not word-aligned.
    StoreAddressMisaligned { addr: u32 },
    /// Store or AMO to an address outside RAM.
    StoreAccessFault { addr: u32 },
    /// `ecall` from machine mode.
    EnvironmentCall,
}

impl Exception {
    /// Returns the exception code (cause) for this exception.
    pub fn code(&self) -> u32 {
        match self {
            Self::InstructionAddressMisaligned { .. } => 0,
            Self::InstructionAccessFault { .. } => 1,
            Self::IllegalInstruction { .. } => 2,
            Self::Breakpoint => 3,
            Self::LoadAccessFault { .. } => 5,
            Self::StoreAddressMisaligned { .. } => 6,
            Self::StoreAccessFault { .. } => 7,
            Self::EnvironmentCall => 11,
        }
    }

    /// Returns the `mtval` to record for this exception, given the address
    /// of the instruction that raised it.
    pub fn mtval(&self, pc: u32) -> u32 {
        match *self {
            Self::InstructionAddressMisaligned { target } => target,
            Self::InstructionAccessFault { addr } => addr,
            Self::IllegalInstruction { inst } => inst,
            Self::Breakpoint => pc,
            Self::LoadAccessFault { addr } => addr,
            Self::StoreAddressMisaligned { addr } => addr,
            Self::StoreAccessFault { addr } => addr,
            Self::EnvironmentCall => 0,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::InstructionAddressMisaligned { target } => {
                write!(f, "instruction address misaligned ({target:#010x})")
            }
            Self::InstructionAccessFault { addr } => {
                write!(f, "instruction access fault ({addr:#010x})")
            }
            Self::IllegalInstruction { inst } => write!(f, "illegal instruction ({inst:#010x})"),
            Self::Breakpoint => write!(f, "breakpoint"),
            Self::LoadAccessFault { addr } => write!(f, "load access fault ({addr:#010x})"),
            Self::StoreAddressMisaligned { addr } => {
                write!(f, "store/AMO address misaligned ({addr:#010x})")
            }
            Self::StoreAccessFault { addr } => write!(f, "store/AMO access fault ({addr:#010x})"),
            Self::EnvironmentCall => write!(f, "environment call from M-mode"),
        }
    }
}

/// Machine-level interrupts, in priority order (highest first: MEI, MTI,
/// MSI).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interrupt {
    MachineExternal,
    MachineTimer,
    MachineSoftware,
}

impl Interrupt {
    /// Returns the exception code (cause) for this interrupt, without the
    /// interrupt bit.
    pub fn code(&self) -> u32 {
        match self {
            Self::MachineSoftware => 3,
            Self::MachineTimer => 7,
            Self::MachineExternal => 11,
        }
    }

    /// Returns the corresponding bit in `mip`/`mie`.
    pub fn mask(&self) -> u32 {
        match self {
            Self::MachineSoftware => MSIP_MASK,
            Self::MachineTimer => MTIP_MASK,
            Self::MachineExternal => MEIP_MASK,
        }
    }
}

/// Whether a [`HostBridge`] serviced a trap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BridgeDisposition {
    /// The bridge serviced the trap; execution resumes at `next_pc` (by
    /// default the instruction after the trapping one) unless the bridge
    /// requested termination.
    Handled,
    /// The bridge does not recognize the trap; deliver it architecturally,
    /// or fail if no guest handler is installed.
    Unhandled,
}

/// Host-side service for synchronous traps.
///
/// Invoked for every synchronous trap while `mtvec` is zero, and regardless
/// of `mtvec` for `ecall`/`ebreak` with `a7 >= `[`DEBUG_BRIDGE_BASE`]. The
/// bridge has full access to the engine: it can read and write registers and
/// memory, request termination via [`Engine::terminate`], or adjust
/// [`Engine::set_next_pc`]. When it returns [`BridgeDisposition::Handled`]
/// without touching `next_pc`, execution continues at the instruction after
/// the trapping one.
pub trait HostBridge {
    fn handle(&mut self, engine: &mut Engine, exception: &Exception) -> BridgeDisposition;
}

impl Engine {
    /// Dispatches a synchronous exception raised by the current instruction:
    /// to the host bridge where configured, to the guest's `mtvec` handler
    /// otherwise, and failing both, out of the engine as a fatal error.
    pub(super) fn dispatch_exception(&mut self, exception: Exception) -> Result<(), EngineError> {
        let debug_call = matches!(
            exception,
            Exception::EnvironmentCall | Exception::Breakpoint
        ) && self.registers.x(17) >= DEBUG_BRIDGE_BASE;

        if self.csrs.mtvec == 0 || debug_call {
            if let Some(mut bridge) = self.bridge.take() {
                let disposition = bridge.handle(self, &exception);
                self.bridge = Some(bridge);
                if disposition == BridgeDisposition::Handled {
                    return Ok(());
                }
            }
            if self.csrs.mtvec == 0 {
                return Err(EngineError::UnhandledTrap {
                    cause: exception,
                    pc: self.registers.pc(),
                });
            }
        }

        self.enter_trap(exception);
        Ok(())
    }

    /// Architectural trap entry for a synchronous exception.
    ///
    /// `pc` still addresses the faulting instruction here; the staged
    /// `next_pc` is redirected at the handler, so `mepc` records the
    /// beginning of the faulting instruction, never its successor.
    fn enter_trap(&mut self, exception: Exception) {
        let pc = self.registers.pc();
        trace!("trap: {exception}, pc={pc:#010x}");
        self.trap_csrs(exception.code(), exception.mtval(pc), pc);
        self.next_pc = self.csrs.mtvec & !0x3;
    }

    /// Trap entry for an interrupt, taken between instructions.
    ///
    /// `pc` has already advanced to the instruction that would have run, so
    /// it is that address which lands in `mepc`.
    pub(super) fn take_interrupt(&mut self, interrupt: Interrupt) {
        let pc = self.registers.pc();
        trace!("interrupt: {interrupt:?}, resume pc={pc:#010x}");
        self.trap_csrs(0x8000_0000 | interrupt.code(), 0, pc);
        self.registers.set_pc(self.csrs.mtvec & !0x3);
    }

    /// The CSR updates shared by all trap entries: record the trap, stash
    /// MIE into MPIE, and disable interrupts. Any trap also invalidates the
    /// LR/SC reservation.
    fn trap_csrs(&mut self, cause: u32, mtval: u32, epc: u32) {
        self.csrs.mepc = epc;
        self.csrs.mcause = cause;
        self.csrs.mtval = mtval;
        let mie = self.csrs.status.mie();
        self.csrs.status.set_mpie(mie);
        self.csrs.status.set_mie(false);
        self.reservation = None;
    }

    /// Return from a machine-mode trap.
    ///
    /// > An MRET instruction is used to return from a trap in M-mode. MRET
    /// > first determines what the new privilege mode will be [...]. MRET
    /// > then in mstatus/mstatush sets MPV=0, MPP=0, MIE=MPIE, and MPIE=1.
    ///
    /// The return target is `mepc` masked to the *current* instruction
    /// alignment, so returning into compressed code is valid whenever
    /// `misa.C` is set.
    pub(super) fn mret(&mut self) {
        let mpie = self.csrs.status.mpie();
        self.csrs.status.set_mie(mpie);
        self.csrs.status.set_mpie(true);
        self.next_pc = self.csrs.mepc & !self.alignment_mask;
    }
}
