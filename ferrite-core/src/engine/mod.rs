//! The execution engine: architectural state plus the fetch/decode/execute
//! loop.
//!
//! One [`Engine`] is one hart. It owns the register file, the CSRs, the
//! machine timer, the LR/SC reservation, the decode cache, and the system
//! bus, and advances them one instruction per [`Engine::step`].
//!
//! Between instructions the engine is quiescent: every architectural effect
//! of the previous instruction is committed, `x0` is zero, and the pc is
//! aligned. That is where interrupts are polled, where the host may inspect
//! or mutate state, and where the cooperative stop flag is honored.

pub mod csr;
mod decode;
mod execute;
pub mod rvc;
pub mod timer;
mod trap;

pub use csr::{CsrAccessError, CsrSpecifier, CsrWriteError};
pub use timer::MachineTimer;
pub use trap::{
    BridgeDisposition, Exception, ExecutionResult, HostBridge, Interrupt, DEBUG_BRIDGE_BASE,
};

use crate::bus::SystemBus;
use crate::registers::Registers;
use crate::resources::ram::{OutOfBounds, Ram};
use csr::{Csrs, MEIP_MASK, MISA_C, MSIP_MASK, MTIP_MASK};
use decode::DecodeCache;
use execute::HANDLERS;
use log::trace;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the flat RAM in bytes.
    pub ram_size: usize,
    /// Lowest RAM address. Zero for flat binaries; ELF test suites link at
    /// `0x8000_0000`.
    pub ram_base: u32,
    /// Address the pc register is reset to.
    pub reset_vector: u32,
    /// Whether the C extension starts out enabled (`misa.C` is writable
    /// either way).
    pub compressed: bool,
    /// Whether the machine timer is additionally reachable through its
    /// memory-mapped window (the CSR binding is always active).
    pub mmio_timer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ram_size: 4 << 20,
            ram_base: 0,
            reset_vector: 0,
            compressed: true,
            mmio_timer: true,
        }
    }
}

#[derive(Error, Debug)]
#[error("invalid RAM size: {0:#x} bytes")]
pub struct InvalidRamSizeError(pub usize);

/// Fatal errors: conditions neither the guest nor a host bridge claimed.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unhandled trap ({cause}) at pc {pc:#010x} with no trap handler installed")]
    UnhandledTrap { cause: Exception, pc: u32 },
}

/// Why [`Engine::run`] returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunOutcome {
    /// The guest (through the host bridge) requested termination.
    Exited(i32),
    /// The cooperative stop flag was set.
    Cancelled,
}

/// A simulated RV32IMAC hart in machine mode.
pub struct Engine {
    config: Config,
    registers: Registers,
    csrs: Csrs,
    timer: MachineTimer,
    bus: SystemBus,
    decode: DecodeCache,
    /// LR/SC reservation: `Some(addr)` while a reservation on the word at
    /// `addr` is held. `addr` is always word-aligned.
    reservation: Option<u32>,
    /// `0x1` while `misa.C` is set (16-bit instruction alignment), `0x3`
    /// otherwise. Updated atomically with every `misa.C` write.
    alignment_mask: u32,
    /// Size in bytes of the instruction currently executing.
    inst_size: u32,
    /// The pc that will be installed when the current instruction retires.
    /// Staged separately so a trap can leave `pc` intact as `mepc`.
    next_pc: u32,
    exit_code: Option<i32>,
    stop: Arc<AtomicBool>,
    bridge: Option<Box<dyn HostBridge>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("pc", &self.registers.pc())
            .field("inst_size", &self.inst_size)
            .field("reservation", &self.reservation)
            .field("alignment_mask", &self.alignment_mask)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: Config) -> Result<Self, InvalidRamSizeError> {
        let ram = Ram::with_base(config.ram_size, config.ram_base)
            .ok_or(InvalidRamSizeError(config.ram_size))?;
        let alignment_mask = if config.compressed { 0x1 } else { 0x3 };
        Ok(Self {
            registers: Registers::new(config.reset_vector),
            csrs: Csrs::new(config.compressed),
            timer: MachineTimer::new(),
            bus: SystemBus::new(ram),
            decode: DecodeCache::new(),
            reservation: None,
            alignment_mask,
            inst_size: 4,
            next_pc: config.reset_vector,
            exit_code: None,
            stop: Arc::new(AtomicBool::new(false)),
            bridge: None,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn bus(&self) -> &SystemBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut SystemBus {
        &mut self.bus
    }

    pub fn timer(&self) -> &MachineTimer {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut MachineTimer {
        &mut self.timer
    }

    /// Size in bytes (2 or 4) of the instruction currently executing, for
    /// the host bridge, which needs it to reason about resumption.
    pub fn inst_size(&self) -> u32 {
        self.inst_size
    }

    /// Overrides where execution resumes when the current instruction
    /// retires. Intended for [`HostBridge`] implementations.
    pub fn set_next_pc(&mut self, next_pc: u32) {
        self.next_pc = next_pc;
    }

    /// The current LR/SC reservation, if held.
    pub fn reservation(&self) -> Option<u32> {
        self.reservation
    }

    /// Whether compressed instructions are currently legal (`misa.C`).
    pub fn rvc_enabled(&self) -> bool {
        self.csrs.misa & MISA_C != 0
    }

    /// Installs the host-side trap service invoked when `mtvec` is zero (and
    /// unconditionally for the `a7 >= `[`DEBUG_BRIDGE_BASE`] convention).
    pub fn install_bridge(&mut self, bridge: Box<dyn HostBridge>) {
        self.bridge = Some(bridge);
    }

    /// Requests clean termination with `exit_code`; [`Engine::run`] returns
    /// at the current instruction boundary.
    pub fn terminate(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
    }

    /// The exit code, once termination has been requested.
    pub fn exited(&self) -> Option<i32> {
        self.exit_code
    }

    /// A handle to the cooperative stop flag, safe to set from a signal
    /// handler or another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Copies an image into RAM at `base`. No relocation is performed;
    /// images must be linked for their load address.
    pub fn load_image(&mut self, base: u32, image: &[u8]) -> Result<(), OutOfBounds> {
        self.bus.ram_mut().store_bytes(base, image)
    }

    pub(crate) fn set_rvc_enabled(&mut self, enabled: bool) {
        if enabled {
            self.csrs.misa |= MISA_C;
        } else {
            self.csrs.misa &= !MISA_C;
        }
        self.alignment_mask = if enabled { 0x1 } else { 0x3 };
    }

    //
    // Memory access paths. All guest loads and stores (including fetches)
    // come through here: the memory-mapped timer window is checked first,
    // then the peripheral windows on the bus, then RAM.
    //

    fn is_timer_mmio(&self, addr: u32) -> bool {
        self.config.mmio_timer && self.timer.mmio_contains(addr)
    }

    pub fn load_u8(&mut self, addr: u32) -> Result<u8, OutOfBounds> {
        if self.is_timer_mmio(addr) {
            return Ok(self.timer.mmio_read_u8(addr));
        }
        self.bus.load_u8(addr)
    }

    pub fn load_i8(&mut self, addr: u32) -> Result<i8, OutOfBounds> {
        Ok(self.load_u8(addr)? as i8)
    }

    pub fn load_u16(&mut self, addr: u32) -> Result<u16, OutOfBounds> {
        if self.is_timer_mmio(addr) {
            let lo = self.timer.mmio_read_u8(addr) as u16;
            let hi = self.timer.mmio_read_u8(addr.wrapping_add(1)) as u16;
            return Ok(hi << 8 | lo);
        }
        self.bus.load_u16(addr)
    }

    pub fn load_i16(&mut self, addr: u32) -> Result<i16, OutOfBounds> {
        Ok(self.load_u16(addr)? as i16)
    }

    pub fn load_u32(&mut self, addr: u32) -> Result<u32, OutOfBounds> {
        if self.is_timer_mmio(addr) {
            if addr & 0x3 == 0 {
                return Ok(self.timer.mmio_read_u32(addr));
            }
            let mut value = 0;
            for i in 0..4 {
                value |= (self.timer.mmio_read_u8(addr.wrapping_add(i)) as u32) << (i * 8);
            }
            return Ok(value);
        }
        self.bus.load_u32(addr)
    }

    pub fn store_u8(&mut self, addr: u32, value: u8) -> Result<(), OutOfBounds> {
        self.reservation = None;
        if self.is_timer_mmio(addr) {
            self.timer.mmio_write_u8(addr, value);
            return Ok(());
        }
        self.bus.store_u8(addr, value)
    }

    pub fn store_u16(&mut self, addr: u32, value: u16) -> Result<(), OutOfBounds> {
        self.reservation = None;
        if self.is_timer_mmio(addr) {
            self.timer.mmio_write_u8(addr, value as u8);
            self.timer.mmio_write_u8(addr.wrapping_add(1), (value >> 8) as u8);
            return Ok(());
        }
        self.bus.store_u16(addr, value)
    }

    pub fn store_u32(&mut self, addr: u32, value: u32) -> Result<(), OutOfBounds> {
        self.reservation = None;
        if self.is_timer_mmio(addr) {
            if addr & 0x3 == 0 {
                self.timer.mmio_write_u32(addr, value);
            } else {
                for i in 0..4 {
                    self.timer
                        .mmio_write_u8(addr.wrapping_add(i), (value >> (i * 8)) as u8);
                }
            }
            return Ok(());
        }
        self.bus.store_u32(addr, value)
    }

    //
    // The fetch/decode/execute loop.
    //

    /// Executes one instruction (or delivers one trap) and advances the
    /// machine timer and interrupt state.
    ///
    /// Returns an error only for conditions neither the guest nor the host
    /// bridge claims (see [`EngineError`]); architectural traps are handled
    /// internally and are not errors.
    pub fn step(&mut self) -> Result<(), EngineError> {
        let pc = self.registers.pc();

        if pc & self.alignment_mask != 0 {
            self.next_pc = pc;
            self.dispatch_exception(Exception::InstructionAddressMisaligned { target: pc })?;
            return Ok(self.retire());
        }

        // Fetch one parcel at a time. The second parcel of a full-width
        // instruction is only read once the first one's low bits call for
        // it, so a 16-bit instruction at the top of RAM never over-reads.
        let parcel = match self.load_u16(pc) {
            Ok(parcel) => parcel,
            Err(_) => {
                self.next_pc = pc;
                self.dispatch_exception(Exception::InstructionAccessFault { addr: pc })?;
                return Ok(self.retire());
            }
        };

        let decoded = if parcel & 0b11 == 0b11 {
            self.inst_size = 4;
            self.next_pc = pc.wrapping_add(4);
            let upper = match self.load_u16(pc.wrapping_add(2)) {
                Ok(upper) => upper,
                Err(_) => {
                    self.next_pc = pc;
                    self.dispatch_exception(Exception::InstructionAccessFault {
                        addr: pc.wrapping_add(2),
                    })?;
                    return Ok(self.retire());
                }
            };
            self.decode.full((upper as u32) << 16 | parcel as u32)
        } else {
            self.inst_size = 2;
            self.next_pc = pc.wrapping_add(2);
            match self.decode.compressed(parcel) {
                Ok(decoded) => decoded,
                Err(_) => {
                    self.dispatch_exception(Exception::IllegalInstruction {
                        inst: parcel as u32,
                    })?;
                    return Ok(self.retire());
                }
            }
        };

        let handler = HANDLERS[(decoded.opcode & 0x7F) as usize];
        if let Err(exception) = handler(self, decoded) {
            self.dispatch_exception(exception)?;
        }

        Ok(self.retire())
    }

    /// Commits the instruction boundary: re-zeroes `x0`, installs the staged
    /// pc, advances the timer and counters, and polls for interrupts.
    fn retire(&mut self) {
        self.registers.clear_x0();
        self.registers.set_pc(self.next_pc);
        self.timer.tick();
        self.csrs.mcycle = self.csrs.mcycle.wrapping_add(1);
        self.csrs.minstret = self.csrs.minstret.wrapping_add(1);
        self.poll_interrupts();
    }

    /// Instruction-stream-driven interrupt poll.
    ///
    /// Device interrupt lines are folded into `mip.MEIP` first, then the
    /// highest-priority enabled pending interrupt is taken (MEI > MTI >
    /// MSI). `pc` has already advanced, so the interrupted-to `mepc` is the
    /// instruction that would have run next.
    fn poll_interrupts(&mut self) {
        if self.bus.irq_pending() {
            self.csrs.mip |= MEIP_MASK;
        } else {
            self.csrs.mip &= !MEIP_MASK;
        }
        if !self.csrs.status.mie() {
            return;
        }
        let pending = self.mip() & self.csrs.mie;
        let interrupt = if pending & MEIP_MASK != 0 {
            Interrupt::MachineExternal
        } else if pending & MTIP_MASK != 0 {
            Interrupt::MachineTimer
        } else if pending & MSIP_MASK != 0 {
            Interrupt::MachineSoftware
        } else {
            return;
        };
        self.take_interrupt(interrupt);
    }

    /// Runs until the guest exits, the stop flag is raised, or a fatal error
    /// surfaces.
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        loop {
            self.step()?;
            if let Some(exit_code) = self.exit_code {
                trace!("run loop: guest exited with code {exit_code}");
                return Ok(RunOutcome::Exited(exit_code));
            }
            if self.stop.load(Ordering::Relaxed) {
                trace!("run loop: cancelled");
                return Ok(RunOutcome::Cancelled);
            }
        }
    }
}
