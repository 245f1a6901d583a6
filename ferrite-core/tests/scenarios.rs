//! End-to-end scenarios driving the engine through its public API only:
//! small hand-assembled guest programs, stepped to completion.

use ferrite_core::engine::csr;
use ferrite_core::engine::{
    BridgeDisposition, Config, Engine, EngineError, Exception, HostBridge, RunOutcome,
};

const NOP: u32 = 0x0000_0013;
const EBREAK: u32 = 0x0010_0073;
const ECALL: u32 = 0x0000_0073;
const MRET: u32 = 0x3020_0073;
/// `jal x0, 0`: park the hart in place.
const SELF_LOOP: u32 = 0x0000_006F;

fn engine() -> Engine {
    Engine::new(Config {
        ram_size: 0x10000,
        ..Config::default()
    })
    .unwrap()
}

fn load_words(engine: &mut Engine, base: u32, words: &[u32]) {
    for (i, word) in words.iter().enumerate() {
        engine
            .load_image(base + i as u32 * 4, &word.to_le_bytes())
            .unwrap();
    }
}

/// 1+2+...+100 accumulated in t0, then `ebreak`.
#[test]
fn sum_loop_terminates_at_ebreak() {
    let mut engine = engine();
    load_words(
        &mut engine,
        0,
        &[
            0x0000_0293, // addi t0, x0, 0
            0x0010_0313, // addi t1, x0, 1
            0x0640_0393, // addi t2, x0, 100
            0x0062_82B3, // loop: add t0, t0, t1
            0x0013_0313, // addi t1, t1, 1
            0xFE63_DCE3, // bge t2, t1, loop
            EBREAK,
        ],
    );
    let error = loop {
        if let Err(error) = engine.step() {
            break error;
        }
    };
    match error {
        EngineError::UnhandledTrap {
            cause: Exception::Breakpoint,
            pc,
        } => assert_eq!(0x18, pc),
        other => panic!("expected breakpoint, got {other}"),
    }
    assert_eq!(5050, engine.registers().x(5));
    assert_eq!(0x18, engine.registers().pc());
}

/// A compressed `c.li a0, 1` executes identically to its expansion.
#[test]
fn compressed_li_executes() {
    let mut engine = engine();
    engine.load_image(0, &0x4505u16.to_le_bytes()).unwrap();
    engine.step().unwrap();
    assert_eq!(1, engine.registers().x(10));
    assert_eq!(2, engine.registers().pc());
}

/// An intervening store invalidates the reservation, so SC.W fails and does
/// not touch memory.
#[test]
fn sc_fails_after_intervening_store() {
    let mut engine = engine();
    engine.store_u32(0x100, 0xDEADBEEF).unwrap();
    load_words(
        &mut engine,
        0,
        &[
            0x1000_0093, // addi x1, x0, 0x100
            0x1000_A12F, // lr.w x2, (x1)
            0x0000_A023, // sw x0, 0(x1)
            0x1234_51B7, // lui x3, 0x12345
            0x6781_8193, // addi x3, x3, 0x678
            0x1830_A22F, // sc.w x4, x3, (x1)
        ],
    );
    for _ in 0..6 {
        engine.step().unwrap();
    }
    assert_eq!(0xDEADBEEF, engine.registers().x(2));
    assert_eq!(1, engine.registers().x(4), "sc.w must fail");
    assert_eq!(0, engine.load_u32(0x100).unwrap(), "sc.w must not store");
    assert_eq!(None, engine.reservation());
}

/// LR then SC with no intervening store succeeds.
#[test]
fn lr_sc_pair_succeeds() {
    let mut engine = engine();
    engine.store_u32(0x100, 0x1111_1111).unwrap();
    load_words(
        &mut engine,
        0,
        &[
            0x1000_0093, // addi x1, x0, 0x100
            0x1000_A12F, // lr.w x2, (x1)
            0x1234_51B7, // lui x3, 0x12345
            0x6781_8193, // addi x3, x3, 0x678
            0x1830_A22F, // sc.w x4, x3, (x1)
        ],
    );
    for _ in 0..5 {
        engine.step().unwrap();
    }
    assert_eq!(0x1111_1111, engine.registers().x(2));
    assert_eq!(0, engine.registers().x(4));
    assert_eq!(0x1234_5678, engine.load_u32(0x100).unwrap());
}

/// Timer interrupt: mtimecmp = 100, a handler that bumps the comparator and
/// returns. Fires exactly once, with the interrupt cause and a word-aligned
/// mepc inside the nop run.
#[test]
fn timer_interrupt_fires_once() {
    let mut engine = engine();
    let mut program = vec![
        0x0000_12B7, // lui t0, 0x1 (handler base 0x1000)
        0x3052_9073, // csrw mtvec, t0
        0x0640_0313, // addi t1, x0, 100
        0x7C23_1073, // csrw mtimecmp, t1
        0x7C30_1073, // csrw mtimecmph, x0 (latches the comparator)
        0x0800_0393, // addi t2, x0, 0x80 (MTIE)
        0x3043_9073, // csrw mie, t2
        0x3004_6073, // csrsi mstatus, 8 (MIE)
    ];
    let nops_base = program.len() as u32 * 4;
    program.extend(std::iter::repeat(NOP).take(200));
    program.push(SELF_LOOP);
    load_words(&mut engine, 0, &program);
    load_words(
        &mut engine,
        0x1000,
        &[
            0x0014_0413, // addi s0, s0, 1
            0x0010_0513, // addi a0, x0, 1
            0x0001_0E37, // lui t3, 0x10
            0x7C2E_1073, // csrw mtimecmp, t3
            0x7C30_1073, // csrw mtimecmph, x0
            MRET,
        ],
    );
    for _ in 0..400 {
        engine.step().unwrap();
    }
    assert_eq!(1, engine.registers().x(8), "handler must fire exactly once");
    assert_eq!(1, engine.registers().x(10));
    assert_eq!(0x8000_0007, engine.read_csr(csr::MCAUSE).unwrap());
    let mepc = engine.read_csr(csr::MEPC).unwrap();
    assert_eq!(0, mepc & 0x3, "mepc must be an instruction boundary");
    assert!(mepc >= nops_base, "mepc {mepc:#x} before the nop run");
}

/// `c.jalr t0` links past the 2-byte instruction, not 4.
#[test]
fn compressed_jalr_links_pc_plus_2() {
    let mut engine = engine();
    engine
        .load_image(0x2000, &0x9282u16.to_le_bytes())
        .unwrap();
    engine.registers_mut().set_x(5, 0x3000);
    engine.registers_mut().set_pc(0x2000);
    engine.step().unwrap();
    assert_eq!(0x2002, engine.registers().x(1));
    assert_eq!(0x3000, engine.registers().pc());
}

/// Clearing `misa.C` tightens the fetch alignment: a jump to an address with
/// bit 1 set then traps with cause 0 and the target in mtval.
#[test]
fn misa_c_clear_makes_halfword_targets_trap() {
    let mut engine = engine();
    load_words(
        &mut engine,
        0,
        &[
            0x3012_7073, // csrci misa, 4
            0x1020_0093, // addi x1, x0, 0x102
            0x0000_8067, // jalr x0, 0(x1)
        ],
    );
    load_words(&mut engine, 0x40, &[SELF_LOOP]);
    engine.write_csr(csr::MTVEC, 0x40, !0).unwrap();
    for _ in 0..4 {
        engine.step().unwrap();
    }
    assert!(!engine.rvc_enabled());
    assert_eq!(0, engine.read_csr(csr::MCAUSE).unwrap());
    assert_eq!(0x102, engine.read_csr(csr::MTVAL).unwrap());
    assert_eq!(0x40, engine.registers().pc());
}

/// With `misa.C` still set, the same jump is legal.
#[test]
fn halfword_target_is_legal_with_c_enabled() {
    let mut engine = engine();
    engine.load_image(0x102, &0x4505u16.to_le_bytes()).unwrap();
    load_words(
        &mut engine,
        0,
        &[
            0x1020_0093, // addi x1, x0, 0x102
            0x0000_8067, // jalr x0, 0(x1)
        ],
    );
    for _ in 0..3 {
        engine.step().unwrap();
    }
    assert_eq!(1, engine.registers().x(10));
    assert_eq!(0x104, engine.registers().pc());
}

/// With the C extension disabled from the start, a taken branch whose target
/// has bit 1 set traps with cause 0; the same branch not taken is harmless.
#[test]
fn taken_branch_to_halfword_traps_without_c() {
    let mut engine = Engine::new(Config {
        ram_size: 0x1000,
        compressed: false,
        ..Config::default()
    })
    .unwrap();
    // bne x0, x0, 6 (never taken), then beq x0, x0, 6 (taken, target 0xA).
    load_words(&mut engine, 0, &[0x0000_1363, 0x0000_0363]);
    engine.step().unwrap();
    match engine.step() {
        Err(EngineError::UnhandledTrap {
            cause: Exception::InstructionAddressMisaligned { target },
            pc,
        }) => {
            assert_eq!(0xA, target);
            assert_eq!(4, pc);
        }
        other => panic!("expected misaligned-target trap, got {other:?}"),
    }
}

/// Full-width JAL links past 4 bytes.
#[test]
fn jal_links_pc_plus_4() {
    let mut engine = engine();
    // jal x1, 16 at address 8
    load_words(&mut engine, 0, &[NOP, NOP, 0x0100_00EF]);
    for _ in 0..3 {
        engine.step().unwrap();
    }
    assert_eq!(0xC, engine.registers().x(1));
    assert_eq!(0x18, engine.registers().pc());
}

/// A 16-bit instruction in the last parcel of RAM executes without touching
/// the (nonexistent) upper half.
#[test]
fn compressed_fetch_at_top_of_ram() {
    let mut engine = Engine::new(Config {
        ram_size: 0x1000,
        ..Config::default()
    })
    .unwrap();
    engine
        .load_image(0xFFE, &0x4505u16.to_le_bytes())
        .unwrap();
    engine.registers_mut().set_pc(0xFFE);
    engine.step().unwrap();
    assert_eq!(1, engine.registers().x(10));
    assert_eq!(0x1000, engine.registers().pc());
}

/// A full-width instruction whose upper half would fall off the end of RAM
/// faults on the upper-half fetch.
#[test]
fn full_width_fetch_at_top_of_ram_faults() {
    let mut engine = Engine::new(Config {
        ram_size: 0x1000,
        ..Config::default()
    })
    .unwrap();
    // Low parcel of `addi x5, x0, 7` (bits[1:0] == 0b11).
    engine.load_image(0xFFE, &0x0293u16.to_le_bytes()).unwrap();
    engine.registers_mut().set_pc(0xFFE);
    match engine.step() {
        Err(EngineError::UnhandledTrap {
            cause: Exception::InstructionAccessFault { addr },
            ..
        }) => assert_eq!(0x1000, addr),
        other => panic!("expected access fault, got {other:?}"),
    }
}

/// Minimal Newlib-flavored bridge: `_exit` only.
struct ExitBridge;

impl HostBridge for ExitBridge {
    fn handle(&mut self, engine: &mut Engine, exception: &Exception) -> BridgeDisposition {
        match exception {
            Exception::EnvironmentCall if engine.registers().x(17) == 93 => {
                let code = engine.registers().x(10) as i32;
                engine.terminate(code);
                BridgeDisposition::Handled
            }
            Exception::EnvironmentCall | Exception::Breakpoint => {
                let code = engine.registers().x(10) as i32;
                engine.terminate(code);
                BridgeDisposition::Handled
            }
            _ => BridgeDisposition::Unhandled,
        }
    }
}

/// `ecall` with `mtvec == 0` dispatches to the host bridge.
#[test]
fn ecall_reaches_bridge_when_mtvec_unset() {
    let mut engine = engine();
    engine.install_bridge(Box::new(ExitBridge));
    load_words(
        &mut engine,
        0,
        &[
            0x02A0_0513, // addi a0, x0, 42
            0x05D0_0893, // addi a7, x0, 93
            ECALL,
        ],
    );
    assert!(matches!(engine.run(), Ok(RunOutcome::Exited(42))));
}

/// `a7 >= 0xFFFF_0000` reaches the bridge even with a guest handler
/// installed.
#[test]
fn debug_bridge_overrides_guest_handler() {
    let mut engine = engine();
    engine.install_bridge(Box::new(ExitBridge));
    load_words(&mut engine, 0x100, &[SELF_LOOP]);
    engine.write_csr(csr::MTVEC, 0x100, !0).unwrap();
    load_words(
        &mut engine,
        0,
        &[
            0xFFFF_08B7, // lui a7, 0xFFFF0
            0x0070_0513, // addi a0, x0, 7
            ECALL,
        ],
    );
    assert!(matches!(engine.run(), Ok(RunOutcome::Exited(7))));
}

/// With a guest handler installed and an ordinary a7, `ecall` traps into the
/// guest, not the bridge.
#[test]
fn ordinary_ecall_prefers_guest_handler() {
    let mut engine = engine();
    engine.install_bridge(Box::new(ExitBridge));
    load_words(&mut engine, 0x100, &[SELF_LOOP]);
    engine.write_csr(csr::MTVEC, 0x100, !0).unwrap();
    load_words(&mut engine, 0, &[0x05D0_0893, ECALL]);
    for _ in 0..3 {
        engine.step().unwrap();
    }
    assert_eq!(0x100, engine.registers().pc());
    assert_eq!(11, engine.read_csr(csr::MCAUSE).unwrap());
    assert_eq!(None, engine.exited());
}

/// The cooperative stop flag returns the loop at an instruction boundary.
#[test]
fn stop_flag_cancels_run() {
    let mut engine = engine();
    load_words(&mut engine, 0, &[NOP, SELF_LOOP]);
    engine.stop_handle().store(true, std::sync::atomic::Ordering::Relaxed);
    assert!(matches!(engine.run(), Ok(RunOutcome::Cancelled)));
}
