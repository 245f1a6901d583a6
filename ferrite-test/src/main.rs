//! Compliance harness for the riscv-tests suites (rv32ui, rv32mi, rv32um,
//! rv32ua, rv32uc).
//!
//! Protocol: the test ELF exports a `tohost` word. The harness clears it,
//! runs the guest until the word turns non-zero, and interprets the value:
//! `1` is a pass, anything else fails at sub-case `value >> 1`.

use clap::Parser;
use ferrite_core::engine::{csr, Config};
use ferrite_core::Engine;
use goblin::elf::program_header::PT_LOAD;
use log::debug;
use std::fs::File;
use std::io::Read;
use std::process::ExitCode;

/// Written to `tohost` before the run; any other value ends it.
const SENTINEL: u32 = 0;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Test ELF to run.
    elf: String,
    /// Give up after this many executed instructions.
    #[arg(long, default_value_t = 100_000_000)]
    max_steps: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut image = Vec::new();
    File::open(&args.elf)
        .and_then(|mut f| f.read_to_end(&mut image))
        .expect("failed to read test ELF");

    let elf = goblin::elf::Elf::parse(&image).expect("failed to parse test ELF");

    let mut engine = Engine::new(Config {
        ram_size: 8 << 20,
        // riscv-tests link against a memory map based at 0x80000000.
        ram_base: 0x8000_0000,
        ..Config::default()
    })
    .expect("RAM configuration is valid");

    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        debug!(
            "loading segment [{:#010x}..{:#010x}]",
            header.p_paddr,
            header.p_paddr + header.p_filesz
        );
        engine
            .load_image(header.p_paddr as u32, &image[header.file_range()])
            .expect("segment does not fit in RAM");
    }
    engine.registers_mut().set_pc(elf.entry as u32);

    let tohost = elf
        .syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some("tohost"))
        .map(|sym| sym.st_value as u32)
        .expect("missing symbol `tohost`");
    engine
        .store_u32(tohost, SENTINEL)
        .expect("tohost is not backed by RAM");

    for _ in 0..args.max_steps {
        if let Err(err) = engine.step() {
            let mcause = engine.read_csr(csr::MCAUSE).unwrap_or(0);
            let mepc = engine.read_csr(csr::MEPC).unwrap_or(0);
            eprintln!("FAIL: {err} (mcause={mcause:#010x}, mepc={mepc:#010x})");
            return ExitCode::FAILURE;
        }
        let value = engine
            .load_u32(tohost)
            .expect("tohost is not backed by RAM");
        if value != SENTINEL {
            return if value == 1 {
                println!("PASS");
                ExitCode::SUCCESS
            } else {
                println!("FAIL: test {}", value >> 1);
                ExitCode::FAILURE
            };
        }
    }

    eprintln!(
        "FAIL: no tohost write after {} steps (pc={:#010x})",
        args.max_steps,
        engine.registers().pc()
    );
    ExitCode::FAILURE
}
