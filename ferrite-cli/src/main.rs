mod loader;
mod syscall;

use clap::Parser;
use ferrite_core::bus::AddressRange;
use ferrite_core::engine::{Config, EngineError, RunOutcome};
use ferrite_core::resources::uart;
use ferrite_core::resources::Uart;
use ferrite_core::Engine;
use log::{error, info};
use std::fs::File;
use std::io::Read;
use std::process::ExitCode;
use syscall::NewlibBridge;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Binary file to execute (ELF unless --bin is given).
    binary: String,
    /// Treat the image as a flat binary loaded at address 0.
    #[arg(long)]
    bin: bool,
    /// RAM size in bytes.
    #[arg(long, default_value_t = 4 << 20)]
    ram_size: usize,
    /// Lowest RAM address (images must be linked for it).
    #[arg(long, default_value_t = 0)]
    ram_base: u32,
    /// Start with the C extension disabled (misa.C stays writable).
    #[arg(long)]
    no_rvc: bool,
    /// Map the two-register UART at its conventional base address.
    #[arg(long)]
    uart: bool,
    /// Log every serviced syscall.
    #[arg(long)]
    trace_syscalls: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Load(#[from] loader::LoadError),
    #[error(transparent)]
    Config(#[from] ferrite_core::engine::InvalidRamSizeError),
    #[error("failed to map UART window: {0}")]
    Uart(#[from] ferrite_core::bus::OverlappingWindowError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(&args) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<i32, CliError> {
    let mut image = Vec::new();
    File::open(&args.binary)?.read_to_end(&mut image)?;

    let mut engine = Engine::new(Config {
        ram_size: args.ram_size,
        ram_base: args.ram_base,
        compressed: !args.no_rvc,
        ..Config::default()
    })?;

    let layout = if args.bin {
        loader::load_flat(&mut engine, &image)?
    } else {
        loader::load_elf(&mut engine, &image)?
    };
    engine.registers_mut().set_pc(layout.entry);
    info!("loaded {} ({} bytes), entry {:#010x}", args.binary, image.len(), layout.entry);

    if args.uart {
        let range = AddressRange::new(uart::BASE_ADDRESS, uart::BASE_ADDRESS + 7)
            .expect("constant range is valid");
        engine
            .bus_mut()
            .map(range, Box::new(Uart::new(Box::new(std::io::stdout()))))?;
    }

    engine.install_bridge(Box::new(NewlibBridge::new(&layout, args.trace_syscalls)));

    let stop = engine.stop_handle();
    if let Err(err) = ctrlc::set_handler(move || {
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
    }) {
        // Not fatal; the guest just cannot be interrupted cleanly.
        error!("failed to install Ctrl-C handler: {err}");
    }

    match engine.run() {
        Ok(RunOutcome::Exited(code)) => {
            info!("guest exited with code {code}");
            Ok(code)
        }
        Ok(RunOutcome::Cancelled) => {
            info!("cancelled");
            Ok(130)
        }
        Err(err) => {
            // Dump the architectural state before surfacing the error; this
            // is the last chance to see where the guest was.
            eprintln!("{}", engine.registers());
            Err(err.into())
        }
    }
}
