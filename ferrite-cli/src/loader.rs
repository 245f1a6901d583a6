//! Image loading: flat binaries and ELF executables.

use ferrite_core::Engine;
use goblin::elf::program_header::PT_LOAD;
use log::{debug, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("malformed ELF: {0}")]
    Elf(#[from] goblin::error::Error),
    #[error("segment does not fit in RAM: {0}")]
    OutOfRam(#[from] ferrite_core::resources::ram::OutOfBounds),
}

/// Addresses extracted from the image, where available.
#[derive(Debug, Default, Clone)]
pub struct Layout {
    pub entry: u32,
    /// `__heap_start` (start of the sbrk arena).
    pub heap_start: Option<u32>,
    /// `__stack_top`.
    pub stack_top: Option<u32>,
    /// `__stack_bottom` (the sbrk arena must stay below this).
    pub stack_bottom: Option<u32>,
    /// `tohost` (compliance-test completion word).
    pub tohost: Option<u32>,
}

/// Loads a flat binary at address zero with entry zero.
pub fn load_flat(engine: &mut Engine, image: &[u8]) -> Result<Layout, LoadError> {
    engine.load_image(0, image)?;
    Ok(Layout::default())
}

/// Loads every PT_LOAD segment of an ELF executable at its physical address
/// and picks up the entry point and the linker-script symbols the syscall
/// layer cares about. No relocation is performed.
pub fn load_elf(engine: &mut Engine, image: &[u8]) -> Result<Layout, LoadError> {
    let elf = goblin::elf::Elf::parse(image)?;

    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        debug!(
            "loading segment: file range [{:#010x}..{:#010x}] to pmem [{:#010x}..{:#010x}]",
            header.p_offset,
            header.p_offset + header.p_filesz,
            header.p_paddr,
            header.p_paddr + header.p_memsz,
        );
        engine.load_image(header.p_paddr as u32, &image[header.file_range()])?;
    }

    let mut layout = Layout {
        entry: elf.entry as u32,
        ..Layout::default()
    };
    for sym in elf.syms.iter() {
        let Some(name) = elf.strtab.get_at(sym.st_name) else {
            continue;
        };
        let value = sym.st_value as u32;
        match name {
            "__heap_start" => layout.heap_start = Some(value),
            "__stack_top" => layout.stack_top = Some(value),
            "__stack_bottom" => layout.stack_bottom = Some(value),
            "tohost" => layout.tohost = Some(value),
            _ => {}
        }
    }
    if layout.heap_start.is_none() {
        warn!("no __heap_start symbol; _sbrk will be refused");
    }

    Ok(layout)
}
