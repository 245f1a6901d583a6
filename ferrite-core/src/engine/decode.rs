//! Content-addressed decode caching.
//!
//! Two maps, keyed by the raw instruction bits: one over the 32-bit word
//! space for full-width instructions, one over the 16-bit parcel space for
//! compressed instructions. The key spaces overlap numerically (`0x4505` is
//! both a valid parcel and the low half of many words), so the maps must
//! never be merged. Entries are immutable once inserted and never evicted;
//! instruction bits at a given address are assumed not to change.

use super::rvc::{self, IllegalParcel};
use crate::instruction;
use nohash::IntMap;

/// An instruction split into its fixed fields, plus the expanded 32-bit form
/// it was split from.
///
/// The raw word is kept alongside the fields because several handlers need
/// immediate bits (U/J/B/S-type immediates, AMO ordering bits, CSR
/// specifiers) that are not worth caching individually.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Decoded {
    pub opcode: u8,
    pub rd: u8,
    pub funct3: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub funct7: u8,
    /// The (expanded) 32-bit instruction word.
    pub inst: u32,
    /// Size in bytes of the fetched form: 2 for compressed, 4 for full-width.
    pub size: u32,
}

impl Decoded {
    fn from_word(inst: u32, size: u32) -> Self {
        Self {
            opcode: instruction::opcode(inst),
            rd: instruction::rd(inst),
            funct3: instruction::funct3(inst),
            rs1: instruction::rs1(inst),
            rs2: instruction::rs2(inst),
            funct7: instruction::funct7(inst),
            inst,
            size,
        }
    }
}

#[derive(Debug, Default)]
pub struct DecodeCache {
    full: IntMap<u32, Decoded>,
    compressed: IntMap<u16, Decoded>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up (or decodes and inserts) a full-width instruction word.
    pub fn full(&mut self, inst: u32) -> Decoded {
        *self
            .full
            .entry(inst)
            .or_insert_with(|| Decoded::from_word(inst, 4))
    }

    /// Looks up (or expands, decodes, and inserts) a compressed parcel.
    ///
    /// Illegal parcels are not cached; they trap and the cost of re-expanding
    /// on a (pathological) re-execution is irrelevant.
    pub fn compressed(&mut self, parcel: u16) -> Result<Decoded, IllegalParcel> {
        if let Some(decoded) = self.compressed.get(&parcel) {
            return Ok(*decoded);
        }
        let expanded = rvc::expand(parcel)?;
        let decoded = Decoded::from_word(expanded, 2);
        self.compressed.insert(parcel, decoded);
        Ok(decoded)
    }
}
