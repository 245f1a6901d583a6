//! Byte-based RAM implementation with support for misaligned memory access.

use thiserror::Error;

/// Number of padding bytes kept past the last valid address.
///
/// A word access at the final valid byte may read up to three bytes past the
/// end of the addressable range before the bounds check rejects it; the tail
/// keeps such reads inside the allocation.
const TAIL_PAD: usize = 8;

/// Error returned for accesses outside the addressable range.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("access out of bounds: {addr:#010x} (+{size})")]
pub struct OutOfBounds {
    /// First address of the rejected access.
    pub addr: u32,
    /// Size of the rejected access in bytes.
    pub size: u32,
}

/// Flat byte-addressable store covering addresses `[base, base + size)`.
///
/// This can be categorized as *main memory* according to the types of memory
/// resources defined by the RISC-V spec. The base address is zero for flat
/// binaries; ELF test suites link at `0x8000_0000` and get a RAM based
/// there. All multi-byte accesses are little-endian and may be misaligned;
/// misalignment never traps here (the deviation from strict RV32 is
/// deliberate, single-hart software cannot observe the difference).
#[derive(Debug, Clone)]
pub struct Ram {
    data: Vec<u8>,
    size: u32,
    base: u32,
}

impl Ram {
    /// Create a new zero-initialized RAM that can hold `size` bytes, based
    /// at address zero.
    ///
    /// `size` must be at least one and at most `1 << 32`.
    pub fn new(size: usize) -> Option<Self> {
        Self::with_base(size, 0)
    }

    /// Create a new zero-initialized RAM covering `[base, base + size)`.
    pub fn with_base(size: usize, base: u32) -> Option<Self> {
        if size == 0 || size > (1 << 32) {
            return None;
        }
        Some(Self {
            data: vec![0; size + TAIL_PAD],
            size: size as u32,
            base,
        })
    }

    /// Returns the size expressed in bytes. Guaranteed to be at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// Returns the lowest valid address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Maps an absolute address to a buffer index, bounds-checked for an
    /// access of `size` bytes.
    ///
    /// Addresses below `base` wrap to a huge offset and fail the bounds
    /// check; the tail pad guarantees that any index this returns supports a
    /// `size`-byte slice.
    fn index(&self, addr: u32, size: u32) -> Result<usize, OutOfBounds> {
        let offset = addr.wrapping_sub(self.base);
        if (offset as u64) + (size as u64) <= self.size as u64 {
            Ok(offset as usize)
        } else {
            Err(OutOfBounds { addr, size })
        }
    }

    pub fn load_u8(&self, addr: u32) -> Result<u8, OutOfBounds> {
        let i = self.index(addr, 1)?;
        Ok(self.data[i])
    }

    pub fn load_i8(&self, addr: u32) -> Result<i8, OutOfBounds> {
        Ok(self.load_u8(addr)? as i8)
    }

    pub fn load_u16(&self, addr: u32) -> Result<u16, OutOfBounds> {
        let i = self.index(addr, 2)?;
        Ok(u16::from_le_bytes([self.data[i], self.data[i + 1]]))
    }

    pub fn load_i16(&self, addr: u32) -> Result<i16, OutOfBounds> {
        Ok(self.load_u16(addr)? as i16)
    }

    pub fn load_u32(&self, addr: u32) -> Result<u32, OutOfBounds> {
        let i = self.index(addr, 4)?;
        Ok(u32::from_le_bytes([
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]))
    }

    pub fn store_u8(&mut self, addr: u32, value: u8) -> Result<(), OutOfBounds> {
        let i = self.index(addr, 1)?;
        self.data[i] = value;
        Ok(())
    }

    pub fn store_u16(&mut self, addr: u32, value: u16) -> Result<(), OutOfBounds> {
        let i = self.index(addr, 2)?;
        self.data[i..i + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn store_u32(&mut self, addr: u32, value: u32) -> Result<(), OutOfBounds> {
        let i = self.index(addr, 4)?;
        self.data[i..i + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Bulk store used for initial image loading and DMA-style transfers.
    pub fn store_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), OutOfBounds> {
        let i = self.index(addr, bytes.len() as u32)?;
        self.data[i..i + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Bulk read counterpart of [`Ram::store_bytes`].
    pub fn load_bytes(&self, addr: u32, len: usize) -> Result<&[u8], OutOfBounds> {
        let i = self.index(addr, len as u32)?;
        Ok(&self.data[i..i + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_round_trip() {
        let mut ram = Ram::new(64).unwrap();
        ram.store_u32(0x10, 0xDEADBEEF).unwrap();
        assert_eq!(0xEF, ram.load_u8(0x10).unwrap());
        assert_eq!(0xBEEF, ram.load_u16(0x10).unwrap());
        assert_eq!(0xDEAD, ram.load_u16(0x12).unwrap());
        assert_eq!(0xDEADBEEF, ram.load_u32(0x10).unwrap());
    }

    #[test]
    fn test_misaligned_access() {
        let mut ram = Ram::new(64).unwrap();
        ram.store_u32(0x11, 0x01020304).unwrap();
        assert_eq!(0x01020304, ram.load_u32(0x11).unwrap());
        assert_eq!(0x0304, ram.load_u16(0x11).unwrap());
    }

    #[test]
    fn test_out_of_bounds() {
        let mut ram = Ram::new(64).unwrap();
        assert_eq!(
            Err(OutOfBounds { addr: 64, size: 1 }),
            ram.load_u8(64).map(|_| ())
        );
        // The final word access must fail even though the tail pad would
        // physically absorb it.
        assert!(ram.load_u32(61).is_err());
        assert!(ram.load_u32(60).is_ok());
        assert!(ram.store_u32(61, 0).is_err());
        assert!(ram.store_bytes(60, &[0; 5]).is_err());
    }

    #[test]
    fn test_signed_loads() {
        let mut ram = Ram::new(64).unwrap();
        ram.store_u8(0, 0x80).unwrap();
        ram.store_u16(2, 0x8000).unwrap();
        assert_eq!(-128, ram.load_i8(0).unwrap());
        assert_eq!(-32768, ram.load_i16(2).unwrap());
    }

    #[test]
    fn test_store_bytes() {
        let mut ram = Ram::new(16).unwrap();
        ram.store_bytes(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(0x04030201, ram.load_u32(4).unwrap());
        assert_eq!(&[1, 2, 3, 4], ram.load_bytes(4, 4).unwrap());
    }

    #[test]
    fn test_based_ram() {
        let mut ram = Ram::with_base(0x1000, 0x8000_0000).unwrap();
        ram.store_u32(0x8000_0010, 0xCAFEBABE).unwrap();
        assert_eq!(0xCAFEBABE, ram.load_u32(0x8000_0010).unwrap());
        // Below base and past the end both fail, reporting the absolute
        // address.
        assert_eq!(
            Err(OutOfBounds {
                addr: 0x7FFF_FFFC,
                size: 4
            }),
            ram.load_u32(0x7FFF_FFFC).map(|_| ())
        );
        assert!(ram.load_u8(0x8000_1000).is_err());
        assert!(ram.load_u8(0).is_err());
    }
}
