use thiserror::Error;

/// Base physical address of RAM, matching the memory map the modeled CPU
/// boots from. The `SystemBus` in `bus.rs` places its primary region here
/// unless constructed with an explicit base.
pub const DRAM_BASE: u64 = 0x4000_0000;

/// Backing-store access errors.
///
/// These are mapped into architectural traps (`Trap`) by the system bus;
/// they only escape as-is from host-side paths (loader, snapshots).
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at {0:#x}")]
    OutOfBounds(u64),

    #[error("Invalid or misaligned access at {0:#x}")]
    InvalidAlignment(u64),
}

/// Flat RAM image.
///
/// The simulated bus is big-endian, so the typed accessors assemble and
/// split values with big-endian byte order. Offsets passed to the load/store
/// helpers are offsets from `base`, not full physical addresses; the bus
/// translates between the two.
///
/// The machine is single-owner and single-threaded, so accessors borrow
/// mutably where they mutate; there is no interior mutability here.
pub struct Dram {
    pub base: u64,
    data: Vec<u8>,
}

impl Dram {
    /// Create a new RAM image of `size` bytes, zero-initialised.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Translate a physical address into an offset, if it lands in RAM.
    #[inline(always)]
    pub fn offset(&self, addr: u64) -> Option<usize> {
        let off = addr.wrapping_sub(self.base) as usize;
        if off < self.data.len() { Some(off) } else { None }
    }

    /// Load data into RAM at the given offset.
    pub fn load(&mut self, data: &[u8], offset: u64) -> Result<(), MemoryError> {
        self.write_bytes(offset, data)
    }

    pub fn zero_range(&mut self, offset: usize, len: usize) -> Result<(), MemoryError> {
        let end = offset
            .checked_add(len)
            .ok_or(MemoryError::OutOfBounds(offset as u64))?;
        if end > self.data.len() {
            return Err(MemoryError::OutOfBounds(offset as u64));
        }
        self.data[offset..end].fill(0);
        Ok(())
    }

    #[inline(always)]
    pub fn load_8(&self, offset: u64) -> Result<u8, MemoryError> {
        let off = offset as usize;
        if off >= self.data.len() {
            return Err(MemoryError::OutOfBounds(offset));
        }
        Ok(self.data[off])
    }

    #[inline(always)]
    pub fn load_16(&self, offset: u64) -> Result<u16, MemoryError> {
        if offset % 2 != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        let off = offset as usize;
        if off + 2 > self.data.len() {
            return Err(MemoryError::OutOfBounds(offset));
        }
        let bytes = [self.data[off], self.data[off + 1]];
        Ok(u16::from_be_bytes(bytes))
    }

    #[inline(always)]
    pub fn load_32(&self, offset: u64) -> Result<u32, MemoryError> {
        if offset % 4 != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        let off = offset as usize;
        if off + 4 > self.data.len() {
            return Err(MemoryError::OutOfBounds(offset));
        }
        let bytes: [u8; 4] = self.data[off..off + 4].try_into().unwrap_or([0; 4]);
        Ok(u32::from_be_bytes(bytes))
    }

    #[inline(always)]
    pub fn store_8(&mut self, offset: u64, value: u8) -> Result<(), MemoryError> {
        let off = offset as usize;
        if off >= self.data.len() {
            return Err(MemoryError::OutOfBounds(offset));
        }
        self.data[off] = value;
        Ok(())
    }

    #[inline(always)]
    pub fn store_16(&mut self, offset: u64, value: u16) -> Result<(), MemoryError> {
        if offset % 2 != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        let off = offset as usize;
        if off + 2 > self.data.len() {
            return Err(MemoryError::OutOfBounds(offset));
        }
        self.data[off..off + 2].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    #[inline(always)]
    pub fn store_32(&mut self, offset: u64, value: u32) -> Result<(), MemoryError> {
        if offset % 4 != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        let off = offset as usize;
        if off + 4 > self.data.len() {
            return Err(MemoryError::OutOfBounds(offset));
        }
        self.data[off..off + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Write an arbitrary slice into RAM starting at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        let off = offset as usize;
        let end = off
            .checked_add(data.len())
            .ok_or(MemoryError::OutOfBounds(offset))?;
        if end > self.data.len() {
            return Err(MemoryError::OutOfBounds(offset));
        }
        self.data[off..end].copy_from_slice(data);
        Ok(())
    }

    /// Read a range of bytes from RAM (snapshots, debug inspection).
    pub fn read_range(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let end = offset
            .checked_add(len)
            .ok_or(MemoryError::OutOfBounds(offset as u64))?;
        if end > self.data.len() {
            return Err(MemoryError::OutOfBounds(offset as u64));
        }
        Ok(self.data[offset..end].to_vec())
    }

    /// Get a clone of all RAM contents (for snapshots).
    pub fn get_data(&self) -> Vec<u8> {
        self.data.clone()
    }

    /// Replace all RAM contents (for snapshot restore).
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() != self.data.len() {
            return Err(MemoryError::OutOfBounds(data.len() as u64));
        }
        self.data.copy_from_slice(data);
        Ok(())
    }
}
