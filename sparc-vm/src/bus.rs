use crate::Trap;
use crate::dram::{DRAM_BASE, Dram, MemoryError};

/// Physical address-space interface consumed by the CPU core and the MMU
/// page-table walker.
///
/// All addresses are physical; virtual-address callers go through
/// `Mmu::translate` first. Big-endian byte order throughout. Errors are
/// architectural bus-error traps; the fetch path re-maps them onto the
/// instruction-access side (see `fetch_word`).
///
/// The `*_debug` variants are for external inspection (debugger, snapshot
/// tooling): they must not have side effects and report failure softly
/// instead of trapping.
pub trait Memory {
    fn read_word(&mut self, addr: u64) -> Result<u32, Trap>;
    fn read_half(&mut self, addr: u64) -> Result<u16, Trap>;
    fn read_byte(&mut self, addr: u64) -> Result<u8, Trap>;

    fn write_word(&mut self, addr: u64, val: u32) -> Result<(), Trap>;
    fn write_half(&mut self, addr: u64, val: u16) -> Result<(), Trap>;
    fn write_byte(&mut self, addr: u64, val: u8) -> Result<(), Trap>;

    fn read_word_debug(&self, addr: u64) -> Option<u32>;
    fn write_word_debug(&mut self, addr: u64, val: u32) -> bool;

    /// Instruction fetch: word-sized read with data-side bus errors re-mapped
    /// onto the instruction-access cause.
    fn fetch_word(&mut self, addr: u64) -> Result<u32, Trap> {
        self.read_word(addr).map_err(|e| match e {
            Trap::DataAccessError(a) => Trap::InstructionAccessError(a),
            Trap::DataAccessException(a) => Trap::InstructionAccessException(a),
            other => other,
        })
    }
}

/// System bus with a single RAM region.
///
/// Bus-level faults (accesses outside RAM) surface as `DataAccessError`,
/// the memory-exception cause distinct from the MMU's translation faults.
pub struct SystemBus {
    pub dram: Dram,
}

impl SystemBus {
    pub fn new(dram_base: u64, dram_size: usize) -> Self {
        Self {
            dram: Dram::new(dram_base, dram_size),
        }
    }

    /// Bus with RAM at the default base.
    pub fn with_size(dram_size: usize) -> Self {
        Self::new(DRAM_BASE, dram_size)
    }

    pub fn dram_base(&self) -> u64 {
        self.dram.base
    }

    pub fn dram_size(&self) -> usize {
        self.dram.size()
    }

    fn offset(&self, addr: u64) -> Result<u64, Trap> {
        match self.dram.offset(addr) {
            Some(off) => Ok(off as u64),
            None => Err(Trap::DataAccessError(addr as u32)),
        }
    }

    fn map_err(addr: u64, e: MemoryError) -> Trap {
        match e {
            MemoryError::OutOfBounds(_) | MemoryError::InvalidAlignment(_) => {
                Trap::DataAccessError(addr as u32)
            }
        }
    }
}

impl Memory for SystemBus {
    fn read_word(&mut self, addr: u64) -> Result<u32, Trap> {
        let off = self.offset(addr)?;
        self.dram.load_32(off).map_err(|e| Self::map_err(addr, e))
    }

    fn read_half(&mut self, addr: u64) -> Result<u16, Trap> {
        let off = self.offset(addr)?;
        self.dram.load_16(off).map_err(|e| Self::map_err(addr, e))
    }

    fn read_byte(&mut self, addr: u64) -> Result<u8, Trap> {
        let off = self.offset(addr)?;
        self.dram.load_8(off).map_err(|e| Self::map_err(addr, e))
    }

    fn write_word(&mut self, addr: u64, val: u32) -> Result<(), Trap> {
        let off = self.offset(addr)?;
        self.dram
            .store_32(off, val)
            .map_err(|e| Self::map_err(addr, e))
    }

    fn write_half(&mut self, addr: u64, val: u16) -> Result<(), Trap> {
        let off = self.offset(addr)?;
        self.dram
            .store_16(off, val)
            .map_err(|e| Self::map_err(addr, e))
    }

    fn write_byte(&mut self, addr: u64, val: u8) -> Result<(), Trap> {
        let off = self.offset(addr)?;
        self.dram
            .store_8(off, val)
            .map_err(|e| Self::map_err(addr, e))
    }

    fn read_word_debug(&self, addr: u64) -> Option<u32> {
        let off = self.dram.offset(addr)? as u64;
        self.dram.load_32(off).ok()
    }

    fn write_word_debug(&mut self, addr: u64, val: u32) -> bool {
        match self.dram.offset(addr) {
            Some(off) => self.dram.store_32(off as u64, val).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes_round_trip() {
        let mut bus = SystemBus::with_size(4096);
        let base = bus.dram_base();
        bus.write_word(base + 8, 0xCAFE_F00D).unwrap();
        assert_eq!(bus.read_word(base + 8).unwrap(), 0xCAFE_F00D);
        assert_eq!(bus.read_half(base + 8).unwrap(), 0xCAFE);
        assert_eq!(bus.read_byte(base + 11).unwrap(), 0x0D);
    }

    #[test]
    fn out_of_range_access_is_a_bus_error() {
        let mut bus = SystemBus::with_size(4096);
        let past_end = bus.dram_base() + 4096;
        assert_eq!(
            bus.read_word(past_end),
            Err(Trap::DataAccessError(past_end as u32))
        );
        assert_eq!(
            bus.write_word(0x0, 1),
            Err(Trap::DataAccessError(0))
        );
    }

    #[test]
    fn fetch_remaps_bus_errors_to_instruction_side() {
        let mut bus = SystemBus::with_size(4096);
        assert_eq!(
            bus.fetch_word(0x100),
            Err(Trap::InstructionAccessError(0x100))
        );
    }

    #[test]
    fn debug_access_fails_softly() {
        let mut bus = SystemBus::with_size(4096);
        let base = bus.dram_base();
        assert!(bus.write_word_debug(base, 42));
        assert_eq!(bus.read_word_debug(base), Some(42));
        assert_eq!(bus.read_word_debug(0x10), None);
        assert!(!bus.write_word_debug(0x10, 1));
    }
}
