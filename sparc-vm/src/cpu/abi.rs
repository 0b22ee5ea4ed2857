//! Debugger and calling-convention surface over the register file.
//!
//! Register ids follow the GDB target numbering for this architecture:
//! 0..=31 are the integer registers of the current window, 64..=69 the
//! control registers. Ids in the floating-point range and anything past
//! NPC read as zero and ignore writes, which lets a debugger stub walk
//! the whole id space without special cases.

use crate::cpu::regs::RegisterFile;

pub const GDB_REG_Y: usize = 64;
pub const GDB_REG_PSR: usize = 65;
pub const GDB_REG_WIM: usize = 66;
pub const GDB_REG_TBR: usize = 67;
pub const GDB_REG_PC: usize = 68;
pub const GDB_REG_NPC: usize = 69;
/// One past the last valid debugger register id.
pub const GDB_NUM_REGS: usize = 70;

/// Outgoing arguments live in %i0..%i5 of the callee's window.
pub const MAX_ABI_ARGS: usize = 6;

const ABI_ARG_BASE: usize = 24;

impl RegisterFile {
    /// Read a register by debugger id.
    pub fn debug_reg(&self, id: usize) -> u32 {
        match id {
            0..=31 => self.read(id),
            GDB_REG_Y => self.y(),
            GDB_REG_PSR => self.psr(),
            GDB_REG_WIM => self.wim(),
            GDB_REG_TBR => self.tbr(),
            GDB_REG_PC => self.pc,
            GDB_REG_NPC => self.npc,
            _ => 0,
        }
    }

    /// Write a register by debugger id. Control registers go through the
    /// same masked setters the instruction set uses; unknown ids are
    /// silently dropped.
    pub fn set_debug_reg(&mut self, id: usize, value: u32) {
        match id {
            0..=31 => self.write(id, value),
            GDB_REG_Y => self.set_y(value),
            GDB_REG_PSR => self.set_psr(value),
            GDB_REG_WIM => self.set_wim(value),
            GDB_REG_TBR => {
                self.set_tbr_base(value);
                self.set_tbr_tt(((value >> 4) & 0xFF) as u8);
            }
            GDB_REG_PC => self.pc = value,
            GDB_REG_NPC => self.npc = value,
            _ => {}
        }
    }

    /// Function result as seen by the caller after the callee's RESTORE,
    /// i.e. %i0 of the current window.
    pub fn return_value(&self) -> u32 {
        self.read(ABI_ARG_BASE)
    }

    pub fn set_return_value(&mut self, value: u32) {
        self.write(ABI_ARG_BASE, value);
    }

    /// Incoming register arguments %i0..%i5 of the current window.
    pub fn abi_args(&self) -> [u32; MAX_ABI_ARGS] {
        std::array::from_fn(|i| self.read(ABI_ARG_BASE + i))
    }

    /// Write up to six register arguments; extra values are ignored.
    pub fn set_abi_args(&mut self, args: &[u32]) {
        for (i, value) in args.iter().take(MAX_ABI_ARGS).enumerate() {
            self.write(ABI_ARG_BASE + i, *value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs() -> RegisterFile {
        RegisterFile::new(0x4000)
    }

    #[test]
    fn integer_ids_alias_the_current_window() {
        let mut r = regs();
        r.write(9, 0xDEAD_BEEF);
        assert_eq!(r.debug_reg(9), 0xDEAD_BEEF);
        r.set_debug_reg(17, 0x1234);
        assert_eq!(r.read(17), 0x1234);
        // %g0 stays hardwired to zero through the debug path too.
        r.set_debug_reg(0, 0xFFFF_FFFF);
        assert_eq!(r.debug_reg(0), 0);
    }

    #[test]
    fn control_register_ids_map_through_the_masked_setters() {
        let mut r = regs();
        r.set_debug_reg(GDB_REG_Y, 0xABCD_0123);
        assert_eq!(r.y(), 0xABCD_0123);
        r.set_debug_reg(GDB_REG_WIM, 0xFFFF_FF01);
        assert_eq!(r.debug_reg(GDB_REG_WIM), 0x01); // unimplemented windows drop
        r.set_debug_reg(GDB_REG_TBR, 0x0012_3450);
        assert_eq!(r.debug_reg(GDB_REG_TBR), 0x0012_3450);
        r.set_debug_reg(GDB_REG_PC, 0x8000);
        r.set_debug_reg(GDB_REG_NPC, 0x8004);
        assert_eq!((r.pc, r.npc), (0x8000, 0x8004));
    }

    #[test]
    fn out_of_range_ids_read_zero_and_ignore_writes() {
        let mut r = regs();
        assert_eq!(r.debug_reg(40), 0); // fp range, no FPU
        assert_eq!(r.debug_reg(GDB_NUM_REGS), 0);
        r.set_debug_reg(40, 0x55);
        r.set_debug_reg(200, 0x55);
        assert_eq!(r.debug_reg(40), 0);
    }

    #[test]
    fn argument_and_return_conventions_use_the_in_registers() {
        let mut r = regs();
        r.set_abi_args(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(r.abi_args(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(r.read(24), 1);
        assert_eq!(r.read(29), 6);
        // Nothing spilled past %i5.
        assert_eq!(r.read(30), 0);

        r.set_return_value(0x77);
        assert_eq!(r.return_value(), 0x77);
        assert_eq!(r.abi_args()[0], 0x77);
    }
}
