use crate::bus::Memory;
use crate::cpu::decode::{Decoded, OpcodeId};
use crate::cpu::regs::{NUM_WINDOWS, RegisterFile, WindowFault, WindowOp};
use crate::cpu::types::{AccessType, Trap};
use crate::mmu::{Mmu, Translation};

/// Result of one engine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Executed { cycles: u32 },
    /// The instruction was squashed before taking effect and consumed no
    /// cycles; used when a latched interrupt turns out to be stale.
    Annulled,
    /// A pending trap entry replaced the fetch; the handler's first
    /// instruction runs on the next step.
    TrapDispatched,
}

// Alternate address spaces reachable through LDA/STA and friends.
const ASI_FLUSH: u8 = 0x18;
const ASI_MMU_REGS: u8 = 0x19;
const ASI_BYPASS: u8 = 0x1C;

fn window_trap(fault: WindowFault) -> Trap {
    match fault {
        WindowFault::Overflow => Trap::WindowOverflow,
        WindowFault::Underflow => Trap::WindowUnderflow,
    }
}

// ---- Condition codes ----

fn add_overflow(a: u32, b: u32, r: u32) -> bool {
    ((a & b & !r) | (!a & !b & r)) >> 31 != 0
}

fn add_carry(a: u32, b: u32, r: u32) -> bool {
    ((a & b) | ((a | b) & !r)) >> 31 != 0
}

fn sub_overflow(a: u32, b: u32, r: u32) -> bool {
    ((a & !b & !r) | (!a & b & r)) >> 31 != 0
}

fn sub_borrow(a: u32, b: u32, r: u32) -> bool {
    ((!a & b) | ((!a | b) & r)) >> 31 != 0
}

fn set_icc_logic(regs: &mut RegisterFile, r: u32) {
    regs.set_icc(r >> 31 != 0, r == 0, false, false);
}

fn set_icc_add(regs: &mut RegisterFile, a: u32, b: u32, r: u32) {
    regs.set_icc(
        r >> 31 != 0,
        r == 0,
        add_overflow(a, b, r),
        add_carry(a, b, r),
    );
}

fn set_icc_sub(regs: &mut RegisterFile, a: u32, b: u32, r: u32) {
    regs.set_icc(
        r >> 31 != 0,
        r == 0,
        sub_overflow(a, b, r),
        sub_borrow(a, b, r),
    );
}

/// Evaluate a branch/trap condition field against the current icc.
fn condition_holds(regs: &RegisterFile, cond: u8) -> bool {
    let n = regs.flag_n();
    let z = regs.flag_z();
    let v = regs.flag_v();
    let c = regs.flag_c();
    match cond & 0xF {
        0x0 => false,            // never
        0x1 => z,                // equal
        0x2 => z || (n != v),    // less or equal
        0x3 => n != v,           // less
        0x4 => c || z,           // less or equal unsigned
        0x5 => c,                // carry set
        0x6 => n,                // negative
        0x7 => v,                // overflow set
        0x8 => true,             // always
        0x9 => !z,               // not equal
        0xA => !(z || (n != v)), // greater
        0xB => n == v,           // greater or equal
        0xC => !(c || z),        // greater unsigned
        0xD => !c,               // carry clear
        0xE => !n,               // positive
        _ => !v,                 // overflow clear
    }
}

// ---- Data path ----

/// One memory access stream: translation flags fixed up front so ordinary
/// and alternate-space accesses share the sized load/store helpers.
struct DataPath<'a, M: Memory> {
    mmu: &'a mut Mmu,
    bus: &'a mut M,
    supervisor: bool,
    instruction: bool,
    bypass: bool,
}

impl<'a, M: Memory> DataPath<'a, M> {
    fn normal(mmu: &'a mut Mmu, bus: &'a mut M, supervisor: bool) -> Self {
        Self {
            mmu,
            bus,
            supervisor,
            instruction: false,
            bypass: false,
        }
    }

    fn access_type(&self, write: bool) -> AccessType {
        if write {
            AccessType::Store
        } else if self.instruction {
            AccessType::Execute
        } else {
            AccessType::Load
        }
    }

    /// Resolve a virtual address; `None` means the access was suppressed in
    /// no-fault mode (loads read zero, stores are dropped).
    fn phys(&mut self, vaddr: u32, write: bool) -> Result<Option<u64>, Trap> {
        if self.bypass {
            return Ok(Some(vaddr as u64));
        }
        let at = self.access_type(write);
        match self.mmu.translate(self.bus, vaddr, at, self.supervisor)? {
            Translation::Phys(pa) => Ok(Some(pa)),
            Translation::Suppressed => Ok(None),
        }
    }

    fn load_word(&mut self, vaddr: u32) -> Result<u32, Trap> {
        match self.phys(vaddr, false)? {
            Some(pa) => self.bus.read_word(pa),
            None => Ok(0),
        }
    }

    fn load_half(&mut self, vaddr: u32) -> Result<u16, Trap> {
        match self.phys(vaddr, false)? {
            Some(pa) => self.bus.read_half(pa),
            None => Ok(0),
        }
    }

    fn load_byte(&mut self, vaddr: u32) -> Result<u8, Trap> {
        match self.phys(vaddr, false)? {
            Some(pa) => self.bus.read_byte(pa),
            None => Ok(0),
        }
    }

    fn store_word(&mut self, vaddr: u32, value: u32) -> Result<(), Trap> {
        match self.phys(vaddr, true)? {
            Some(pa) => self.bus.write_word(pa, value),
            None => Ok(()),
        }
    }

    fn store_half(&mut self, vaddr: u32, value: u16) -> Result<(), Trap> {
        match self.phys(vaddr, true)? {
            Some(pa) => self.bus.write_half(pa, value),
            None => Ok(()),
        }
    }

    fn store_byte(&mut self, vaddr: u32, value: u8) -> Result<(), Trap> {
        match self.phys(vaddr, true)? {
            Some(pa) => self.bus.write_byte(pa, value),
            None => Ok(()),
        }
    }
}

/// Reduce an alternate-space memory opcode to its ordinary counterpart.
fn base_mem_op(op: OpcodeId) -> OpcodeId {
    use OpcodeId::*;
    match op {
        Lda => Ld,
        Lduba => Ldub,
        Lduha => Lduh,
        Ldda => Ldd,
        Ldsba => Ldsb,
        Ldsha => Ldsh,
        Sta => St,
        Stba => Stb,
        Stha => Sth,
        Stda => Std,
        Ldstuba => Ldstub,
        Swapa => Swap,
        other => other,
    }
}

/// Perform one sized memory operation at `ea` through `path`.
/// Returns the cycle count.
fn memory_op<M: Memory>(
    regs: &mut RegisterFile,
    path: &mut DataPath<'_, M>,
    op: OpcodeId,
    rd: usize,
    ea: u32,
    word: u32,
) -> Result<u32, Trap> {
    use OpcodeId::*;
    match op {
        Ld => {
            if ea & 3 != 0 {
                return Err(Trap::MemAddressNotAligned(ea));
            }
            let value = path.load_word(ea)?;
            regs.write(rd, value);
            Ok(1)
        }
        Ldub => {
            let value = path.load_byte(ea)?;
            regs.write(rd, value as u32);
            Ok(1)
        }
        Ldsb => {
            let value = path.load_byte(ea)?;
            regs.write(rd, value as i8 as i32 as u32);
            Ok(1)
        }
        Lduh => {
            if ea & 1 != 0 {
                return Err(Trap::MemAddressNotAligned(ea));
            }
            let value = path.load_half(ea)?;
            regs.write(rd, value as u32);
            Ok(1)
        }
        Ldsh => {
            if ea & 1 != 0 {
                return Err(Trap::MemAddressNotAligned(ea));
            }
            let value = path.load_half(ea)?;
            regs.write(rd, value as i16 as i32 as u32);
            Ok(1)
        }
        Ldd => {
            if rd & 1 != 0 {
                return Err(Trap::IllegalInstruction(word));
            }
            if ea & 7 != 0 {
                return Err(Trap::MemAddressNotAligned(ea));
            }
            // Doubleword alignment keeps both halves on one page, so a
            // single translation covers the pair.
            match path.phys(ea, false)? {
                Some(pa) => {
                    let even = path.bus.read_word(pa)?;
                    let odd = path.bus.read_word(pa + 4)?;
                    regs.write(rd, even);
                    regs.write(rd | 1, odd);
                }
                None => {
                    regs.write(rd, 0);
                    regs.write(rd | 1, 0);
                }
            }
            Ok(2)
        }
        St => {
            if ea & 3 != 0 {
                return Err(Trap::MemAddressNotAligned(ea));
            }
            path.store_word(ea, regs.read(rd))?;
            Ok(1)
        }
        Stb => {
            path.store_byte(ea, regs.read(rd) as u8)?;
            Ok(1)
        }
        Sth => {
            if ea & 1 != 0 {
                return Err(Trap::MemAddressNotAligned(ea));
            }
            path.store_half(ea, regs.read(rd) as u16)?;
            Ok(1)
        }
        Std => {
            if rd & 1 != 0 {
                return Err(Trap::IllegalInstruction(word));
            }
            if ea & 7 != 0 {
                return Err(Trap::MemAddressNotAligned(ea));
            }
            match path.phys(ea, true)? {
                Some(pa) => {
                    path.bus.write_word(pa, regs.read(rd))?;
                    path.bus.write_word(pa + 4, regs.read(rd | 1))?;
                }
                None => {}
            }
            Ok(2)
        }
        Ldstub => {
            // Atomic read-set: the old byte reaches rd, memory reads 0xFF.
            match path.phys(ea, true)? {
                Some(pa) => {
                    let old = path.bus.read_byte(pa)?;
                    path.bus.write_byte(pa, 0xFF)?;
                    regs.write(rd, old as u32);
                }
                None => regs.write(rd, 0),
            }
            Ok(1)
        }
        Swap => {
            if ea & 3 != 0 {
                return Err(Trap::MemAddressNotAligned(ea));
            }
            match path.phys(ea, true)? {
                Some(pa) => {
                    let old = path.bus.read_word(pa)?;
                    path.bus.write_word(pa, regs.read(rd))?;
                    regs.write(rd, old);
                }
                None => regs.write(rd, 0),
            }
            Ok(1)
        }
        _ => Err(Trap::IllegalInstruction(word)),
    }
}

/// Execute one decoded instruction against the register file, MMU and bus.
///
/// Control transfers are expressed as a redirect on the register file; the
/// engine applies it (or the default advance) after the handler returns.
/// Architectural faults come back as `Err` for the trap controller.
pub fn execute<M: Memory>(
    regs: &mut RegisterFile,
    mmu: &mut Mmu,
    bus: &mut M,
    dec: &Decoded,
    word: u32,
) -> Result<Outcome, Trap> {
    use OpcodeId::*;

    let rs1 = regs.read(dec.rs1 as usize);
    let op2 = if dec.imm {
        dec.simm13 as u32
    } else {
        regs.read(dec.rs2 as usize)
    };
    let rd = dec.rd as usize;

    let cycles = match dec.op {
        // ---- Format 1/2 ----
        Call => {
            regs.write(15, regs.pc);
            let target = regs.pc.wrapping_add((dec.disp30 as u32) << 2);
            regs.redirect(regs.npc, target);
            1
        }
        Sethi => {
            regs.write(rd, dec.imm22 << 10);
            1
        }
        Bicc => {
            let target = regs.pc.wrapping_add((dec.disp22 as u32) << 2);
            let taken = condition_holds(regs, dec.cond);
            if taken {
                if dec.cond == 8 && dec.annul {
                    // Branch-always with the annul bit skips its delay slot.
                    regs.redirect(target, target.wrapping_add(4));
                } else {
                    regs.redirect(regs.npc, target);
                }
            } else if dec.annul {
                let skip = regs.npc.wrapping_add(4);
                regs.redirect(skip, skip.wrapping_add(4));
            }
            1
        }
        Unimp => return Err(Trap::IllegalInstruction(word)),

        // ---- Logical ----
        And => {
            regs.write(rd, rs1 & op2);
            1
        }
        Andcc => {
            let r = rs1 & op2;
            regs.write(rd, r);
            set_icc_logic(regs, r);
            1
        }
        Andn => {
            regs.write(rd, rs1 & !op2);
            1
        }
        Andncc => {
            let r = rs1 & !op2;
            regs.write(rd, r);
            set_icc_logic(regs, r);
            1
        }
        Or => {
            regs.write(rd, rs1 | op2);
            1
        }
        Orcc => {
            let r = rs1 | op2;
            regs.write(rd, r);
            set_icc_logic(regs, r);
            1
        }
        Orn => {
            regs.write(rd, rs1 | !op2);
            1
        }
        Orncc => {
            let r = rs1 | !op2;
            regs.write(rd, r);
            set_icc_logic(regs, r);
            1
        }
        Xor => {
            regs.write(rd, rs1 ^ op2);
            1
        }
        Xorcc => {
            let r = rs1 ^ op2;
            regs.write(rd, r);
            set_icc_logic(regs, r);
            1
        }
        Xnor => {
            regs.write(rd, !(rs1 ^ op2));
            1
        }
        Xnorcc => {
            let r = !(rs1 ^ op2);
            regs.write(rd, r);
            set_icc_logic(regs, r);
            1
        }

        // ---- Shifts ----
        Sll => {
            regs.write(rd, rs1 << (op2 & 0x1F));
            1
        }
        Srl => {
            regs.write(rd, rs1 >> (op2 & 0x1F));
            1
        }
        Sra => {
            regs.write(rd, ((rs1 as i32) >> (op2 & 0x1F)) as u32);
            1
        }

        // ---- Arithmetic ----
        Add => {
            regs.write(rd, rs1.wrapping_add(op2));
            1
        }
        Addcc => {
            let r = rs1.wrapping_add(op2);
            regs.write(rd, r);
            set_icc_add(regs, rs1, op2, r);
            1
        }
        Addx => {
            let r = rs1.wrapping_add(op2).wrapping_add(regs.flag_c() as u32);
            regs.write(rd, r);
            1
        }
        Addxcc => {
            let r = rs1.wrapping_add(op2).wrapping_add(regs.flag_c() as u32);
            regs.write(rd, r);
            set_icc_add(regs, rs1, op2, r);
            1
        }
        Sub => {
            regs.write(rd, rs1.wrapping_sub(op2));
            1
        }
        Subcc => {
            let r = rs1.wrapping_sub(op2);
            regs.write(rd, r);
            set_icc_sub(regs, rs1, op2, r);
            1
        }
        Subx => {
            let r = rs1.wrapping_sub(op2).wrapping_sub(regs.flag_c() as u32);
            regs.write(rd, r);
            1
        }
        Subxcc => {
            let r = rs1.wrapping_sub(op2).wrapping_sub(regs.flag_c() as u32);
            regs.write(rd, r);
            set_icc_sub(regs, rs1, op2, r);
            1
        }

        // ---- Tagged arithmetic ----
        Taddcc | Taddcctv => {
            let r = rs1.wrapping_add(op2);
            let overflow = add_overflow(rs1, op2, r) || (rs1 | op2) & 3 != 0;
            if dec.op == Taddcctv && overflow {
                return Err(Trap::TagOverflow);
            }
            regs.write(rd, r);
            regs.set_icc(r >> 31 != 0, r == 0, overflow, add_carry(rs1, op2, r));
            1
        }
        Tsubcc | Tsubcctv => {
            let r = rs1.wrapping_sub(op2);
            let overflow = sub_overflow(rs1, op2, r) || (rs1 | op2) & 3 != 0;
            if dec.op == Tsubcctv && overflow {
                return Err(Trap::TagOverflow);
            }
            regs.write(rd, r);
            regs.set_icc(r >> 31 != 0, r == 0, overflow, sub_borrow(rs1, op2, r));
            1
        }

        // ---- Multiply / divide ----
        Mulscc => {
            let a = ((regs.flag_n() ^ regs.flag_v()) as u32) << 31 | rs1 >> 1;
            let b = if regs.y() & 1 != 0 { op2 } else { 0 };
            let r = a.wrapping_add(b);
            regs.set_y((rs1 & 1) << 31 | regs.y() >> 1);
            regs.write(rd, r);
            set_icc_add(regs, a, b, r);
            1
        }
        Umul | Umulcc => {
            let product = (rs1 as u64).wrapping_mul(op2 as u64);
            regs.set_y((product >> 32) as u32);
            let r = product as u32;
            regs.write(rd, r);
            if dec.op == Umulcc {
                set_icc_logic(regs, r);
            }
            5
        }
        Smul | Smulcc => {
            let product = (rs1 as i32 as i64).wrapping_mul(op2 as i32 as i64) as u64;
            regs.set_y((product >> 32) as u32);
            let r = product as u32;
            regs.write(rd, r);
            if dec.op == Smulcc {
                set_icc_logic(regs, r);
            }
            5
        }
        Udiv | Udivcc => {
            if op2 == 0 {
                return Err(Trap::DivisionByZero);
            }
            let dividend = (regs.y() as u64) << 32 | rs1 as u64;
            let q = dividend / op2 as u64;
            let overflow = q > u32::MAX as u64;
            let r = if overflow { u32::MAX } else { q as u32 };
            regs.write(rd, r);
            if dec.op == Udivcc {
                regs.set_icc(r >> 31 != 0, r == 0, overflow, false);
            }
            35
        }
        Sdiv | Sdivcc => {
            if op2 == 0 {
                return Err(Trap::DivisionByZero);
            }
            let dividend = ((regs.y() as u64) << 32 | rs1 as u64) as i64;
            let divisor = op2 as i32 as i64;
            let q = dividend.checked_div(divisor).unwrap_or(i64::MAX);
            let (r, overflow) = if q > i32::MAX as i64 {
                (i32::MAX as u32, true)
            } else if q < i32::MIN as i64 {
                (i32::MIN as u32, true)
            } else {
                (q as u32, false)
            };
            regs.write(rd, r);
            if dec.op == Sdivcc {
                regs.set_icc(r >> 31 != 0, r == 0, overflow, false);
            }
            35
        }

        // ---- State registers ----
        Rdasr => {
            if dec.rs1 == 0 {
                regs.write(rd, regs.y());
            } else {
                if dec.rs1 >= 16 && !regs.supervisor() {
                    return Err(Trap::PrivilegedInstruction);
                }
                regs.write(rd, regs.asr(dec.rs1 as usize));
            }
            1
        }
        Rdpsr => {
            if !regs.supervisor() {
                return Err(Trap::PrivilegedInstruction);
            }
            regs.write(rd, regs.psr());
            1
        }
        Rdwim => {
            if !regs.supervisor() {
                return Err(Trap::PrivilegedInstruction);
            }
            regs.write(rd, regs.wim());
            1
        }
        Rdtbr => {
            if !regs.supervisor() {
                return Err(Trap::PrivilegedInstruction);
            }
            regs.write(rd, regs.tbr());
            1
        }
        Wrasr => {
            let value = rs1 ^ op2;
            if dec.rd == 0 {
                regs.set_y(value);
            } else {
                if dec.rd >= 16 && !regs.supervisor() {
                    return Err(Trap::PrivilegedInstruction);
                }
                if dec.rd == 19 {
                    // Power-down register: stop the machine with the
                    // written value as the exit code.
                    return Err(Trap::PowerDown(value));
                }
                regs.set_asr(rd, value);
            }
            1
        }
        Wrpsr => {
            if !regs.supervisor() {
                return Err(Trap::PrivilegedInstruction);
            }
            let value = rs1 ^ op2;
            if value & 0x1F >= NUM_WINDOWS as u32 {
                return Err(Trap::IllegalInstruction(word));
            }
            regs.set_psr(value);
            1
        }
        Wrwim => {
            if !regs.supervisor() {
                return Err(Trap::PrivilegedInstruction);
            }
            regs.set_wim(rs1 ^ op2);
            1
        }
        Wrtbr => {
            if !regs.supervisor() {
                return Err(Trap::PrivilegedInstruction);
            }
            regs.set_tbr_base(rs1 ^ op2);
            1
        }

        // ---- Control transfer ----
        Jmpl => {
            let target = rs1.wrapping_add(op2);
            if target & 3 != 0 {
                return Err(Trap::MemAddressNotAligned(target));
            }
            regs.write(rd, regs.pc);
            regs.redirect(regs.npc, target);
            1
        }
        Rett => {
            if regs.traps_enabled() {
                return Err(if regs.supervisor() {
                    Trap::IllegalInstruction(word)
                } else {
                    Trap::PrivilegedInstruction
                });
            }
            if !regs.supervisor() {
                return Err(Trap::PrivilegedInstruction);
            }
            let target = rs1.wrapping_add(op2);
            let previous = (regs.cwp() as usize + 1) % NUM_WINDOWS;
            if regs.wim() & (1 << previous) != 0 {
                return Err(Trap::WindowUnderflow);
            }
            if target & 3 != 0 {
                return Err(Trap::MemAddressNotAligned(target));
            }
            regs.rotate_window(WindowOp::Restore).map_err(window_trap)?;
            regs.set_traps_enabled(true);
            let ps = regs.prev_supervisor();
            regs.set_supervisor(ps);
            regs.redirect(regs.npc, target);
            1
        }
        Ticc => {
            if condition_holds(regs, dec.cond) {
                let number = (rs1.wrapping_add(op2) & 0x7F) as u8;
                return Err(Trap::TrapInstruction(number));
            }
            1
        }
        Flush => 1,
        Save | Restore => {
            let result = rs1.wrapping_add(op2);
            let op = if dec.op == Save {
                WindowOp::Save
            } else {
                WindowOp::Restore
            };
            regs.rotate_window(op).map_err(window_trap)?;
            // The sum uses the old window's sources, the destination lands
            // in the new window.
            regs.write(rd, result);
            1
        }

        // ---- Ordinary memory access ----
        Ld | Ldub | Lduh | Ldd | Ldsb | Ldsh | St | Stb | Sth | Std | Ldstub | Swap => {
            let ea = rs1.wrapping_add(op2);
            let supervisor = regs.supervisor();
            let mut path = DataPath::normal(mmu, bus, supervisor);
            memory_op(regs, &mut path, dec.op, rd, ea, word)?
        }

        // ---- Alternate-space memory access ----
        Lda | Lduba | Lduha | Ldda | Ldsba | Ldsha | Sta | Stba | Stha | Stda | Ldstuba
        | Swapa => {
            if !regs.supervisor() {
                return Err(Trap::PrivilegedInstruction);
            }
            if dec.imm {
                // The immediate form has no ASI field.
                return Err(Trap::IllegalInstruction(word));
            }
            let ea = rs1.wrapping_add(op2);
            let base = base_mem_op(dec.op);
            match dec.asi {
                ASI_MMU_REGS => match base {
                    OpcodeId::Ld => {
                        let value = mmu.read_register(ea);
                        regs.write(rd, value);
                        1
                    }
                    OpcodeId::St => {
                        mmu.write_register(ea, regs.read(rd));
                        1
                    }
                    _ => return Err(Trap::DataAccessException(ea)),
                },
                ASI_FLUSH => {
                    match base {
                        OpcodeId::St | OpcodeId::Stb | OpcodeId::Sth | OpcodeId::Std => {
                            mmu.flush()
                        }
                        // Loads from the flush space read as zero.
                        _ => regs.write(rd, 0),
                    }
                    1
                }
                ASI_BYPASS => {
                    let mut path = DataPath {
                        mmu,
                        bus,
                        supervisor: true,
                        instruction: false,
                        bypass: true,
                    };
                    memory_op(regs, &mut path, base, rd, ea, word)?
                }
                0x08..=0x0B => {
                    let mut path = DataPath {
                        mmu,
                        bus,
                        supervisor: dec.asi & 1 != 0,
                        instruction: dec.asi < 0x0A,
                        bypass: false,
                    };
                    memory_op(regs, &mut path, base, rd, ea, word)?
                }
                _ => return Err(Trap::DataAccessException(ea)),
            }
        }

        FpOp => return Err(Trap::FpDisabled),
        CpOp => return Err(Trap::CpDisabled),
        Invalid => return Err(Trap::IllegalInstruction(word)),
    };

    Ok(Outcome::Executed { cycles })
}
