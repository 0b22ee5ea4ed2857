use crate::bus::Memory;
use crate::cpu::decode::DecodeCache;
use crate::cpu::execution::{self, Outcome};
use crate::cpu::regs::RegisterFile;
use crate::cpu::trap::TrapController;
use crate::cpu::types::{AccessType, Trap};
use crate::mmu::{Mmu, MmuConfig, Translation};
use crate::snapshot::CpuSnapshot;

/// The processor: integer unit, trap controller and MMU behind one `step`.
///
/// A step either dispatches a pending trap or runs one instruction: fetch
/// through the MMU, decode through the cache, execute, then advance PC/NPC
/// (or consume a redirect) and sample the interrupt line. Architectural
/// traps never escape; `Err` from [`Cpu::step`] is always a host-level
/// terminal condition.
pub struct Cpu {
    pub regs: RegisterFile,
    pub traps: TrapController,
    pub mmu: Mmu,
    decode: DecodeCache,
    irq_line: Option<u8>,
    irq_ack: Option<Box<dyn FnMut(u8)>>,
    /// Retired instruction count.
    pub instret: u64,
    /// Accumulated cycle estimate.
    pub cycles: u64,
}

impl Cpu {
    pub fn new(entry: u32, config: MmuConfig) -> Self {
        Self {
            regs: RegisterFile::new(entry),
            traps: TrapController::new(),
            mmu: Mmu::new(config),
            decode: DecodeCache::new(),
            irq_line: None,
            irq_ack: None,
            instret: 0,
            cycles: 0,
        }
    }

    /// Full processor reset at a new entry point.
    pub fn reset(&mut self, entry: u32) {
        self.regs.reset(entry);
        self.traps = TrapController::new();
        self.mmu.reset();
        self.decode.clear();
        self.irq_line = None;
        self.instret = 0;
        self.cycles = 0;
    }

    /// Drive the external interrupt request line. Level 0 or `None` means
    /// deasserted; levels outside 1..=15 are ignored.
    pub fn set_irq(&mut self, line: Option<u8>) {
        self.irq_line = line.filter(|level| (1..=15).contains(level));
    }

    pub fn irq_line(&self) -> Option<u8> {
        self.irq_line
    }

    /// Register a callback fired when an interrupt is actually taken, so an
    /// external controller can clear its pending bit.
    pub fn on_interrupt_ack(&mut self, ack: impl FnMut(u8) + 'static) {
        self.irq_ack = Some(Box::new(ack));
    }

    fn irq_gate_open(&self, level: u8) -> bool {
        self.regs.traps_enabled() && (level == 15 || level > self.regs.pil())
    }

    /// Sample the interrupt line at the end of a step; an open gate latches
    /// the request for dispatch at the top of the next step.
    fn poll_interrupt(&mut self) {
        if let Some(level) = self.irq_line {
            if self.irq_gate_open(level) {
                self.traps
                    .raise(Trap::Interrupt(level), self.regs.pc, self.regs.npc);
            }
        }
    }

    fn fetch<M: Memory>(&mut self, bus: &mut M, pc: u32) -> Result<Option<u32>, Trap> {
        if pc & 3 != 0 {
            return Err(Trap::MemAddressNotAligned(pc));
        }
        let supervisor = self.regs.supervisor();
        match self
            .mmu
            .translate(bus, pc, AccessType::Execute, supervisor)?
        {
            Translation::Phys(pa) => bus.fetch_word(pa).map(Some),
            Translation::Suppressed => Ok(None),
        }
    }

    /// Route a fault from fetch or execute: architectural causes are latched
    /// for the trap controller, host-level ones bubble out.
    fn absorb(&mut self, trap: Trap, cycles: u32) -> Result<Outcome, Trap> {
        if !trap.is_architectural() {
            return Err(trap);
        }
        // A handler may have scheduled a control transfer before faulting;
        // the trap supersedes it.
        self.regs.take_redirect();
        self.traps.raise(trap, self.regs.pc, self.regs.npc);
        self.cycles += cycles as u64;
        Ok(Outcome::Executed { cycles })
    }

    /// Execute one instruction (or dispatch one trap entry).
    pub fn step<M: Memory>(&mut self, bus: &mut M) -> Result<Outcome, Trap> {
        // Trap dispatch happens before anything is fetched.
        if self.traps.is_pending() {
            let latched_irq = match self.traps.pending().map(|p| &p.cause) {
                Some(Trap::Interrupt(level)) => Some(*level),
                _ => None,
            };
            if let Some(level) = latched_irq {
                // Re-check against the live line: the request may have been
                // withdrawn or masked since it was latched.
                if self.irq_line != Some(level) || !self.irq_gate_open(level) {
                    self.traps.cancel();
                    return Ok(Outcome::Annulled);
                }
            }
            if self.traps.deliver(&mut self.regs)? {
                if let Some(level) = latched_irq {
                    self.irq_line = None;
                    if let Some(ack) = self.irq_ack.as_mut() {
                        ack(level);
                    }
                }
                // Entry replaces the fetch for this step; the handler's
                // first instruction runs on the next one.
                return Ok(Outcome::TrapDispatched);
            }
        }

        let pc = self.regs.pc;
        let word = match self.fetch(bus, pc) {
            Ok(Some(word)) => word,
            // A suppressed fetch reads zero and resolves as UNIMP below.
            Ok(None) => 0,
            Err(trap) => return self.absorb(trap, 1),
        };

        let dec = self.decode.lookup(word);
        match execution::execute(&mut self.regs, &mut self.mmu, bus, &dec, word) {
            Ok(Outcome::Executed { cycles }) => {
                self.advance();
                self.instret += 1;
                self.cycles += cycles as u64;
                self.poll_interrupt();
                Ok(Outcome::Executed { cycles })
            }
            Ok(outcome) => {
                // A squashed instruction still vacates its slot in the
                // stream.
                self.advance();
                self.poll_interrupt();
                Ok(outcome)
            }
            Err(trap) => {
                let outcome = self.absorb(trap, 1)?;
                self.poll_interrupt();
                Ok(outcome)
            }
        }
    }

    /// Move to the next instruction: consume a scheduled redirect if there
    /// is one, otherwise fall through the delay-slot pair.
    fn advance(&mut self) {
        match self.regs.take_redirect() {
            Some((pc, npc)) => {
                self.regs.pc = pc;
                self.regs.npc = npc;
            }
            None => {
                self.regs.pc = self.regs.npc;
                self.regs.npc = self.regs.npc.wrapping_add(4);
            }
        }
    }

    /// Debugger word read through the MMU without architectural side
    /// effects.
    pub fn read_mem_debug<M: Memory>(&self, bus: &mut M, vaddr: u32) -> Option<u32> {
        let pa = self.mmu.probe(bus, vaddr)?;
        bus.read_word_debug(pa)
    }

    /// Debugger word write; returns false if the address does not resolve.
    pub fn write_mem_debug<M: Memory>(&self, bus: &mut M, vaddr: u32, value: u32) -> bool {
        match self.mmu.probe(bus, vaddr) {
            Some(pa) => bus.write_word_debug(pa, value),
            None => false,
        }
    }

    /// Decode cache statistics: (hits, misses, entries, hit rate).
    pub fn decode_stats(&self) -> (u64, u64, usize, f64) {
        let hits = self.decode.hits;
        let misses = self.decode.misses;
        let total = hits + misses;
        let rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        (hits, misses, self.decode.len(), rate)
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            regs: self.regs.snapshot(),
            mmu: self.mmu.registers(),
            pending_trap: self.traps.pending().cloned(),
            irq_line: self.irq_line,
            instret: self.instret,
            cycles: self.cycles,
        }
    }

    pub fn restore(&mut self, snap: &CpuSnapshot) -> Result<(), String> {
        self.regs.restore(&snap.regs)?;
        self.mmu.restore_registers(&snap.mmu);
        self.traps.set_pending(snap.pending_trap.clone());
        self.irq_line = snap.irq_line;
        self.instret = snap.instret;
        self.cycles = snap.cycles;
        self.decode.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SystemBus;
    use std::cell::Cell;
    use std::rc::Rc;

    const NOP: u32 = 0x0100_0000; // sethi 0, %g0

    fn machine(entry: u32) -> (Cpu, SystemBus) {
        let cpu = Cpu::new(entry, MmuConfig::default());
        let bus = SystemBus::new(0, 0x1_0000);
        (cpu, bus)
    }

    fn fill_nops(bus: &mut SystemBus, base: u64, count: usize) {
        for i in 0..count {
            bus.write_word(base + (i as u64) * 4, NOP).unwrap();
        }
    }

    #[test]
    fn straight_line_code_advances_the_pc_pair() {
        let (mut cpu, mut bus) = machine(0x1000);
        fill_nops(&mut bus, 0x1000, 4);
        for _ in 0..3 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.regs.pc, 0x100C);
        assert_eq!(cpu.regs.npc, 0x1010);
        assert_eq!(cpu.instret, 3);
    }

    #[test]
    fn illegal_instruction_vectors_through_the_trap_table() {
        let (mut cpu, mut bus) = machine(0x2000);
        cpu.regs.set_traps_enabled(true);
        cpu.regs.set_tbr_base(0x3000);
        bus.write_word(0x2000, 0).unwrap(); // unimp
        fill_nops(&mut bus, 0x3020, 2); // tt=0x02 vector

        cpu.step(&mut bus).unwrap();
        assert!(cpu.traps.is_pending());
        assert_eq!(cpu.regs.pc, 0x2000); // not advanced past the fault

        // Dispatch consumes a whole step and parks the PC at the vector.
        assert_eq!(cpu.step(&mut bus), Ok(Outcome::TrapDispatched));
        assert_eq!(cpu.regs.tbr_tt(), 0x02);
        assert!(cpu.regs.supervisor());
        assert!(cpu.regs.prev_supervisor());
        assert!(!cpu.regs.traps_enabled());
        assert_eq!(cpu.regs.cwp(), 7);
        assert_eq!(cpu.regs.pc, 0x3020);
        assert_eq!(cpu.regs.npc, 0x3024);
        assert_eq!(cpu.regs.read(17), 0x2000);
        assert_eq!(cpu.regs.read(18), 0x2004);
        assert_eq!(cpu.instret, 0);

        cpu.step(&mut bus).unwrap(); // handler's first instruction
        assert_eq!(cpu.regs.pc, 0x3024);
        assert_eq!(cpu.instret, 1);
    }

    #[test]
    fn window_overflow_traps_without_rotating_first() {
        let (mut cpu, mut bus) = machine(0x1000);
        cpu.regs.set_traps_enabled(true);
        cpu.regs.set_tbr_base(0x3000);
        cpu.regs.set_wim(0x01);
        cpu.regs.set_psr(cpu.regs.psr() & !0x1F | 1); // CWP = 1
        bus.write_word(0x1000, 0x9DE3_BFA0).unwrap(); // save %sp, -96, %sp
        fill_nops(&mut bus, 0x3050, 2); // tt=0x05 vector

        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.cwp(), 1); // untouched by the faulting save
        assert!(cpu.traps.is_pending());

        assert_eq!(cpu.step(&mut bus), Ok(Outcome::TrapDispatched));
        assert_eq!(cpu.regs.tbr_tt(), 0x05);
        assert_eq!(cpu.regs.cwp(), 0); // trap entry took the window itself
        assert_eq!(cpu.regs.pc, 0x3050);

        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.pc, 0x3054);
    }

    #[test]
    fn interrupt_latches_after_a_step_and_dispatches_on_the_next() {
        let (mut cpu, mut bus) = machine(0x1000);
        cpu.regs.set_traps_enabled(true);
        fill_nops(&mut bus, 0x1000, 4);
        fill_nops(&mut bus, 0x130, 2); // tt=0x13 vector (TBR base 0)

        let acked = Rc::new(Cell::new(None));
        let sink = acked.clone();
        cpu.on_interrupt_ack(move |level| sink.set(Some(level)));

        cpu.set_irq(Some(3));
        cpu.step(&mut bus).unwrap();
        assert!(cpu.traps.is_pending());

        assert_eq!(cpu.step(&mut bus), Ok(Outcome::TrapDispatched));
        assert_eq!(cpu.regs.tbr_tt(), 0x13);
        assert_eq!(acked.get(), Some(3));
        assert_eq!(cpu.irq_line(), None);
        assert_eq!(cpu.regs.pc, 0x130);

        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.pc, 0x134);
    }

    #[test]
    fn masked_levels_never_latch() {
        let (mut cpu, mut bus) = machine(0x1000);
        cpu.regs.set_traps_enabled(true);
        cpu.regs.set_pil(5);
        fill_nops(&mut bus, 0x1000, 4);

        cpu.set_irq(Some(2));
        cpu.step(&mut bus).unwrap();
        assert!(!cpu.traps.is_pending());

        // Level 15 punches through any PIL.
        cpu.regs.set_pil(15);
        cpu.set_irq(Some(15));
        cpu.step(&mut bus).unwrap();
        assert!(cpu.traps.is_pending());
    }

    #[test]
    fn withdrawn_interrupt_is_annulled_not_delivered() {
        let (mut cpu, mut bus) = machine(0x1000);
        cpu.regs.set_traps_enabled(true);
        fill_nops(&mut bus, 0x1000, 4);

        cpu.set_irq(Some(4));
        cpu.step(&mut bus).unwrap();
        assert!(cpu.traps.is_pending());

        cpu.set_irq(None);
        let before = cpu.instret;
        assert_eq!(cpu.step(&mut bus), Ok(Outcome::Annulled));
        assert!(!cpu.traps.is_pending());
        assert_eq!(cpu.instret, before);
    }

    #[test]
    fn advancing_falls_through_or_consumes_a_redirect() {
        let (mut cpu, _bus) = machine(0x1000);
        cpu.advance();
        assert_eq!(cpu.regs.pc, 0x1004);
        assert_eq!(cpu.regs.npc, 0x1008);

        cpu.regs.redirect(0x2000, 0x2004);
        cpu.advance();
        assert_eq!(cpu.regs.pc, 0x2000);
        assert_eq!(cpu.regs.npc, 0x2004);
    }

    #[test]
    fn synchronous_trap_with_et_clear_reports_error_mode() {
        let (mut cpu, mut bus) = machine(0x1000);
        assert!(!cpu.regs.traps_enabled());
        bus.write_word(0x1000, 0).unwrap(); // unimp

        cpu.step(&mut bus).unwrap(); // fault latched
        assert_eq!(cpu.step(&mut bus), Err(Trap::ErrorMode(0x02)));
    }

    #[test]
    fn power_down_write_surfaces_as_an_error() {
        let (mut cpu, mut bus) = machine(0x1000);
        // mov 7, %g1 ; wr %g1, %asr19
        bus.write_word(0x1000, 0x8210_2007).unwrap(); // or %g0, 7, %g1
        bus.write_word(0x1004, 0xA780_4000).unwrap(); // wr %g1, %g0, %asr19
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.step(&mut bus), Err(Trap::PowerDown(7)));
    }

    #[test]
    fn fetch_translates_through_the_mmu() {
        let (mut cpu, mut bus) = machine(0x4000_1000);
        // 4K tables: context 0 root at 0x1000 maps 0x40001000 -> 0x8000.
        bus.write_word(0x1000, (((0x2000u32) >> 6) << 2) | 1).unwrap();
        bus.write_word(0x2000 + 0x40 * 4, (((0x3000u32) >> 6) << 2) | 1)
            .unwrap();
        bus.write_word(0x3000, (((0x4000u32) >> 6) << 2) | 1).unwrap();
        bus.write_word(0x4004, ((0x8u32) << 8) | (0x3 << 2) | 2).unwrap();
        fill_nops(&mut bus, 0x8000, 2);

        cpu.mmu.write_register(0x100, 0x100);
        cpu.mmu.write_register(0x200, 0);
        cpu.mmu.write_register(0x000, 1);

        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.instret, 1);
        assert_eq!(cpu.regs.pc, 0x4000_1004);
    }

    #[test]
    fn decode_cache_serves_repeated_words() {
        let (mut cpu, mut bus) = machine(0x1000);
        fill_nops(&mut bus, 0x1000, 3);
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        let (hits, misses, entries, _) = cpu.decode_stats();
        assert_eq!(misses, 1);
        assert_eq!(hits, 1);
        assert_eq!(entries, 1);
    }

    #[test]
    fn snapshot_round_trips_the_processor_state() {
        let (mut cpu, mut bus) = machine(0x1000);
        cpu.regs.set_traps_enabled(true);
        fill_nops(&mut bus, 0x1000, 4);
        cpu.step(&mut bus).unwrap();
        cpu.set_irq(Some(9));
        cpu.step(&mut bus).unwrap(); // latches the interrupt

        let snap = cpu.snapshot();
        let mut other = Cpu::new(0, MmuConfig::default());
        other.restore(&snap).unwrap();
        assert_eq!(other.snapshot(), snap);
        assert_eq!(other.regs.pc, cpu.regs.pc);
        assert!(other.traps.is_pending());
    }
}
