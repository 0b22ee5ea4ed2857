//! Paged memory management: context-indexed three-level page tables, a
//! fault status register file and small fully-associative TLBs in front of
//! the walker.

use serde::{Deserialize, Serialize};

use crate::bus::Memory;
use crate::cpu::types::{AccessType, Trap};

/// Physical addresses are 36 bits wide.
pub const PA_MASK: u64 = 0xF_FFFF_FFFF;

pub const DEFAULT_TLB_ENTRIES: usize = 64;

// Control register: impl/version in the top byte, then the read-only
// configuration fields (TLB sizes [23:21]/[20:18] as log2, page size
// [17:16], split bit [14]) and the writable bits below.
const MCR_IMPL_VER: u32 = 0x0100_0000;
const MCR_TLB_DISABLE: u32 = 1 << 15;
const MCR_SPLIT: u32 = 1 << 14;
const MCR_NO_FAULT: u32 = 1 << 1;
const MCR_ENABLE: u32 = 1 << 0;
const MCR_WRITE_MASK: u32 = MCR_TLB_DISABLE | MCR_NO_FAULT | MCR_ENABLE;

const CTPR_MASK: u32 = !0x3;

// Register file offsets within the control ASI address space.
const REG_CONTROL: u32 = 0x000;
const REG_CONTEXT_TABLE: u32 = 0x100;
const REG_CONTEXT: u32 = 0x200;
const REG_FAULT_STATUS: u32 = 0x300;
const REG_FAULT_ADDRESS: u32 = 0x400;

// Fault status layout: [9:8] level, [7:5] access type, [4:2] fault type,
// [1] fault address valid, [0] overwrite.
const FSR_FAV: u32 = 1 << 1;
const FSR_OW: u32 = 1 << 0;

// Fault types.
const FT_INVALID: u8 = 1;
const FT_PROTECTION: u8 = 2;
const FT_PRIVILEGE: u8 = 3;
const FT_TRANSLATION: u8 = 4;

// Descriptor entry types.
const ET_MASK: u32 = 0x3;
const ET_INVALID: u32 = 0;
const ET_PTD: u32 = 1;
const ET_PTE: u32 = 2;

const PTE_REFERENCED: u32 = 1 << 5;
const PTE_MODIFIED: u32 = 1 << 6;

/// Supervisor instruction fetches fault even in no-fault mode.
const ASI_SUPERVISOR_INSTRUCTION: u8 = 0x9;

/// Fault type per (access type, page ACC field); zero means permitted.
const ACCESS_TABLE: [[u8; 8]; 8] = [
    [0, 0, 0, 0, 2, 0, 3, 3], // user data load
    [0, 0, 0, 0, 2, 0, 0, 0], // supervisor data load
    [2, 2, 0, 0, 0, 2, 3, 3], // user instruction fetch
    [2, 2, 0, 0, 0, 2, 0, 0], // supervisor instruction fetch
    [2, 0, 2, 0, 2, 2, 3, 3], // user data store
    [2, 0, 2, 0, 2, 0, 2, 0], // supervisor data store
    [2, 2, 2, 0, 2, 2, 3, 3], // user instruction store
    [2, 2, 2, 0, 2, 2, 2, 0], // supervisor instruction store
];

/// Base page size; selects how virtual addresses split into table indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSize {
    Size4K,
    Size8K,
    Size16K,
    Size32K,
}

impl PageSize {
    pub fn from_kib(kib: u32) -> Option<Self> {
        match kib {
            4 => Some(PageSize::Size4K),
            8 => Some(PageSize::Size8K),
            16 => Some(PageSize::Size16K),
            32 => Some(PageSize::Size32K),
            _ => None,
        }
    }

    pub fn kib(self) -> u32 {
        match self {
            PageSize::Size4K => 4,
            PageSize::Size8K => 8,
            PageSize::Size16K => 16,
            PageSize::Size32K => 32,
        }
    }

    pub fn offset_bits(self) -> u32 {
        match self {
            PageSize::Size4K => 12,
            PageSize::Size8K => 13,
            PageSize::Size16K => 14,
            PageSize::Size32K => 15,
        }
    }

    /// Two-bit code reported in the control register's PSZ field.
    fn psz(self) -> u32 {
        match self {
            PageSize::Size4K => 0,
            PageSize::Size8K => 1,
            PageSize::Size16K => 2,
            PageSize::Size32K => 3,
        }
    }

    /// Index field widths for walk levels 1..=3, most significant first.
    fn level_bits(self) -> [u32; 3] {
        match self {
            PageSize::Size4K => [8, 6, 6],
            PageSize::Size8K => [7, 6, 6],
            PageSize::Size16K => [6, 6, 6],
            PageSize::Size32K => [4, 7, 6],
        }
    }

    /// Table index for `vaddr` at walk level 1..=3.
    fn index(self, vaddr: u32, level: u8) -> u32 {
        let bits = self.level_bits();
        let shift = match level {
            1 => self.offset_bits() + bits[2] + bits[1],
            2 => self.offset_bits() + bits[2],
            _ => self.offset_bits(),
        };
        (vaddr >> shift) & ((1 << bits[(level - 1) as usize]) - 1)
    }

    /// Virtual-address bits carried through unchanged for a mapping entry
    /// found at walk level 1..=3. Entries above level 3 map larger regions.
    fn offset_mask_at(self, level: u8) -> u32 {
        let bits = self.level_bits();
        let width = match level {
            1 => self.offset_bits() + bits[2] + bits[1],
            2 => self.offset_bits() + bits[2],
            _ => self.offset_bits(),
        };
        (1u32 << width) - 1
    }
}

/// TLB replacement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Random,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "random" => Ok(EvictionPolicy::Random),
            other => Err(format!("unknown eviction policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    vtag: u32,
    ctx: u32,
    pte: u32,
    /// Physical address of the mapping entry, for flag write-back.
    pte_addr: u64,
    level: u8,
    page_base: u64,
    page_mask: u32,
    stamp: u64,
}

impl TlbEntry {
    fn acc(&self) -> u32 {
        (self.pte >> 2) & 0x7
    }
}

/// Fully associative translation cache.
pub struct Tlb {
    entries: Vec<TlbEntry>,
    capacity: usize,
    policy: EvictionPolicy,
    clock: u64,
    rng: u32,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl Tlb {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            policy,
            clock: 0,
            rng: 0x2F6E_2B1D,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Find a mapping and mark it most recently used.
    fn lookup(&mut self, vtag: u32, ctx: u32) -> Option<usize> {
        self.clock += 1;
        let clock = self.clock;
        match self
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.vtag == vtag && e.ctx == ctx)
        {
            Some((i, entry)) => {
                entry.stamp = clock;
                self.hits += 1;
                Some(i)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, mut entry: TlbEntry) {
        if self.capacity == 0 {
            return;
        }
        self.clock += 1;
        entry.stamp = self.clock;
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return;
        }
        let victim = match self.policy {
            EvictionPolicy::Lru => self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(i, _)| i)
                .unwrap_or(0),
            EvictionPolicy::Random => {
                self.rng ^= self.rng << 13;
                self.rng ^= self.rng >> 17;
                self.rng ^= self.rng << 5;
                self.rng as usize % self.entries.len()
            }
        };
        self.entries[victim] = entry;
        self.evictions += 1;
    }

    pub fn flush(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of a successful translation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    Phys(u64),
    /// The access faulted in no-fault mode: loads read zero, stores drop.
    Suppressed,
}

/// MMU construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct MmuConfig {
    pub page_size: PageSize,
    pub tlb_entries: usize,
    pub split_tlb: bool,
    pub policy: EvictionPolicy,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            page_size: PageSize::Size4K,
            tlb_entries: DEFAULT_TLB_ENTRIES,
            split_tlb: true,
            policy: EvictionPolicy::Lru,
        }
    }
}

/// Architectural MMU registers, the part of MMU state that is snapshotted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MmuRegisters {
    pub control: u32,
    pub context_table_ptr: u32,
    pub context: u32,
    pub fault_status: u32,
    pub fault_address: u32,
    pub fault_pending: bool,
}

struct WalkHit {
    pte: u32,
    pte_addr: u64,
    level: u8,
    page_base: u64,
    page_mask: u32,
}

struct WalkFault {
    level: u8,
    ft: u8,
}

/// Paged memory management unit with reference/modified maintenance.
pub struct Mmu {
    page: PageSize,
    split: bool,
    /// Read-only configuration fields reported through the control register.
    geometry: u32,
    control: u32,
    context_table_ptr: u32,
    context: u32,
    fault_status: u32,
    fault_address: u32,
    fault_pending: bool,
    itlb: Tlb,
    dtlb: Tlb,
    pub walks: u64,
    pub faults: u64,
}

impl Mmu {
    pub fn new(config: MmuConfig) -> Self {
        let tlb_log2 = config.tlb_entries.max(1).ilog2().min(7);
        let mut geometry =
            (tlb_log2 << 21) | (tlb_log2 << 18) | (config.page_size.psz() << 16);
        if config.split_tlb {
            geometry |= MCR_SPLIT;
        }
        Self {
            page: config.page_size,
            split: config.split_tlb,
            geometry,
            control: 0,
            context_table_ptr: 0,
            context: 0,
            fault_status: 0,
            fault_address: 0,
            fault_pending: false,
            itlb: Tlb::new(config.tlb_entries, config.policy),
            dtlb: Tlb::new(config.tlb_entries, config.policy),
            walks: 0,
            faults: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.control & MCR_ENABLE != 0
    }

    pub fn no_fault(&self) -> bool {
        self.control & MCR_NO_FAULT != 0
    }

    fn tlb_disabled(&self) -> bool {
        self.control & MCR_TLB_DISABLE != 0
    }

    pub fn page_size(&self) -> PageSize {
        self.page
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn itlb(&self) -> &Tlb {
        &self.itlb
    }

    pub fn dtlb(&self) -> &Tlb {
        &self.dtlb
    }

    /// Read a control-space register; reading the fault status clears it.
    pub fn read_register(&mut self, offset: u32) -> u32 {
        match offset & 0x700 {
            REG_CONTROL => MCR_IMPL_VER | self.geometry | self.control,
            REG_CONTEXT_TABLE => self.context_table_ptr,
            REG_CONTEXT => self.context,
            REG_FAULT_STATUS => {
                let status = self.fault_status;
                self.fault_status = 0;
                self.fault_pending = false;
                status
            }
            REG_FAULT_ADDRESS => self.fault_address,
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32) {
        match offset & 0x700 {
            REG_CONTROL => self.control = value & MCR_WRITE_MASK,
            REG_CONTEXT_TABLE => self.context_table_ptr = value & CTPR_MASK,
            REG_CONTEXT => self.context = value,
            REG_FAULT_STATUS | REG_FAULT_ADDRESS => {
                log::trace!("mmu: ignored write to read-only register {:#x}", offset)
            }
            _ => log::trace!("mmu: write to unknown register {:#x}", offset),
        }
    }

    /// Drop all cached translations.
    pub fn flush(&mut self) {
        log::debug!("mmu: tlb flush");
        self.itlb.flush();
        self.dtlb.flush();
    }

    /// Return to the power-on state: translation off, no latched fault.
    pub fn reset(&mut self) {
        self.control = 0;
        self.context_table_ptr = 0;
        self.context = 0;
        self.fault_status = 0;
        self.fault_address = 0;
        self.fault_pending = false;
        self.flush();
    }

    /// Side-effect-free translation for debugger access: no fault is
    /// latched, no flags are written back and the TLBs are left alone.
    pub fn probe(&self, bus: &mut impl Memory, vaddr: u32) -> Option<u64> {
        if !self.enabled() {
            return Some(vaddr as u64);
        }
        match self.walk(bus, vaddr) {
            Ok(hit) => Some(hit.page_base | u64::from(vaddr & hit.page_mask)),
            Err(_) => None,
        }
    }

    pub fn registers(&self) -> MmuRegisters {
        MmuRegisters {
            control: self.control,
            context_table_ptr: self.context_table_ptr,
            context: self.context,
            fault_status: self.fault_status,
            fault_address: self.fault_address,
            fault_pending: self.fault_pending,
        }
    }

    /// Restore architectural registers; cached translations are discarded
    /// since they may describe another address space.
    pub fn restore_registers(&mut self, regs: &MmuRegisters) {
        self.control = regs.control & MCR_WRITE_MASK;
        self.context_table_ptr = regs.context_table_ptr & CTPR_MASK;
        self.context = regs.context;
        self.fault_status = regs.fault_status;
        self.fault_address = regs.fault_address;
        self.fault_pending = regs.fault_pending;
        self.flush();
    }

    fn tlb_mut(&mut self, instruction: bool) -> &mut Tlb {
        if self.split && instruction {
            &mut self.itlb
        } else {
            &mut self.dtlb
        }
    }

    /// Translate a virtual address, consulting the TLB first and walking the
    /// page tables on a miss. Referenced and modified bits are maintained in
    /// the tables as a side effect of successful accesses.
    pub fn translate(
        &mut self,
        bus: &mut impl Memory,
        vaddr: u32,
        at: AccessType,
        supervisor: bool,
    ) -> Result<Translation, Trap> {
        if !self.enabled() {
            return Ok(Translation::Phys(vaddr as u64));
        }

        let at_code = at.at_code(supervisor);
        let vtag = vaddr >> self.page.offset_bits();
        let ctx = self.context;
        let instruction = at.is_instruction();

        if !self.tlb_disabled() {
            if let Some(i) = self.tlb_mut(instruction).lookup(vtag, ctx) {
                let entry = self.tlb_mut(instruction).entries[i];
                let ft = ACCESS_TABLE[at_code as usize][entry.acc() as usize];
                if ft != 0 {
                    // Fault on a cached mapping: report it, keep the entry.
                    return self.fault(vaddr, at, at_code, entry.level, ft);
                }
                if at.is_write() && entry.pte & PTE_MODIFIED == 0 {
                    let pte = entry.pte | PTE_MODIFIED;
                    self.tlb_mut(instruction).entries[i].pte = pte;
                    if bus.write_word(entry.pte_addr, pte).is_err() {
                        return self.fault(vaddr, at, at_code, entry.level, FT_TRANSLATION);
                    }
                }
                let paddr = entry.page_base | u64::from(vaddr & entry.page_mask);
                return Ok(Translation::Phys(paddr));
            }
        }

        self.walks += 1;
        match self.walk(bus, vaddr) {
            Ok(hit) => {
                let acc = ((hit.pte >> 2) & 0x7) as usize;
                let ft = ACCESS_TABLE[at_code as usize][acc];
                if ft != 0 {
                    return self.fault(vaddr, at, at_code, hit.level, ft);
                }
                let mut pte = hit.pte | PTE_REFERENCED;
                if at.is_write() {
                    pte |= PTE_MODIFIED;
                }
                if pte != hit.pte && bus.write_word(hit.pte_addr, pte).is_err() {
                    return self.fault(vaddr, at, at_code, hit.level, FT_TRANSLATION);
                }
                if !self.tlb_disabled() {
                    self.tlb_mut(instruction).insert(TlbEntry {
                        vtag,
                        ctx,
                        pte,
                        pte_addr: hit.pte_addr,
                        level: hit.level,
                        page_base: hit.page_base,
                        page_mask: hit.page_mask,
                        stamp: 0,
                    });
                }
                let paddr = hit.page_base | u64::from(vaddr & hit.page_mask);
                log::trace!(
                    "mmu: walk ctx={} vaddr={:#010x} -> paddr={:#011x} (level {})",
                    ctx,
                    vaddr,
                    paddr,
                    hit.level
                );
                Ok(Translation::Phys(paddr))
            }
            Err(fault) => self.fault(vaddr, at, at_code, fault.level, fault.ft),
        }
    }

    /// Walk the tables from the context entry down to a mapping descriptor.
    fn walk(&self, bus: &mut impl Memory, vaddr: u32) -> Result<WalkHit, WalkFault> {
        let mut level: u8 = 0;
        let mut desc_addr = ((self.context_table_ptr as u64) << 4)
            .wrapping_add((self.context as u64) << 2)
            & PA_MASK;
        loop {
            let desc = bus
                .read_word(desc_addr)
                .map_err(|_| WalkFault { level, ft: FT_TRANSLATION })?;
            match desc & ET_MASK {
                ET_INVALID => return Err(WalkFault { level, ft: FT_INVALID }),
                ET_PTD => {
                    if level == 3 {
                        return Err(WalkFault { level, ft: FT_TRANSLATION });
                    }
                    level += 1;
                    let index = self.page.index(vaddr, level);
                    desc_addr = ((u64::from(desc & !ET_MASK) << 4)
                        + (u64::from(index) << 2))
                        & PA_MASK;
                }
                ET_PTE => {
                    if level == 0 {
                        // A mapping at the context entry itself is not legal.
                        return Err(WalkFault { level, ft: FT_TRANSLATION });
                    }
                    let page_mask = self.page.offset_mask_at(level);
                    let page_base =
                        (u64::from(desc & !0xFF) << 4) & !(u64::from(page_mask)) & PA_MASK;
                    return Ok(WalkHit {
                        pte: desc,
                        pte_addr: desc_addr,
                        level,
                        page_base,
                        page_mask,
                    });
                }
                _ => return Err(WalkFault { level, ft: FT_TRANSLATION }),
            }
        }
    }

    /// Record a fault and either raise the trap or, in no-fault mode,
    /// suppress it. Supervisor instruction fetches are never suppressed.
    fn fault(
        &mut self,
        vaddr: u32,
        at: AccessType,
        at_code: u32,
        level: u8,
        ft: u8,
    ) -> Result<Translation, Trap> {
        self.faults += 1;
        let mut status = (u32::from(level) << 8) | (at_code << 5) | (u32::from(ft) << 2);
        if !at.is_instruction() {
            status |= FSR_FAV;
            self.fault_address = vaddr;
        }
        if self.fault_pending {
            status |= FSR_OW;
        }
        self.fault_status = status;
        self.fault_pending = true;
        log::trace!(
            "mmu: fault vaddr={:#010x} level={} ft={} status={:#06x}",
            vaddr,
            level,
            ft,
            status
        );

        if self.no_fault() && at.asi(at_code & 1 != 0) != ASI_SUPERVISOR_INSTRUCTION {
            return Ok(Translation::Suppressed);
        }
        Err(at.fault(vaddr))
    }
}
