use crate::cpu::regs::RegFileSnapshot;
use crate::cpu::trap::PendingTrap;
use crate::mmu::MmuRegisters;
use serde::{Deserialize, Serialize};

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Full machine snapshot: processor state plus memory regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub version: String,
    pub cpu: CpuSnapshot,
    pub memory: Vec<MemRegionSnapshot>,
}

/// Serializable processor state.
///
/// Caches (TLBs, decode cache) are not part of the architectural state and
/// are rebuilt cold after a restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub regs: RegFileSnapshot,
    pub mmu: MmuRegisters,
    pub pending_trap: Option<PendingTrap>,
    pub irq_line: Option<u8>,
    pub instret: u64,
    pub cycles: u64,
}

/// Memory region snapshot (currently a single RAM region).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemRegionSnapshot {
    pub base: u64,
    pub size: u64,
    pub hash: String,
    pub data: Option<Vec<u8>>,
}
