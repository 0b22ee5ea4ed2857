use crate::bus::SystemBus;
use crate::cpu::Cpu;
use crate::cpu::execution::Outcome;
use crate::cpu::types::Trap;
use crate::dram::DRAM_BASE;
use crate::loader;
use crate::mmu::MmuConfig;
use crate::snapshot::{MachineSnapshot, MemRegionSnapshot, SNAPSHOT_VERSION};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default RAM size used when constructing a [`Machine`] via [`Machine::new`].
const DEFAULT_DRAM_MIB: usize = 16;

/// Progress report cadence for [`Machine::run`], in steps.
const REPORT_INTERVAL: u64 = 10_000_000;

/// Stop flag shared between [`Machine::run`] and an external controller.
///
/// The machine hands out clones via [`Machine::halt_signal`]; a supervising
/// thread or signal handler calls [`HaltSignal::request_halt`] and the run
/// loop notices at the next instruction boundary, never mid-instruction.
/// The flag is sticky: once set, later `run` calls return before stepping.
pub struct HaltSignal {
    requested: AtomicBool,
}

impl HaltSignal {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
        }
    }

    /// Ask the run loop to stop at the next instruction boundary.
    pub fn request_halt(&self) {
        // Release so state written before the request is visible by the
        // time the loop observes the flag.
        self.requested.store(true, Ordering::Release);
    }

    /// Check whether a halt has been requested.
    pub fn is_halt_requested(&self) -> bool {
        // Relaxed: the loop polls every instruction, eventual visibility
        // is enough for a stop flag.
        self.requested.load(Ordering::Relaxed)
    }
}

impl Default for HaltSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a [`Machine::run`] call returned.
#[derive(Debug, Clone, PartialEq)]
pub enum RunExit {
    /// The guest executed a power-down write; carries the value written.
    PowerDown(u32),
    /// A synchronous trap arrived with traps disabled; carries the tt code.
    ErrorMode(u8),
    /// The configured step limit was reached.
    StepLimit(u64),
    /// An external halt request arrived; carries the steps executed by
    /// this `run` call before it stopped.
    Halted(u64),
    /// Non-recoverable simulator error.
    Fatal(String),
}

/// High-level machine wrapper: one CPU on one bus, plus loading, snapshots
/// and a run loop.
///
/// ```ignore
/// let mut machine = Machine::new();
/// machine.load_elf("image.elf")?;
/// let exit = machine.run(None);
/// ```
pub struct Machine {
    pub cpu: Cpu,
    pub bus: SystemBus,
    halt: Arc<HaltSignal>,
    halted: bool,
    last_trap: Option<Trap>,
}

impl Machine {
    /// Machine with the default RAM size and MMU geometry.
    pub fn new() -> Self {
        Self::with_memory(DEFAULT_DRAM_MIB * 1024 * 1024)
    }

    pub fn with_memory(dram_size_bytes: usize) -> Self {
        Self::with_config(dram_size_bytes, MmuConfig::default())
    }

    pub fn with_config(dram_size_bytes: usize, mmu: MmuConfig) -> Self {
        let bus = SystemBus::new(DRAM_BASE, dram_size_bytes);
        let cpu = Cpu::new(DRAM_BASE as u32, mmu);
        Self {
            cpu,
            bus,
            halt: Arc::new(HaltSignal::new()),
            halted: false,
            last_trap: None,
        }
    }

    /// Handle for stopping [`Machine::run`] from outside; clone it into
    /// whatever controller needs to interrupt the loop.
    pub fn halt_signal(&self) -> Arc<HaltSignal> {
        Arc::clone(&self.halt)
    }

    /// Returns `true` once execution has reached a terminal condition.
    pub fn halted(&self) -> bool {
        self.halted
    }

    /// The terminal trap that stopped the machine, if any.
    pub fn last_trap(&self) -> Option<&Trap> {
        self.last_trap.as_ref()
    }

    /// Point the reset PC pair at `entry`.
    pub fn set_entry(&mut self, entry: u32) {
        self.cpu.regs.pc = entry;
        self.cpu.regs.npc = entry.wrapping_add(4);
    }

    /// Drive the external interrupt line.
    pub fn set_irq(&mut self, line: Option<u8>) {
        self.cpu.set_irq(line);
    }

    /// Load an ELF image (or a raw binary, placed at the RAM base) from disk
    /// and point the PC at its entry.
    pub fn load_elf<P: AsRef<Path>>(&mut self, path: P) -> Result<u32, Box<dyn std::error::Error>> {
        let mut file = File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        self.load_image(&buffer)
    }

    /// Load an in-memory image, ELF or raw, and point the PC at its entry.
    pub fn load_image(&mut self, buffer: &[u8]) -> Result<u32, Box<dyn std::error::Error>> {
        let base = self.bus.dram_base();
        let entry = if loader::is_elf(buffer) {
            loader::load_elf(buffer, &mut self.bus)?
        } else {
            loader::load_raw(buffer, &mut self.bus, base)?
        };
        self.set_entry(entry);
        Ok(entry)
    }

    /// Execute a single step.
    ///
    /// Architectural traps are handled inside the CPU; an `Err` here is a
    /// terminal condition and marks the machine halted.
    pub fn step(&mut self) -> Result<Outcome, Trap> {
        match self.cpu.step(&mut self.bus) {
            Ok(outcome) => Ok(outcome),
            Err(trap) => {
                self.halted = true;
                self.last_trap = Some(trap.clone());
                Err(trap)
            }
        }
    }

    /// Run until the guest powers down, the processor enters error mode,
    /// a halt is requested, or `max_steps` is exhausted.
    pub fn run(&mut self, max_steps: Option<u64>) -> RunExit {
        let mut steps: u64 = 0;
        let mut last_report: u64 = 0;
        loop {
            if self.halt.is_halt_requested() {
                return RunExit::Halted(steps);
            }
            if let Some(limit) = max_steps {
                if steps >= limit {
                    return RunExit::StepLimit(steps);
                }
            }
            match self.step() {
                Ok(_) => steps += 1,
                Err(Trap::PowerDown(code)) => return RunExit::PowerDown(code),
                Err(Trap::ErrorMode(tt)) => return RunExit::ErrorMode(tt),
                Err(Trap::Fatal(msg)) => return RunExit::Fatal(msg),
                Err(other) => return RunExit::Fatal(format!("unexpected trap {:?}", other)),
            }
            if steps - last_report >= REPORT_INTERVAL {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!(
                        "[{} M steps] pc=0x{:x} instret={}",
                        steps / 1_000_000,
                        self.cpu.regs.pc,
                        self.cpu.instret
                    );
                }
                last_report = steps;
            }
        }
    }

    /// Flat text report of the execution counters, for end-of-run dumps.
    pub fn stats_report(&self) -> String {
        let (dhits, dmisses, dentries, drate) = self.cpu.decode_stats();
        let itlb = self.cpu.mmu.itlb();
        let dtlb = self.cpu.mmu.dtlb();
        let mut out = String::new();
        let _ = writeln!(out, "instructions retired: {}", self.cpu.instret);
        let _ = writeln!(out, "cycles:               {}", self.cpu.cycles);
        let _ = writeln!(out, "traps taken:          {}", self.cpu.traps.taken);
        let _ = writeln!(
            out,
            "decode cache:         {} hits / {} misses ({:.1}% hit), {} entries",
            dhits,
            dmisses,
            drate * 100.0,
            dentries
        );
        let _ = writeln!(
            out,
            "itlb:                 {} hits / {} misses, {} evictions",
            itlb.hits, itlb.misses, itlb.evictions
        );
        let _ = writeln!(
            out,
            "dtlb:                 {} hits / {} misses, {} evictions",
            dtlb.hits, dtlb.misses, dtlb.evictions
        );
        let _ = writeln!(
            out,
            "table walks:          {} ({} faulted)",
            self.cpu.mmu.walks, self.cpu.mmu.faults
        );
        out
    }

    /// Capture a complete, deterministic snapshot of the machine.
    pub fn snapshot(&self) -> MachineSnapshot {
        let dram_data = self.bus.dram.get_data();
        let mut hasher = Sha256::new();
        hasher.update(&dram_data);
        let hash = hex::encode(hasher.finalize());

        let region = MemRegionSnapshot {
            base: self.bus.dram.base,
            size: self.bus.dram.size() as u64,
            hash,
            data: Some(dram_data),
        };

        MachineSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            cpu: self.cpu.snapshot(),
            memory: vec![region],
        }
    }

    /// Restore machine state from a previously captured snapshot.
    pub fn apply_snapshot(&mut self, snapshot: &MachineSnapshot) -> Result<(), String> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(format!(
                "snapshot version mismatch: expected {}, found {}",
                SNAPSHOT_VERSION, snapshot.version
            ));
        }

        let region = snapshot
            .memory
            .first()
            .ok_or_else(|| "snapshot missing primary memory region".to_string())?;
        let data = region
            .data
            .as_ref()
            .ok_or_else(|| "snapshot memory region has no inline data".to_string())?;

        if self.bus.dram.base != region.base {
            return Err(format!(
                "snapshot RAM base mismatch: machine=0x{:x}, snapshot=0x{:x}",
                self.bus.dram.base, region.base
            ));
        }
        if self.bus.dram.size() != data.len() {
            return Err(format!(
                "snapshot RAM size mismatch: machine={} bytes, snapshot={} bytes",
                self.bus.dram.size(),
                data.len()
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(data);
        let current_hash = hex::encode(hasher.finalize());
        if current_hash != region.hash {
            return Err(format!(
                "snapshot RAM hash mismatch for base 0x{:x}",
                region.base
            ));
        }

        self.cpu.restore(&snapshot.cpu)?;
        self.bus
            .dram
            .set_data(data)
            .map_err(|e| format!("failed to restore RAM: {}", e))?;

        self.halted = false;
        self.last_trap = None;
        Ok(())
    }

    /// Construct a new machine from a snapshot, using the default MMU
    /// geometry. The CLI path builds its machine first and calls
    /// [`apply_snapshot`] so configured geometry survives.
    pub fn from_snapshot(snapshot: MachineSnapshot) -> Result<Self, String> {
        let region = snapshot
            .memory
            .first()
            .ok_or_else(|| "snapshot missing primary memory region".to_string())?;
        let dram_size = region
            .size
            .try_into()
            .map_err(|_| "snapshot RAM size does not fit in usize".to_string())?;

        let mut machine = Machine::with_memory(dram_size);
        machine.apply_snapshot(&snapshot)?;
        Ok(machine)
    }

    /// Save a snapshot to disk using bincode.
    pub fn save_snapshot_to_path<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let snap = self.snapshot();
        let mut file = File::create(path)?;
        bincode::serialize_into(&mut file, &snap)?;
        file.flush()?;
        Ok(())
    }

    /// Load a snapshot from disk and construct a new machine from it.
    pub fn load_snapshot_from_path<P: AsRef<Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut file = File::open(path)?;
        let snapshot: MachineSnapshot = bincode::deserialize_from(&mut file)?;
        let machine = Machine::from_snapshot(snapshot).map_err(std::io::Error::other)?;
        Ok(machine)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
