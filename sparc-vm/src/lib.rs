pub mod bus;
pub mod cpu;
pub mod dram;
pub mod emulator;
pub mod loader;
pub mod mmu;
pub mod snapshot;

pub use cpu::types::Trap;
