pub mod abi;
pub mod core;
pub mod decode;
pub mod execution;
pub mod regs;
pub mod trap;
pub mod types;

pub use core::Cpu;
pub use execution::Outcome;
pub use regs::RegisterFile;
pub use trap::TrapController;
pub use types::{AccessType, Trap};
