use serde::{Deserialize, Serialize};

/// Architectural trap causes plus host-level terminal conditions.
///
/// Architectural variants carry the V8 trap-type code (see [`Trap::tt`]) and
/// a delivery priority (see [`Trap::priority`]); they are absorbed by the trap
/// controller and never escape the engine. The host-level variants
/// (`PowerDown`, `ErrorMode`, `Fatal`) never enter the trap table and are the
/// only causes a caller of `Cpu::step` observes as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Trap {
    Reset,
    InstructionAccessException(u32),
    InstructionAccessError(u32),
    IllegalInstruction(u32),
    PrivilegedInstruction,
    FpDisabled,
    CpDisabled,
    WindowOverflow,
    WindowUnderflow,
    MemAddressNotAligned(u32),
    DataAccessException(u32),
    DataAccessError(u32),
    TagOverflow,
    DivisionByZero,
    /// Ticc software trap; payload is the 7-bit trap number.
    TrapInstruction(u8),
    /// External interrupt, level 1..=15.
    Interrupt(u8),

    // Host-level terminal conditions
    /// Guest wrote %asr19; payload is the written value (exit code).
    PowerDown(u32),
    /// Synchronous trap taken while ET=0; payload is the trap type that
    /// could not be delivered.
    ErrorMode(u8),
    Fatal(String),
}

impl Trap {
    /// V8 trap-type code written into TBR.tt on delivery.
    pub fn tt(&self) -> u8 {
        match self {
            Trap::Reset => 0x00,
            Trap::InstructionAccessException(_) => 0x01,
            Trap::IllegalInstruction(_) => 0x02,
            Trap::PrivilegedInstruction => 0x03,
            Trap::FpDisabled => 0x04,
            Trap::WindowOverflow => 0x05,
            Trap::WindowUnderflow => 0x06,
            Trap::MemAddressNotAligned(_) => 0x07,
            Trap::DataAccessException(_) => 0x09,
            Trap::TagOverflow => 0x0A,
            Trap::InstructionAccessError(_) => 0x21,
            Trap::CpDisabled => 0x24,
            Trap::DataAccessError(_) => 0x29,
            Trap::DivisionByZero => 0x2A,
            Trap::TrapInstruction(n) => 0x80 | (n & 0x7F),
            Trap::Interrupt(l) => 0x10 + (l & 0x0F),
            // Host-level causes never reach the trap table.
            Trap::PowerDown(_) | Trap::ErrorMode(_) | Trap::Fatal(_) => 0x00,
        }
    }

    /// Delivery priority; lower rank wins when several causes arise in the
    /// same cycle. Interrupts rank below all synchronous causes, higher
    /// levels first.
    pub fn priority(&self) -> u8 {
        match self {
            Trap::Reset => 1,
            Trap::DataAccessException(_) | Trap::DataAccessError(_) => 2,
            Trap::InstructionAccessException(_) | Trap::InstructionAccessError(_) => 3,
            Trap::PrivilegedInstruction => 4,
            Trap::IllegalInstruction(_) => 5,
            Trap::FpDisabled | Trap::CpDisabled => 6,
            Trap::WindowOverflow | Trap::WindowUnderflow => 7,
            Trap::MemAddressNotAligned(_) => 8,
            Trap::TagOverflow => 9,
            Trap::DivisionByZero => 10,
            Trap::TrapInstruction(_) => 11,
            Trap::Interrupt(l) => 12 + (15 - (l & 0x0F)),
            Trap::PowerDown(_) | Trap::ErrorMode(_) | Trap::Fatal(_) => u8::MAX,
        }
    }

    /// True for causes delivered through the trap table.
    pub fn is_architectural(&self) -> bool {
        !matches!(
            self,
            Trap::PowerDown(_) | Trap::ErrorMode(_) | Trap::Fatal(_)
        )
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Trap::Interrupt(_))
    }
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Trap {}

/// Classification of a memory access for translation and fault reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Load,
    Store,
    Execute,
}

impl AccessType {
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Store)
    }

    pub fn is_instruction(self) -> bool {
        matches!(self, AccessType::Execute)
    }

    /// SRMMU access-type field: (write << 2) | (instruction << 1) | supervisor.
    pub fn at_code(self, supervisor: bool) -> u32 {
        ((self.is_write() as u32) << 2)
            | ((self.is_instruction() as u32) << 1)
            | (supervisor as u32)
    }

    /// Default ASI for this access: 0x8/0x9 instruction, 0xA/0xB data, the
    /// low bit tracking the supervisor state.
    pub fn asi(self, supervisor: bool) -> u8 {
        if self.is_instruction() {
            0x8 | supervisor as u8
        } else {
            0xA | supervisor as u8
        }
    }

    /// The trap cause reported when this access faults at `addr`.
    pub fn fault(self, addr: u32) -> Trap {
        if self.is_instruction() {
            Trap::InstructionAccessException(addr)
        } else {
            Trap::DataAccessException(addr)
        }
    }

    /// The trap cause for a physical bus error during this access.
    pub fn bus_error(self, addr: u32) -> Trap {
        if self.is_instruction() {
            Trap::InstructionAccessError(addr)
        } else {
            Trap::DataAccessError(addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_types_match_the_v8_table() {
        assert_eq!(Trap::InstructionAccessException(0).tt(), 0x01);
        assert_eq!(Trap::IllegalInstruction(0).tt(), 0x02);
        assert_eq!(Trap::WindowOverflow.tt(), 0x05);
        assert_eq!(Trap::WindowUnderflow.tt(), 0x06);
        assert_eq!(Trap::DataAccessException(0).tt(), 0x09);
        assert_eq!(Trap::DivisionByZero.tt(), 0x2A);
        assert_eq!(Trap::TrapInstruction(0x12).tt(), 0x92);
        assert_eq!(Trap::Interrupt(15).tt(), 0x1F);
        assert_eq!(Trap::Interrupt(1).tt(), 0x11);
    }

    #[test]
    fn priority_orders_the_cause_classes() {
        // data fault > instruction fault > privileged > illegal > window
        // fault > trap instruction > interrupt, with reset above all.
        let order = [
            Trap::Reset,
            Trap::DataAccessException(0),
            Trap::InstructionAccessException(0),
            Trap::PrivilegedInstruction,
            Trap::IllegalInstruction(0),
            Trap::WindowOverflow,
            Trap::TrapInstruction(0),
            Trap::Interrupt(15),
        ];
        for pair in order.windows(2) {
            assert!(
                pair[0].priority() < pair[1].priority(),
                "{:?} should outrank {:?}",
                pair[0],
                pair[1]
            );
        }
        // Higher interrupt levels outrank lower ones.
        assert!(Trap::Interrupt(15).priority() < Trap::Interrupt(1).priority());
    }

    #[test]
    fn access_type_encodes_the_at_field() {
        assert_eq!(AccessType::Load.at_code(false), 0);
        assert_eq!(AccessType::Load.at_code(true), 1);
        assert_eq!(AccessType::Execute.at_code(false), 2);
        assert_eq!(AccessType::Execute.at_code(true), 3);
        assert_eq!(AccessType::Store.at_code(false), 4);
        assert_eq!(AccessType::Store.at_code(true), 5);
    }
}
