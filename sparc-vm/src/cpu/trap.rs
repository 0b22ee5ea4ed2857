use serde::{Deserialize, Serialize};

use crate::cpu::regs::RegisterFile;
use crate::cpu::types::Trap;

/// Trap controller phase, visible for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapState {
    Normal,
    TrapPending,
    TrapDispatch,
}

/// A captured but not yet delivered trap cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTrap {
    pub cause: Trap,
    pub pc: u32,
    pub npc: u32,
}

/// Detects, prioritizes and delivers traps.
///
/// At most one cause is pending at a time: when several arise in one cycle,
/// only the highest-priority one is retained and the rest are discarded.
/// Delivery happens at the top of the next engine step, before any fetch.
pub struct TrapController {
    state: TrapState,
    pending: Option<PendingTrap>,
    /// Count of traps actually delivered.
    pub taken: u64,
}

impl TrapController {
    pub fn new() -> Self {
        Self {
            state: TrapState::Normal,
            pending: None,
            taken: 0,
        }
    }

    pub fn state(&self) -> TrapState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingTrap> {
        self.pending.as_ref()
    }

    /// Drop a pending cause without delivering it (interrupt deassertion).
    pub fn cancel(&mut self) {
        self.pending = None;
        self.state = TrapState::Normal;
    }

    /// Reinstate a pending cause from a snapshot.
    pub fn set_pending(&mut self, pending: Option<PendingTrap>) {
        self.state = if pending.is_some() {
            TrapState::TrapPending
        } else {
            TrapState::Normal
        };
        self.pending = pending;
    }

    /// Record an architectural cause against the faulting PC/NPC pair.
    /// A lower-priority cause never displaces a pending higher-priority one.
    pub fn raise(&mut self, cause: Trap, pc: u32, npc: u32) {
        debug_assert!(cause.is_architectural());
        if let Some(existing) = &self.pending {
            if existing.cause.priority() <= cause.priority() {
                log::trace!(
                    "trap {:?} discarded, {:?} already pending",
                    cause,
                    existing.cause
                );
                return;
            }
        }
        self.pending = Some(PendingTrap { cause, pc, npc });
        self.state = TrapState::TrapPending;
    }

    /// Deliver the pending trap, if any, redirecting control through TBR.
    ///
    /// Returns `Ok(true)` when a trap was dispatched, `Ok(false)` when there
    /// was nothing to do (or a masked interrupt was discarded). A
    /// synchronous cause arriving with ET=0 cannot be delivered: the
    /// processor enters error mode, surfaced as `Err(Trap::ErrorMode)`.
    pub fn deliver(&mut self, regs: &mut RegisterFile) -> Result<bool, Trap> {
        let Some(pending) = self.pending.take() else {
            return Ok(false);
        };
        self.state = TrapState::TrapDispatch;
        let tt = pending.cause.tt();

        if let Trap::Reset = pending.cause {
            regs.set_tbr_tt(0);
            regs.set_supervisor(true);
            regs.set_traps_enabled(false);
            regs.pc = 0;
            regs.npc = 4;
            self.state = TrapState::Normal;
            self.taken += 1;
            log::debug!("reset trap taken");
            return Ok(true);
        }

        if !regs.traps_enabled() {
            if pending.cause.is_interrupt() {
                // Interrupts are merely masked by ET=0.
                self.state = TrapState::Normal;
                return Ok(false);
            }
            log::warn!(
                "trap {:?} (tt={:#04x}) with ET=0 at pc={:#010x}: error mode",
                pending.cause,
                tt,
                pending.pc
            );
            self.state = TrapState::Normal;
            return Err(Trap::ErrorMode(tt));
        }

        // Entry sequence: PS <- S, supervisor on, traps off, one window
        // down, trapped PC pair into %l1/%l2 of that window. The window
        // save is unconditional: WIM is not consulted, otherwise a
        // window-fault trap could never be entered.
        let was_supervisor = regs.supervisor();
        regs.set_prev_supervisor(was_supervisor);
        regs.set_supervisor(true);
        regs.set_traps_enabled(false);
        regs.rotate_window_for_trap();
        regs.write(17, pending.pc);
        regs.write(18, pending.npc);
        regs.set_tbr_tt(tt);
        regs.pc = regs.tbr();
        regs.npc = regs.tbr().wrapping_add(4);

        self.state = TrapState::Normal;
        self.taken += 1;
        log::debug!(
            "trap {:?} (tt={:#04x}) taken at pc={:#010x}, vector={:#010x}, cwp={}",
            pending.cause,
            tt,
            pending.pc,
            regs.pc,
            regs.cwp()
        );
        Ok(true)
    }
}

impl Default for TrapController {
    fn default() -> Self {
        Self::new()
    }
}
