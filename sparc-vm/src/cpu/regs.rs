use serde::{Deserialize, Serialize};

/// Number of implemented register windows.
pub const NUM_WINDOWS: usize = 8;
/// Windowed registers per window (8 outs + 8 locals; ins alias the next
/// window's outs).
const WINDOW_REGS: usize = 16;
/// Physical windowed backing registers.
const WINDOW_BACKING: usize = NUM_WINDOWS * WINDOW_REGS;

/// PSR reset value: impl=0xF ver=3, supervisor, traps disabled, window 0.
pub const PSR_RESET: u32 = 0xF300_0080;

// PSR fields. impl/ver are read-only; EC/EF always read zero (no FPU or
// coprocessor), and the reserved bits stay clear, so writes are masked to
// icc | PIL | S | PS | ET | CWP.
const PSR_IMPL_VER: u32 = 0xF300_0000;
const PSR_WRITE_MASK: u32 = 0x00F0_0FFF & !0x0000_3000;
const PSR_ICC_MASK: u32 = 0x00F0_0000;
const PSR_N: u32 = 1 << 23;
const PSR_Z: u32 = 1 << 22;
const PSR_V: u32 = 1 << 21;
const PSR_C: u32 = 1 << 20;
const PSR_PIL_SHIFT: u32 = 8;
const PSR_PIL_MASK: u32 = 0xF << PSR_PIL_SHIFT;
const PSR_S: u32 = 1 << 7;
const PSR_PS: u32 = 1 << 6;
const PSR_ET: u32 = 1 << 5;
const PSR_CWP_MASK: u32 = 0x1F;

// TBR: base [31:12], tt [11:4], zero [3:0].
const TBR_BASE_MASK: u32 = 0xFFFF_F000;
const TBR_TT_SHIFT: u32 = 4;
const TBR_TT_MASK: u32 = 0xFF << TBR_TT_SHIFT;

/// Version tag of the register-file snapshot layout.
pub const REGFILE_SNAPSHOT_VERSION: &str = "1.0";

/// Window rotation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOp {
    Save,
    Restore,
}

/// Rotation into a WIM-invalid window; the caller turns this into a trap
/// without any state having changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFault {
    Overflow,
    Underflow,
}

/// The integer unit's architectural register state.
///
/// The 24 windowed registers visible at any time are index arithmetic over
/// one flat backing array: logical r8..r31 of window `w` live at
/// `(w*16 + i-8) % 128`, which makes window `w`'s ins the same cells as
/// window `w-1`'s outs. There is no alias graph to maintain; SP/FP/LR/PCR
/// are computed from CWP on demand.
pub struct RegisterFile {
    globals: [u32; 8],
    windows: [u32; WINDOW_BACKING],
    asr: [u32; 32],
    psr: u32,
    wim: u32,
    tbr: u32,
    y: u32,
    pub pc: u32,
    pub npc: u32,
    /// Control-transfer override for the current instruction; consumed by
    /// the engine in place of the default PC advance.
    redirect: Option<(u32, u32)>,
}

/// Flat, versioned serialization of the visible register state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegFileSnapshot {
    pub version: String,
    pub globals: [u32; 8],
    pub windows: Vec<u32>,
    pub asr: Vec<u32>,
    pub psr: u32,
    pub wim: u32,
    pub tbr: u32,
    pub y: u32,
    pub pc: u32,
    pub npc: u32,
}

impl RegisterFile {
    pub fn new(entry: u32) -> Self {
        let mut regs = Self {
            globals: [0; 8],
            windows: [0; WINDOW_BACKING],
            asr: [0; 32],
            psr: PSR_RESET,
            wim: 0,
            tbr: 0,
            y: 0,
            pc: 0,
            npc: 0,
            redirect: None,
        };
        regs.reset(entry);
        regs
    }

    /// Architectural reset. ASR17 carries the configuration word (8 windows,
    /// single processor).
    pub fn reset(&mut self, entry: u32) {
        self.globals = [0; 8];
        self.windows = [0; WINDOW_BACKING];
        self.asr = [0; 32];
        self.asr[17] = 0x307;
        self.psr = PSR_RESET;
        self.wim = 0;
        self.tbr = 0;
        self.y = 0;
        self.pc = entry;
        self.npc = entry.wrapping_add(4);
        self.redirect = None;
    }

    #[inline(always)]
    fn window_slot(&self, index: usize) -> usize {
        (self.cwp() as usize * WINDOW_REGS + (index - 8)) % WINDOW_BACKING
    }

    /// Read logical register 0..=31 through the current window. %g0 is
    /// hardwired to zero.
    #[inline(always)]
    pub fn read(&self, index: usize) -> u32 {
        debug_assert!(index < 32);
        match index {
            0 => 0,
            1..=7 => self.globals[index],
            _ => self.windows[self.window_slot(index)],
        }
    }

    /// Write logical register 0..=31; writes to %g0 are discarded.
    #[inline(always)]
    pub fn write(&mut self, index: usize, value: u32) {
        debug_assert!(index < 32);
        match index {
            0 => {}
            1..=7 => self.globals[index] = value,
            _ => {
                let slot = self.window_slot(index);
                self.windows[slot] = value;
            }
        }
    }

    // ---- PSR ----

    pub fn psr(&self) -> u32 {
        self.psr
    }

    /// Masked PSR write: icc, PIL, S, PS, ET and CWP are writable; impl/ver
    /// and the unimplemented EC/EF bits are protected. Callers validate the
    /// CWP range before writing.
    pub fn set_psr(&mut self, value: u32) {
        self.psr = (value & PSR_WRITE_MASK) | PSR_IMPL_VER;
    }

    #[inline(always)]
    pub fn cwp(&self) -> u32 {
        self.psr & PSR_CWP_MASK
    }

    fn set_cwp(&mut self, cwp: u32) {
        debug_assert!(cwp < NUM_WINDOWS as u32);
        self.psr = (self.psr & !PSR_CWP_MASK) | cwp;
    }

    pub fn flag_n(&self) -> bool {
        self.psr & PSR_N != 0
    }

    pub fn flag_z(&self) -> bool {
        self.psr & PSR_Z != 0
    }

    pub fn flag_v(&self) -> bool {
        self.psr & PSR_V != 0
    }

    pub fn flag_c(&self) -> bool {
        self.psr & PSR_C != 0
    }

    pub fn set_icc(&mut self, n: bool, z: bool, v: bool, c: bool) {
        let mut icc = 0;
        if n {
            icc |= PSR_N;
        }
        if z {
            icc |= PSR_Z;
        }
        if v {
            icc |= PSR_V;
        }
        if c {
            icc |= PSR_C;
        }
        self.psr = (self.psr & !PSR_ICC_MASK) | icc;
    }

    pub fn supervisor(&self) -> bool {
        self.psr & PSR_S != 0
    }

    pub fn set_supervisor(&mut self, s: bool) {
        self.psr = if s { self.psr | PSR_S } else { self.psr & !PSR_S };
    }

    pub fn prev_supervisor(&self) -> bool {
        self.psr & PSR_PS != 0
    }

    pub fn set_prev_supervisor(&mut self, ps: bool) {
        self.psr = if ps {
            self.psr | PSR_PS
        } else {
            self.psr & !PSR_PS
        };
    }

    pub fn traps_enabled(&self) -> bool {
        self.psr & PSR_ET != 0
    }

    pub fn set_traps_enabled(&mut self, et: bool) {
        self.psr = if et { self.psr | PSR_ET } else { self.psr & !PSR_ET };
    }

    pub fn pil(&self) -> u8 {
        ((self.psr & PSR_PIL_MASK) >> PSR_PIL_SHIFT) as u8
    }

    pub fn set_pil(&mut self, pil: u8) {
        self.psr =
            (self.psr & !PSR_PIL_MASK) | (((pil as u32) << PSR_PIL_SHIFT) & PSR_PIL_MASK);
    }

    // ---- WIM / TBR / Y / ASR ----

    pub fn wim(&self) -> u32 {
        self.wim
    }

    /// WIM bits for unimplemented windows read as zero.
    pub fn set_wim(&mut self, value: u32) {
        self.wim = value & ((1 << NUM_WINDOWS) - 1);
    }

    pub fn tbr(&self) -> u32 {
        self.tbr
    }

    /// WRTBR reaches only the base field; tt is owned by trap entry.
    pub fn set_tbr_base(&mut self, value: u32) {
        self.tbr = (value & TBR_BASE_MASK) | (self.tbr & TBR_TT_MASK);
    }

    pub fn set_tbr_tt(&mut self, tt: u8) {
        self.tbr = (self.tbr & !TBR_TT_MASK) | ((tt as u32) << TBR_TT_SHIFT);
    }

    pub fn tbr_tt(&self) -> u8 {
        ((self.tbr & TBR_TT_MASK) >> TBR_TT_SHIFT) as u8
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn set_y(&mut self, value: u32) {
        self.y = value;
    }

    pub fn asr(&self, index: usize) -> u32 {
        self.asr[index & 31]
    }

    pub fn set_asr(&mut self, index: usize, value: u32) {
        self.asr[index & 31] = value;
    }

    // ---- Window rotation ----

    /// Rotate the current window. `Save` moves to CWP-1, `Restore` to CWP+1
    /// (mod 8); if WIM marks the target invalid, nothing changes and the
    /// corresponding fault is returned for the trap controller to deliver.
    pub fn rotate_window(&mut self, op: WindowOp) -> Result<(), WindowFault> {
        let cwp = self.cwp() as usize;
        let (target, fault) = match op {
            WindowOp::Save => ((cwp + NUM_WINDOWS - 1) % NUM_WINDOWS, WindowFault::Overflow),
            WindowOp::Restore => ((cwp + 1) % NUM_WINDOWS, WindowFault::Underflow),
        };
        if self.wim & (1 << target) != 0 {
            return Err(fault);
        }
        self.set_cwp(target as u32);
        Ok(())
    }

    /// Trap-entry window save: always takes the new window, bypassing WIM.
    pub fn rotate_window_for_trap(&mut self) {
        let cwp = self.cwp() as usize;
        self.set_cwp(((cwp + NUM_WINDOWS - 1) % NUM_WINDOWS) as u32);
    }

    // ---- Named aliases (pure functions of CWP) ----

    pub fn sp(&self) -> u32 {
        self.read(14)
    }

    pub fn set_sp(&mut self, value: u32) {
        self.write(14, value);
    }

    pub fn fp(&self) -> u32 {
        self.read(30)
    }

    pub fn set_fp(&mut self, value: u32) {
        self.write(30, value);
    }

    pub fn lr(&self) -> u32 {
        self.read(31)
    }

    pub fn set_lr(&mut self, value: u32) {
        self.write(31, value);
    }

    pub fn pcr(&self) -> u32 {
        self.asr(17)
    }

    pub fn set_pcr(&mut self, value: u32) {
        self.set_asr(17, value);
    }

    // ---- Control transfer ----

    /// Replace the default PC advance for this instruction.
    pub fn redirect(&mut self, pc: u32, npc: u32) {
        self.redirect = Some((pc, npc));
    }

    pub fn take_redirect(&mut self) -> Option<(u32, u32)> {
        self.redirect.take()
    }

    // ---- Snapshot ----

    pub fn snapshot(&self) -> RegFileSnapshot {
        RegFileSnapshot {
            version: REGFILE_SNAPSHOT_VERSION.to_string(),
            globals: self.globals,
            windows: self.windows.to_vec(),
            asr: self.asr.to_vec(),
            psr: self.psr,
            wim: self.wim,
            tbr: self.tbr,
            y: self.y,
            pc: self.pc,
            npc: self.npc,
        }
    }

    pub fn restore(&mut self, snap: &RegFileSnapshot) -> Result<(), String> {
        if snap.version != REGFILE_SNAPSHOT_VERSION {
            return Err(format!(
                "register snapshot version mismatch: expected {}, found {}",
                REGFILE_SNAPSHOT_VERSION, snap.version
            ));
        }
        if snap.windows.len() != WINDOW_BACKING {
            return Err(format!(
                "register snapshot has {} window registers, expected {}",
                snap.windows.len(),
                WINDOW_BACKING
            ));
        }
        if snap.asr.len() != 32 {
            return Err(format!(
                "register snapshot has {} ASRs, expected 32",
                snap.asr.len()
            ));
        }
        self.globals = snap.globals;
        self.windows.copy_from_slice(&snap.windows);
        self.asr.copy_from_slice(&snap.asr);
        self.psr = snap.psr;
        self.wim = snap.wim;
        self.tbr = snap.tbr;
        self.y = snap.y;
        self.pc = snap.pc;
        self.npc = snap.npc;
        self.redirect = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g0_is_hardwired_to_zero() {
        let mut regs = RegisterFile::new(0);
        regs.write(0, 0xFFFF_FFFF);
        assert_eq!(regs.read(0), 0);
    }

    #[test]
    fn outs_become_ins_after_save() {
        let mut regs = RegisterFile::new(0);
        regs.set_wim(0);
        regs.write(8, 0x1111_0000); // %o0
        regs.write(15, 0x2222_0000); // %o7
        regs.rotate_window(WindowOp::Save).unwrap();
        assert_eq!(regs.read(24), 0x1111_0000); // %i0
        assert_eq!(regs.read(31), 0x2222_0000); // %i7
    }

    #[test]
    fn full_rotation_round_trips_every_window() {
        let mut regs = RegisterFile::new(0);
        regs.set_wim(0);
        let start_cwp = regs.cwp();

        // Stamp a distinct local in each window on the way down.
        for w in 0..NUM_WINDOWS {
            regs.write(16, 0xAB00 + w as u32);
            regs.rotate_window(WindowOp::Save).unwrap();
        }
        assert_eq!(regs.cwp(), start_cwp);

        for w in (0..NUM_WINDOWS).rev() {
            regs.rotate_window(WindowOp::Restore).unwrap();
            assert_eq!(regs.read(16), 0xAB00 + w as u32);
        }
        assert_eq!(regs.cwp(), start_cwp);
    }

    #[test]
    fn save_into_invalid_window_faults_without_moving() {
        let mut regs = RegisterFile::new(0);
        regs.set_wim(0x01);
        regs.set_psr(regs.psr() & !0x1F | 1); // CWP = 1
        assert_eq!(regs.cwp(), 1);

        let res = regs.rotate_window(WindowOp::Save);
        assert_eq!(res, Err(WindowFault::Overflow));
        assert_eq!(regs.cwp(), 1);
    }

    #[test]
    fn restore_into_invalid_window_underflows() {
        let mut regs = RegisterFile::new(0);
        regs.set_wim(0x02);
        assert_eq!(regs.cwp(), 0);
        assert_eq!(
            regs.rotate_window(WindowOp::Restore),
            Err(WindowFault::Underflow)
        );
        assert_eq!(regs.cwp(), 0);
    }

    #[test]
    fn trap_entry_rotation_ignores_wim() {
        let mut regs = RegisterFile::new(0);
        regs.set_wim(0xFF);
        regs.rotate_window_for_trap();
        assert_eq!(regs.cwp(), (NUM_WINDOWS - 1) as u32);
    }

    #[test]
    fn psr_write_protects_impl_and_ver() {
        let mut regs = RegisterFile::new(0);
        regs.set_psr(0x0000_00A7);
        assert_eq!(regs.psr() & 0xFF00_0000, 0xF300_0000);
        assert_eq!(regs.psr() & 0x1F, 0x07);
        // EC/EF stay clear.
        regs.set_psr(0xFFFF_FFFF & !0x18); // keep a sane CWP
        assert_eq!(regs.psr() & 0x3000, 0);
    }

    #[test]
    fn wrtbr_leaves_tt_untouched() {
        let mut regs = RegisterFile::new(0);
        regs.set_tbr_tt(0x2A);
        regs.set_tbr_base(0xDEAD_BFFF);
        assert_eq!(regs.tbr(), 0xDEAD_B000 | (0x2A << 4));
        assert_eq!(regs.tbr_tt(), 0x2A);
    }

    #[test]
    fn aliases_track_the_current_window() {
        let mut regs = RegisterFile::new(0);
        regs.set_wim(0);
        regs.set_sp(0xF000_0000);
        regs.rotate_window(WindowOp::Save).unwrap();
        // The old SP (%o6) is now the FP (%i6).
        assert_eq!(regs.fp(), 0xF000_0000);
        regs.set_sp(0xE000_0000);
        regs.rotate_window(WindowOp::Restore).unwrap();
        assert_eq!(regs.sp(), 0xF000_0000);
    }

    #[test]
    fn snapshot_restore_is_identity() {
        let mut regs = RegisterFile::new(0x4000_0000);
        regs.set_wim(0x10);
        regs.set_psr(regs.psr() | 0x00F0_0F00);
        regs.set_y(0x1234_5678);
        regs.set_tbr_base(0x8000_0000);
        regs.set_tbr_tt(0x09);
        for i in 1..32 {
            regs.write(i, (i as u32) * 0x0101_0101);
        }
        for i in 0..32 {
            regs.set_asr(i, 0xA500_0000 | i as u32);
        }

        let snap = regs.snapshot();
        let mut other = RegisterFile::new(0);
        other.restore(&snap).unwrap();
        assert_eq!(other.snapshot(), snap);
    }

    #[test]
    fn restore_rejects_wrong_version() {
        let mut regs = RegisterFile::new(0);
        let mut snap = regs.snapshot();
        snap.version = "0.0".to_string();
        assert!(regs.restore(&snap).is_err());
    }
}
