use std::collections::HashMap;

/// Default capacity of the decode cache.
pub const DECODE_CACHE_SIZE: usize = 4096;

/// Decoded instruction class.
///
/// `Invalid` is a legitimate identifier: execution resolves it to an
/// illegal-instruction trap, so decoding itself is total and never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeId {
    // Format 1/2
    Call,
    Sethi,
    Bicc,
    Unimp,

    // Format 3, op=2: logical
    And,
    Andcc,
    Andn,
    Andncc,
    Or,
    Orcc,
    Orn,
    Orncc,
    Xor,
    Xorcc,
    Xnor,
    Xnorcc,

    // Shifts
    Sll,
    Srl,
    Sra,

    // Arithmetic
    Add,
    Addcc,
    Addx,
    Addxcc,
    Sub,
    Subcc,
    Subx,
    Subxcc,
    Taddcc,
    Tsubcc,
    Taddcctv,
    Tsubcctv,
    Mulscc,
    Umul,
    Smul,
    Umulcc,
    Smulcc,
    Udiv,
    Sdiv,
    Udivcc,
    Sdivcc,

    // State register access
    Rdasr,
    Rdpsr,
    Rdwim,
    Rdtbr,
    Wrasr,
    Wrpsr,
    Wrwim,
    Wrtbr,

    // Control transfer
    Jmpl,
    Rett,
    Ticc,
    Flush,
    Save,
    Restore,

    // Format 3, op=3: memory
    Ld,
    Ldub,
    Lduh,
    Ldd,
    Ldsb,
    Ldsh,
    St,
    Stb,
    Sth,
    Std,
    Ldstub,
    Swap,
    Lda,
    Lduba,
    Lduha,
    Ldda,
    Ldsba,
    Ldsha,
    Sta,
    Stba,
    Stha,
    Stda,
    Ldstuba,
    Swapa,

    // Floating-point / coprocessor surfaces (no FPU or CP attached; these
    // resolve to the corresponding disabled trap)
    FpOp,
    CpOp,

    Invalid,
}

/// Pre-extracted operand fields for one instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub op: OpcodeId,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    /// Format-3 immediate select (the i bit).
    pub imm: bool,
    pub simm13: i32,
    pub asi: u8,
    pub cond: u8,
    pub annul: bool,
    /// Branch displacement in instructions (unscaled, sign-extended).
    pub disp22: i32,
    /// Call displacement in instructions (unscaled, sign-extended).
    pub disp30: i32,
    /// SETHI immediate, unshifted.
    pub imm22: u32,
}

#[inline(always)]
fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Classify a raw instruction word. Deterministic and total.
pub fn decode(word: u32) -> OpcodeId {
    let op = word >> 30;
    match op {
        1 => OpcodeId::Call,
        0 => match (word >> 22) & 0x7 {
            0 => OpcodeId::Unimp,
            2 => OpcodeId::Bicc,
            4 => OpcodeId::Sethi,
            6 => OpcodeId::FpOp,
            7 => OpcodeId::CpOp,
            _ => OpcodeId::Invalid,
        },
        2 => match (word >> 19) & 0x3F {
            0x00 => OpcodeId::Add,
            0x01 => OpcodeId::And,
            0x02 => OpcodeId::Or,
            0x03 => OpcodeId::Xor,
            0x04 => OpcodeId::Sub,
            0x05 => OpcodeId::Andn,
            0x06 => OpcodeId::Orn,
            0x07 => OpcodeId::Xnor,
            0x08 => OpcodeId::Addx,
            0x0A => OpcodeId::Umul,
            0x0B => OpcodeId::Smul,
            0x0C => OpcodeId::Subx,
            0x0E => OpcodeId::Udiv,
            0x0F => OpcodeId::Sdiv,
            0x10 => OpcodeId::Addcc,
            0x11 => OpcodeId::Andcc,
            0x12 => OpcodeId::Orcc,
            0x13 => OpcodeId::Xorcc,
            0x14 => OpcodeId::Subcc,
            0x15 => OpcodeId::Andncc,
            0x16 => OpcodeId::Orncc,
            0x17 => OpcodeId::Xnorcc,
            0x18 => OpcodeId::Addxcc,
            0x1A => OpcodeId::Umulcc,
            0x1B => OpcodeId::Smulcc,
            0x1C => OpcodeId::Subxcc,
            0x1E => OpcodeId::Udivcc,
            0x1F => OpcodeId::Sdivcc,
            0x20 => OpcodeId::Taddcc,
            0x21 => OpcodeId::Tsubcc,
            0x22 => OpcodeId::Taddcctv,
            0x23 => OpcodeId::Tsubcctv,
            0x24 => OpcodeId::Mulscc,
            0x25 => OpcodeId::Sll,
            0x26 => OpcodeId::Srl,
            0x27 => OpcodeId::Sra,
            0x28 => OpcodeId::Rdasr,
            0x29 => OpcodeId::Rdpsr,
            0x2A => OpcodeId::Rdwim,
            0x2B => OpcodeId::Rdtbr,
            0x30 => OpcodeId::Wrasr,
            0x31 => OpcodeId::Wrpsr,
            0x32 => OpcodeId::Wrwim,
            0x33 => OpcodeId::Wrtbr,
            0x34 | 0x35 => OpcodeId::FpOp,
            0x36 | 0x37 => OpcodeId::CpOp,
            0x38 => OpcodeId::Jmpl,
            0x39 => OpcodeId::Rett,
            0x3A => OpcodeId::Ticc,
            0x3B => OpcodeId::Flush,
            0x3C => OpcodeId::Save,
            0x3D => OpcodeId::Restore,
            _ => OpcodeId::Invalid,
        },
        _ => match (word >> 19) & 0x3F {
            0x00 => OpcodeId::Ld,
            0x01 => OpcodeId::Ldub,
            0x02 => OpcodeId::Lduh,
            0x03 => OpcodeId::Ldd,
            0x04 => OpcodeId::St,
            0x05 => OpcodeId::Stb,
            0x06 => OpcodeId::Sth,
            0x07 => OpcodeId::Std,
            0x09 => OpcodeId::Ldsb,
            0x0A => OpcodeId::Ldsh,
            0x0D => OpcodeId::Ldstub,
            0x0F => OpcodeId::Swap,
            0x10 => OpcodeId::Lda,
            0x11 => OpcodeId::Lduba,
            0x12 => OpcodeId::Lduha,
            0x13 => OpcodeId::Ldda,
            0x14 => OpcodeId::Sta,
            0x15 => OpcodeId::Stba,
            0x16 => OpcodeId::Stha,
            0x17 => OpcodeId::Stda,
            0x19 => OpcodeId::Ldsba,
            0x1A => OpcodeId::Ldsha,
            0x1D => OpcodeId::Ldstuba,
            0x1F => OpcodeId::Swapa,
            0x20..=0x27 => OpcodeId::FpOp,
            0x30..=0x37 => OpcodeId::CpOp,
            _ => OpcodeId::Invalid,
        },
    }
}

/// Extract the full operand record for a word. Pure; the decode cache only
/// memoizes this.
pub fn extract(word: u32) -> Decoded {
    Decoded {
        op: decode(word),
        rd: ((word >> 25) & 0x1F) as u8,
        rs1: ((word >> 14) & 0x1F) as u8,
        rs2: (word & 0x1F) as u8,
        imm: word & (1 << 13) != 0,
        simm13: sign_extend(word & 0x1FFF, 13),
        asi: ((word >> 5) & 0xFF) as u8,
        cond: ((word >> 25) & 0xF) as u8,
        annul: word & (1 << 29) != 0,
        disp22: sign_extend(word & 0x3F_FFFF, 22),
        disp30: sign_extend(word & 0x3FFF_FFFF, 30),
        imm22: word & 0x3F_FFFF,
    }
}

/// Memoized decode results keyed by the raw instruction word.
///
/// Decoding is a pure function of the bits, so entries never go stale; the
/// cache exists purely to skip re-extraction on hot words. When full it is
/// cleared wholesale, which cannot affect observable behavior.
pub struct DecodeCache {
    entries: HashMap<u32, Decoded>,
    capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::with_capacity(DECODE_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Resolve a word through the cache.
    #[inline]
    pub fn lookup(&mut self, word: u32) -> Decoded {
        if let Some(entry) = self.entries.get(&word) {
            self.hits += 1;
            return *entry;
        }
        self.misses += 1;
        let entry = extract(word);
        if self.entries.len() >= self.capacity {
            self.entries.clear();
        }
        self.entries.insert(word, entry);
        entry
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses, resident entries, hit rate).
    pub fn stats(&self) -> (u64, u64, usize, f64) {
        let total = self.hits + self.misses;
        let hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
        (self.hits, self.misses, self.entries.len(), hit_rate)
    }
}

impl Default for DecodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_representative_encodings() {
        // add %g1, %g2, %g3
        assert_eq!(decode(0x8600_4002), OpcodeId::Add);
        // sethi %hi(...), %g1
        assert_eq!(decode(0x0300_0000 | 0x3_F000), OpcodeId::Sethi);
        // call
        assert_eq!(decode(0x4000_0010), OpcodeId::Call);
        // bne (cond=9)
        assert_eq!(decode(0x1280_0005), OpcodeId::Bicc);
        // ld [%g1 + 4], %g2
        assert_eq!(decode(0xC400_6004), OpcodeId::Ld);
        // jmpl / rett / save / restore
        assert_eq!(decode(0x81C0_4000), OpcodeId::Jmpl);
        assert_eq!(decode(0x81C8_4000), OpcodeId::Rett);
        assert_eq!(decode(0x9DE3_BF98), OpcodeId::Save);
        assert_eq!(decode(0x81E8_0000), OpcodeId::Restore);
        // unimp
        assert_eq!(decode(0x0000_0000), OpcodeId::Unimp);
    }

    #[test]
    fn unrecognized_patterns_are_invalid_not_errors() {
        // op=0, op2=5 is a hole in the format-2 space.
        assert_eq!(decode(5 << 22), OpcodeId::Invalid);
        // op=2, op3=0x2F is a hole in the arithmetic space.
        assert_eq!(decode((2 << 30) | (0x2F << 19)), OpcodeId::Invalid);
    }

    #[test]
    fn decode_is_pure_regardless_of_cache_state() {
        let mut cache = DecodeCache::with_capacity(2);
        let words = [0x8600_4002u32, 0xC400_6004, 0x4000_0010, 0x0128_0005];
        for &w in &words {
            let cold = extract(w);
            let first = cache.lookup(w);
            let second = cache.lookup(w);
            assert_eq!(cold, first);
            assert_eq!(first, second);
            assert_eq!(decode(w), cold.op);
        }
    }

    #[test]
    fn operand_extraction_sign_extends() {
        // ld [%g1 - 4], %g2: simm13 = 0x1FFC
        let d = extract(0xC400_6000 | 0x1FFC);
        assert_eq!(d.simm13, -4);
        assert_eq!(d.rs1, 1);
        assert_eq!(d.rd, 2);
        assert!(d.imm);

        // Branch backwards: disp22 all ones = -1.
        let b = extract(0x1280_0000 | 0x3F_FFFF);
        assert_eq!(b.disp22, -1);
        assert_eq!(b.cond, 9);
        assert!(!b.annul);
    }

    #[test]
    fn cache_counts_hits_and_misses() {
        let mut cache = DecodeCache::new();
        cache.lookup(0x8600_4002);
        cache.lookup(0x8600_4002);
        cache.lookup(0xC400_6004);
        let (hits, misses, len, rate) = cache.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 2);
        assert_eq!(len, 2);
        assert!((rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn cache_clears_wholesale_at_capacity() {
        let mut cache = DecodeCache::with_capacity(2);
        cache.lookup(1);
        cache.lookup(2);
        cache.lookup(3);
        assert!(cache.len() <= 2);
        // Still decodes correctly after the clear.
        assert_eq!(cache.lookup(1).op, decode(1));
    }
}
