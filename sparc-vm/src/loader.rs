//! ELF and raw-image loading into simulated RAM.

use crate::bus::SystemBus;
use goblin::elf::{Elf, header, program_header::PT_LOAD};

/// Quick format sniff used to pick between [`load_elf`] and [`load_raw`].
pub fn is_elf(buffer: &[u8]) -> bool {
    buffer.starts_with(b"\x7FELF")
}

/// Load a 32-bit big-endian ELF image into RAM and return its entry point.
///
/// PT_LOAD segments are copied to their physical addresses (falling back to
/// the virtual address when p_paddr is zero) with bounds checks against the
/// RAM region; memsz beyond filesz is zeroed.
pub fn load_elf(buffer: &[u8], bus: &mut SystemBus) -> Result<u32, Box<dyn std::error::Error>> {
    let elf = Elf::parse(buffer)?;
    if elf.is_64 {
        return Err("64-bit ELF image; this machine executes 32-bit code".into());
    }
    if elf.little_endian {
        return Err("little-endian ELF image; this machine is big-endian".into());
    }
    match elf.header.e_machine {
        header::EM_SPARC | header::EM_SPARC32PLUS => {}
        other => log::warn!("unexpected ELF machine type {other:#x}, loading anyway"),
    }

    let base = bus.dram_base();
    let dram_end = base + bus.dram_size() as u64;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz as usize;
        let file_offset = ph.p_offset as usize;
        if file_offset + file_size > buffer.len() {
            return Err(format!(
                "ELF segment exceeds file bounds (offset 0x{:x})",
                file_offset
            )
            .into());
        }

        let target_addr = if ph.p_paddr != 0 {
            ph.p_paddr
        } else {
            ph.p_vaddr
        };
        if target_addr < base {
            return Err(format!(
                "Segment start 0x{:x} lies below RAM base 0x{:x}",
                target_addr, base
            )
            .into());
        }
        let seg_end = target_addr
            .checked_add(mem_size as u64)
            .ok_or_else(|| "Segment end overflow".to_string())?;
        if seg_end > dram_end {
            return Err(format!(
                "Segment 0x{:x}-0x{:x} exceeds RAM (end 0x{:x})",
                target_addr, seg_end, dram_end
            )
            .into());
        }

        let dram_offset = target_addr - base;
        if file_size > 0 {
            let end = file_offset + file_size;
            bus.dram
                .load(&buffer[file_offset..end], dram_offset)
                .map_err(|e| format!("Failed to load segment: {}", e))?;
        }
        if mem_size > file_size {
            let zero_start = dram_offset as usize + file_size;
            bus.dram
                .zero_range(zero_start, mem_size - file_size)
                .map_err(|e| format!("Failed to zero bss: {}", e))?;
        }
        log::debug!(
            "Loaded segment: addr=0x{:x}, filesz=0x{:x}, memsz=0x{:x}",
            target_addr,
            file_size,
            mem_size
        );
    }

    Ok(elf.entry as u32)
}

/// Copy a raw binary image to `addr` and return that address as the entry
/// point.
pub fn load_raw(
    buffer: &[u8],
    bus: &mut SystemBus,
    addr: u64,
) -> Result<u32, Box<dyn std::error::Error>> {
    let base = bus.dram_base();
    if addr < base {
        return Err(format!("Load address 0x{:x} lies below RAM base 0x{:x}", addr, base).into());
    }
    bus.dram
        .load(buffer, addr - base)
        .map_err(|e| format!("Failed to load image: {}", e))?;
    log::debug!("Loaded raw image: addr=0x{:x}, size=0x{:x}", addr, buffer.len());
    Ok(addr as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Memory;
    use crate::dram::DRAM_BASE;

    fn be16(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    fn be32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    /// Minimal ELF32 big-endian executable with one PT_LOAD segment.
    fn build_elf(entry: u32, paddr: u32, payload: &[u8], memsz: u32) -> Vec<u8> {
        let mut img = Vec::new();
        img.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 2, 1, 0]);
        img.extend_from_slice(&[0; 8]);
        be16(&mut img, 2); // ET_EXEC
        be16(&mut img, header::EM_SPARC);
        be32(&mut img, 1);
        be32(&mut img, entry);
        be32(&mut img, 52); // phoff right after the header
        be32(&mut img, 0);
        be32(&mut img, 0);
        be16(&mut img, 52);
        be16(&mut img, 32);
        be16(&mut img, 1);
        be16(&mut img, 0);
        be16(&mut img, 0);
        be16(&mut img, 0);
        // Program header.
        be32(&mut img, PT_LOAD);
        be32(&mut img, 84); // file offset of the payload
        be32(&mut img, paddr);
        be32(&mut img, paddr);
        be32(&mut img, payload.len() as u32);
        be32(&mut img, memsz);
        be32(&mut img, 5);
        be32(&mut img, 4);
        img.extend_from_slice(payload);
        img
    }

    #[test]
    fn elf_segments_land_at_their_physical_address() {
        let mut bus = SystemBus::with_size(0x1_0000);
        let paddr = (DRAM_BASE + 0x100) as u32;
        let payload = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        let img = build_elf(paddr, paddr, &payload, payload.len() as u32);

        assert!(is_elf(&img));
        let entry = load_elf(&img, &mut bus).unwrap();
        assert_eq!(entry, paddr);
        assert_eq!(bus.read_word(paddr as u64).unwrap(), 0xDEAD_BEEF);
        assert_eq!(bus.read_word(paddr as u64 + 4).unwrap(), 0x0102_0304);
    }

    #[test]
    fn bss_tail_is_zeroed() {
        let mut bus = SystemBus::with_size(0x1_0000);
        let paddr = (DRAM_BASE + 0x200) as u32;
        // Dirty the region the bss will cover.
        for i in 0..8 {
            bus.write_word(paddr as u64 + i * 4, 0xFFFF_FFFF).unwrap();
        }
        let payload = [0xAA, 0xBB, 0xCC, 0xDD];
        let img = build_elf(paddr, paddr, &payload, 32);

        load_elf(&img, &mut bus).unwrap();
        assert_eq!(bus.read_word(paddr as u64).unwrap(), 0xAABB_CCDD);
        for i in 1..8 {
            assert_eq!(bus.read_word(paddr as u64 + i * 4).unwrap(), 0);
        }
    }

    #[test]
    fn segment_outside_ram_is_rejected() {
        let mut bus = SystemBus::with_size(0x1000);
        let img = build_elf(0x1000, 0x1000, &[0; 4], 4); // below DRAM_BASE
        assert!(load_elf(&img, &mut bus).is_err());

        let past_end = (DRAM_BASE as u32) + 0x1000;
        let img = build_elf(past_end, past_end, &[0; 16], 16);
        assert!(load_elf(&img, &mut bus).is_err());
    }

    #[test]
    fn raw_image_loads_at_the_requested_address() {
        let mut bus = SystemBus::with_size(0x1000);
        let blob = [1, 2, 3, 4];
        assert!(!is_elf(&blob));
        let entry = load_raw(&blob, &mut bus, DRAM_BASE + 0x40).unwrap();
        assert_eq!(entry, (DRAM_BASE + 0x40) as u32);
        assert_eq!(bus.read_word(DRAM_BASE + 0x40).unwrap(), 0x0102_0304);
        assert!(load_raw(&blob, &mut bus, 0).is_err());
    }
}
