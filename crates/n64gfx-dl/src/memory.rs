//! Bounds-checked access to console RAM.
//!
//! RDRAM is big-endian. Every address is masked with `len - 1` before use,
//! so a bad pointer in a display list reads the wrong bytes instead of
//! faulting. Multi-byte reads that run off the end wrap to offset 0.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("RDRAM size {0} is not a non-zero power of two")]
    BadSize(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct RdramView<'a> {
    bytes: &'a [u8],
    mask: u32,
}

impl<'a> RdramView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, MemoryError> {
        let len = bytes.len();
        if len == 0 || !len.is_power_of_two() || len as u64 > 1 << 32 {
            return Err(MemoryError::BadSize(len));
        }
        Ok(Self {
            bytes,
            mask: (len - 1) as u32,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// The physical offset `addr` maps to.
    #[inline]
    pub fn clamp(&self, addr: u32) -> u32 {
        addr & self.mask
    }

    #[inline]
    pub fn read_u8(&self, addr: u32) -> u8 {
        self.bytes[self.clamp(addr) as usize]
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        u16::from_be_bytes(self.array(addr))
    }

    pub fn read_i16(&self, addr: u32) -> i16 {
        self.read_u16(addr) as i16
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        u32::from_be_bytes(self.array(addr))
    }

    pub fn read_u64(&self, addr: u32) -> u64 {
        u64::from_be_bytes(self.array(addr))
    }

    /// Fill `out` with the bytes starting at `addr`, wrapping at the end of
    /// RAM.
    pub fn read_into(&self, addr: u32, out: &mut [u8]) {
        let mut pos = self.clamp(addr) as usize;
        let mut filled = 0;
        while filled < out.len() {
            let n = (out.len() - filled).min(self.bytes.len() - pos);
            out[filled..filled + n].copy_from_slice(&self.bytes[pos..pos + n]);
            filled += n;
            pos = 0;
        }
    }

    fn array<const N: usize>(&self, addr: u32) -> [u8; N] {
        let mut out = [0u8; N];
        self.read_into(addr, &mut out);
        out
    }
}

/// The RSP's sixteen segment base registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentTable {
    bases: [u32; 16],
}

impl SegmentTable {
    pub fn set(&mut self, segment: usize, base: u32) {
        if let Some(slot) = self.bases.get_mut(segment) {
            *slot = base & 0x00FF_FFFF;
        }
    }

    pub fn base(&self, segment: usize) -> u32 {
        self.bases.get(segment).copied().unwrap_or(0)
    }

    /// Turn a segmented address into a physical one. The result still needs
    /// the view's mask; [`RdramView`] applies it on every read.
    pub fn resolve(&self, segmented: u32) -> u32 {
        let segment = ((segmented >> 24) & 0x0F) as usize;
        self.bases[segment].wrapping_add(segmented & 0x00FF_FFFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rejects_sizes_that_cannot_be_masked() {
        assert_eq!(RdramView::new(&[]).unwrap_err(), MemoryError::BadSize(0));
        assert_eq!(RdramView::new(&[0; 12]).unwrap_err(), MemoryError::BadSize(12));
        assert!(RdramView::new(&[0; 16]).is_ok());
    }

    #[test]
    fn reads_are_big_endian_and_masked() {
        let mut ram = vec![0u8; 64];
        ram[8..16].copy_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0]);
        let view = RdramView::new(&ram).unwrap();
        assert_eq!(view.read_u16(8), 0x1234);
        assert_eq!(view.read_u32(8), 0x1234_5678);
        assert_eq!(view.read_u64(8), 0x1234_5678_9ABC_DEF0);
        // Out-of-range addresses land inside the segment.
        assert_eq!(view.read_u32(0x8000_0048), 0x1234_5678);
        assert_eq!(view.read_i16(12), 0x9ABCu16 as i16);
    }

    #[test]
    fn straddling_reads_wrap_to_the_start() {
        let mut ram = vec![0u8; 16];
        ram[14] = 0xAA;
        ram[15] = 0xBB;
        ram[0] = 0xCC;
        ram[1] = 0xDD;
        let view = RdramView::new(&ram).unwrap();
        assert_eq!(view.read_u32(14), 0xAABB_CCDD);

        let mut out = [0u8; 20];
        view.read_into(15, &mut out);
        assert_eq!(out[0], 0xBB);
        assert_eq!(out[1], 0xCC);
        assert_eq!(out[17], 0xCC);
    }

    #[test]
    fn segments_resolve_relative_to_their_base() {
        let mut segments = SegmentTable::default();
        segments.set(6, 0x8012_3400);
        segments.set(99, 0xDEAD);
        assert_eq!(segments.base(6), 0x0012_3400);
        assert_eq!(segments.resolve(0x0600_0010), 0x0012_3410);
        // Segment 0 is identity, which also covers KSEG0 pointers.
        assert_eq!(segments.resolve(0x8000_1000), 0x1000);
    }
}
