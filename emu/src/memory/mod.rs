//! # Guest Memory
//!
//! The console exposes three physical regions behind a segmented address
//! space:
//!
//! ```text
//! ┌──────────────┬────────────────────────┬──────────────────────────────┐
//! │ Region       │ Physical range         │ Notes                        │
//! ├──────────────┼────────────────────────┼──────────────────────────────┤
//! │ Scratchpad   │ 0x00010000..0x00014000 │ 16 KiB                       │
//! │ VRAM         │ 0x04000000..0x04200000 │ 2 MiB, mirrored to 0x04800000│
//! │ Main RAM     │ 0x08000000..0x0A000000 │ 32 MiB (kernel + user)       │
//! └──────────────┴────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Bits 30 and 31 select the cached/uncached and user/kernel views of the
//! same physical memory, so every address is masked with `0x3FFF_FFFF`
//! before it is resolved.

pub mod allocator;

use tracing::warn;

pub const SCRATCHPAD_BASE: u32 = 0x0001_0000;
pub const SCRATCHPAD_SIZE: u32 = 0x0000_4000;
pub const VRAM_BASE: u32 = 0x0400_0000;
pub const VRAM_SIZE: u32 = 0x0020_0000;
pub const VRAM_MIRROR_END: u32 = 0x0480_0000;
pub const RAM_BASE: u32 = 0x0800_0000;
pub const RAM_SIZE: u32 = 0x0200_0000;

/// Start of the kernel partition handed to the kernel allocator.
pub const KERNEL_PARTITION_BASE: u32 = 0x0840_0000;
pub const KERNEL_PARTITION_SIZE: u32 = 0x0040_0000;
/// Start of the user partition.
pub const USER_PARTITION_BASE: u32 = 0x0880_0000;

const SEGMENT_MASK: u32 = 0x3FFF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Region {
    Scratchpad,
    Vram,
    Ram,
}

/// Flat byte-addressable guest memory.
pub struct Memory {
    scratchpad: Box<[u8]>,
    vram: Box<[u8]>,
    ram: Box<[u8]>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scratchpad: vec![0; SCRATCHPAD_SIZE as usize].into_boxed_slice(),
            vram: vec![0; VRAM_SIZE as usize].into_boxed_slice(),
            ram: vec![0; RAM_SIZE as usize].into_boxed_slice(),
        }
    }

    fn resolve(address: u32) -> Option<(Region, usize)> {
        let physical = address & SEGMENT_MASK;
        match physical {
            SCRATCHPAD_BASE..0x0001_4000 => {
                Some((Region::Scratchpad, (physical - SCRATCHPAD_BASE) as usize))
            }
            VRAM_BASE..VRAM_MIRROR_END => {
                Some((Region::Vram, ((physical - VRAM_BASE) % VRAM_SIZE) as usize))
            }
            RAM_BASE..0x0A00_0000 => Some((Region::Ram, (physical - RAM_BASE) as usize)),
            _ => None,
        }
    }

    fn region(&self, region: Region) -> &[u8] {
        match region {
            Region::Scratchpad => &self.scratchpad,
            Region::Vram => &self.vram,
            Region::Ram => &self.ram,
        }
    }

    fn region_mut(&mut self, region: Region) -> &mut [u8] {
        match region {
            Region::Scratchpad => &mut self.scratchpad,
            Region::Vram => &mut self.vram,
            Region::Ram => &mut self.ram,
        }
    }

    #[must_use]
    pub fn is_valid_address(&self, address: u32) -> bool {
        Self::resolve(address).is_some()
    }

    /// Returns `len` bytes starting at `address` when the whole range lives in
    /// one region.
    #[must_use]
    pub fn slice(&self, address: u32, len: usize) -> Option<&[u8]> {
        let (region, offset) = Self::resolve(address)?;
        self.region(region).get(offset..offset.checked_add(len)?)
    }

    pub fn slice_mut(&mut self, address: u32, len: usize) -> Option<&mut [u8]> {
        let (region, offset) = Self::resolve(address)?;
        self.region_mut(region)
            .get_mut(offset..offset.checked_add(len)?)
    }

    fn read_array<const N: usize>(&self, address: u32) -> [u8; N] {
        match self.slice(address, N) {
            Some(bytes) => {
                let mut out = [0; N];
                out.copy_from_slice(bytes);
                out
            }
            None => {
                warn!("invalid read{} at {address:#010x}", N * 8);
                [0; N]
            }
        }
    }

    fn write_array<const N: usize>(&mut self, address: u32, bytes: [u8; N]) {
        match self.slice_mut(address, N) {
            Some(dst) => dst.copy_from_slice(&bytes),
            None => warn!("invalid write{} at {address:#010x}", N * 8),
        }
    }

    #[must_use]
    pub fn read_u8(&self, address: u32) -> u8 {
        self.read_array::<1>(address)[0]
    }

    #[must_use]
    pub fn read_u16(&self, address: u32) -> u16 {
        u16::from_le_bytes(self.read_array(address))
    }

    #[must_use]
    pub fn read_u32(&self, address: u32) -> u32 {
        u32::from_le_bytes(self.read_array(address))
    }

    #[must_use]
    pub fn read_f32(&self, address: u32) -> f32 {
        f32::from_bits(self.read_u32(address))
    }

    pub fn write_u8(&mut self, address: u32, value: u8) {
        self.write_array(address, [value]);
    }

    pub fn write_u16(&mut self, address: u32, value: u16) {
        self.write_array(address, value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: u32, value: u32) {
        self.write_array(address, value.to_le_bytes());
    }

    pub fn write_f32(&mut self, address: u32, value: f32) {
        self.write_u32(address, value.to_bits());
    }

    /// Copies `data` into guest memory. Returns `false` when the destination
    /// range is not fully backed.
    pub fn copy_from_slice(&mut self, address: u32, data: &[u8]) -> bool {
        match self.slice_mut(address, data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => {
                warn!(
                    "invalid block write of {} bytes at {address:#010x}",
                    data.len()
                );
                false
            }
        }
    }

    pub fn memset(&mut self, address: u32, value: u8, len: usize) -> bool {
        match self.slice_mut(address, len) {
            Some(dst) => {
                dst.fill(value);
                true
            }
            None => false,
        }
    }

    /// Reads a NUL-terminated string, capped at `max_len` bytes.
    #[must_use]
    pub fn read_cstring(&self, address: u32, max_len: usize) -> String {
        let mut out = Vec::new();
        for i in 0..max_len {
            let Some(offset) = u32::try_from(i).ok() else {
                break;
            };
            if !self.is_valid_address(address.wrapping_add(offset)) {
                break;
            }
            let byte = self.read_u8(address.wrapping_add(offset));
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Writes `text` followed by a NUL byte.
    pub fn write_cstring(&mut self, address: u32, text: &str) -> bool {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.copy_from_slice(address, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn segments_alias_the_same_physical_memory() {
        let mut memory = Memory::new();
        memory.write_u32(0x0880_0000, 0xDEAD_BEEF);
        assert_eq!(memory.read_u32(0x4880_0000), 0xDEAD_BEEF);
        assert_eq!(memory.read_u32(0x8880_0000), 0xDEAD_BEEF);
        assert_eq!(memory.read_u16(0x0880_0002), 0xDEAD);
        assert_eq!(memory.read_u8(0x0880_0000), 0xEF);
    }

    #[test]
    fn vram_is_mirrored() {
        let mut memory = Memory::new();
        memory.write_u16(0x0400_0010, 0x1234);
        assert_eq!(memory.read_u16(0x0420_0010), 0x1234);
        assert_eq!(memory.read_u16(0x0460_0010), 0x1234);
    }

    #[test]
    fn invalid_accesses_are_harmless() {
        let mut memory = Memory::new();
        memory.write_u32(0x0000_0000, 1);
        assert_eq!(memory.read_u32(0x0000_0000), 0);
        assert!(!memory.is_valid_address(0x0A00_0000));
        assert!(memory.slice(0x09FF_FFFE, 4).is_none());
    }

    #[test]
    fn cstrings_round_trip() {
        let mut memory = Memory::new();
        assert!(memory.write_cstring(0x0001_0000, "kumquat"));
        assert_eq!(memory.read_cstring(0x0001_0000, 64), "kumquat");
        assert_eq!(memory.read_cstring(0x0001_0000, 3), "kum");
    }
}
