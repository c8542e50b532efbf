//! # Block Allocator
//!
//! Manages one contiguous guest address range as an address-ordered list of
//! blocks that always covers the whole range:
//!
//! ```text
//!  start                                                     start + size
//!  ├──────────┬───────────────┬────────────┬─────────────────────────┤
//!  │ "stack"  │     free      │  "module"  │          free           │
//!  └──────────┴───────────────┴────────────┴─────────────────────────┘
//! ```
//!
//! Allocation can take from the low end (first fit), from the high end (last
//! fit, for short lived allocations that should not fragment the bottom) or
//! at a fixed address (for position-dependent executables). Freed blocks are
//! merged with free neighbours immediately, so two adjacent blocks are never
//! both free.

use tracing::{debug, warn};

pub const DEFAULT_GRAIN: u32 = 0x100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub start: u32,
    pub size: u32,
    pub free: bool,
    pub name: String,
}

impl Block {
    fn free(start: u32, size: u32) -> Self {
        Self {
            start,
            size,
            free: true,
            name: String::from("(free)"),
        }
    }

    const fn end(&self) -> u64 {
        self.start as u64 + self.size as u64
    }

    const fn contains(&self, address: u32) -> bool {
        address >= self.start && (address as u64) < self.end()
    }
}

const fn align_up(value: u32, grain: u32) -> u32 {
    value.div_ceil(grain) * grain
}

const fn align_down(value: u32, grain: u32) -> u32 {
    (value / grain) * grain
}

pub struct BlockAllocator {
    start: u32,
    size: u32,
    grain: u32,
    blocks: Vec<Block>,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(start: u32, size: u32, grain: u32) -> Self {
        debug_assert!(grain.is_power_of_two());
        Self {
            start,
            size,
            grain,
            blocks: vec![Block::free(start, size)],
        }
    }

    /// Drops every allocation.
    pub fn clear(&mut self) {
        self.blocks = vec![Block::free(self.start, self.size)];
    }

    #[must_use]
    pub const fn start(&self) -> u32 {
        self.start
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub const fn grain(&self) -> u32 {
        self.grain
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn alloc(&mut self, size: u32, from_top: bool, name: &str) -> Option<u32> {
        self.alloc_aligned(size, self.grain, self.grain, from_top, name)
    }

    /// Allocates `size` bytes (padded to `size_grain`) at an address aligned
    /// to `grain`.
    pub fn alloc_aligned(
        &mut self,
        size: u32,
        size_grain: u32,
        grain: u32,
        from_top: bool,
        name: &str,
    ) -> Option<u32> {
        let size_grain = size_grain.max(self.grain);
        let grain = grain.max(self.grain);
        if size == 0 || size > self.size {
            warn!("refusing allocation of {size:#x} bytes for {name}");
            return None;
        }
        let needed = align_up(size, size_grain);

        let candidate = if from_top {
            self.blocks.iter().enumerate().rev().find_map(|(i, block)| {
                if !block.free || block.size < needed {
                    return None;
                }
                let position = align_down(
                    u32::try_from(block.end() - u64::from(needed)).ok()?,
                    grain,
                );
                (position >= block.start).then_some((i, position))
            })
        } else {
            self.blocks.iter().enumerate().find_map(|(i, block)| {
                if !block.free {
                    return None;
                }
                let position = align_up(block.start, grain);
                let fits = u64::from(position) + u64::from(needed) <= block.end();
                fits.then_some((i, position))
            })
        };

        match candidate {
            Some((index, position)) => {
                self.split_and_take(index, position, needed, name);
                Some(position)
            }
            None => {
                warn!(
                    "out of memory allocating {needed:#x} bytes for {name} (largest free {:#x})",
                    self.largest_free_block_size()
                );
                None
            }
        }
    }

    /// Allocates exactly `[position, position + size)` (rounded out to the
    /// grain). Fails if any part of it is already taken.
    pub fn alloc_at(&mut self, position: u32, size: u32, name: &str) -> Option<u32> {
        let aligned = align_down(position, self.grain);
        let end = u64::from(position) + u64::from(size);
        let needed = u32::try_from(end - u64::from(aligned))
            .ok()
            .map(|s| align_up(s, self.grain))?;

        let Some(index) = self.blocks.iter().position(|b| b.contains(aligned)) else {
            warn!("alloc_at {position:#010x} is outside the managed range");
            return None;
        };
        let block = &self.blocks[index];
        if !block.free {
            warn!(
                "alloc_at {position:#010x} overlaps allocated block {} at {:#010x}",
                block.name, block.start
            );
            return None;
        }
        if u64::from(aligned) + u64::from(needed) > block.end() {
            warn!("alloc_at {position:#010x} with size {size:#x} does not fit a free block");
            return None;
        }
        self.split_and_take(index, aligned, needed, name);
        Some(aligned)
    }

    fn split_and_take(&mut self, index: usize, position: u32, size: u32, name: &str) {
        let block = self.blocks[index].clone();
        let mut replacement = Vec::with_capacity(3);
        if position > block.start {
            replacement.push(Block::free(block.start, position - block.start));
        }
        replacement.push(Block {
            start: position,
            size,
            free: false,
            name: if name.is_empty() {
                String::from("(unnamed)")
            } else {
                name.to_string()
            },
        });
        let taken_end = u64::from(position) + u64::from(size);
        if taken_end < block.end() {
            // The remainder always fits in u32: it is bounded by the block end.
            #[allow(clippy::cast_possible_truncation)]
            replacement.push(Block::free(
                taken_end as u32,
                (block.end() - taken_end) as u32,
            ));
        }
        self.blocks.splice(index..=index, replacement);
        debug!("allocated {size:#x} bytes at {position:#010x} for {name}");
    }

    /// Frees the block starting at `position`.
    pub fn free(&mut self, position: u32) -> bool {
        let Some(index) = self.blocks.iter().position(|b| b.start == position) else {
            warn!("free of unknown block {position:#010x}");
            return false;
        };
        if self.blocks[index].free {
            warn!("double free of block {position:#010x}");
            return false;
        }
        let block = &mut self.blocks[index];
        block.free = true;
        block.name = String::from("(free)");
        self.merge_free_blocks(index);
        true
    }

    /// Frees whatever block contains `address`.
    pub fn free_containing(&mut self, address: u32) -> bool {
        match self.block_start_from_address(address) {
            Some(start) => self.free(start),
            None => false,
        }
    }

    fn merge_free_blocks(&mut self, mut index: usize) {
        if index > 0 && self.blocks[index - 1].free {
            let current = self.blocks.remove(index);
            self.blocks[index - 1].size += current.size;
            index -= 1;
        }
        if index + 1 < self.blocks.len() && self.blocks[index + 1].free {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
        }
    }

    #[must_use]
    pub fn largest_free_block_size(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|b| b.free)
            .map(|b| b.size)
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn total_free_bytes(&self) -> u32 {
        self.blocks.iter().filter(|b| b.free).map(|b| b.size).sum()
    }

    #[must_use]
    pub fn block_start_from_address(&self, address: u32) -> Option<u32> {
        self.blocks
            .iter()
            .find(|b| !b.free && b.contains(address))
            .map(|b| b.start)
    }

    #[must_use]
    pub fn block_size_from_address(&self, address: u32) -> Option<u32> {
        self.blocks
            .iter()
            .find(|b| !b.free && b.contains(address))
            .map(|b| b.size)
    }

    /// Logs the current block list at debug level.
    pub fn list_blocks(&self) {
        for block in &self.blocks {
            debug!(
                "{:#010x}..{:#010x} {:>8} {}",
                block.start,
                block.end(),
                if block.free { "free" } else { "used" },
                block.name
            );
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let mut cursor = u64::from(self.start);
        for pair in self.blocks.windows(2) {
            assert!(!(pair[0].free && pair[1].free), "adjacent free blocks");
        }
        for block in &self.blocks {
            assert_eq!(u64::from(block.start), cursor, "gap or overlap");
            assert!(block.free || !block.name.is_empty());
            cursor = block.end();
        }
        assert_eq!(cursor, u64::from(self.start) + u64::from(self.size));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn allocator() -> BlockAllocator {
        BlockAllocator::new(0x0880_0000, 0x10_0000, DEFAULT_GRAIN)
    }

    #[test]
    fn alloc_then_free_restores_a_single_block() {
        let mut a = allocator();
        let address = a.alloc(0x1234, false, "test").unwrap();
        assert_eq!(address, 0x0880_0000);
        a.check_invariants();
        assert!(a.free(address));
        assert_eq!(a.blocks(), &[Block::free(0x0880_0000, 0x10_0000)]);
    }

    #[test]
    fn size_is_padded_to_grain() {
        let mut a = allocator();
        let first = a.alloc(1, false, "a").unwrap();
        let second = a.alloc(1, false, "b").unwrap();
        assert_eq!(second - first, DEFAULT_GRAIN);
        assert_eq!(a.block_size_from_address(first), Some(DEFAULT_GRAIN));
    }

    #[test]
    fn from_top_takes_the_high_end() {
        let mut a = allocator();
        let address = a.alloc(0x1000, true, "stack").unwrap();
        assert_eq!(address, 0x0890_0000 - 0x1000);
        a.check_invariants();
    }

    #[test]
    fn aligned_allocation_respects_alignment() {
        let mut a = allocator();
        a.alloc(0x100, false, "pad").unwrap();
        let address = a.alloc_aligned(0x100, 0x100, 0x1000, false, "aligned").unwrap();
        assert_eq!(address % 0x1000, 0);
        a.check_invariants();
    }

    #[test]
    fn alloc_at_refuses_overlap() {
        let mut a = allocator();
        let taken = a.alloc_at(0x0880_4000, 0x2000, "module").unwrap();
        assert_eq!(taken, 0x0880_4000);
        assert_eq!(a.alloc_at(0x0880_5000, 0x100, "overlap"), None);
        assert_eq!(a.alloc_at(0x0880_3F00, 0x200, "straddle"), None);
        assert!(a.alloc_at(0x0880_6000, 0x100, "after").is_some());
        a.check_invariants();
    }

    #[test]
    fn freeing_merges_both_neighbours() {
        let mut a = allocator();
        let x = a.alloc(0x100, false, "x").unwrap();
        let y = a.alloc(0x100, false, "y").unwrap();
        let z = a.alloc(0x100, false, "z").unwrap();
        assert!(a.free(x));
        assert!(a.free(z));
        assert!(a.free(y));
        a.check_invariants();
        assert_eq!(a.blocks().len(), 1);
    }

    #[test]
    fn double_free_is_reported() {
        let mut a = allocator();
        let x = a.alloc(0x100, false, "x").unwrap();
        assert!(a.free(x));
        assert!(!a.free(x));
        assert!(!a.free(0x1234));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut a = allocator();
        assert!(a.alloc(0x10_0000, false, "all").is_some());
        assert_eq!(a.alloc(0x100, false, "more"), None);
        assert_eq!(a.total_free_bytes(), 0);
        assert_eq!(a.largest_free_block_size(), 0);
    }

    #[test]
    fn free_containing_resolves_interior_addresses() {
        let mut a = allocator();
        let x = a.alloc(0x400, false, "x").unwrap();
        assert_eq!(a.block_start_from_address(x + 0x10), Some(x));
        assert!(a.free_containing(x + 0x10));
        assert_eq!(a.total_free_bytes(), 0x10_0000);
    }
}
