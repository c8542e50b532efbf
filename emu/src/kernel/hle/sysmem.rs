//! `SysMemUserForUser`: partition memory blocks.

use tracing::{debug, warn};

use crate::kernel::error;
use crate::kernel::object::MemoryBlock;
use crate::memory::allocator::BlockAllocator;

use super::{Hle, HleFunction, HleRegistry, HleReturn};

const MODULE: &str = "SysMemUserForUser";

const PARTITION_KERNEL: u32 = 1;
const PARTITION_USER: u32 = 2;
const PARTITION_USER_MIRROR: u32 = 6;

const ALLOC_LOW: u32 = 0;
const ALLOC_HIGH: u32 = 1;
const ALLOC_ADDR: u32 = 2;
const ALLOC_LOW_ALIGNED: u32 = 3;
const ALLOC_HIGH_ALIGNED: u32 = 4;

const DEVKIT_VERSION: u32 = 0x0602_0010;

const FUNCTIONS: &[(u32, HleFunction)] = &[
    (0x237D_BD4F, HleFunction::new("sceKernelAllocPartitionMemory", alloc_partition_memory)),
    (0xB6D6_1D02, HleFunction::new("sceKernelFreePartitionMemory", free_partition_memory)),
    (0x9D9A_5BA1, HleFunction::new("sceKernelGetBlockHeadAddr", get_block_head_addr)),
    (0xA291_F107, HleFunction::new("sceKernelMaxFreeMemSize", max_free_mem_size)),
    (0xF919_F628, HleFunction::new("sceKernelTotalFreeMemSize", total_free_mem_size)),
    (0x3FC9_AE6A, HleFunction::new("sceKernelDevkitVersion", devkit_version)),
];

pub(super) fn register(registry: &mut HleRegistry) {
    for (nid, function) in FUNCTIONS {
        registry.register(MODULE, *nid, *function);
    }
}

fn partition<'a>(hle: &'a mut Hle, id: u32) -> Option<&'a mut BlockAllocator> {
    match id {
        PARTITION_KERNEL => Some(&mut hle.kernel.kernel_memory),
        PARTITION_USER | PARTITION_USER_MIRROR => Some(&mut hle.kernel.user_memory),
        _ => None,
    }
}

fn alloc_partition_memory(hle: &mut Hle) -> HleReturn {
    let (id, kind, size, addr) = (hle.arg(0), hle.arg(2), hle.arg(3), hle.arg(4));
    let name = hle.arg_string(1);
    if size == 0 {
        return HleReturn::U32(error::ILLEGAL_ARGUMENT);
    }
    let Some(allocator) = partition(hle, id) else {
        return HleReturn::U32(error::ILLEGAL_PARTITION);
    };
    let grain = allocator.grain();
    let address = match kind {
        ALLOC_LOW => allocator.alloc(size, false, &name),
        ALLOC_HIGH => allocator.alloc(size, true, &name),
        ALLOC_ADDR => allocator.alloc_at(addr, size, &name),
        ALLOC_LOW_ALIGNED | ALLOC_HIGH_ALIGNED => {
            if !addr.is_power_of_two() {
                return HleReturn::U32(error::ILLEGAL_ALIGNMENT_SIZE);
            }
            allocator.alloc_aligned(size, grain, addr, kind == ALLOC_HIGH_ALIGNED, &name)
        }
        _ => return HleReturn::U32(error::ILLEGAL_MEMBLOCK_ALLOC_TYPE),
    };
    let Some(address) = address else {
        warn!("partition {id} cannot fit {size:#x} bytes for {name}");
        return HleReturn::U32(error::NO_MEMORY);
    };
    let block = MemoryBlock {
        name,
        partition: id,
        address,
        size,
    };
    match hle.kernel.objects.create(block) {
        Some(uid) => {
            debug!("partition block {uid:#x} at {address:#010x} ({size:#x} bytes)");
            HleReturn::U32(uid)
        }
        None => {
            if let Some(allocator) = partition(hle, id) {
                allocator.free(address);
            }
            HleReturn::U32(error::NO_MEMORY)
        }
    }
}

fn free_partition_memory(hle: &mut Hle) -> HleReturn {
    let Some(block) = hle.kernel.objects.destroy_as::<MemoryBlock>(hle.arg(0)) else {
        return HleReturn::U32(error::UNKNOWN_UID);
    };
    if let Some(allocator) = partition(hle, block.partition) {
        allocator.free(block.address);
    }
    HleReturn::U32(error::OK)
}

fn get_block_head_addr(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(
        hle.kernel
            .objects
            .get::<MemoryBlock>(hle.arg(0))
            .map_or(error::UNKNOWN_UID, |b| b.address),
    )
}

fn max_free_mem_size(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(hle.kernel.user_memory.largest_free_block_size())
}

fn total_free_mem_size(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(hle.kernel.user_memory.total_free_bytes())
}

fn devkit_version(_hle: &mut Hle) -> HleReturn {
    HleReturn::U32(DEVKIT_VERSION)
}
