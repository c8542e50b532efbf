//! Guest visible status codes.
//!
//! Kernel calls report failures by returning one of these in `v0`. They are
//! plain numbers from the console's own error space and are never turned into
//! host errors.

pub const OK: u32 = 0;

pub const ILLEGAL_CONTEXT: u32 = 0x8002_0064;
pub const ILLEGAL_ARGUMENT: u32 = 0x8002_00D2;
pub const UNKNOWN_UID: u32 = 0x8002_00CB;
pub const NO_MEMORY: u32 = 0x8002_00D9;
pub const ILLEGAL_PARTITION: u32 = 0x8002_00D6;
pub const ILLEGAL_MEMBLOCK_ALLOC_TYPE: u32 = 0x8002_00D8;
pub const ILLEGAL_ADDR: u32 = 0x8002_00D3;
pub const ILLEGAL_ALIGNMENT_SIZE: u32 = 0x8002_00E4;

pub const ILLEGAL_ATTR: u32 = 0x8002_0191;
pub const ILLEGAL_ENTRY: u32 = 0x8002_0192;
pub const ILLEGAL_PRIORITY: u32 = 0x8002_0193;
pub const ILLEGAL_STACK_SIZE: u32 = 0x8002_0194;
pub const ILLEGAL_MODE: u32 = 0x8002_0195;
pub const ILLEGAL_MASK: u32 = 0x8002_0196;
pub const ILLEGAL_THID: u32 = 0x8002_0197;
pub const UNKNOWN_THID: u32 = 0x8002_0198;
pub const UNKNOWN_SEMID: u32 = 0x8002_0199;
pub const UNKNOWN_EVFID: u32 = 0x8002_019A;
pub const UNKNOWN_CBID: u32 = 0x8002_01A1;
pub const DORMANT: u32 = 0x8002_01A2;
pub const SUSPEND: u32 = 0x8002_01A3;
pub const NOT_DORMANT: u32 = 0x8002_01A4;
pub const NOT_SUSPEND: u32 = 0x8002_01A5;
pub const NOT_WAIT: u32 = 0x8002_01A6;
pub const CAN_NOT_WAIT: u32 = 0x8002_01A7;
pub const WAIT_TIMEOUT: u32 = 0x8002_01A8;
pub const WAIT_CANCEL: u32 = 0x8002_01A9;
pub const RELEASE_WAIT: u32 = 0x8002_01AA;
pub const NOTIFY_CALLBACK: u32 = 0x8002_01AB;
pub const THREAD_TERMINATED: u32 = 0x8002_01AC;
pub const SEMA_ZERO: u32 = 0x8002_01AD;
pub const SEMA_OVF: u32 = 0x8002_01AE;
pub const EVF_COND: u32 = 0x8002_01AF;
pub const EVF_MULTI: u32 = 0x8002_01B0;
pub const EVF_ILPAT: u32 = 0x8002_01B1;
pub const WAIT_DELETE: u32 = 0x8002_01B5;
pub const ILLEGAL_COUNT: u32 = 0x8002_01BD;

pub const MUTEX_NOT_FOUND: u32 = 0x8002_01C3;
pub const MUTEX_TRYLOCK_FAILED: u32 = 0x8002_01C4;
pub const MUTEX_NOT_LOCKED: u32 = 0x8002_01C5;
pub const MUTEX_LOCK_OVERFLOW: u32 = 0x8002_01C6;
pub const MUTEX_UNLOCK_UNDERFLOW: u32 = 0x8002_01C7;
pub const MUTEX_RECURSIVE_NOT_ALLOWED: u32 = 0x8002_01C8;

pub const INTR_ILLEGAL_NUMBER: u32 = 0x8002_0065;
pub const INTR_FOUND_HANDLER: u32 = 0x8002_0067;
pub const INTR_NOT_FOUND_HANDLER: u32 = 0x8002_0068;

pub const NOFILE: u32 = 0x8001_0002;
pub const BADF: u32 = 0x8002_0323;
pub const FILE_EXISTS: u32 = 0x8001_0011;
pub const NOT_DIRECTORY: u32 = 0x8001_0014;
pub const IS_DIRECTORY: u32 = 0x8001_0015;
pub const DIRECTORY_NOT_EMPTY: u32 = 0x8001_005A;

pub const GE_INVALID_ID: u32 = 0x8000_0100;
pub const GE_INVALID_MODE: u32 = 0x8000_0107;
pub const GE_LIST_FULL: u32 = 0x8000_0022;
