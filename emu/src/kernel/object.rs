//! # Kernel Object Table
//!
//! Every kernel entity lives in a fixed table of 4096 slots. Guests only ever
//! see a UID, a weak handle that may outlive the object it named:
//!
//! ```text
//!   uid = slot + 0x100
//!
//!   slot   0      1      2      3           4095
//!        ┌──────┬──────┬──────┬──────┬ ─ ─ ┬──────┐
//!        │Thread│ free │ Sema │ free │     │ Evf  │
//!        └──────┴──────┴──────┴──────┴ ─ ─ ┴──────┘
//!                  ▲
//!                  └── next scan starts after the last issued slot
//! ```
//!
//! Lookups are type checked: asking for a semaphore with a thread's UID or
//! with a stale UID yields `None`, never a wrong object.

use tracing::warn;

use super::callback::Callback;
use super::event_flag::EventFlag;
use super::module::Module;
use super::mutex::Mutex;
use super::semaphore::Semaphore;
use super::thread::Thread;

pub type Uid = u32;

pub const MAX_OBJECTS: usize = 4096;
const UID_OFFSET: u32 = 0x100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Thread,
    Semaphore,
    Mutex,
    EventFlag,
    Callback,
    Module,
    MemoryBlock,
    File,
    Directory,
}

/// Partition memory handed out by `sceKernelAllocPartitionMemory`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub name: String,
    pub partition: u32,
    pub address: u32,
    pub size: u32,
}

/// An open file: the UID maps to a handle of the meta filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenFile {
    pub path: String,
    pub handle: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenDirectory {
    pub path: String,
    pub entries: Vec<super::filesystem::FileInfo>,
    pub position: usize,
}

#[allow(clippy::large_enum_variant)]
pub enum KernelObject {
    Thread(Thread),
    Semaphore(Semaphore),
    Mutex(Mutex),
    EventFlag(EventFlag),
    Callback(Callback),
    Module(Module),
    MemoryBlock(MemoryBlock),
    File(OpenFile),
    Directory(OpenDirectory),
}

impl KernelObject {
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Thread(_) => ObjectKind::Thread,
            Self::Semaphore(_) => ObjectKind::Semaphore,
            Self::Mutex(_) => ObjectKind::Mutex,
            Self::EventFlag(_) => ObjectKind::EventFlag,
            Self::Callback(_) => ObjectKind::Callback,
            Self::Module(_) => ObjectKind::Module,
            Self::MemoryBlock(_) => ObjectKind::MemoryBlock,
            Self::File(_) => ObjectKind::File,
            Self::Directory(_) => ObjectKind::Directory,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Thread(t) => &t.name,
            Self::Semaphore(s) => &s.name,
            Self::Mutex(m) => &m.name,
            Self::EventFlag(e) => &e.name,
            Self::Callback(c) => &c.name,
            Self::Module(m) => &m.name,
            Self::MemoryBlock(b) => &b.name,
            Self::File(f) => &f.path,
            Self::Directory(d) => &d.path,
        }
    }
}

/// Conversion between a concrete object type and the table entry.
pub trait KernelObjectType: Sized {
    const KIND: ObjectKind;
    fn wrap(self) -> KernelObject;
    fn unwrap_ref(object: &KernelObject) -> Option<&Self>;
    fn unwrap_mut(object: &mut KernelObject) -> Option<&mut Self>;
    fn unwrap_owned(object: KernelObject) -> Option<Self>;
}

macro_rules! impl_object_type {
    ($variant:ident, $t:ty) => {
        impl KernelObjectType for $t {
            const KIND: ObjectKind = ObjectKind::$variant;

            fn wrap(self) -> KernelObject {
                KernelObject::$variant(self)
            }

            fn unwrap_ref(object: &KernelObject) -> Option<&Self> {
                match object {
                    KernelObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn unwrap_mut(object: &mut KernelObject) -> Option<&mut Self> {
                match object {
                    KernelObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn unwrap_owned(object: KernelObject) -> Option<Self> {
                match object {
                    KernelObject::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

impl_object_type!(Thread, Thread);
impl_object_type!(Semaphore, Semaphore);
impl_object_type!(Mutex, Mutex);
impl_object_type!(EventFlag, EventFlag);
impl_object_type!(Callback, Callback);
impl_object_type!(Module, Module);
impl_object_type!(MemoryBlock, MemoryBlock);
impl_object_type!(File, OpenFile);
impl_object_type!(Directory, OpenDirectory);

pub struct ObjectTable {
    slots: Vec<Option<KernelObject>>,
    next_slot: usize,
    count: usize,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

const fn slot_of(uid: Uid) -> Option<usize> {
    if uid < UID_OFFSET {
        return None;
    }
    let slot = (uid - UID_OFFSET) as usize;
    if slot < MAX_OBJECTS { Some(slot) } else { None }
}

impl ObjectTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(MAX_OBJECTS).collect(),
            next_slot: 0,
            count: 0,
        }
    }

    /// Stores `object` in the first free slot after the last one handed out.
    pub fn create<T: KernelObjectType>(&mut self, object: T) -> Option<Uid> {
        for step in 0..MAX_OBJECTS {
            let slot = (self.next_slot + step) % MAX_OBJECTS;
            if self.slots[slot].is_none() {
                self.slots[slot] = Some(object.wrap());
                self.next_slot = (slot + 1) % MAX_OBJECTS;
                self.count += 1;
                return Some(slot as u32 + UID_OFFSET);
            }
        }
        warn!("kernel object table is full");
        None
    }

    /// Removes and returns the object behind `uid`.
    pub fn destroy(&mut self, uid: Uid) -> Option<KernelObject> {
        let object = slot_of(uid).and_then(|slot| self.slots[slot].take());
        match object {
            Some(object) => {
                self.count -= 1;
                Some(object)
            }
            None => {
                warn!("attempt to destroy stale uid {uid:#x}");
                None
            }
        }
    }

    /// Removes `uid` only if it names a `T`.
    pub fn destroy_as<T: KernelObjectType>(&mut self, uid: Uid) -> Option<T> {
        if self.kind(uid) != Some(T::KIND) {
            return None;
        }
        let slot = slot_of(uid)?;
        let object = self.slots[slot].take()?;
        self.count -= 1;
        T::unwrap_owned(object)
    }

    #[must_use]
    pub fn get<T: KernelObjectType>(&self, uid: Uid) -> Option<&T> {
        let slot = slot_of(uid)?;
        self.slots[slot].as_ref().and_then(T::unwrap_ref)
    }

    pub fn get_mut<T: KernelObjectType>(&mut self, uid: Uid) -> Option<&mut T> {
        let slot = slot_of(uid)?;
        self.slots[slot].as_mut().and_then(T::unwrap_mut)
    }

    #[must_use]
    pub fn kind(&self, uid: Uid) -> Option<ObjectKind> {
        let slot = slot_of(uid)?;
        self.slots[slot].as_ref().map(KernelObject::kind)
    }

    #[must_use]
    pub fn name(&self, uid: Uid) -> Option<&str> {
        let slot = slot_of(uid)?;
        self.slots[slot].as_ref().map(KernelObject::name)
    }

    /// UIDs of every live `T`, in slot order.
    #[must_use]
    pub fn uids_of<T: KernelObjectType>(&self) -> Vec<Uid> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(|o| o.kind() == T::KIND))
            .map(|(slot, _)| slot as u32 + UID_OFFSET)
            .collect()
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Drops every object.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.next_slot = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block(name: &str) -> MemoryBlock {
        MemoryBlock {
            name: name.to_string(),
            partition: 2,
            address: 0x0880_0000,
            size: 0x100,
        }
    }

    #[test]
    fn uids_start_past_zero_and_round_robin() {
        let mut table = ObjectTable::new();
        let a = table.create(block("a")).unwrap();
        let b = table.create(block("b")).unwrap();
        assert_eq!(a, 0x100);
        assert_eq!(b, 0x101);
        table.destroy(a);
        // The freed slot is not reused until the scan wraps around.
        let c = table.create(block("c")).unwrap();
        assert_eq!(c, 0x102);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn lookups_are_type_checked() {
        let mut table = ObjectTable::new();
        let uid = table.create(block("a")).unwrap();
        assert!(table.get::<MemoryBlock>(uid).is_some());
        assert!(table.get::<OpenFile>(uid).is_none());
        assert!(table.get::<MemoryBlock>(0).is_none());
        assert!(table.get::<MemoryBlock>(uid + 1).is_none());
        assert_eq!(table.kind(uid), Some(ObjectKind::MemoryBlock));
        assert_eq!(table.name(uid), Some("a"));
    }

    #[test]
    fn stale_uids_are_rejected() {
        let mut table = ObjectTable::new();
        let uid = table.create(block("a")).unwrap();
        assert!(table.destroy(uid).is_some());
        assert!(table.destroy(uid).is_none());
        assert!(table.get::<MemoryBlock>(uid).is_none());
        assert!(table.destroy_as::<MemoryBlock>(uid).is_none());
    }

    #[test]
    fn full_table_refuses_new_objects() {
        let mut table = ObjectTable::new();
        for i in 0..MAX_OBJECTS {
            assert!(table.create(block(&i.to_string())).is_some());
        }
        assert_eq!(table.create(block("overflow")), None);
        assert_eq!(table.uids_of::<MemoryBlock>().len(), MAX_OBJECTS);
    }
}
