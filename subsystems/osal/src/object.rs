//! # Kernel Objects
//!
//! Every primitive lives in a per-kind [`ObjectTable`] and is referred to by
//! a generation-checked [`Handle`]. Deleting an object bumps its slot's
//! generation, so a stale handle is rejected with `InvalidArg` instead of
//! reaching freed state. Lookups are O(1).
//!
//! Creation attributes share one shape: a name, attribute bits, and the
//! origin of the control block memory.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

use spin::RwLock;
use static_assertions::assert_eq_size;

use crate::error::{OsalError, OsalResult};

/// Typed, generation-checked reference to a kernel object
pub struct Handle<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

assert_eq_size!(Handle<()>, u64);

impl<K> Handle<K> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _kind: PhantomData,
        }
    }

    /// Pack into an opaque pointer-sized value
    pub fn as_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Rebuild from [`as_raw`](Self::as_raw). A forged value is caught at
    /// lookup time.
    pub fn from_raw(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_raw().hash(state);
    }
}

impl<K> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Origin of a control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlBlock {
    /// Allocated and owned by the layer
    #[default]
    Dynamic,
    /// Supplied by the caller; `size` bytes reserved for the control block
    Static {
        /// Bytes the caller set aside
        size: usize,
    },
}

impl ControlBlock {
    /// Check a caller-supplied block can hold `required` bytes
    pub fn validate(self, required: usize) -> OsalResult<()> {
        match self {
            ControlBlock::Dynamic => Ok(()),
            ControlBlock::Static { size } if size == 0 || size < required => {
                Err(OsalError::InvalidArg)
            }
            ControlBlock::Static { .. } => Ok(()),
        }
    }

    /// Is this caller-managed memory?
    pub fn is_static(self) -> bool {
        matches!(self, ControlBlock::Static { .. })
    }
}

/// Creation attributes shared by every primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectAttr {
    /// Human-readable name
    pub name: Option<&'static str>,
    /// Attribute bits; reserved (must be zero) unless a primitive says otherwise
    pub attr_bits: u32,
    /// Control block memory
    pub cb_mem: ControlBlock,
}

impl ObjectAttr {
    /// Attributes with just a name
    pub const fn named(name: &'static str) -> Self {
        Self {
            name: Some(name),
            attr_bits: 0,
            cb_mem: ControlBlock::Dynamic,
        }
    }

    /// Reject attribute bits outside `allowed` when `strict` is set
    pub(crate) fn check_bits(&self, allowed: u32, strict: bool) -> OsalResult<()> {
        if strict && self.attr_bits & !allowed != 0 {
            return Err(OsalError::InvalidArg);
        }
        Ok(())
    }
}

/// Data memory of a message queue
#[derive(Default)]
pub enum MessageMemory {
    /// Allocated and owned by the layer
    #[default]
    Dynamic,
    /// Caller-supplied slot storage
    Static(&'static mut [u8]),
}

impl fmt::Debug for MessageMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageMemory::Dynamic => f.write_str("Dynamic"),
            MessageMemory::Static(buf) => write!(f, "Static({} bytes)", buf.len()),
        }
    }
}

struct Slot<T> {
    generation: u32,
    object: Option<Arc<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Arena of one kind of kernel object
pub(crate) struct ObjectTable<K, T> {
    inner: RwLock<Slots<T>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, T> fmt::Debug for ObjectTable<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTable").field("live", &self.len()).finish()
    }
}

impl<K, T> ObjectTable<K, T> {
    pub(crate) const fn new() -> Self {
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            _kind: PhantomData,
        }
    }

    /// Store an object and hand out its handle
    pub(crate) fn insert(&self, object: T) -> OsalResult<Handle<K>> {
        let mut inner = self.inner.write();
        let object = Some(Arc::new(object));
        let handle = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.object = object;
                Handle::new(index, slot.generation)
            }
            None => {
                let index = u32::try_from(inner.slots.len()).map_err(|_| OsalError::Fail)?;
                inner.slots.push(Slot { generation: 0, object });
                Handle::new(index, 0)
            }
        };
        inner.live += 1;
        Ok(handle)
    }

    /// Resolve a handle
    pub(crate) fn get(&self, handle: Handle<K>) -> OsalResult<Arc<T>> {
        let inner = self.inner.read();
        match inner.slots.get(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation => {
                slot.object.clone().ok_or(OsalError::InvalidArg)
            }
            _ => Err(OsalError::InvalidArg),
        }
    }

    /// Detach an object; its handle (and copies of it) become stale
    pub(crate) fn remove(&self, handle: Handle<K>) -> OsalResult<Arc<T>> {
        let mut inner = self.inner.write();
        let slot = inner
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(OsalError::InvalidArg)?;
        let object = slot.object.take().ok_or(OsalError::InvalidArg)?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        inner.live -= 1;
        Ok(object)
    }

    /// Live objects with their handles
    pub(crate) fn snapshot(&self) -> Vec<(Handle<K>, Arc<T>)> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.object
                    .clone()
                    .map(|object| (Handle::new(index as u32, slot.generation), object))
            })
            .collect()
    }

    /// Number of live objects
    pub(crate) fn len(&self) -> usize {
        self.inner.read().live
    }
}
