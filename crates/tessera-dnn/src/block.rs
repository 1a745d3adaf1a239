//! Arena of shared host/device blocks.
//!
//! A block owns one device allocation, the host tensor it mirrors, the pin on
//! that host range, the stream copies run on and the coherence state. Every
//! [`CoherentBuffer`](crate::CoherentBuffer) aliasing the block holds a counted
//! [`BlockRef`]; the block is released when the last one drops.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_core::{HostTensor, Result, TesseraError};
use tessera_kernels::{DeviceBuffer, ExecutionStream, HostPin};

/// Which side of a block holds the latest data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coherence {
    /// Host and device agree.
    #[default]
    Clean,
    /// The host was written; the device copy is stale.
    HostAhead,
    /// The device was written; the host copy is stale.
    DeviceAhead,
}

impl Coherence {
    pub fn host_dirty(self) -> bool {
        self == Coherence::HostAhead
    }

    pub fn device_dirty(self) -> bool {
        self == Coherence::DeviceAhead
    }
}

/// State shared by every alias of one tensor.
///
/// Field order is drop order: the pin is released before the host buffer it
/// covers, and the device allocation before the stream.
pub(crate) struct Block {
    pub(crate) pin: HostPin,
    pub(crate) device: DeviceBuffer,
    pub(crate) stream: ExecutionStream,
    pub(crate) coherence: Coherence,
    pub(crate) host: HostTensor,
}

struct Slot {
    generation: u32,
    refs: usize,
    block: Option<Block>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

/// Slot storage for shared blocks. Cloning shares the arena.
#[derive(Clone, Default)]
pub struct BlockArena {
    inner: Arc<Mutex<Slots>>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, block: Block) -> BlockRef {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index];
                slot.refs = 1;
                slot.block = Some(block);
                index
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    refs: 1,
                    block: Some(block),
                });
                inner.slots.len() - 1
            }
        };
        let generation = inner.slots[index].generation;
        BlockRef {
            arena: self.clone(),
            index,
            generation,
        }
    }

    /// Blocks currently alive.
    pub fn live_blocks(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.block.is_some()).count()
    }

    /// Slots allocated so far, live or free.
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl fmt::Debug for BlockArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BlockArena")
            .field("slots", &inner.slots.len())
            .field("free", &inner.free.len())
            .finish()
    }
}

/// Counted reference to one arena block.
pub struct BlockRef {
    arena: BlockArena,
    index: usize,
    generation: u32,
}

impl BlockRef {
    /// Run `f` with exclusive access to the block.
    ///
    /// `f` must not touch the arena again; the arena lock is held for its
    /// duration.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Block) -> R) -> Result<R> {
        let mut inner = self.arena.inner.lock();
        match inner.slots.get_mut(self.index) {
            Some(Slot {
                generation,
                block: Some(block),
                ..
            }) if *generation == self.generation => Ok(f(block)),
            _ => Err(TesseraError::invalid(format!(
                "stale block reference {}#{}",
                self.index, self.generation
            ))),
        }
    }

    /// Number of live references to this block.
    pub fn ref_count(&self) -> usize {
        let inner = self.arena.inner.lock();
        inner.slots.get(self.index).map_or(0, |s| s.refs)
    }

    pub fn same_block(&self, other: &BlockRef) -> bool {
        Arc::ptr_eq(&self.arena.inner, &other.arena.inner)
            && self.index == other.index
            && self.generation == other.generation
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        self.arena.inner.lock().slots[self.index].refs += 1;
        Self {
            arena: self.arena.clone(),
            index: self.index,
            generation: self.generation,
        }
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        let released = {
            let mut inner = self.arena.inner.lock();
            let slot = &mut inner.slots[self.index];
            slot.refs -= 1;
            if slot.refs == 0 {
                slot.generation = slot.generation.wrapping_add(1);
                let block = slot.block.take();
                inner.free.push(self.index);
                block
            } else {
                None
            }
        };
        // Device resources are released outside the arena lock.
        if released.is_some() {
            tracing::debug!(slot = self.index, "released shared block");
        }
        drop(released);
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRef({}#{})", self.index, self.generation)
    }
}
