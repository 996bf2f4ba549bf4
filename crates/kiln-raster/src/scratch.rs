//! Staging of transient client data for asynchronous draws.
//!
//! Each data class (vertices, indices, per-stage constants) gets its own ring.
//! A ring is sized so `max_draws_in_flight` copies of the largest per-draw
//! payload fit without reuse. Growing never reallocates in place: the old
//! buffer is handed to the fence and a fresh one takes over, since queued
//! draws may still be reading the old bytes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::fence::{DeferredWork, FenceLink};
use crate::ring_arena::RingArena;
use crate::shader::ShaderStage;
use crate::stats::EngineStats;

/// Offsets handed out by the rings are multiples of this.
pub const SCRATCH_ALIGNMENT: u64 = 4;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchClass {
    Vertex,
    Index,
    Constants(ShaderStage),
}

impl ScratchClass {
    const COUNT: usize = 2 + ShaderStage::COUNT;

    fn index(self) -> usize {
        match self {
            ScratchClass::Vertex => 0,
            ScratchClass::Index => 1,
            ScratchClass::Constants(stage) => 2 + stage.index(),
        }
    }
}

/// One allocation backing a scratch ring.
pub struct ScratchBuffer {
    id: u64,
    bytes: RwLock<Box<[u8]>>,
}

impl ScratchBuffer {
    fn try_new(capacity: usize) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).ok()?;
        bytes.resize(capacity, 0);
        Some(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            bytes: RwLock::new(bytes.into_boxed_slice()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.bytes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self
            .bytes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A staged copy of client data. Holds its buffer alive.
#[derive(Clone)]
pub struct ScratchRegion {
    buffer: Arc<ScratchBuffer>,
    offset: u64,
    len: u64,
    retire: u64,
}

impl ScratchRegion {
    pub fn buffer_id(&self) -> u64 {
        self.buffer.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fence value after which the bytes may be overwritten.
    pub fn retire(&self) -> u64 {
        self.retire
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn overlaps(&self, other: &ScratchRegion) -> bool {
        self.buffer.id == other.buffer.id && self.offset < other.end() && other.offset < self.end()
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self
            .buffer
            .bytes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&bytes[self.offset as usize..self.end() as usize])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }
}

impl fmt::Debug for ScratchRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchRegion")
            .field("buffer", &self.buffer.id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("retire", &self.retire)
            .finish()
    }
}

/// Outcome of staging client-owned vertex data.
#[derive(Debug, Clone)]
pub enum ClientStaging {
    Staged(ScratchRegion),
    /// Too large to copy; the draw must read the client bytes in place and
    /// block until done.
    Bypass,
}

#[derive(Default)]
struct ScratchSpace {
    buffer: Option<Arc<ScratchBuffer>>,
    arena: Option<RingArena>,
}

pub struct ScratchAllocator {
    spaces: [ScratchSpace; ScratchClass::COUNT],
    max_draws_in_flight: u64,
    client_copy_limit: u64,
    stats: Arc<EngineStats>,
}

impl ScratchAllocator {
    pub fn new(max_draws_in_flight: u32, client_copy_limit: u64, stats: Arc<EngineStats>) -> Self {
        Self {
            spaces: Default::default(),
            max_draws_in_flight: u64::from(max_draws_in_flight.max(1)),
            client_copy_limit,
            stats,
        }
    }

    pub fn capacity(&self, class: ScratchClass) -> u64 {
        self.spaces[class.index()]
            .arena
            .as_ref()
            .map_or(0, RingArena::capacity)
    }

    pub fn client_copy_limit(&self) -> u64 {
        self.client_copy_limit
    }

    /// Stage client vertex data unless it is at or above the copy limit.
    pub fn stage_client(
        &mut self,
        class: ScratchClass,
        data: &[u8],
        link: FenceLink<'_>,
    ) -> ClientStaging {
        if data.len() as u64 >= self.client_copy_limit {
            return ClientStaging::Bypass;
        }
        ClientStaging::Staged(self.stage(class, Some(data), data.len(), link))
    }

    /// Reserve `size` bytes in `class`'s ring and copy `data` in.
    ///
    /// Blocks on the fence when the reservation would overwrite bytes a queued
    /// draw may still read.
    pub fn stage(
        &mut self,
        class: ScratchClass,
        data: Option<&[u8]>,
        size: usize,
        link: FenceLink<'_>,
    ) -> ScratchRegion {
        assert!(size > 0, "staging a zero-sized {class:?} payload");
        if let Some(data) = data {
            assert!(
                data.len() >= size,
                "staging {size} bytes from a {} byte slice",
                data.len()
            );
        }

        let size = size as u64;
        let required = size.saturating_mul(self.max_draws_in_flight);
        if required > self.capacity(class) {
            self.grow(class, required, link);
        }

        let space = &mut self.spaces[class.index()];
        let (Some(buffer), Some(arena)) = (space.buffer.as_ref(), space.arena.as_mut()) else {
            panic!("{class:?} scratch space has no buffer after growth");
        };
        arena.retire(link.fence.read());

        let Some(placement) = arena.placement(size, SCRATCH_ALIGNMENT) else {
            panic!(
                "{class:?} scratch ring of {} bytes cannot hold {size} bytes",
                arena.capacity()
            );
        };
        if let Some(retire) = arena.blocking_retire(placement.offset, size) {
            self.stats.inc_scratch_wrap_waits();
            tracing::debug!(
                ?class,
                offset = placement.offset,
                retire,
                "scratch ring wrapped onto in-flight data; waiting"
            );
            link.wait_for(retire);
            arena.retire(link.fence.read());
        }

        let retire = link.fence.write() + 1;
        arena.commit(placement.offset, size, retire);
        if let Some(data) = data {
            buffer.write(placement.offset as usize, &data[..size as usize]);
        }
        self.stats.add_scratch_bytes_staged(size);

        ScratchRegion {
            buffer: Arc::clone(buffer),
            offset: placement.offset,
            len: size,
            retire,
        }
    }

    fn grow(&mut self, class: ScratchClass, capacity: u64, link: FenceLink<'_>) {
        let space = &mut self.spaces[class.index()];
        if let Some(old) = space.buffer.take() {
            link.fence.attach(DeferredWork::FreeScratch(old));
        }

        let buffer = match ScratchBuffer::try_new(capacity as usize) {
            Some(buffer) => buffer,
            None => {
                // Let everything drain so the retired buffers actually go away,
                // then try once more.
                tracing::warn!(?class, capacity, "scratch allocation failed; stalling");
                link.flush_and_finish();
                ScratchBuffer::try_new(capacity as usize).unwrap_or_else(|| {
                    panic!("failed to allocate a {capacity} byte {class:?} scratch buffer")
                })
            }
        };

        tracing::debug!(?class, capacity, buffer = buffer.id, "grew scratch space");
        self.stats.inc_scratch_grows();
        space.buffer = Some(Arc::new(buffer));
        space.arena = Some(RingArena::new(capacity));
    }

    /// Hand every buffer to the fence. Used at context teardown.
    pub fn release(&mut self, link: FenceLink<'_>) {
        for space in &mut self.spaces {
            if let Some(buffer) = space.buffer.take() {
                link.fence.attach(DeferredWork::FreeScratch(buffer));
            }
            space.arena = None;
        }
    }
}

impl fmt::Debug for ScratchAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchAllocator")
            .field("max_draws_in_flight", &self.max_draws_in_flight)
            .field("client_copy_limit", &self.client_copy_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;
    use crate::backend::BackendContextId;
    use crate::fence::Fence;

    fn allocator(max_draws: u32) -> ScratchAllocator {
        ScratchAllocator::new(max_draws, 1024, Arc::new(EngineStats::new()))
    }

    #[test]
    fn first_use_sizes_for_draws_in_flight() {
        let backend = RecordingBackend::inline();
        let fence = Fence::new();
        let link = FenceLink::new(&fence, &backend, BackendContextId(1));
        let mut scratch = allocator(4);

        let region = scratch.stage(ScratchClass::Vertex, Some(&[1, 2, 3, 4]), 4, link);
        assert_eq!(scratch.capacity(ScratchClass::Vertex), 16);
        assert_eq!(scratch.capacity(ScratchClass::Index), 0);
        assert_eq!(region.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(region.retire(), 1);
    }

    #[test]
    fn growth_retires_the_old_buffer_through_the_fence() {
        let backend = RecordingBackend::deferred();
        let fence = Fence::new();
        let link = FenceLink::new(&fence, &backend, BackendContextId(1));
        let mut scratch = allocator(2);

        let small = scratch.stage(ScratchClass::Index, Some(&[7; 8]), 8, link);
        let big = scratch.stage(ScratchClass::Index, Some(&[9; 32]), 32, link);
        assert_ne!(small.buffer_id(), big.buffer_id());
        assert_eq!(scratch.capacity(ScratchClass::Index), 64);
        assert_eq!(fence.queued_work(), 1);

        // The old region is still readable until the fence retires the buffer.
        assert_eq!(small.to_vec(), vec![7; 8]);
        fence.submit(&backend, BackendContextId(1));
        backend.complete_all();
        assert_eq!(fence.queued_work(), 0);
        assert_eq!(small.to_vec(), vec![7; 8]);
    }

    #[test]
    fn client_data_at_the_limit_bypasses_staging() {
        let backend = RecordingBackend::inline();
        let fence = Fence::new();
        let link = FenceLink::new(&fence, &backend, BackendContextId(1));
        let mut scratch = ScratchAllocator::new(2, 16, Arc::new(EngineStats::new()));

        assert!(matches!(
            scratch.stage_client(ScratchClass::Vertex, &[0; 15], link),
            ClientStaging::Staged(_)
        ));
        assert!(matches!(
            scratch.stage_client(ScratchClass::Vertex, &[0; 16], link),
            ClientStaging::Bypass
        ));
    }

    #[test]
    #[should_panic(expected = "zero-sized")]
    fn zero_sized_stage_is_a_precondition_violation() {
        let backend = RecordingBackend::inline();
        let fence = Fence::new();
        let link = FenceLink::new(&fence, &backend, BackendContextId(1));
        allocator(2).stage(ScratchClass::Vertex, None, 0, link);
    }
}
