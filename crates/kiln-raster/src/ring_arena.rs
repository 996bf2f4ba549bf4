use std::collections::VecDeque;
use std::fmt;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    // `value + alignment - 1` can overflow on pathological inputs, so use a
    // checked path and fall back to saturating behaviour.
    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// A byte range handed out by a [`RingArena`] that may still be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub offset: u64,
    pub len: u64,
    /// Fence value whose completion makes the range reusable.
    pub retire: u64,
}

impl LiveRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn overlaps(&self, offset: u64, len: u64) -> bool {
        self.offset < offset + len && offset < self.end()
    }
}

/// Where the next allocation lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub offset: u64,
    pub wrapped: bool,
}

/// Offset allocator over a fixed-capacity ring.
///
/// Tracks offsets only. Allocations advance a head cursor and wrap to zero
/// when the next one would run past the end. Each committed range remembers
/// the fence value that retires it; the owner must wait for that value before
/// committing anything that overlaps.
#[derive(Clone)]
pub struct RingArena {
    capacity: u64,
    head: u64,
    live: VecDeque<LiveRange>,
}

impl RingArena {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            head: 0,
            live: VecDeque::new(),
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Next allocation will be at or after this offset unless it wraps.
    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn live_ranges(&self) -> impl Iterator<Item = &LiveRange> {
        self.live.iter()
    }

    /// Where `size` bytes aligned to `alignment` would be placed, or `None`
    /// if the ring can never hold them.
    pub fn placement(&self, size: u64, alignment: u64) -> Option<Placement> {
        if size > self.capacity {
            return None;
        }
        let aligned = align_up(self.head, alignment.max(1));
        match aligned.checked_add(size) {
            Some(end) if end <= self.capacity => Some(Placement {
                offset: aligned,
                wrapped: false,
            }),
            _ => Some(Placement {
                offset: 0,
                wrapped: true,
            }),
        }
    }

    /// Largest retire value among live ranges that overlap `[offset, offset + len)`.
    pub fn blocking_retire(&self, offset: u64, len: u64) -> Option<u64> {
        self.live
            .iter()
            .filter(|range| range.overlaps(offset, len))
            .map(|range| range.retire)
            .max()
    }

    /// Forget every range whose retire value is at or below `completed`.
    pub fn retire(&mut self, completed: u64) {
        self.live.retain(|range| range.retire > completed);
    }

    pub fn commit(&mut self, offset: u64, len: u64, retire: u64) {
        debug_assert!(offset + len <= self.capacity);
        debug_assert!(
            self.blocking_retire(offset, len).is_none(),
            "committing over a live range"
        );
        self.live.push_back(LiveRange {
            offset,
            len,
            retire,
        });
        self.head = offset + len;
    }
}

impl fmt::Debug for RingArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingArena")
            .field("capacity", &self.capacity)
            .field("head", &self.head)
            .field("live", &self.live.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(u64::MAX, 16), u64::MAX / 16 * 16);
    }

    #[test]
    fn placement_wraps_only_past_the_end() {
        let mut ring = RingArena::new(64);
        assert_eq!(
            ring.placement(32, 4),
            Some(Placement {
                offset: 0,
                wrapped: false
            })
        );
        ring.commit(0, 32, 1);

        // Exactly fills the ring: no wrap.
        assert_eq!(ring.placement(32, 4).unwrap().offset, 32);
        ring.commit(32, 32, 1);

        let next = ring.placement(8, 4).unwrap();
        assert!(next.wrapped);
        assert_eq!(next.offset, 0);
        assert_eq!(ring.placement(65, 1), None);
    }

    #[test]
    fn overlapping_ranges_block_until_retired() {
        let mut ring = RingArena::new(64);
        ring.commit(0, 16, 1);
        ring.commit(16, 16, 2);
        ring.commit(32, 16, 3);

        assert_eq!(ring.blocking_retire(0, 8), Some(1));
        assert_eq!(ring.blocking_retire(8, 16), Some(2));
        assert_eq!(ring.blocking_retire(48, 16), None);

        ring.retire(2);
        assert_eq!(ring.blocking_retire(0, 32), None);
        assert_eq!(ring.live_ranges().count(), 1);
    }
}
