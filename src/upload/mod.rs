//! §4.B Ring Upload Arena.
//!
//! A persistently-mapped upload buffer with head-advance allocation. When a
//! request would cross the capacity boundary it wraps to 0, after asserting
//! the tail (oldest live allocation) has been released by the copy queue's
//! fence. A single mutex serializes allocation bookkeeping; actual copy
//! submission happens separately on the caller's command encoder.
//!
//! The allocator here is the same "pure logical structure, no GPU resources
//! owned" split the teacher uses for `ModelBufferAllocator`: this type only
//! tracks byte offsets, a host-visible `wgpu::Buffer` is created once at the
//! configured capacity and written into via `queue.write_buffer` at the
//! offsets this type hands out.

use parking_lot::Mutex;

/// One in-flight allocation, released once its upload has been consumed by
/// the GPU (i.e. the copy-queue fence for the submission it was part of has
/// signaled).
#[derive(Debug, Clone, Copy)]
struct LiveRegion {
    offset: u64,
    size: u64,
    fence_value: u64,
}

struct RingState {
    head: u64,
    /// Oldest outstanding allocation, in submission order.
    live: std::collections::VecDeque<LiveRegion>,
    /// Highest fence value the copy queue has signaled so far.
    completed_fence: u64,
}

pub struct RingUploadArena {
    capacity: u64,
    state: Mutex<RingState>,
}

#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub offset: u64,
    pub size: u64,
}

impl RingUploadArena {
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity: capacity_bytes,
            state: Mutex::new(RingState {
                head: 0,
                live: std::collections::VecDeque::new(),
                completed_fence: 0,
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn align_up(offset: u64, alignment: u64) -> u64 {
        debug_assert!(alignment.is_power_of_two());
        (offset + alignment - 1) & !(alignment - 1)
    }

    /// Reclaims live regions whose fence value has completed. Must be called
    /// (directly or via `allocate`'s wrap path) whenever `completed_fence`
    /// advances.
    fn reclaim_locked(state: &mut RingState) {
        while let Some(front) = state.live.front() {
            if front.fence_value <= state.completed_fence {
                state.live.pop_front();
            } else {
                break;
            }
        }
    }

    /// Notifies the arena that the copy queue has signaled up to
    /// `fence_value`, releasing any live regions tagged at or below it.
    pub fn on_fence_signaled(&self, fence_value: u64) {
        let mut state = self.state.lock();
        if fence_value > state.completed_fence {
            state.completed_fence = fence_value;
        }
        Self::reclaim_locked(&mut state);
    }

    /// Allocates `size` bytes aligned to `alignment`, tagging the region with
    /// `submission_fence_value` (the fence value the caller's eventual
    /// `queue.submit` will signal). Returns `None` if the ring genuinely has
    /// no room even after wrapping (the oldest region is still in flight).
    pub fn allocate(&self, size: u64, alignment: u64, submission_fence_value: u64) -> Option<Allocation> {
        assert!(size <= self.capacity, "allocation larger than arena capacity");
        let mut state = self.state.lock();
        Self::reclaim_locked(&mut state);

        let mut offset = Self::align_up(state.head, alignment);
        if offset + size > self.capacity {
            // Would cross the capacity boundary: wrap to 0, but only once the
            // tail (oldest live allocation) has actually been released.
            if state.live.iter().any(|r| r.offset + r.size > 0 && r.offset < self.capacity) {
                // There may still be live regions anywhere in [0, capacity);
                // specifically we must not overwrite anything still live in
                // the region we are about to reuse, i.e. [0, size).
                let wrap_conflicts = state
                    .live
                    .iter()
                    .any(|r| r.offset < size);
                if wrap_conflicts {
                    return None;
                }
            }
            offset = 0;
        }

        state.live.push_back(LiveRegion {
            offset,
            size,
            fence_value: submission_fence_value,
        });
        state.head = offset + size;
        Some(Allocation { offset, size })
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequentially_advancing_head() {
        let arena = RingUploadArena::new(1024);
        let a = arena.allocate(100, 16, 1).unwrap();
        let b = arena.allocate(100, 16, 1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 112); // aligned up from 100 to 16
    }

    #[test]
    fn wraps_to_zero_once_tail_is_released() {
        let arena = RingUploadArena::new(256);
        let first = arena.allocate(200, 16, 1).unwrap();
        assert_eq!(first.offset, 0);

        // A second allocation that would cross the 256-byte boundary must
        // wait until the first region's fence has signaled.
        assert!(arena.allocate(100, 16, 2).is_none());

        arena.on_fence_signaled(1);
        let wrapped = arena.allocate(100, 16, 2).unwrap();
        assert_eq!(wrapped.offset, 0);
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn alignment_is_honored() {
        let arena = RingUploadArena::new(1024);
        let a = arena.allocate(10, 256, 1).unwrap();
        let b = arena.allocate(10, 256, 1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
    }
}
