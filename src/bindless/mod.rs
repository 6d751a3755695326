//! §4.A Bindless Resource Table.
//!
//! A single shader-visible descriptor heap per resource kind (CBV/SRV/UAV,
//! sampler, RTV, DSV). Every GPU buffer/texture view gets a stable
//! [`BindlessIndex`] that shaders index directly from 32-bit push constants.
//! A free list is consulted first; otherwise a monotonic counter advances.
//!
//! Double-free is validated in debug builds (a bitset, following the
//! teacher's debug-only `#[cfg(debug_assertions)]` fields on `BufferRef`).

use crate::errors::{Error, Result};
use crate::types::BindlessIndex;
use crate::util::grow_capacity;
use std::collections::VecDeque;

/// One shader-visible descriptor heap kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

/// A single descriptor heap: free-list allocator over a dense index space.
///
/// This is a pure logical structure — it does not hold wgpu resources, only
/// bytes-free bookkeeping, mirroring `ModelBufferAllocator`'s separation of
/// allocation logic from GPU object creation.
pub struct DescriptorHeap {
    kind: HeapKind,
    capacity: u32,
    next_free: u32,
    free_list: VecDeque<BindlessIndex>,
    /// frame at which a freed index becomes safe to reissue.
    pending_release: Vec<(BindlessIndex, u64)>,
    #[cfg(debug_assertions)]
    live: Vec<bool>,
}

impl DescriptorHeap {
    #[must_use]
    pub fn new(kind: HeapKind, initial_capacity: u32) -> Self {
        Self {
            kind,
            capacity: initial_capacity,
            next_free: 0,
            free_list: VecDeque::new(),
            pending_release: Vec::new(),
            #[cfg(debug_assertions)]
            live: vec![false; initial_capacity as usize],
        }
    }

    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Allocates a stable index. Exhaustion when the heap cannot grow
    /// further is fatal (returns `Err`); callers decide whether to abort.
    pub fn allocate(&mut self) -> Result<BindlessIndex> {
        if let Some(idx) = self.free_list.pop_front() {
            #[cfg(debug_assertions)]
            self.mark_live(idx, true);
            return Ok(idx);
        }

        if self.next_free >= self.capacity {
            let grown = grow_capacity(self.capacity, self.capacity + 1);
            self.grow_to(grown);
        }

        if self.next_free >= self.capacity {
            return Err(Error::BindlessTableExhausted {
                capacity: self.capacity,
            });
        }

        let idx = BindlessIndex(self.next_free);
        self.next_free += 1;
        #[cfg(debug_assertions)]
        self.mark_live(idx, true);
        Ok(idx)
    }

    /// Grows the heap's logical capacity (the backing descriptor array grows
    /// geometrically like every other buffer in this crate, per
    /// SPEC_FULL §4.A.1).
    fn grow_to(&mut self, new_capacity: u32) {
        if new_capacity <= self.capacity {
            return;
        }
        self.capacity = new_capacity;
        #[cfg(debug_assertions)]
        self.live.resize(new_capacity as usize, false);
    }

    #[cfg(debug_assertions)]
    fn mark_live(&mut self, idx: BindlessIndex, live: bool) {
        if (idx.0 as usize) >= self.live.len() {
            self.live.resize(idx.0 as usize + 1, false);
        }
        self.live[idx.0 as usize] = live;
    }

    /// Releases `idx`, safe to reissue once `release_frame + N + 1` has
    /// completed. A BindlessIndex freed at frame `f` is not reissued before
    /// frame `f + N + 1` completes (§3 invariant).
    pub fn release(&mut self, idx: BindlessIndex, current_frame: u64, in_flight_frames: u32) {
        #[cfg(debug_assertions)]
        {
            let is_live = self.live.get(idx.0 as usize).copied().unwrap_or(false);
            debug_assert!(is_live, "double free of bindless index {idx:?}");
            self.mark_live(idx, false);
        }
        let dispose_at = current_frame + u64::from(in_flight_frames) + 1;
        self.pending_release.push((idx, dispose_at));
    }

    /// Returns indices whose reclamation deadline has passed, making them
    /// available for reallocation. Call once per frame (e.g. `begin_frame`).
    pub fn reclaim(&mut self, current_frame: u64) {
        let mut i = 0;
        while i < self.pending_release.len() {
            if self.pending_release[i].1 <= current_frame {
                let (idx, _) = self.pending_release.swap_remove(i);
                self.free_list.push_back(idx);
            } else {
                i += 1;
            }
        }
    }
}

/// Holds one [`DescriptorHeap`] per kind, matching the GPU API's one-heap-
/// per-resource-type model (§4.A).
pub struct BindlessResourceTable {
    cbv_srv_uav: DescriptorHeap,
    sampler: DescriptorHeap,
    rtv: DescriptorHeap,
    dsv: DescriptorHeap,
}

impl BindlessResourceTable {
    #[must_use]
    pub fn new(initial_capacity: u32) -> Self {
        Self {
            cbv_srv_uav: DescriptorHeap::new(HeapKind::CbvSrvUav, initial_capacity),
            sampler: DescriptorHeap::new(HeapKind::Sampler, 256),
            rtv: DescriptorHeap::new(HeapKind::Rtv, 64),
            dsv: DescriptorHeap::new(HeapKind::Dsv, 16),
        }
    }

    pub fn heap_mut(&mut self, kind: HeapKind) -> &mut DescriptorHeap {
        match kind {
            HeapKind::CbvSrvUav => &mut self.cbv_srv_uav,
            HeapKind::Sampler => &mut self.sampler,
            HeapKind::Rtv => &mut self.rtv,
            HeapKind::Dsv => &mut self.dsv,
        }
    }

    pub fn allocate_srv(&mut self) -> Result<BindlessIndex> {
        self.cbv_srv_uav.allocate()
    }

    pub fn release_srv(&mut self, idx: BindlessIndex, current_frame: u64, in_flight_frames: u32) {
        self.cbv_srv_uav.release(idx, current_frame, in_flight_frames);
    }

    /// Called once at `begin_frame` for every heap.
    pub fn reclaim_all(&mut self, current_frame: u64) {
        self.cbv_srv_uav.reclaim(current_frame);
        self.sampler.reclaim(current_frame);
        self.rtv.reclaim(current_frame);
        self.dsv.reclaim(current_frame);
    }
}

impl Default for BindlessResourceTable {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_monotonically_when_free_list_empty() {
        let mut heap = DescriptorHeap::new(HeapKind::CbvSrvUav, 4);
        let a = heap.allocate().unwrap();
        let b = heap.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, BindlessIndex(0));
        assert_eq!(b, BindlessIndex(1));
    }

    #[test]
    fn freed_index_not_reissued_before_n_plus_one_frames() {
        let mut heap = DescriptorHeap::new(HeapKind::CbvSrvUav, 4);
        let idx = heap.allocate().unwrap();
        heap.release(idx, 10, 3);

        // dispose_at = 10 + 3 + 1 = 14
        heap.reclaim(13);
        assert!(heap.free_list.is_empty(), "must not be reclaimable yet");

        heap.reclaim(14);
        assert_eq!(heap.free_list.len(), 1);

        let reissued = heap.allocate().unwrap();
        assert_eq!(reissued, idx);
    }

    #[test]
    fn grows_geometrically_on_exhaustion() {
        let mut heap = DescriptorHeap::new(HeapKind::CbvSrvUav, 1);
        let _ = heap.allocate().unwrap();
        let second = heap.allocate().unwrap();
        assert_eq!(second, BindlessIndex(1));
        assert!(heap.capacity() >= 2);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_detected_in_debug() {
        let mut heap = DescriptorHeap::new(HeapKind::CbvSrvUav, 4);
        let idx = heap.allocate().unwrap();
        heap.release(idx, 0, 3);
        heap.release(idx, 0, 3);
    }
}
