//! §4.C Transform Store.
//!
//! Fixed-capacity dense array mapping entity → matrix, with per-in-flight-
//! frame dirty tracking so `upload()` only re-copies what actually changed
//! this frame. Reads are lock-free for consumers (plain slice indexing once
//! the write lock for the current frame's upload has been released);
//! writers take the single coarse lock the teacher's `CpuBuffer` pattern
//! uses for its internal state.

use crate::errors::{Error, Result};
use glam::Mat4;
use parking_lot::RwLock;

/// Per-frame-ring dirty bitset over `MaxSlots` slots.
struct DirtyBits {
    words: Vec<u64>,
    any_dirty: bool,
}

impl DirtyBits {
    fn new(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(64);
        Self {
            words: vec![0; words],
            any_dirty: false,
        }
    }

    fn set(&mut self, slot: u32) {
        let (word, bit) = (slot as usize / 64, slot as usize % 64);
        self.words[word] |= 1u64 << bit;
        self.any_dirty = true;
    }

    fn is_set(&self, slot: u32) -> bool {
        let (word, bit) = (slot as usize / 64, slot as usize % 64);
        (self.words[word] >> bit) & 1 != 0
    }

    fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.any_dirty = false;
    }

    fn grow(&mut self, capacity: u32) {
        self.words.resize((capacity as usize).div_ceil(64), 0);
    }
}

struct Inner {
    /// Pre-transposed model matrices, ready for direct upload to the shader.
    transforms: Vec<Mat4>,
    material_id: Vec<u32>,
    dirty: Vec<DirtyBits>,
    next_slot: u32,
    capacity: u32,
    free_list: Vec<(u32, u64)>, // (slot, frame at which it becomes reusable)
}

pub struct TransformStore {
    max_slots: u32,
    in_flight_frames: u32,
    inner: RwLock<Inner>,
}

impl TransformStore {
    #[must_use]
    pub fn new(max_slots: u32, in_flight_frames: u32) -> Self {
        let initial_capacity = max_slots.min(1024).max(1);
        Self {
            max_slots,
            in_flight_frames,
            inner: RwLock::new(Inner {
                transforms: vec![Mat4::IDENTITY; initial_capacity as usize],
                material_id: vec![0; initial_capacity as usize],
                dirty: (0..in_flight_frames)
                    .map(|_| DirtyBits::new(initial_capacity))
                    .collect(),
                next_slot: 0,
                capacity: initial_capacity,
                free_list: Vec::new(),
            }),
        }
    }

    /// Allocates a slot and marks it dirty in all `N` frame-ring slots.
    pub fn allocate_slot(&self, current_frame: u64) -> Result<crate::types::TransformSlot> {
        let mut inner = self.inner.write();

        // Prefer a released slot whose reuse deadline has passed.
        if let Some(pos) = inner
            .free_list
            .iter()
            .position(|&(_, ready_at)| ready_at <= current_frame)
        {
            let (slot, _) = inner.free_list.swap_remove(pos);
            for d in &mut inner.dirty {
                d.set(slot);
            }
            return Ok(crate::types::TransformSlot(slot));
        }

        if inner.next_slot >= self.max_slots {
            return Err(Error::TransformStoreExhausted {
                max_slots: self.max_slots,
            });
        }

        let slot = inner.next_slot;
        inner.next_slot += 1;

        if slot >= inner.capacity {
            let new_cap = crate::util::grow_capacity(inner.capacity, slot + 1).min(self.max_slots);
            inner.transforms.resize(new_cap as usize, Mat4::IDENTITY);
            inner.material_id.resize(new_cap as usize, 0);
            for d in &mut inner.dirty {
                d.grow(new_cap);
            }
            inner.capacity = new_cap;
        }

        for d in &mut inner.dirty {
            d.set(slot);
        }
        Ok(crate::types::TransformSlot(slot))
    }

    /// Entity destruction: the slot becomes reusable after `N + 1` frames,
    /// mirroring the bindless table's reclamation window.
    pub fn release_slot(&self, slot: crate::types::TransformSlot, current_frame: u64) {
        let mut inner = self.inner.write();
        let ready_at = current_frame + u64::from(self.in_flight_frames) + 1;
        inner.free_list.push((slot.0, ready_at));
    }

    /// Writes `matrix` (transposed before storage, per the shader ABI) and
    /// marks the slot dirty in all `N` frames. `slot >= next_slot` is a
    /// documented no-op.
    pub fn set_transform(&self, slot: crate::types::TransformSlot, matrix: Mat4, material_id: u32) {
        let mut inner = self.inner.write();
        if slot.0 >= inner.next_slot {
            return;
        }
        inner.transforms[slot.0 as usize] = matrix.transpose();
        inner.material_id[slot.0 as usize] = material_id;
        for d in &mut inner.dirty {
            d.set(slot.0);
        }
    }

    /// Copies only `frame_slot`'s dirty rows into `dest` (representing this
    /// frame's ring-slot GPU buffer region) and clears only that frame's
    /// dirty bits. Other frames' dirty bits are left untouched.
    pub fn upload(&self, frame_slot: u32, dest: &mut [Mat4]) {
        let mut inner = self.inner.write();
        let idx = frame_slot as usize;
        let count = inner.next_slot as usize;
        debug_assert!(dest.len() >= count);

        if !inner.dirty[idx].any_dirty {
            return;
        }

        for slot in 0..count {
            if inner.dirty[idx].is_set(slot as u32) {
                dest[slot] = inner.transforms[slot];
            }
        }
        inner.dirty[idx].clear_all();
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.inner.read().next_slot
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn allocate_marks_dirty_in_all_frames() {
        let store = TransformStore::new(16, 3);
        let slot = store.allocate_slot(0).unwrap();
        let inner = store.inner.read();
        for d in &inner.dirty {
            assert!(d.is_set(slot.0));
        }
    }

    #[test]
    fn upload_clears_only_that_frames_bit() {
        let store = TransformStore::new(16, 3);
        let slot = store.allocate_slot(0).unwrap();
        store.set_transform(slot, Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)), 7);

        let mut dest = vec![Mat4::IDENTITY; 16];
        store.upload(0, &mut dest);

        let inner = store.inner.read();
        assert!(!inner.dirty[0].is_set(slot.0), "frame 0 dirty bit must clear");
        assert!(inner.dirty[1].is_set(slot.0), "frame 1 bit must remain set");
        assert!(inner.dirty[2].is_set(slot.0), "frame 2 bit must remain set");
    }

    #[test]
    fn round_trip_across_n_frames_yields_final_value_everywhere() {
        let store = TransformStore::new(16, 3);
        let slot = store.allocate_slot(0).unwrap();
        let m = Mat4::from_translation(Vec3::new(4.0, 5.0, 6.0));
        store.set_transform(slot, m, 0);

        let mut dests = [vec![Mat4::IDENTITY; 16], vec![Mat4::IDENTITY; 16], vec![Mat4::IDENTITY; 16]];
        for (i, dest) in dests.iter_mut().enumerate() {
            store.upload(i as u32, dest);
        }

        for dest in &dests {
            assert_eq!(dest[slot.0 as usize], m.transpose());
        }
    }

    #[test]
    fn set_transform_on_unallocated_slot_is_noop() {
        let store = TransformStore::new(16, 3);
        // next_slot is 0, so slot 5 is unallocated.
        store.set_transform(crate::types::TransformSlot(5), Mat4::IDENTITY, 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn released_slot_not_reused_before_n_plus_one_frames() {
        let store = TransformStore::new(4, 3);
        let slot = store.allocate_slot(0).unwrap();
        store.release_slot(slot, 10);

        // ready_at = 10 + 3 + 1 = 14
        let alloc_early = store.allocate_slot(13).unwrap();
        assert_ne!(alloc_early, slot);

        let alloc_late = store.allocate_slot(14).unwrap();
        assert_eq!(alloc_late, slot);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let store = TransformStore::new(2, 3);
        store.allocate_slot(0).unwrap();
        store.allocate_slot(0).unwrap();
        assert!(store.allocate_slot(0).is_err());
    }
}
