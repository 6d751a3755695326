//! Explicit per-thread draw-bucket registry (§5, §9 Design Notes).
//!
//! Rather than a hidden thread-local static with ambient global state, each
//! producer thread owns a small map of `BatchKey -> DrawBucket` held in a
//! registry keyed by `ThreadId` (§4.F: "routes to the producer's
//! thread-local bucket keyed by `BatchKey = material.effect`"). A
//! `thread_local!` cell caches the calling thread's slot index so the hot
//! `enqueue` path only takes the registry lock once per thread, on first use.

use crate::staging::DrawBucket;
use crate::types::BatchKey;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::thread::ThreadId;

struct Slot {
    thread_id: ThreadId,
    buckets: Mutex<FxHashMap<BatchKey, DrawBucket>>,
}

/// Owns one `BatchKey -> DrawBucket` map per producer thread that has ever
/// enqueued a draw.
#[derive(Default)]
pub struct ThreadBucketRegistry {
    slots: Mutex<Vec<Slot>>,
}

thread_local! {
    static CACHED_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

impl ThreadBucketRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_index(&self) -> usize {
        let this_thread = std::thread::current().id();
        CACHED_SLOT.with(|cell| {
            if let Some(idx) = cell.get() {
                return idx;
            }
            let mut slots = self.slots.lock();
            let idx = slots
                .iter()
                .position(|s| s.thread_id == this_thread)
                .unwrap_or_else(|| {
                    slots.push(Slot {
                        thread_id: this_thread,
                        buckets: Mutex::new(FxHashMap::default()),
                    });
                    slots.len() - 1
                });
            cell.set(Some(idx));
            idx
        })
    }

    /// Runs `f` against the calling thread's bucket for `key`, creating it on
    /// first use.
    pub fn with_bucket<R>(&self, key: BatchKey, f: impl FnOnce(&mut DrawBucket) -> R) -> R {
        let idx = self.slot_index();
        let slots = self.slots.lock();
        let mut buckets = slots[idx].buckets.lock();
        let bucket = buckets.entry(key).or_insert_with(DrawBucket::new);
        f(bucket)
    }

    /// Calls `f` once per `(BatchKey, &DrawBucket)` pair currently holding
    /// draws, across every registered thread, used by the merge step of
    /// [`crate::batch::batcher::DrawBatcher::execute`].
    pub fn for_each_non_empty(&self, mut f: impl FnMut(BatchKey, &DrawBucket)) {
        let slots = self.slots.lock();
        for slot in slots.iter() {
            let buckets = slot.buckets.lock();
            for (key, bucket) in buckets.iter() {
                if !bucket.is_empty() {
                    f(*key, bucket);
                }
            }
        }
    }

    /// Clears every registered bucket, called after a successful merge.
    pub fn clear_all(&self) {
        let slots = self.slots.lock();
        for slot in slots.iter() {
            for bucket in slot.buckets.lock().values_mut() {
                bucket.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingSphere, MeshPartId, TransformSlot};

    #[test]
    fn with_bucket_reuses_same_slot_on_same_thread() {
        let registry = ThreadBucketRegistry::new();
        let key = BatchKey(1);
        registry.with_bucket(key, |b| {
            b.add(
                MeshPartId(0),
                0,
                TransformSlot(0),
                BoundingSphere::new([0.0; 3], 1.0),
                0,
                &[],
            );
        });
        registry.with_bucket(key, |b| {
            b.add(
                MeshPartId(0),
                0,
                TransformSlot(1),
                BoundingSphere::new([0.0; 3], 1.0),
                0,
                &[],
            );
        });

        let mut total = 0;
        registry.for_each_non_empty(|_, b| total += b.len());
        assert_eq!(total, 2);
    }

    #[test]
    fn distinct_batch_keys_on_same_thread_stay_separate() {
        let registry = ThreadBucketRegistry::new();
        registry.with_bucket(BatchKey(1), |b| {
            b.add(MeshPartId(0), 0, TransformSlot(0), BoundingSphere::new([0.0; 3], 1.0), 0, &[]);
        });
        registry.with_bucket(BatchKey(2), |b| {
            b.add(MeshPartId(0), 0, TransformSlot(0), BoundingSphere::new([0.0; 3], 1.0), 0, &[]);
        });

        let mut keys_seen = 0;
        registry.for_each_non_empty(|_, _| keys_seen += 1);
        assert_eq!(keys_seen, 2);
    }

    #[test]
    fn clear_all_empties_every_bucket() {
        let registry = ThreadBucketRegistry::new();
        registry.with_bucket(BatchKey(1), |b| {
            b.add(
                MeshPartId(0),
                0,
                TransformSlot(0),
                BoundingSphere::new([0.0; 3], 1.0),
                0,
                &[],
            );
        });
        registry.clear_all();
        let mut total = 0;
        registry.for_each_non_empty(|_, b| total += b.len());
        assert_eq!(total, 0);
    }
}
