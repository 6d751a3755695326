//! §4.D Mesh Registry.
//!
//! Maps `(mesh, sub-part-index)` to a dense [`MeshPartId`]. Registration is
//! idempotent: registering the same pair twice returns the same id without
//! appending a second row. The accumulated structure-of-arrays table is
//! re-uploaded lazily, only when new entries have been appended since the
//! last upload — mirroring the teacher's `upload_if_dirty` convention on its
//! asset tables.

use crate::types::{BindlessIndex, BoundingSphere, MeshPartId};
use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// One registered mesh sub-part, stored as a struct-of-arrays row.
#[derive(Debug, Clone, Copy)]
pub struct MeshPartEntry {
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub position_srv: BindlessIndex,
    pub normal_srv: BindlessIndex,
    pub uv_srv: BindlessIndex,
    pub index_srv: BindlessIndex,
    pub bounds: BoundingSphere,
}

/// GPU-resident projection of [`MeshPartEntry`], stripped of the bounds
/// (the Visibility pass reads bounds from the per-instance bounding-sphere
/// buffer, not the mesh part) to match `command_emit.wgsl`'s `MeshPartEntry`
/// struct exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MeshPartGpu {
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub position_srv: u32,
    pub normal_srv: u32,
    pub uv_srv: u32,
    pub index_srv: u32,
}

impl MeshPartEntry {
    #[must_use]
    pub fn to_gpu(self) -> MeshPartGpu {
        MeshPartGpu {
            index_count: self.index_count,
            first_index: self.first_index,
            base_vertex: self.base_vertex,
            position_srv: self.position_srv.0,
            normal_srv: self.normal_srv.0,
            uv_srv: self.uv_srv.0,
            index_srv: self.index_srv.0,
        }
    }
}

struct Inner {
    entries: Vec<MeshPartEntry>,
    lookup: FxHashMap<(u64, u32), MeshPartId>,
    dirty_since_upload: bool,
}

/// Process-wide registry; one coarse `RwLock` guards both the lookup map and
/// the dense entry table, matching §5's "coarse mutex is sufficient" policy
/// for shared, amortized-cost allocators.
pub struct MeshRegistry {
    inner: RwLock<Inner>,
}

impl MeshRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                lookup: FxHashMap::default(),
                dirty_since_upload: false,
            }),
        }
    }

    /// Registers `(mesh_id, sub_part)` if not already known, returning its
    /// stable [`MeshPartId`]. Idempotent.
    pub fn register(&self, mesh_id: u64, sub_part: u32, entry: MeshPartEntry) -> MeshPartId {
        let key = (mesh_id, sub_part);
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.lookup.get(&key) {
                return id;
            }
        }

        let mut inner = self.inner.write();
        // Re-check under the write lock in case another thread raced us.
        if let Some(&id) = inner.lookup.get(&key) {
            return id;
        }

        let id = MeshPartId(inner.entries.len() as u32);
        inner.entries.push(entry);
        inner.lookup.insert(key, id);
        inner.dirty_since_upload = true;
        id
    }

    #[must_use]
    pub fn get(&self, id: MeshPartId) -> Option<MeshPartEntry> {
        self.inner.read().entries.get(id.0 as usize).copied()
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.inner.read().entries.len() as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the full struct-of-arrays table for upload and clears the dirty
    /// flag, or returns `None` if nothing changed since the last upload.
    pub fn upload_if_dirty(&self) -> Option<Vec<MeshPartEntry>> {
        let mut inner = self.inner.write();
        if !inner.dirty_since_upload {
            return None;
        }
        inner.dirty_since_upload = false;
        Some(inner.entries.clone())
    }
}

impl Default for MeshRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_entry() -> MeshPartEntry {
        MeshPartEntry {
            index_count: 36,
            first_index: 0,
            base_vertex: 0,
            position_srv: BindlessIndex(0),
            normal_srv: BindlessIndex(1),
            uv_srv: BindlessIndex(2),
            index_srv: BindlessIndex(3),
            bounds: BoundingSphere::new([0.0, 0.0, 0.0], 1.0),
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let reg = MeshRegistry::new();
        let a = reg.register(42, 0, dummy_entry());
        let b = reg.register(42, 0, dummy_entry());
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn distinct_sub_parts_get_distinct_ids() {
        let reg = MeshRegistry::new();
        let a = reg.register(42, 0, dummy_entry());
        let b = reg.register(42, 1, dummy_entry());
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn to_gpu_drops_bounds_and_keeps_srvs() {
        let entry = dummy_entry();
        let gpu = entry.to_gpu();
        assert_eq!(gpu.position_srv, 0);
        assert_eq!(gpu.index_srv, 3);
        assert_eq!(std::mem::size_of::<MeshPartGpu>(), 28);
    }

    #[test]
    fn upload_if_dirty_clears_flag() {
        let reg = MeshRegistry::new();
        reg.register(1, 0, dummy_entry());
        assert!(reg.upload_if_dirty().is_some());
        assert!(reg.upload_if_dirty().is_none());

        reg.register(2, 0, dummy_entry());
        assert!(reg.upload_if_dirty().is_some());
    }
}
