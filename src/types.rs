//! Core data-model types (§3).
//!
//! GPU-facing PODs are `#[repr(C)]` + `bytemuck::{Pod, Zeroable}` so they can
//! be blitted straight into upload-arena bytes, following the teacher's
//! `DynamicModelUniforms` convention.

use bytemuck::{Pod, Zeroable};

/// Opaque 32-bit handle into the Bindless Resource Table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindlessIndex(pub u32);

impl BindlessIndex {
    pub const INVALID: Self = Self(u32::MAX);

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

/// 32-bit index into the Transform Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransformSlot(pub u32);

/// Dense id for a (mesh, sub-part-index) pair; the unit a `DrawIndexedInstanced`
/// call is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshPartId(pub u32);

/// Per-instance `MeshPartId`, aliased for readability at call sites that care
/// about the histogram/scatter role rather than the registry lookup role.
pub type SubBatchId = MeshPartId;

/// Per-draw payload the vertex shader reads (12 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InstanceDescriptor {
    pub transform_slot: u32,
    pub material_id: u32,
    pub custom_data_index: u32,
}

/// Local-space bounding sphere (16 bytes); transformed per-frame by the
/// Visibility pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BoundingSphere {
    pub center: [f32; 3],
    pub radius: f32,
}

impl BoundingSphere {
    #[must_use]
    pub const fn new(center: [f32; 3], radius: f32) -> Self {
        Self { center, radius }
    }
}

/// Identity of a draw batch: one material-effect executes as one
/// `ExecuteIndirect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey(pub u64);

impl BatchKey {
    #[must_use]
    pub const fn from_material_effect(effect_id: u64) -> Self {
        Self(effect_id)
    }
}

/// Mirrors `D3D12_DRAW_INDEXED_ARGUMENTS` / `wgpu::util::DrawIndexedIndirectArgs`
/// byte layout, generated entirely on the GPU by the Command Emit pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawIndexedIndirectArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

/// Full per-sub-batch indirect command: root-constant payload the vertex
/// shader needs, followed by the `DrawIndexedIndirectArgs`. `CmdSize` in the
/// spec's buffer table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct IndirectCommand {
    /// Bindless index of this frame's visible-indices buffer.
    pub visible_indices_srv: u32,
    /// Bindless index of this batch's per-instance descriptor buffer.
    pub descriptors_srv: u32,
    /// Bindless indices of this frame's optional per-instance channel
    /// buffers (bones, terrain patch data, ...). Unused slots are
    /// `BindlessIndex::INVALID`.
    pub channel_srvs: [u32; 4],
    pub material_id: u32,
    pub sub_batch_id: u32,
    /// Bindless indices for position/normal/uv/index buffers of this
    /// sub-batch's mesh part.
    pub mesh_position_srv: u32,
    pub mesh_normal_srv: u32,
    pub mesh_uv_srv: u32,
    pub mesh_index_srv: u32,
    pub args: DrawIndexedIndirectArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindless_invalid_is_not_valid() {
        assert!(!BindlessIndex::INVALID.is_valid());
        assert!(BindlessIndex(0).is_valid());
    }

    #[test]
    fn instance_descriptor_is_twelve_bytes() {
        assert_eq!(std::mem::size_of::<InstanceDescriptor>(), 12);
    }

    #[test]
    fn bounding_sphere_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<BoundingSphere>(), 16);
    }
}
