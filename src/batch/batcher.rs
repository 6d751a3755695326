//! §4.F Draw Batcher.
//!
//! One `DrawBatcher` serves every render pass (opaque, each shadow
//! cascade); each pass gets its own bucket registry and batch table so a
//! mesh drawn into both the opaque pass and a shadow cascade ends up in two
//! independent `InstanceBatch`es, keyed the same way (`BatchKey =
//! material.effect`) but never sharing buffers.

use crate::batch::bucket_registry::ThreadBucketRegistry;
use crate::batch::instance_batch::InstanceBatch;
use crate::bindless::BindlessResourceTable;
use crate::config::RendererConfig;
use crate::cull::culler::CullerService;
use crate::errors::Result;
use crate::mesh::MeshRegistry;
use crate::staging::ChannelValue;
use crate::types::{BatchKey, BoundingSphere, MeshPartId, TransformSlot};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Identifies which render pass a draw or batch-table belongs to. Opaque is
/// pass 0; shadow cascades are `1..=shadow_cascade_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(pub u32);

impl PassId {
    pub const OPAQUE: Self = Self(0);

    #[must_use]
    pub const fn shadow_cascade(index: u32) -> Self {
        Self(1 + index)
    }

    /// True for any shadow-cascade pass, used to pick the Visibility-vs-
    /// Visibility-Shadow kernel variant (§4.H).
    #[must_use]
    pub const fn is_shadow_cascade(self) -> bool {
        self.0 >= 1
    }
}

struct PassState {
    registry: ThreadBucketRegistry,
    batches: FxHashMap<BatchKey, InstanceBatch>,
    /// Activation order within the current frame, in the order each key was
    /// first merged — this drives the deterministic indirect-draw order
    /// (§4.F step 4). Most passes activate a handful of batches, so this
    /// stays inline.
    activation_order: SmallVec<[BatchKey; 8]>,
}

impl PassState {
    fn new() -> Self {
        Self {
            registry: ThreadBucketRegistry::new(),
            batches: FxHashMap::default(),
            activation_order: SmallVec::new(),
        }
    }
}

pub struct DrawBatcher {
    config: RendererConfig,
    passes: FxHashMap<PassId, PassState>,
}

impl DrawBatcher {
    #[must_use]
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            passes: FxHashMap::default(),
        }
    }

    fn pass_mut(&mut self, pass: PassId) -> &mut PassState {
        self.passes.entry(pass).or_insert_with(PassState::new)
    }

    /// Resolves `(mesh_id, sub_part)` against `mesh_registry` and enqueues
    /// one draw into this thread's bucket for `(pass, key)` (§4.E `add`).
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        pass: PassId,
        key: BatchKey,
        mesh_registry: &MeshRegistry,
        mesh_id: u64,
        sub_part: u32,
        mesh_entry: crate::mesh::MeshPartEntry,
        material_id: u32,
        transform_slot: TransformSlot,
        bounds: BoundingSphere,
        custom_data_index: u32,
        channel_values: &[(u64, u32, usize, u32, ChannelValue)],
    ) {
        let part_id = mesh_registry.register(mesh_id, sub_part, mesh_entry);
        // Note: `passes` is only mutated by `execute`/`reset_for_next_frame`
        // (which require `&mut self`); concurrent producers only ever touch
        // an already-existing `PassState`'s registry, which is internally
        // synchronized. This requires the pass to have been touched once
        // under `&mut self` before concurrent enqueueing begins, matching
        // the orchestrator's begin_frame/producers ordering.
        if let Some(state) = self.passes.get(&pass) {
            state.registry.with_bucket(key, |bucket| {
                bucket.add(part_id, material_id, transform_slot, bounds, custom_data_index, channel_values);
            });
        } else {
            debug_assert!(
                false,
                "enqueue called for a pass that was never initialized via begin_frame"
            );
        }
    }

    /// Ensures a pass's bucket registry exists, called during `begin_frame`
    /// before producers run so `enqueue` never needs to mutate `self`.
    pub fn ensure_pass(&mut self, pass: PassId) {
        self.pass_mut(pass);
    }

    /// §4.L step 1 (for this batcher's slice of it): marks every batch in
    /// every pass inactive, ready to be reactivated by this frame's merge.
    pub fn reset_for_next_frame(&mut self) {
        for state in self.passes.values_mut() {
            for batch in state.batches.values_mut() {
                batch.reset_for_next_frame();
            }
            state.activation_order.clear();
        }
    }

    /// §4.F `execute(pass)` step 1: merges every non-empty bucket into its
    /// target `InstanceBatch`, creating batches lazily and tracking
    /// first-activation order. Buckets are cleared after a successful merge.
    pub fn merge_pass(&mut self, pass: PassId) -> Result<()> {
        let config = self.config;
        let state = self.pass_mut(pass);

        let mut merge_err = None;
        state.registry.for_each_non_empty(|key, bucket| {
            if merge_err.is_some() {
                return;
            }
            let was_new = !state.batches.contains_key(&key);
            let batch = state
                .batches
                .entry(key)
                .or_insert_with(|| InstanceBatch::new(key, &config));
            let was_active_before = batch.is_active();
            if let Err(e) = batch.merge_from_bucket(bucket) {
                merge_err = Some(e);
                return;
            }
            if was_new || !was_active_before {
                state.activation_order.push(key);
            }
        });

        state.registry.clear_all();
        merge_err.map_or(Ok(()), Err)
    }

    /// Visits this pass's active batches in deterministic first-activation
    /// order (§4.F step 4), for the orchestrator to upload/cull/draw.
    pub fn for_each_active_batch_mut(&mut self, pass: PassId, mut f: impl FnMut(&mut InstanceBatch)) {
        let state = self.pass_mut(pass);
        for key in state.activation_order.clone() {
            if let Some(batch) = state.batches.get_mut(&key) {
                f(batch);
            }
        }
    }

    /// Number of active batches this frame, in the same order
    /// [`Self::for_each_active_batch_mut`] visits them.
    #[must_use]
    pub fn active_batch_count(&self, pass: PassId) -> usize {
        self.passes.get(&pass).map_or(0, |s| s.activation_order.len())
    }

    #[must_use]
    pub fn batch_count(&self, pass: PassId) -> usize {
        self.passes.get(&pass).map_or(0, |s| s.batches.len())
    }

    /// §4.F `execute(pass)` steps 3-4 (step 2, uploading pass-wide constants,
    /// is the caller's job via [`CullerService::upload_frustum_constants`]/
    /// `upload_shadow_cascade_constants`, since it needs camera/light data
    /// this batcher doesn't hold): for each active batch in activation
    /// order, ensures its GPU buffers exist at the current capacity,
    /// uploads this frame's columns (`build`), and records its 5-pass cull
    /// dispatch against `encoder`. Returns every displaced GPU buffer
    /// (batches that just grew) for the caller to queue for deferred
    /// disposal.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &mut self,
        pass: PassId,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        bindless: &mut BindlessResourceTable,
        mesh_registry: &MeshRegistry,
        culler: &CullerService,
        encoder: &mut wgpu::CommandEncoder,
        transforms_buffer: &wgpu::Buffer,
        current_frame: u64,
        in_flight_frames: u32,
    ) -> Vec<wgpu::Buffer> {
        let mut displaced_buffers = Vec::new();
        let state = self.pass_mut(pass);
        for key in state.activation_order.clone() {
            let Some(batch) = state.batches.get_mut(&key) else { continue };
            batch.ensure_capacity();
            let displaced_slots = batch.ensure_gpu_buffers(device, bindless, in_flight_frames);
            for slot in displaced_slots {
                displaced_buffers.extend(slot.retire(bindless, current_frame, in_flight_frames));
            }
            batch.build(queue, mesh_registry, current_frame);
            batch.cull(device, encoder, culler, pass, transforms_buffer, current_frame);
        }
        displaced_buffers
    }

    /// §4.F step 4: issues one `draw_indexed_indirect` per active batch's
    /// unique sub-batches, in activation order, against `render_pass`.
    pub fn record_indirect_draws(&self, pass: PassId, render_pass: &mut wgpu::RenderPass<'_>, current_frame: u64) {
        let Some(state) = self.passes.get(&pass) else { return };
        for key in &state.activation_order {
            if let Some(batch) = state.batches.get(key) {
                batch.record_indirect_draws(render_pass, current_frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BindlessIndex;

    fn dummy_entry() -> crate::mesh::MeshPartEntry {
        crate::mesh::MeshPartEntry {
            index_count: 36,
            first_index: 0,
            base_vertex: 0,
            position_srv: BindlessIndex(0),
            normal_srv: BindlessIndex(1),
            uv_srv: BindlessIndex(2),
            index_srv: BindlessIndex(3),
            bounds: BoundingSphere::new([0.0; 3], 1.0),
        }
    }

    #[test]
    fn enqueue_then_merge_activates_batch() {
        let mut batcher = DrawBatcher::new(RendererConfig::default());
        batcher.ensure_pass(PassId::OPAQUE);
        let mesh_registry = MeshRegistry::new();

        batcher.enqueue(
            PassId::OPAQUE,
            BatchKey(1),
            &mesh_registry,
            42,
            0,
            dummy_entry(),
            7,
            TransformSlot(0),
            BoundingSphere::new([0.0; 3], 1.0),
            0,
            &[],
        );

        batcher.merge_pass(PassId::OPAQUE).unwrap();
        assert_eq!(batcher.batch_count(PassId::OPAQUE), 1);
        assert_eq!(batcher.active_batch_count(PassId::OPAQUE), 1);

        let mut seen_count = 0;
        batcher.for_each_active_batch_mut(PassId::OPAQUE, |b| seen_count = b.merged().instance_count());
        assert_eq!(seen_count, 1);
    }

    #[test]
    fn distinct_batch_keys_produce_separate_batches_in_activation_order() {
        let mut batcher = DrawBatcher::new(RendererConfig::default());
        batcher.ensure_pass(PassId::OPAQUE);
        let mesh_registry = MeshRegistry::new();

        batcher.enqueue(
            PassId::OPAQUE, BatchKey(2), &mesh_registry, 1, 0, dummy_entry(), 0,
            TransformSlot(0), BoundingSphere::new([0.0; 3], 1.0), 0, &[],
        );
        batcher.enqueue(
            PassId::OPAQUE, BatchKey(1), &mesh_registry, 2, 0, dummy_entry(), 0,
            TransformSlot(1), BoundingSphere::new([0.0; 3], 1.0), 0, &[],
        );

        batcher.merge_pass(PassId::OPAQUE).unwrap();
        assert_eq!(batcher.batch_count(PassId::OPAQUE), 2);
    }

    #[test]
    fn reset_deactivates_batches_for_next_frame() {
        let mut batcher = DrawBatcher::new(RendererConfig::default());
        batcher.ensure_pass(PassId::OPAQUE);
        let mesh_registry = MeshRegistry::new();
        batcher.enqueue(
            PassId::OPAQUE, BatchKey(1), &mesh_registry, 1, 0, dummy_entry(), 0,
            TransformSlot(0), BoundingSphere::new([0.0; 3], 1.0), 0, &[],
        );
        batcher.merge_pass(PassId::OPAQUE).unwrap();
        batcher.reset_for_next_frame();

        assert_eq!(batcher.active_batch_count(PassId::OPAQUE), 0);
    }
}
