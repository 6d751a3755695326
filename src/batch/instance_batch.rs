//! §4.G Instance Batch — the core.
//!
//! Splits cleanly into a CPU-observable logical half (merged columns,
//! capacity bookkeeping, sub-batch validation — everything the test suite
//! exercises without a GPU device) and a GPU-resource half (the per-frame-
//! ring buffer table in `gpu_buffers.rs`).
//!
//! `build`/`cull`/`record_indirect_draws` are the GPU-resident half of "runs
//! the 5-pass cull-and-group compute pipeline; issues the indirect
//! execution": `build` uploads this frame's columns and the batch-local
//! mesh-part table Command Emit needs, `cull` records the five compute
//! passes, `record_indirect_draws` issues one `draw_indexed_indirect` per
//! unique sub-batch in the teacher's dispatch-recording idiom (see
//! `src/renderer/graph/passes/ibl_compute.rs`).

use crate::batch::gpu_buffers::{EmitConstants, InstanceBatchGpuBuffers, InstanceBatchGpuSlot};
use crate::batch::PassId;
use crate::bindless::BindlessResourceTable;
use crate::config::RendererConfig;
use crate::cull::culler::{CullerService, KernelKind};
use crate::errors::{Error, Result};
use crate::mesh::MeshRegistry;
use crate::staging::DrawBucket;
use crate::types::{BatchKey, BoundingSphere, InstanceDescriptor, MeshPartId};
use crate::util::grow_capacity;
use rustc_hash::{FxHashMap, FxHashSet};
use std::num::NonZeroU64;

/// CPU-side mirror of one frame's merged draw columns, block-copied from
/// every non-empty thread bucket that targeted this batch.
#[derive(Default)]
pub struct MergedColumns {
    pub descriptors: Vec<InstanceDescriptor>,
    pub bounding_spheres: Vec<BoundingSphere>,
    pub sub_batch_ids: Vec<MeshPartId>,
    unique_parts: FxHashSet<MeshPartId>,
}

impl MergedColumns {
    fn clear(&mut self) {
        self.descriptors.clear();
        self.bounding_spheres.clear();
        self.sub_batch_ids.clear();
        self.unique_parts.clear();
    }

    fn extend_from_bucket(&mut self, bucket: &DrawBucket) {
        self.descriptors.extend_from_slice(&bucket.descriptors);
        self.bounding_spheres.extend_from_slice(&bucket.bounding_spheres);
        self.sub_batch_ids.extend_from_slice(&bucket.sub_batch_ids);
        self.unique_parts.extend(bucket.unique_mesh_parts().iter().copied());
    }

    #[must_use]
    pub fn instance_count(&self) -> u32 {
        self.descriptors.len() as u32
    }

    #[must_use]
    pub fn unique_sub_batch_count(&self) -> u32 {
        self.unique_parts.len() as u32
    }
}

/// Reports a capacity growth so the caller can tag the displaced GPU buffers
/// for deferred disposal (§3 Lifecycles, §5 Deferred disposal).
#[derive(Debug, Clone, Copy)]
pub struct GrowthEvent {
    pub old_capacity: u32,
    pub new_capacity: u32,
}

/// CPU-side container for all draws sharing one material-effect within one
/// render pass (§4.G). Persists across frames; re-enters the active list
/// whenever a producer targets it.
pub struct InstanceBatch {
    pub key: BatchKey,
    capacity: u32,
    sub_batch_capacity: u32,
    active_this_frame: bool,
    merged: MergedColumns,
    gpu: Option<InstanceBatchGpuBuffers>,
    /// This frame's dense, ascending-sorted local mesh-part remap: global
    /// `MeshPartId` -> local sub-batch index `0..unique_count`, rebuilt by
    /// `build()`. `MaxSubBatches` in the spec's buffer table is sized to
    /// this local index space, not the (potentially much larger, sparse)
    /// global registry id space.
    unique_part_ids: Vec<MeshPartId>,
}

impl InstanceBatch {
    #[must_use]
    pub fn new(key: BatchKey, config: &RendererConfig) -> Self {
        Self {
            key,
            capacity: config.initial_batch_capacity,
            sub_batch_capacity: config.max_sub_batches,
            active_this_frame: false,
            merged: MergedColumns::default(),
            gpu: None,
            unique_part_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active_this_frame
    }

    #[must_use]
    pub fn merged(&self) -> &MergedColumns {
        &self.merged
    }

    /// Called once at `begin_frame` for every known batch, before producers
    /// run (§4.L step 1).
    pub fn reset_for_next_frame(&mut self) {
        self.active_this_frame = false;
    }

    /// If this is the first bucket targeting the batch this frame, clears it
    /// and marks it active (§4.F step 1).
    fn activate_if_needed(&mut self) {
        if !self.active_this_frame {
            self.merged.clear();
            self.active_this_frame = true;
        }
    }

    /// Block-copies `bucket`'s columns into the batch's merged columns,
    /// activating the batch first if this is its first bucket this frame.
    /// Fatal if the cumulative unique sub-batch count would exceed
    /// `MaxSubBatches`.
    pub fn merge_from_bucket(&mut self, bucket: &DrawBucket) -> Result<()> {
        self.activate_if_needed();
        self.merged.extend_from_bucket(bucket);

        let unique = self.merged.unique_sub_batch_count();
        if unique > self.sub_batch_capacity {
            return Err(Error::TooManySubBatches {
                max: self.sub_batch_capacity,
                requested: unique,
            });
        }
        Ok(())
    }

    /// Grows `capacity` (doubling) if the merged instance count exceeds it,
    /// returning the old/new capacities so the caller can defer-dispose the
    /// displaced GPU buffers. Returns `None` if no growth was needed.
    pub fn ensure_capacity(&mut self) -> Option<GrowthEvent> {
        let required = self.merged.instance_count();
        if required <= self.capacity {
            return None;
        }
        let old_capacity = self.capacity;
        self.capacity = grow_capacity(self.capacity, required);
        Some(GrowthEvent {
            old_capacity,
            new_capacity: self.capacity,
        })
    }

    /// Lazily creates this batch's GPU buffer table on first use, or
    /// reallocates it after `ensure_capacity` reported growth. Returns the
    /// displaced per-slot buffers (empty on first creation or when capacity
    /// hasn't grown) for the caller to push onto a deferred-disposal queue.
    pub fn ensure_gpu_buffers(&mut self, device: &wgpu::Device, bindless: &mut BindlessResourceTable, in_flight_frames: u32) -> Vec<InstanceBatchGpuSlot> {
        let label = format!("instance_batch.{}", self.key.0);
        match &mut self.gpu {
            None => {
                self.gpu = Some(InstanceBatchGpuBuffers::new(device, bindless, in_flight_frames, self.capacity, self.sub_batch_capacity, &label));
                Vec::new()
            }
            Some(gpu) => gpu.resize(device, bindless, self.capacity, self.sub_batch_capacity, &label),
        }
    }

    /// This frame's ring slot of GPU buffers, or `None` if
    /// [`Self::ensure_gpu_buffers`] hasn't been called yet.
    #[must_use]
    pub fn gpu_slot(&self, current_frame: u64) -> Option<&InstanceBatchGpuSlot> {
        self.gpu.as_ref().map(|g| g.slot(current_frame))
    }

    /// §4.F step 3 (`upload_instance_data`, then `build`): rebuilds this
    /// frame's local mesh-part remap and uploads every column the 5-pass
    /// pipeline reads, zeroing the counters the passes accumulate into.
    /// `ensure_capacity`/`ensure_gpu_buffers` must already have been called
    /// this frame.
    pub fn build(&mut self, queue: &wgpu::Queue, mesh_registry: &MeshRegistry, current_frame: u64) {
        let Some(gpu) = &self.gpu else {
            debug_assert!(false, "build() called before ensure_gpu_buffers()");
            return;
        };
        let slot = gpu.slot(current_frame);

        let mut seen: FxHashMap<MeshPartId, ()> = FxHashMap::default();
        self.unique_part_ids.clear();
        for &part in &self.merged.sub_batch_ids {
            if seen.insert(part, ()).is_none() {
                self.unique_part_ids.push(part);
            }
        }
        self.unique_part_ids.sort_unstable();

        let mut local_index: FxHashMap<MeshPartId, u32> = FxHashMap::default();
        for (i, &part) in self.unique_part_ids.iter().enumerate() {
            local_index.insert(part, i as u32);
        }

        let local_sub_batch_ids: Vec<u32> = self.merged.sub_batch_ids.iter().map(|part| local_index[part]).collect();
        let empty_part = crate::mesh::MeshPartGpu {
            index_count: 0,
            first_index: 0,
            base_vertex: 0,
            position_srv: 0,
            normal_srv: 0,
            uv_srv: 0,
            index_srv: 0,
        };
        let mesh_parts_gpu: Vec<crate::mesh::MeshPartGpu> = self
            .unique_part_ids
            .iter()
            .map(|&part| mesh_registry.get(part).map(crate::mesh::MeshPartEntry::to_gpu).unwrap_or(empty_part))
            .collect();

        queue.write_buffer(&slot.descriptors, 0, bytemuck::cast_slice(&self.merged.descriptors));
        queue.write_buffer(&slot.bounding_spheres, 0, bytemuck::cast_slice(&self.merged.bounding_spheres));
        queue.write_buffer(&slot.sub_batch_ids, 0, bytemuck::cast_slice(&local_sub_batch_ids));
        queue.write_buffer(&slot.mesh_parts, 0, bytemuck::cast_slice(&mesh_parts_gpu));

        let unique_count = self.unique_part_ids.len().max(1);
        queue.write_buffer(&slot.histogram, 0, &vec![0u8; unique_count * 4]);
        queue.write_buffer(&slot.sub_batch_cursors, 0, &vec![0u8; unique_count * 4]);

        let emit = EmitConstants::new(slot.visible_indices_srv, slot.descriptors_srv, self.key.0 as u32);
        queue.write_buffer(&slot.emit_constants, 0, bytemuck::bytes_of(&emit));
    }

    /// §4.F step 3 (`cull(pass_constants)`): records the 5-pass cull-and-
    /// group compute pipeline against `encoder`, each pass in its own
    /// `ComputePass` scope (wgpu's pass-boundary semantics stand in for the
    /// explicit UAV barrier the spec calls out). A null PSO or zero
    /// sub-batches is a silent no-op (§4.G failure semantics).
    pub fn cull(&self, device: &wgpu::Device, encoder: &mut wgpu::CommandEncoder, culler: &CullerService, pass: PassId, transforms_buffer: &wgpu::Buffer, current_frame: u64) {
        let Some(gpu) = &self.gpu else { return };
        let unique_count = self.unique_part_ids.len() as u32;
        if unique_count == 0 {
            return;
        }
        let slot = gpu.slot(current_frame);
        let instance_count = self.merged.instance_count();

        let sized = |buffer: &wgpu::Buffer, elements: u32, stride: u64| wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer,
            offset: 0,
            size: NonZeroU64::new(u64::from(elements.max(1)) * stride),
        });

        {
            let bind_group = culler.visibility_bind_group(device, pass, current_frame, slot, transforms_buffer, instance_count);
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("cull.visibility"), timestamp_writes: None });
            cpass.set_pipeline(culler.visibility_pipeline_for_pass(pass));
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(instance_count.div_ceil(256).max(1), 1, 1);
        }

        {
            let layout = culler.pipeline(KernelKind::Histogram).get_bind_group_layout(0);
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cull.histogram"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: sized(&slot.visibility_flags, instance_count, 4) },
                    wgpu::BindGroupEntry { binding: 1, resource: sized(&slot.sub_batch_ids, instance_count, 4) },
                    wgpu::BindGroupEntry { binding: 2, resource: sized(&slot.histogram, unique_count, 4) },
                ],
            });
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("cull.histogram"), timestamp_writes: None });
            cpass.set_pipeline(culler.pipeline(KernelKind::Histogram));
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(instance_count.div_ceil(64).max(1), 1, 1);
        }

        {
            let layout = culler.pipeline(KernelKind::HistogramPrefixSum).get_bind_group_layout(0);
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cull.prefix_sum"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: sized(&slot.histogram, unique_count, 4) },
                    wgpu::BindGroupEntry { binding: 1, resource: sized(&slot.sub_batch_offsets, unique_count, 4) },
                ],
            });
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("cull.prefix_sum"), timestamp_writes: None });
            cpass.set_pipeline(culler.pipeline(KernelKind::HistogramPrefixSum));
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(1, 1, 1);
        }

        {
            let layout = culler.pipeline(KernelKind::GlobalScatter).get_bind_group_layout(0);
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cull.scatter"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: sized(&slot.visibility_flags, instance_count, 4) },
                    wgpu::BindGroupEntry { binding: 1, resource: sized(&slot.sub_batch_ids, instance_count, 4) },
                    wgpu::BindGroupEntry { binding: 2, resource: sized(&slot.sub_batch_offsets, unique_count, 4) },
                    wgpu::BindGroupEntry { binding: 3, resource: sized(&slot.sub_batch_cursors, unique_count, 4) },
                    wgpu::BindGroupEntry { binding: 4, resource: sized(&slot.visible_indices, instance_count, 4) },
                ],
            });
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("cull.scatter"), timestamp_writes: None });
            cpass.set_pipeline(culler.pipeline(KernelKind::GlobalScatter));
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(instance_count.div_ceil(256).max(1), 1, 1);
        }

        {
            let layout = culler.pipeline(KernelKind::CommandEmit).get_bind_group_layout(0);
            let mesh_part_stride = std::mem::size_of::<crate::mesh::MeshPartGpu>() as u64;
            let command_stride = std::mem::size_of::<crate::types::IndirectCommand>() as u64;
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cull.command_emit"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: slot.emit_constants.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: sized(&slot.mesh_parts, unique_count, mesh_part_stride) },
                    wgpu::BindGroupEntry { binding: 2, resource: sized(&slot.histogram, unique_count, 4) },
                    wgpu::BindGroupEntry { binding: 3, resource: sized(&slot.sub_batch_offsets, unique_count, 4) },
                    wgpu::BindGroupEntry { binding: 4, resource: sized(&slot.indirect_commands, unique_count, command_stride) },
                ],
            });
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("cull.command_emit"), timestamp_writes: None });
            cpass.set_pipeline(culler.pipeline(KernelKind::CommandEmit));
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(unique_count.div_ceil(64), 1, 1);
        }
    }

    /// §4.F step 4: issues one `draw_indexed_indirect` per unique sub-batch,
    /// ascending local-index order, against the active `render_pass` (the
    /// GBuffer/shadow-map render target and its vertex/fragment pipeline
    /// remain the host engine's concern — only the indirect-draw recording
    /// itself is this crate's).
    pub fn record_indirect_draws(&self, render_pass: &mut wgpu::RenderPass<'_>, current_frame: u64) {
        let Some(gpu) = &self.gpu else { return };
        let unique_count = self.unique_part_ids.len() as u32;
        if unique_count == 0 {
            return;
        }
        let slot = gpu.slot(current_frame);
        let stride = std::mem::size_of::<crate::types::IndirectCommand>() as u64;
        let args_offset = std::mem::offset_of!(crate::types::IndirectCommand, args) as u64;
        for i in 0..unique_count {
            render_pass.draw_indexed_indirect(&slot.indirect_commands, u64::from(i) * stride + args_offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransformSlot;

    fn bucket_with(n: u32, part: MeshPartId) -> DrawBucket {
        let mut bucket = DrawBucket::new();
        for i in 0..n {
            bucket.add(part, 0, TransformSlot(i), BoundingSphere::new([0.0; 3], 1.0), 0, &[]);
        }
        bucket
    }

    #[test]
    fn first_bucket_of_the_frame_activates_and_clears() {
        let config = RendererConfig::default();
        let mut batch = InstanceBatch::new(BatchKey(0), &config);
        assert!(!batch.is_active());

        batch.merge_from_bucket(&bucket_with(3, MeshPartId(0))).unwrap();
        assert!(batch.is_active());
        assert_eq!(batch.merged().instance_count(), 3);
    }

    #[test]
    fn second_bucket_same_frame_appends_without_clearing() {
        let config = RendererConfig::default();
        let mut batch = InstanceBatch::new(BatchKey(0), &config);
        batch.merge_from_bucket(&bucket_with(3, MeshPartId(0))).unwrap();
        batch.merge_from_bucket(&bucket_with(2, MeshPartId(1))).unwrap();
        assert_eq!(batch.merged().instance_count(), 5);
        assert_eq!(batch.merged().unique_sub_batch_count(), 2);
    }

    #[test]
    fn reset_then_merge_clears_previous_frames_data() {
        let config = RendererConfig::default();
        let mut batch = InstanceBatch::new(BatchKey(0), &config);
        batch.merge_from_bucket(&bucket_with(3, MeshPartId(0))).unwrap();
        batch.reset_for_next_frame();
        assert!(!batch.is_active());

        batch.merge_from_bucket(&bucket_with(1, MeshPartId(0))).unwrap();
        assert_eq!(batch.merged().instance_count(), 1);
    }

    #[test]
    fn exceeding_max_sub_batches_is_fatal() {
        let mut config = RendererConfig::default();
        config.max_sub_batches = 1;
        let mut batch = InstanceBatch::new(BatchKey(0), &config);
        batch.merge_from_bucket(&bucket_with(1, MeshPartId(0))).unwrap();
        let err = batch.merge_from_bucket(&bucket_with(1, MeshPartId(1)));
        assert!(err.is_err());
    }

    #[test]
    fn capacity_doubles_when_exceeded_and_tags_old_buffers() {
        let mut config = RendererConfig::default();
        config.initial_batch_capacity = 128;
        let mut batch = InstanceBatch::new(BatchKey(0), &config);
        batch.merge_from_bucket(&bucket_with(300, MeshPartId(0))).unwrap();

        let growth = batch.ensure_capacity().expect("must grow");
        assert_eq!(growth.old_capacity, 128);
        assert!(growth.new_capacity >= 300);
        assert_eq!(batch.capacity(), growth.new_capacity);

        assert!(batch.ensure_capacity().is_none(), "capacity already sufficient");
    }

    #[test]
    fn record_indirect_draws_without_gpu_buffers_is_a_noop() {
        let config = RendererConfig::default();
        let batch = InstanceBatch::new(BatchKey(0), &config);
        assert!(batch.gpu_slot(0).is_none());
    }
}
