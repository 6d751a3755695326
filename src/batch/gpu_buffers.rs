//! GPU-resource half of §4.G Instance Batch: the per-frame-ring buffer table
//! (Visible Indices, Indirect Commands, Counters, Visibility Flags,
//! Histogram) plus the intermediate buffers the 5-pass kernels need
//! (descriptors/bounding spheres/sub-batch ids staged this frame,
//! sub-batch offsets from the prefix sum, and the batch's local mesh-part
//! table for Command Emit). Recreated wholesale whenever the batch's
//! capacity grows; the displaced slots are handed back to the caller for
//! deferred disposal (§5), the same split `DescriptorHeap` uses for
//! bindless indices.
//!
//! Per §5 ("Each Instance Batch exclusively owns its per-frame-ring GPU
//! buffers and bindless indices"), each slot also owns the two bindless
//! indices the indirect-command root constants reference directly:
//! `visible_indices_srv` and `descriptors_srv`.

use crate::bindless::BindlessResourceTable;
use crate::mesh::MeshPartGpu;
use crate::types::{BindlessIndex, BoundingSphere, IndirectCommand, InstanceDescriptor};
use bytemuck::{Pod, Zeroable};

fn storage_buffer(device: &wgpu::Device, label: &str, size: u64, extra_usage: wgpu::BufferUsages) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(4),
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC
            | extra_usage,
        mapped_at_creation: false,
    })
}

/// Uniform block Command Emit reads (§4.G pass 5), matching
/// `command_emit.wgsl`'s `EmitConstants` byte-for-byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EmitConstants {
    pub visible_indices_srv: u32,
    pub descriptors_srv: u32,
    pub channel_srvs: [u32; 4],
    pub material_id: u32,
    pub _pad: u32,
}

impl EmitConstants {
    #[must_use]
    pub fn new(visible_indices_srv: BindlessIndex, descriptors_srv: BindlessIndex, material_id: u32) -> Self {
        Self {
            visible_indices_srv: visible_indices_srv.0,
            descriptors_srv: descriptors_srv.0,
            channel_srvs: [BindlessIndex::INVALID.0; 4],
            material_id,
            _pad: 0,
        }
    }
}

/// One frame-ring slot's worth of GPU buffers for one `InstanceBatch`.
pub struct InstanceBatchGpuSlot {
    pub visible_indices: wgpu::Buffer,
    pub visible_indices_srv: BindlessIndex,
    pub indirect_commands: wgpu::Buffer,
    /// §4.G's "Counter (per sub-batch)... atomic append counters" buffer;
    /// the atomic increments happen during Global Scatter (pass 4), which
    /// reads it as `sub_batch_cursors`.
    pub sub_batch_cursors: wgpu::Buffer,
    pub visibility_flags: wgpu::Buffer,
    pub histogram: wgpu::Buffer,
    pub sub_batch_offsets: wgpu::Buffer,
    pub descriptors: wgpu::Buffer,
    pub descriptors_srv: BindlessIndex,
    pub bounding_spheres: wgpu::Buffer,
    pub sub_batch_ids: wgpu::Buffer,
    pub mesh_parts: wgpu::Buffer,
    pub emit_constants: wgpu::Buffer,
}

impl InstanceBatchGpuSlot {
    #[must_use]
    fn new(device: &wgpu::Device, bindless: &mut BindlessResourceTable, capacity: u32, sub_batch_capacity: u32, label_prefix: &str) -> Self {
        let instance_count = u64::from(capacity.max(1));
        let sub_batch_count = u64::from(sub_batch_capacity.max(1));

        let visible_indices = storage_buffer(device, &format!("{label_prefix}.visible_indices"), instance_count * 4, wgpu::BufferUsages::empty());
        let descriptors = storage_buffer(
            device,
            &format!("{label_prefix}.descriptors"),
            instance_count * std::mem::size_of::<InstanceDescriptor>() as u64,
            wgpu::BufferUsages::empty(),
        );

        // §5: the batch owns the bindless indices its own indirect commands
        // reference; exhaustion of the descriptor heap is as fatal here as
        // anywhere else it's allocated from.
        let visible_indices_srv = bindless.allocate_srv().expect("bindless SRV heap exhausted");
        let descriptors_srv = bindless.allocate_srv().expect("bindless SRV heap exhausted");

        Self {
            visible_indices,
            visible_indices_srv,
            indirect_commands: storage_buffer(
                device,
                &format!("{label_prefix}.indirect_commands"),
                sub_batch_count * std::mem::size_of::<IndirectCommand>() as u64,
                wgpu::BufferUsages::INDIRECT,
            ),
            sub_batch_cursors: storage_buffer(device, &format!("{label_prefix}.sub_batch_cursors"), sub_batch_count * 4, wgpu::BufferUsages::empty()),
            visibility_flags: storage_buffer(device, &format!("{label_prefix}.visibility_flags"), instance_count * 4, wgpu::BufferUsages::empty()),
            histogram: storage_buffer(device, &format!("{label_prefix}.histogram"), sub_batch_count * 4, wgpu::BufferUsages::empty()),
            sub_batch_offsets: storage_buffer(device, &format!("{label_prefix}.sub_batch_offsets"), sub_batch_count * 4, wgpu::BufferUsages::empty()),
            descriptors,
            descriptors_srv,
            bounding_spheres: storage_buffer(
                device,
                &format!("{label_prefix}.bounding_spheres"),
                instance_count * std::mem::size_of::<BoundingSphere>() as u64,
                wgpu::BufferUsages::empty(),
            ),
            sub_batch_ids: storage_buffer(device, &format!("{label_prefix}.sub_batch_ids"), instance_count * 4, wgpu::BufferUsages::empty()),
            mesh_parts: storage_buffer(
                device,
                &format!("{label_prefix}.mesh_parts"),
                sub_batch_count * std::mem::size_of::<MeshPartGpu>() as u64,
                wgpu::BufferUsages::empty(),
            ),
            emit_constants: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("{label_prefix}.emit_constants")),
                size: std::mem::size_of::<EmitConstants>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
        }
    }
}

/// One [`InstanceBatchGpuSlot`] per frame-ring slot, indexed by
/// `current_frame % in_flight_frames`, the same ring-slot addressing the
/// Transform Store uses for its per-frame dirty ranges.
pub struct InstanceBatchGpuBuffers {
    slots: Vec<InstanceBatchGpuSlot>,
    allocated_capacity: u32,
    allocated_sub_batch_capacity: u32,
}

impl InstanceBatchGpuBuffers {
    #[must_use]
    pub fn new(
        device: &wgpu::Device,
        bindless: &mut BindlessResourceTable,
        in_flight_frames: u32,
        capacity: u32,
        sub_batch_capacity: u32,
        label_prefix: &str,
    ) -> Self {
        let slots = (0..in_flight_frames)
            .map(|i| InstanceBatchGpuSlot::new(device, bindless, capacity, sub_batch_capacity, &format!("{label_prefix}[{i}]")))
            .collect();
        Self {
            slots,
            allocated_capacity: capacity,
            allocated_sub_batch_capacity: sub_batch_capacity,
        }
    }

    #[must_use]
    pub fn slot(&self, current_frame: u64) -> &InstanceBatchGpuSlot {
        let idx = (current_frame as usize) % self.slots.len();
        &self.slots[idx]
    }

    /// Reallocates every ring slot at the new capacity if it actually grew
    /// since the last allocation, returning the displaced slots for the
    /// caller to queue for deferred disposal. A no-op (empty result) if
    /// capacity is unchanged.
    pub fn resize(
        &mut self,
        device: &wgpu::Device,
        bindless: &mut BindlessResourceTable,
        capacity: u32,
        sub_batch_capacity: u32,
        label_prefix: &str,
    ) -> Vec<InstanceBatchGpuSlot> {
        if capacity <= self.allocated_capacity && sub_batch_capacity <= self.allocated_sub_batch_capacity {
            return Vec::new();
        }
        let n = self.slots.len() as u32;
        let mut fresh: Vec<InstanceBatchGpuSlot> = (0..n)
            .map(|i| InstanceBatchGpuSlot::new(device, bindless, capacity, sub_batch_capacity, &format!("{label_prefix}[{i}]")))
            .collect();
        std::mem::swap(&mut self.slots, &mut fresh);
        self.allocated_capacity = capacity;
        self.allocated_sub_batch_capacity = sub_batch_capacity;
        fresh
    }
}

impl InstanceBatchGpuSlot {
    /// Releases this slot's owned bindless indices and decomposes it into
    /// its individual buffers, for the caller to push onto a
    /// `DisposalQueue<wgpu::Buffer>` one at a time (§5 deferred disposal
    /// applies to both buffers and bindless indices on the same `N + 1`
    /// schedule; `release_srv` defers internally).
    #[must_use]
    pub fn retire(self, bindless: &mut BindlessResourceTable, current_frame: u64, in_flight_frames: u32) -> Vec<wgpu::Buffer> {
        bindless.release_srv(self.visible_indices_srv, current_frame, in_flight_frames);
        bindless.release_srv(self.descriptors_srv, current_frame, in_flight_frames);
        vec![
            self.visible_indices,
            self.indirect_commands,
            self.sub_batch_cursors,
            self.visibility_flags,
            self.histogram,
            self.sub_batch_offsets,
            self.descriptors,
            self.bounding_spheres,
            self.sub_batch_ids,
            self.mesh_parts,
            self.emit_constants,
        ]
    }
}
