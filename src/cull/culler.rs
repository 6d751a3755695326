//! §4.H Culler Service.
//!
//! Owns the ten compute PSOs, the per-frame-ring constant buffers, the Hi-Z
//! pyramid, and the SDSM analyzer. Pipeline creation and dispatch recording
//! talk to `wgpu` directly; the readback/fallback bookkeeping those passes
//! feed is plain Rust, covered by the unit tests in [`super::readback`] and
//! [`super::sdsm`].

use crate::batch::gpu_buffers::InstanceBatchGpuSlot;
use crate::batch::PassId;
use crate::config::RendererConfig;
use crate::cull::frustum::{FrustumConstants, ShadowCascadeConstants};
use crate::cull::hzb::HzbPyramid;
use crate::cull::readback::ReadbackRing;
use crate::cull::sdsm::SdsmAnalyzer;
use crate::errors::{Error, Result};
use std::borrow::Cow;
use std::num::NonZeroU64;

/// Two `u32` counters read back from the GPU: visible and Hi-Z-occluded
/// instance counts for the frame that produced them (§4.H Cull-stats
/// readback).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullStats {
    pub visible: u32,
    pub hi_z_occluded: u32,
}

/// Names the ten compute kernels §4.H/§4.G enumerate, each backed by a
/// statically authored WGSL file embedded via `include_str!` (§4.M) rather
/// than any runtime shader templating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Visibility,
    VisibilityShadow,
    Histogram,
    HistogramPrefixSum,
    GlobalScatter,
    CommandEmit,
    DepthPyramidDownsample,
    DepthReduce,
    DepthHistogram,
    ComputeSplits,
}

impl KernelKind {
    #[must_use]
    pub const fn source(self) -> &'static str {
        match self {
            KernelKind::Visibility => include_str!("../../shaders/visibility.wgsl"),
            KernelKind::VisibilityShadow => include_str!("../../shaders/visibility_shadow.wgsl"),
            KernelKind::Histogram => include_str!("../../shaders/histogram.wgsl"),
            KernelKind::HistogramPrefixSum => include_str!("../../shaders/histogram_prefix_sum.wgsl"),
            KernelKind::GlobalScatter => include_str!("../../shaders/global_scatter.wgsl"),
            KernelKind::CommandEmit => include_str!("../../shaders/command_emit.wgsl"),
            KernelKind::DepthPyramidDownsample => include_str!("../../shaders/depth_pyramid_downsample.wgsl"),
            KernelKind::DepthReduce => include_str!("../../shaders/depth_reduce.wgsl"),
            KernelKind::DepthHistogram => include_str!("../../shaders/depth_histogram.wgsl"),
            KernelKind::ComputeSplits => include_str!("../../shaders/compute_splits.wgsl"),
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            KernelKind::Visibility => "visibility",
            KernelKind::VisibilityShadow => "visibility_shadow",
            KernelKind::Histogram => "histogram",
            KernelKind::HistogramPrefixSum => "histogram_prefix_sum",
            KernelKind::GlobalScatter => "global_scatter",
            KernelKind::CommandEmit => "command_emit",
            KernelKind::DepthPyramidDownsample => "depth_pyramid_downsample",
            KernelKind::DepthReduce => "depth_reduce",
            KernelKind::DepthHistogram => "depth_histogram",
            KernelKind::ComputeSplits => "compute_splits",
        }
    }
}

const ALL_KERNELS: [KernelKind; 10] = [
    KernelKind::Visibility,
    KernelKind::VisibilityShadow,
    KernelKind::Histogram,
    KernelKind::HistogramPrefixSum,
    KernelKind::GlobalScatter,
    KernelKind::CommandEmit,
    KernelKind::DepthPyramidDownsample,
    KernelKind::DepthReduce,
    KernelKind::DepthHistogram,
    KernelKind::ComputeSplits,
];

/// `VisibilityShadow`'s cascade-index root constant; wgpu's auto
/// bind-group-layout inference (`layout: None`) can't see push-constant
/// ranges, so this kernel alone gets a hand-authored layout.
fn visibility_shadow_layout(device: &wgpu::Device) -> wgpu::PipelineLayout {
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("visibility_shadow.bind_group_layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Uniform, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Storage { read_only: true }, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Storage { read_only: true }, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 3,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Storage { read_only: true }, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 4,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Storage { read_only: false }, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            },
        ],
    });
    device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("visibility_shadow.pipeline_layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[wgpu::PushConstantRange { stages: wgpu::ShaderStages::COMPUTE, range: 0..4 }],
    })
}

pub struct CullerService {
    pipelines: rustc_hash::FxHashMap<&'static str, wgpu::ComputePipeline>,
    pub hzb: HzbPyramid,
    pub sdsm: SdsmAnalyzer,
    cull_stats_ring: ReadbackRing<CullStats>,
    in_flight_frames: u32,
    frustum_constants: Vec<wgpu::Buffer>,
    shadow_cascade_constants: Vec<wgpu::Buffer>,
    cull_stats_gpu: Vec<wgpu::Buffer>,
}

impl CullerService {
    /// Compiles every kernel in [`ALL_KERNELS`] up front at startup. A
    /// missing/invalid shader is a fatal configuration error (§7), reported
    /// with the kernel's name rather than aborting silently.
    pub fn new(device: &wgpu::Device, config: &RendererConfig, depth_width: u32, depth_height: u32) -> Result<Self> {
        let mut pipelines = rustc_hash::FxHashMap::default();
        let shadow_layout = visibility_shadow_layout(device);
        for kernel in ALL_KERNELS {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel.label()),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(kernel.source())),
            });
            let layout = match kernel {
                KernelKind::VisibilityShadow => Some(&shadow_layout),
                _ => None,
            };
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.label()),
                layout,
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            pipelines.insert(kernel.label(), pipeline);
        }

        if pipelines.len() != ALL_KERNELS.len() {
            return Err(Error::PipelineCreateFailed {
                name: "culler",
                reason: "one or more kernel pipelines failed to register".to_string(),
            });
        }

        let frustum_constants = (0..config.in_flight_frames)
            .map(|i| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("culler.frustum_constants[{i}]")),
                    size: std::mem::size_of::<FrustumConstants>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();
        let shadow_cascade_constants = (0..config.in_flight_frames)
            .map(|i| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("culler.shadow_cascade_constants[{i}]")),
                    size: std::mem::size_of::<ShadowCascadeConstants>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();
        let cull_stats_gpu = (0..config.in_flight_frames)
            .map(|i| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("culler.cull_stats[{i}]")),
                    size: 8,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();

        Ok(Self {
            pipelines,
            hzb: HzbPyramid::new(depth_width, depth_height),
            sdsm: SdsmAnalyzer::new(config),
            cull_stats_ring: ReadbackRing::new(3, 2),
            in_flight_frames: config.in_flight_frames,
            frustum_constants,
            shadow_cascade_constants,
            cull_stats_gpu,
        })
    }

    #[must_use]
    pub fn pipeline(&self, kernel: KernelKind) -> &wgpu::ComputePipeline {
        &self.pipelines[kernel.label()]
    }

    /// Which Visibility kernel variant a pass dispatches: shadow cascades
    /// test the light's cascade frustum and skip Hi-Z occlusion entirely
    /// (casters behind the cascade's near plane still cast shadows), the
    /// opaque pass runs the full frustum-and-Hi-Z kernel (§4.H).
    #[must_use]
    pub fn visibility_kernel_for_pass(&self, pass: PassId) -> KernelKind {
        if pass.is_shadow_cascade() {
            KernelKind::VisibilityShadow
        } else {
            KernelKind::Visibility
        }
    }

    #[must_use]
    pub fn visibility_pipeline_for_pass(&self, pass: PassId) -> &wgpu::ComputePipeline {
        self.pipeline(self.visibility_kernel_for_pass(pass))
    }

    fn ring_index(&self, current_frame: u64) -> usize {
        (current_frame as usize) % self.in_flight_frames as usize
    }

    #[must_use]
    pub fn frustum_constants_buffer(&self, current_frame: u64) -> &wgpu::Buffer {
        &self.frustum_constants[self.ring_index(current_frame)]
    }

    #[must_use]
    pub fn shadow_cascade_constants_buffer(&self, current_frame: u64) -> &wgpu::Buffer {
        &self.shadow_cascade_constants[self.ring_index(current_frame)]
    }

    #[must_use]
    pub fn cull_stats_buffer(&self, current_frame: u64) -> &wgpu::Buffer {
        &self.cull_stats_gpu[self.ring_index(current_frame)]
    }

    /// §4.F step 2: uploads this frame's frustum constants into the ring
    /// slot the Visibility kernel will read.
    pub fn upload_frustum_constants(&self, queue: &wgpu::Queue, current_frame: u64, constants: &FrustumConstants) {
        queue.write_buffer(self.frustum_constants_buffer(current_frame), 0, bytemuck::bytes_of(constants));
    }

    /// §4.F step 2: uploads this frame's shadow-cascade constants into the
    /// ring slot the Visibility-Shadow kernel will read.
    pub fn upload_shadow_cascade_constants(&self, queue: &wgpu::Queue, current_frame: u64, constants: &ShadowCascadeConstants) {
        queue.write_buffer(self.shadow_cascade_constants_buffer(current_frame), 0, bytemuck::bytes_of(constants));
    }

    /// Builds the Visibility (or Visibility-Shadow) kernel's bind group for
    /// one batch's cull dispatch, scoping every per-instance storage buffer
    /// to `instance_count` rather than the slot's full allocated capacity.
    #[must_use]
    pub fn visibility_bind_group(
        &self,
        device: &wgpu::Device,
        pass: PassId,
        current_frame: u64,
        slot: &InstanceBatchGpuSlot,
        transforms_buffer: &wgpu::Buffer,
        instance_count: u32,
    ) -> wgpu::BindGroup {
        let sized = |buffer: &wgpu::Buffer, elements: u32, stride: u64| wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer,
            offset: 0,
            size: NonZeroU64::new(u64::from(elements.max(1)) * stride),
        });
        let instance_stride = std::mem::size_of::<crate::types::InstanceDescriptor>() as u64;
        let sphere_stride = std::mem::size_of::<crate::types::BoundingSphere>() as u64;

        let layout = self.visibility_pipeline_for_pass(pass).get_bind_group_layout(0);
        if pass.is_shadow_cascade() {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cull.visibility_shadow"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: self.shadow_cascade_constants_buffer(current_frame).as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: sized(&slot.descriptors, instance_count, instance_stride) },
                    wgpu::BindGroupEntry { binding: 2, resource: sized(&slot.bounding_spheres, instance_count, sphere_stride) },
                    wgpu::BindGroupEntry { binding: 3, resource: transforms_buffer.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 4, resource: sized(&slot.visibility_flags, instance_count, 4) },
                ],
            })
        } else {
            let (hzb_view, hzb_sampler) = self.hzb.sampled_view_and_sampler();
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cull.visibility"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: self.frustum_constants_buffer(current_frame).as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: sized(&slot.descriptors, instance_count, instance_stride) },
                    wgpu::BindGroupEntry { binding: 2, resource: sized(&slot.bounding_spheres, instance_count, sphere_stride) },
                    wgpu::BindGroupEntry { binding: 3, resource: transforms_buffer.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 4, resource: sized(&slot.visibility_flags, instance_count, 4) },
                    wgpu::BindGroupEntry { binding: 5, resource: self.cull_stats_buffer(current_frame).as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 6, resource: wgpu::BindingResource::TextureView(hzb_view) },
                    wgpu::BindGroupEntry { binding: 7, resource: wgpu::BindingResource::Sampler(hzb_sampler) },
                ],
            })
        }
    }

    pub fn record_cull_stats(&mut self, frame_index: u64, stats: CullStats) {
        self.cull_stats_ring.record(frame_index, stats);
    }

    /// Stats read on frame `f` are from frame `f-2` (§4.H); returns zeroed
    /// stats if no readback has resolved yet rather than blocking (§7).
    #[must_use]
    pub fn cull_stats(&self, current_frame: u64) -> CullStats {
        self.cull_stats_ring.read(current_frame).unwrap_or_default()
    }
}
