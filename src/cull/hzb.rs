//! §4.I Hi-Z Pyramid Builder.
//!
//! Half-resolution R32Float min-reduction mip chain. The GPU texture itself
//! is created lazily (`ensure_texture`); the mip-dimension arithmetic and the
//! "which frame's VP goes with the currently-sampled pyramid" bookkeeping are
//! plain CPU state, testable without a device.

use crate::config::RendererConfig;
use glam::Mat4;

/// Width/height of mip `level` of a pyramid whose mip 0 covers
/// `base_width x base_height` at half the source depth buffer's resolution.
#[must_use]
pub fn mip_dimensions(base_width: u32, base_height: u32, level: u32) -> (u32, u32) {
    let w = (base_width >> level).max(1);
    let h = (base_height >> level).max(1);
    (w, h)
}

/// Tracks, for the pyramid currently resident on the GPU, which frame's
/// view-projection it was built from — frame `f`'s Visibility pass samples
/// frame `f-1`'s pyramid and must project spheres with frame `f-1`'s VP
/// (§3 invariant, §4.I).
#[derive(Debug, Clone, Copy, Default)]
pub struct PyramidHistory {
    built_at_frame: Option<u64>,
    view_projection: Mat4,
}

impl PyramidHistory {
    /// Records that a new pyramid was just built from `vp` at `frame_index`.
    pub fn record_build(&mut self, frame_index: u64, vp: Mat4) {
        self.built_at_frame = Some(frame_index);
        self.view_projection = vp;
    }

    /// The VP the currently-resident pyramid was built with, if any pyramid
    /// has been built yet.
    #[must_use]
    pub fn occlusion_view_projection(&self) -> Option<Mat4> {
        self.built_at_frame.map(|_| self.view_projection)
    }
}

struct GpuPyramid {
    texture: wgpu::Texture,
    mip_views: Vec<wgpu::TextureView>,
    sampled_view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

/// Logical description of the Hi-Z pyramid; the half-resolution mip 0 base
/// dimensions and mip count are config-derived, so every frame's
/// `FrustumConstants` can compute them without re-deriving from the depth
/// buffer's actual resolution each time.
pub struct HzbPyramid {
    base_width: u32,
    base_height: u32,
    mip_count: u32,
    history: PyramidHistory,
    gpu: Option<GpuPyramid>,
}

impl HzbPyramid {
    #[must_use]
    pub fn new(depth_width: u32, depth_height: u32) -> Self {
        let base_width = (depth_width / 2).max(1);
        let base_height = (depth_height / 2).max(1);
        Self {
            base_width,
            base_height,
            mip_count: RendererConfig::hzb_mip_count(depth_width, depth_height),
            history: PyramidHistory::default(),
            gpu: None,
        }
    }

    #[must_use]
    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.base_width, self.base_height)
    }

    #[must_use]
    pub fn mip_dimensions(&self, level: u32) -> (u32, u32) {
        mip_dimensions(self.base_width, self.base_height, level)
    }

    pub fn record_build(&mut self, frame_index: u64, vp: Mat4) {
        self.history.record_build(frame_index, vp);
    }

    #[must_use]
    pub fn occlusion_view_projection(&self) -> Option<Mat4> {
        self.history.occlusion_view_projection()
    }

    /// Creates (or resizes) the backing GPU texture, an `R32Float` mip chain
    /// with `mip_count` levels, one storage view per mip (downsample
    /// dispatch target) plus one sampled view over the whole chain (what
    /// the Visibility kernel binds). Called on startup and on swap-chain
    /// resize.
    pub fn ensure_texture(&mut self, device: &wgpu::Device) {
        if self.gpu.is_some() {
            return;
        }
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("hzb-pyramid"),
            size: wgpu::Extent3d {
                width: self.base_width,
                height: self.base_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: self.mip_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let mip_views = (0..self.mip_count)
            .map(|level| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("hzb-pyramid.mip{level}")),
                    base_mip_level: level,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();
        let sampled_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("hzb-pyramid.sampled"),
            ..Default::default()
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("hzb-pyramid.sampler"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });

        self.gpu = Some(GpuPyramid {
            texture,
            mip_views,
            sampled_view,
            sampler,
        });
    }

    /// The full-chain sampled view and nearest-filter sampler the Visibility
    /// kernel binds. Panics if `ensure_texture` hasn't been called yet.
    #[must_use]
    pub fn sampled_view_and_sampler(&self) -> (&wgpu::TextureView, &wgpu::Sampler) {
        let gpu = self.gpu.as_ref().expect("ensure_texture must run before the pyramid is sampled");
        (&gpu.sampled_view, &gpu.sampler)
    }

    /// Dispatches `DepthPyramidDownsample` once per mip level (§4.I): mip 0
    /// reads `source_depth_view`, every subsequent mip reads the prior mip's
    /// own view, 8x8 threads per workgroup. Each mip's dispatch is recorded
    /// in its own `ComputePass`, so mip `k+1` never begins before mip `k`'s
    /// write is visible.
    pub fn record_downsample(&self, device: &wgpu::Device, encoder: &mut wgpu::CommandEncoder, pipeline: &wgpu::ComputePipeline, source_depth_view: &wgpu::TextureView) {
        let layout = pipeline.get_bind_group_layout(0);
        let gpu = self.gpu.as_ref().expect("ensure_texture must run before downsampling");

        for level in 0..self.mip_count {
            let source_view = if level == 0 { source_depth_view } else { &gpu.mip_views[(level - 1) as usize] };
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("hzb-pyramid.downsample.mip{level}")),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(source_view) },
                    wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(&gpu.mip_views[level as usize]) },
                ],
            });

            let (w, h) = mip_dimensions(self.base_width, self.base_height, level);
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("hzb-pyramid.downsample"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(w.div_ceil(8), h.div_ceil(8), 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_dimensions_halve_each_level() {
        assert_eq!(mip_dimensions(960, 540, 0), (960, 540));
        assert_eq!(mip_dimensions(960, 540, 1), (480, 270));
        assert_eq!(mip_dimensions(960, 540, 10), (1, 1));
    }

    #[test]
    fn history_has_no_vp_before_first_build() {
        let history = PyramidHistory::default();
        assert!(history.occlusion_view_projection().is_none());
    }

    #[test]
    fn history_reports_the_vp_from_its_most_recent_build() {
        let mut history = PyramidHistory::default();
        let vp = Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        history.record_build(5, vp);
        assert_eq!(history.occlusion_view_projection(), Some(vp));
    }

    #[test]
    fn pyramid_base_is_half_the_depth_buffer_resolution() {
        let pyramid = HzbPyramid::new(1920, 1080);
        assert_eq!(pyramid.dimensions(), (960, 540));
        assert_eq!(pyramid.mip_count(), RendererConfig::hzb_mip_count(1920, 1080));
    }
}
