//! §4.K Adaptive Terrain.

pub mod quadtree;

use crate::config::RendererConfig;
use crate::cull::readback::ReadbackRing;
use crate::errors::{Error, Result};
use crate::util::RateLimitedLog;
use quadtree::QuadtreeLeaf;
use std::borrow::Cow;

/// Statically authored WGSL for the terrain compute kernels (§4.K, §4.M),
/// embedded via `include_str!` rather than generated at runtime.
pub const MARK_SPLITS_SHADER: &str = include_str!("../../shaders/terrain_mark_splits.wgsl");
pub const EMIT_LEAVES_SHADER: &str = include_str!("../../shaders/terrain_emit_leaves.wgsl");
pub const MINMAX_PYRAMID_SHADER: &str = include_str!("../../shaders/terrain_minmax_pyramid.wgsl");

/// Names the three terrain compute kernels, mirroring
/// [`crate::cull::culler::KernelKind`]'s embed-and-compile pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerrainKernel {
    MarkSplits,
    EmitLeaves,
    MinMaxPyramid,
}

impl TerrainKernel {
    #[must_use]
    pub const fn source(self) -> &'static str {
        match self {
            TerrainKernel::MarkSplits => MARK_SPLITS_SHADER,
            TerrainKernel::EmitLeaves => EMIT_LEAVES_SHADER,
            TerrainKernel::MinMaxPyramid => MINMAX_PYRAMID_SHADER,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            TerrainKernel::MarkSplits => "terrain_mark_splits",
            TerrainKernel::EmitLeaves => "terrain_emit_leaves",
            TerrainKernel::MinMaxPyramid => "terrain_minmax_pyramid",
        }
    }
}

const ALL_TERRAIN_KERNELS: [TerrainKernel; 3] =
    [TerrainKernel::MarkSplits, TerrainKernel::EmitLeaves, TerrainKernel::MinMaxPyramid];

/// Compiles and owns the three terrain compute PSOs, the GPU counterpart of
/// [`TerrainSystem`]'s CPU-side quadtree math. Kept as a separate type so a
/// headless caller (tests, tools) can use `TerrainSystem` without a device.
pub struct TerrainGpuPipelines {
    pipelines: rustc_hash::FxHashMap<&'static str, wgpu::ComputePipeline>,
}

impl TerrainGpuPipelines {
    pub fn new(device: &wgpu::Device) -> Result<Self> {
        let mut pipelines = rustc_hash::FxHashMap::default();
        for kernel in ALL_TERRAIN_KERNELS {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel.label()),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(kernel.source())),
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.label()),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            pipelines.insert(kernel.label(), pipeline);
        }

        if pipelines.len() != ALL_TERRAIN_KERNELS.len() {
            return Err(Error::PipelineCreateFailed {
                name: "terrain",
                reason: "one or more terrain kernel pipelines failed to register".to_string(),
            });
        }

        Ok(Self { pipelines })
    }

    #[must_use]
    pub fn pipeline(&self, kernel: TerrainKernel) -> &wgpu::ComputePipeline {
        &self.pipelines[kernel.label()]
    }
}

/// One terrain leaf patch, fed into the opaque path's instance buffers
/// exactly like any other draw (§4.K step 2) so it receives free GPU culling
/// and shadowing.
#[derive(Debug, Clone, Copy)]
pub struct TerrainPatch {
    pub world_min: [f32; 3],
    pub world_max: [f32; 3],
    pub uv_rect: [f32; 4],
    pub morph_factor: f32,
    pub lod_level: u32,
}

/// CDLOD ring formula (§4.K step 3): `saturate((dist - r_inner) / (r_outer -
/// r_inner))`, blended by the vertex shader toward the coarser-LOD
/// counterpart.
#[must_use]
pub fn morph_factor(distance: f32, r_inner: f32, r_outer: f32) -> f32 {
    ((distance - r_inner) / (r_outer - r_inner)).clamp(0.0, 1.0)
}

pub struct TerrainSystem {
    world_size: f32,
    max_depth: u32,
    lod_range0: f32,
    max_patches: u32,
    min_max_pyramid: Vec<Vec<(f32, f32)>>,
    leaf_count_ring: ReadbackRing<u32>,
    patch_overflow_log: RateLimitedLog,
}

impl TerrainSystem {
    #[must_use]
    pub fn new(config: &RendererConfig, heightmap: &[f32], heightmap_side: u32, world_size: f32) -> Self {
        Self {
            world_size,
            max_depth: config.terrain_max_depth,
            lod_range0: config.terrain_lod_range0,
            max_patches: config.max_terrain_patches,
            min_max_pyramid: quadtree::build_min_max_pyramid(heightmap, heightmap_side),
            leaf_count_ring: ReadbackRing::new(3, 2),
            patch_overflow_log: RateLimitedLog::new(config.soft_fault_log_period),
        }
    }

    /// Runs the mark-splits + emit-leaves passes for one frame (§4.K steps
    /// 1-3): recursively descends the quadtree from the root footprint,
    /// splitting a node only as far as the CDLOD distance test wants and
    /// `max_depth` allows, so a distant, uniformly coarse region of terrain
    /// emits a single large patch instead of `grid_resolution²` small ones.
    /// Caps emission at `max_terrain_patches`, logging a rate-limited
    /// warning (§7 soft faults) whenever the traversal would have gone past
    /// it.
    pub fn emit_patches(&mut self, frame_index: u64, camera_xz: (f32, f32)) -> Vec<TerrainPatch> {
        let mut leaves = Vec::new();
        let mut dropped = 0u32;
        quadtree::collect_leaves(
            0.0,
            0.0,
            self.world_size / 2.0,
            0,
            self.max_depth,
            self.lod_range0,
            camera_xz,
            self.max_patches,
            &mut leaves,
            &mut dropped,
        );

        if dropped > 0 && self.patch_overflow_log.should_log(frame_index) {
            log::warn!(
                "terrain quadtree traversal dropped {dropped} node(s) past max_terrain_patches={}; \
                 coarsen lod_range0 or raise the cap",
                self.max_patches
            );
        }

        let min_y = self
            .min_max_pyramid
            .last()
            .and_then(|top| top.first())
            .map_or(0.0, |&(lo, _)| lo);
        let max_y = self
            .min_max_pyramid
            .last()
            .and_then(|top| top.first())
            .map_or(0.0, |&(_, hi)| hi);

        let patches: Vec<TerrainPatch> = leaves
            .into_iter()
            .map(|leaf: QuadtreeLeaf| self.patch_from_leaf(leaf, camera_xz, min_y, max_y))
            .collect();

        self.leaf_count_ring.record(frame_index, patches.len() as u32);
        patches
    }

    fn patch_from_leaf(&self, leaf: QuadtreeLeaf, camera_xz: (f32, f32), min_y: f32, max_y: f32) -> TerrainPatch {
        let dist = ((leaf.center_x - camera_xz.0).powi(2) + (leaf.center_z - camera_xz.1).powi(2)).sqrt();
        let r_inner = self.lod_range0 * 2f32.powi((self.max_depth - leaf.depth) as i32);
        let r_outer = r_inner * 2.0;
        let extent = leaf.half_extent * 2.0;

        TerrainPatch {
            world_min: [leaf.center_x - leaf.half_extent, min_y, leaf.center_z - leaf.half_extent],
            world_max: [leaf.center_x + leaf.half_extent, max_y, leaf.center_z + leaf.half_extent],
            uv_rect: [
                (leaf.center_x - leaf.half_extent + self.world_size / 2.0) / self.world_size,
                (leaf.center_z - leaf.half_extent + self.world_size / 2.0) / self.world_size,
                extent / self.world_size,
                extent / self.world_size,
            ],
            morph_factor: morph_factor(dist, r_inner, r_outer),
            lod_level: leaf.depth,
        }
    }

    /// 2-frame-latent diagnostic readback (§4.K "Readback of leaf count");
    /// used only for diagnostics and batch activation (skip draw if
    /// `last_patch_count == 0`), never to gate the current frame's emission.
    #[must_use]
    pub fn last_patch_count(&self, current_frame: u64) -> u32 {
        self.leaf_count_ring.read(current_frame).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terrain_shader_sources_are_embedded_and_nonempty() {
        assert!(!MARK_SPLITS_SHADER.trim().is_empty());
        assert!(!EMIT_LEAVES_SHADER.trim().is_empty());
        assert!(!MINMAX_PYRAMID_SHADER.trim().is_empty());
    }

    #[test]
    fn morph_factor_saturates_at_bounds() {
        assert_eq!(morph_factor(0.0, 10.0, 20.0), 0.0);
        assert_eq!(morph_factor(20.0, 10.0, 20.0), 1.0);
        assert_eq!(morph_factor(15.0, 10.0, 20.0), 0.5);
    }

    #[test]
    fn a_camera_far_past_every_lod_range_leaves_the_root_unsplit() {
        // distance > lod_range0 * 2^max_depth puts desired_depth at 0 for the
        // root node, so the traversal never recurses into children.
        let config = RendererConfig::default();
        let heightmap = vec![0.0f32; 4 * 4];
        let mut terrain = TerrainSystem::new(&config, &heightmap, 4, 1000.0);
        let patches = terrain.emit_patches(0, (20_000.0, 20_000.0));
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].lod_level, 0);
    }

    #[test]
    fn a_camera_at_the_root_center_splits_into_more_than_one_patch() {
        let config = RendererConfig::default();
        let heightmap = vec![0.0f32; 4 * 4];
        let mut terrain = TerrainSystem::new(&config, &heightmap, 4, 1000.0);
        let patches = terrain.emit_patches(0, (0.0, 0.0));
        assert!(patches.len() > 1, "a centered camera should force at least one split");
    }

    #[test]
    fn emit_patches_never_exceeds_the_configured_cap() {
        let mut config = RendererConfig::default();
        config.max_terrain_patches = 4;
        let heightmap = vec![0.0f32; 4 * 4];
        let mut terrain = TerrainSystem::new(&config, &heightmap, 4, 1000.0);
        // Camera at the root center forces maximal splitting, so without the
        // cap this would run away toward `total_nodes(max_depth)` leaves.
        let patches = terrain.emit_patches(0, (0.0, 0.0));
        assert!(patches.len() as u32 <= config.max_terrain_patches);
    }

    #[test]
    fn last_patch_count_is_latent_by_two_frames() {
        let config = RendererConfig::default();
        let heightmap = vec![0.0f32; 4 * 4];
        let mut terrain = TerrainSystem::new(&config, &heightmap, 4, 1000.0);
        terrain.emit_patches(0, (20_000.0, 20_000.0));
        assert_eq!(terrain.last_patch_count(1), 0);
        assert_eq!(terrain.last_patch_count(2), 1);
    }
}
