//! Renderer-wide tunables (§6 Limits and constants).
//!
//! Every magic number named in the spec lives here instead of being
//! scattered as literals through the component implementations.

/// Number of in-flight frame-ring slots (`N` throughout the spec).
pub const DEFAULT_IN_FLIGHT_FRAMES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct RendererConfig {
    /// `N`: frame-ring depth. A resource freed at frame `f` may not be
    /// reissued before frame `f + in_flight_frames + 1` completes.
    pub in_flight_frames: u32,
    /// Fixed capacity of the Transform Store.
    pub max_transform_slots: u32,
    /// Per-batch sub-batch cap; exceeding this is fatal (validated).
    pub max_sub_batches: u32,
    /// Upper bound on terrain leaves emitted per frame.
    pub max_terrain_patches: u32,
    /// Upper bound on bone matrices addressable by the optional bone channel.
    pub max_bone_matrices: u32,
    /// Initial capacity (in instances) of a newly created Instance Batch.
    pub initial_batch_capacity: u32,
    /// Size of the Ring Upload Arena, in bytes.
    pub upload_arena_bytes: u64,
    /// Maximum quadtree depth for adaptive terrain (`depth <= 7`).
    pub terrain_max_depth: u32,
    /// CDLOD morph distance base (`LODRange0`); range at depth `d` is
    /// `LODRange0 * 2^d`.
    pub terrain_lod_range0: f32,
    /// SDSM cascade-split percentiles (e.g. 0.25 / 0.5 / 0.75).
    pub sdsm_percentiles: [f32; 3],
    /// Logarithmic/uniform blend factor used both as the SDSM fallback and
    /// to soften SDSM's percentile picks.
    pub cascade_log_blend: f32,
    /// Number of shadow cascades.
    pub shadow_cascade_count: u32,
    /// Rate limit (in frames) for duplicate soft-fault log lines.
    pub soft_fault_log_period: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            in_flight_frames: DEFAULT_IN_FLIGHT_FRAMES,
            max_transform_slots: 100_000,
            max_sub_batches: 4096,
            max_terrain_patches: 8192,
            max_bone_matrices: 10_000,
            initial_batch_capacity: 1024,
            upload_arena_bytes: 256 * 1024 * 1024,
            terrain_max_depth: 7,
            terrain_lod_range0: 64.0,
            sdsm_percentiles: [0.25, 0.5, 0.75],
            cascade_log_blend: 0.5,
            shadow_cascade_count: 4,
            soft_fault_log_period: 60,
        }
    }
}

impl RendererConfig {
    /// `1 + floor(log2(max(w, h) / 2))`, the Hi-Z mip count for a depth
    /// buffer of the given dimensions (§6).
    #[must_use]
    pub fn hzb_mip_count(width: u32, height: u32) -> u32 {
        let half = width.max(height).max(2) / 2;
        1 + half.ilog2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hzb_mip_count_matches_spec_formula() {
        assert_eq!(RendererConfig::hzb_mip_count(1920, 1080), 1 + (960u32.ilog2()));
        assert_eq!(RendererConfig::hzb_mip_count(256, 256), 1 + 7);
    }

    #[test]
    fn defaults_match_spec_limits() {
        let cfg = RendererConfig::default();
        assert_eq!(cfg.max_transform_slots, 100_000);
        assert_eq!(cfg.max_sub_batches, 4096);
        assert_eq!(cfg.max_terrain_patches, 8192);
        assert_eq!(cfg.in_flight_frames, 3);
        assert_eq!(cfg.terrain_max_depth, 7);
    }
}
