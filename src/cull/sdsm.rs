//! §4.J SDSM Split Analyzer.
//!
//! Reduce + histogram of the scene's visible depth to pick cascade split
//! depths, 2-frame-latent through the shared [`super::readback::ReadbackRing`].
//! Callers fall back to [`logarithmic_splits`] until a readback resolves.

use crate::config::RendererConfig;
use crate::cull::readback::ReadbackRing;

pub type CascadeSplits = [f32; 4];

/// Standard practical-split-scheme blend between uniform and logarithmic
/// cascade division, used both as the no-readback-yet fallback and to soften
/// SDSM's raw percentile picks (§4.J step 3).
#[must_use]
pub fn logarithmic_splits(near: f32, far: f32, cascade_count: u32, blend: f32) -> CascadeSplits {
    let mut out = [far; 4];
    for i in 1..=cascade_count.min(4) {
        let p = f32::from(i as u16) / cascade_count as f32;
        let log_split = near * (far / near).powf(p);
        let uniform_split = near + (far - near) * p;
        out[i as usize - 1] = blend.mul_add(log_split - uniform_split, uniform_split);
    }
    out
}

/// Picks three split depths at `percentiles` from a 256-bucket normalized
/// depth histogram, blended toward uniform by `blend`, then appends `far` as
/// the last cascade's far end (§4.J `CSComputeSplits`, modeled in plain Rust
/// so its arithmetic is testable without a GPU histogram).
#[must_use]
pub fn splits_from_histogram(histogram: &[u32; 256], near: f32, far: f32, percentiles: [f32; 3], blend: f32) -> CascadeSplits {
    let total: u64 = histogram.iter().map(|&c| u64::from(c)).sum();
    if total == 0 {
        return logarithmic_splits(near, far, 4, blend);
    }

    let mut cumulative = 0u64;
    let mut percentile_idx = 0usize;
    let mut picks = [far; 3];
    for (bucket, &count) in histogram.iter().enumerate() {
        cumulative += u64::from(count);
        while percentile_idx < 3 && cumulative as f64 >= f64::from(percentiles[percentile_idx]) * total as f64 {
            let t = bucket as f32 / 255.0;
            let depth_split = near * (far / near).powf(t);
            let uniform_split = near + (far - near) * t;
            picks[percentile_idx] = blend.mul_add(depth_split - uniform_split, uniform_split);
            percentile_idx += 1;
        }
        if percentile_idx == 3 {
            break;
        }
    }

    [picks[0], picks[1], picks[2], far]
}

pub struct SdsmAnalyzer {
    splits_ring: ReadbackRing<CascadeSplits>,
    percentiles: [f32; 3],
    blend: f32,
    cascade_count: u32,
}

impl SdsmAnalyzer {
    #[must_use]
    pub fn new(config: &RendererConfig) -> Self {
        Self {
            splits_ring: ReadbackRing::new(3, 2),
            percentiles: config.sdsm_percentiles,
            blend: config.cascade_log_blend,
            cascade_count: config.shadow_cascade_count,
        }
    }

    /// Records this frame's GPU-computed splits for later readback.
    pub fn record(&mut self, frame_index: u64, splits: CascadeSplits) {
        self.splits_ring.record(frame_index, splits);
    }

    /// Returns the 2-frame-latent splits readback if resolved, otherwise the
    /// logarithmic fallback (§4.J, §7 Readback latency faults — never
    /// blocks).
    #[must_use]
    pub fn splits(&self, current_frame: u64, near: f32, far: f32) -> CascadeSplits {
        self.splits_ring
            .read(current_frame)
            .unwrap_or_else(|| logarithmic_splits(near, far, self.cascade_count, self.blend))
    }

    #[must_use]
    pub fn percentiles(&self) -> [f32; 3] {
        self.percentiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logarithmic_splits_are_monotonically_increasing() {
        let splits = logarithmic_splits(0.1, 1000.0, 4, 0.5);
        assert!(splits[0] < splits[1]);
        assert!(splits[1] < splits[2]);
        assert!(splits[2] <= splits[3]);
    }

    #[test]
    fn empty_histogram_falls_back_to_logarithmic() {
        let histogram = [0u32; 256];
        let splits = splits_from_histogram(&histogram, 0.1, 1000.0, [0.25, 0.5, 0.75], 0.5);
        let expected = logarithmic_splits(0.1, 1000.0, 4, 0.5);
        assert_eq!(splits, expected);
    }

    #[test]
    fn uniform_histogram_picks_are_monotonic() {
        let histogram = [1u32; 256];
        let splits = splits_from_histogram(&histogram, 0.1, 1000.0, [0.25, 0.5, 0.75], 0.5);
        assert!(splits[0] < splits[1]);
        assert!(splits[1] < splits[2]);
        assert!(splits[2] < splits[3]);
    }

    #[test]
    fn analyzer_falls_back_before_readback_latency_elapses() {
        let config = RendererConfig::default();
        let mut analyzer = SdsmAnalyzer::new(&config);
        analyzer.record(0, [10.0, 20.0, 30.0, 40.0]);
        // Not yet resolved (latency = 2).
        let splits = analyzer.splits(1, 0.1, 1000.0);
        assert_ne!(splits, [10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn analyzer_returns_recorded_splits_once_latency_elapses() {
        let config = RendererConfig::default();
        let mut analyzer = SdsmAnalyzer::new(&config);
        analyzer.record(0, [10.0, 20.0, 30.0, 40.0]);
        let splits = analyzer.splits(2, 0.1, 1000.0);
        assert_eq!(splits, [10.0, 20.0, 30.0, 40.0]);
    }
}
