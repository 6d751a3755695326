//! §4.K Adaptive Terrain: CPU-observable quadtree math.
//!
//! The GPU dispatches one thread per node against a flat node list sized
//! `total_nodes(max_depth)`; the distance test and restriction-enforcement
//! logic are plain arithmetic, reproduced here so the restriction invariant
//! (§8 "no two adjacent leaves differ in depth by more than 1") is testable
//! without a device.

/// `(4^(max_depth+1) - 1) / 3`: total node count across every level of a
/// complete quadtree down to `max_depth` (§4.K).
#[must_use]
pub fn total_nodes(max_depth: u32) -> u64 {
    (4u64.pow(max_depth + 1) - 1) / 3
}

/// CDLOD distance test (§4.K Mark Splits): returns the LOD depth a node at
/// `distance` from the camera should refine to, where `lod_range0 * 2^lod`
/// is the range of level `lod` counted coarse-to-fine from the root. Strictly
/// non-increasing as `distance` grows, so farther cameras never produce a
/// finer depth than closer ones (§8 scenario 6).
#[must_use]
pub fn desired_depth(distance: f32, lod_range0: f32, max_depth: u32) -> u32 {
    for lod in 0..=max_depth {
        let range = lod_range0 * 2f32.powi(lod as i32);
        if distance < range {
            return max_depth - lod;
        }
    }
    0
}

/// A flat grid of per-cell desired LOD depths, restriction-enforced so no
/// two orthogonally adjacent cells differ by more than one level. Models the
/// quadtree's leaf-depth assignment at `size x size` sample resolution.
pub struct DesiredDepthGrid {
    size: u32,
    max_depth: u32,
    depths: Vec<u32>,
}

impl DesiredDepthGrid {
    #[must_use]
    pub fn from_camera_distance(
        size: u32,
        max_depth: u32,
        lod_range0: f32,
        world_size: f32,
        camera_xz: (f32, f32),
    ) -> Self {
        let cell_size = world_size / size as f32;
        let depths = (0..size * size)
            .map(|idx| {
                let (x, y) = (idx % size, idx / size);
                let world_x = (x as f32 + 0.5) * cell_size - world_size / 2.0;
                let world_z = (y as f32 + 0.5) * cell_size - world_size / 2.0;
                let dx = world_x - camera_xz.0;
                let dz = world_z - camera_xz.1;
                let distance = (dx * dx + dz * dz).sqrt();
                desired_depth(distance, lod_range0, max_depth)
            })
            .collect();
        Self { size, max_depth, depths }
    }

    #[must_use]
    pub fn depth_at(&self, x: u32, y: u32) -> u32 {
        self.depths[(y * self.size + x) as usize]
    }

    fn neighbors(&self, x: u32, y: u32) -> [Option<(u32, u32)>; 4] {
        [
            (x > 0).then(|| (x - 1, y)),
            (x + 1 < self.size).then(|| (x + 1, y)),
            (y > 0).then(|| (x, y - 1)),
            (y + 1 < self.size).then(|| (x, y + 1)),
        ]
    }

    /// Iteratively lifts any cell whose neighbor is more than one level
    /// finer, for up to `max_depth` rounds — provably sufficient to
    /// propagate a split request up to `max_depth` levels of ancestry
    /// (SPEC_FULL §9 Open Question 3). Returns the number of rounds it
    /// actually took to reach a fixed point.
    pub fn enforce_restriction(&mut self) -> u32 {
        for round in 0..self.max_depth {
            let mut changed = false;
            let mut next = self.depths.clone();
            for y in 0..self.size {
                for x in 0..self.size {
                    let here = self.depth_at(x, y);
                    let max_neighbor = self
                        .neighbors(x, y)
                        .into_iter()
                        .flatten()
                        .map(|(nx, ny)| self.depth_at(nx, ny))
                        .max()
                        .unwrap_or(here);
                    if max_neighbor > here + 1 {
                        next[(y * self.size + x) as usize] = max_neighbor - 1;
                        changed = true;
                    }
                }
            }
            self.depths = next;
            if !changed {
                return round;
            }
        }
        self.max_depth
    }

    #[must_use]
    pub fn is_restricted(&self) -> bool {
        (0..self.size).all(|y| {
            (0..self.size).all(|x| {
                let here = self.depth_at(x, y);
                self.neighbors(x, y)
                    .into_iter()
                    .flatten()
                    .all(|(nx, ny)| self.depth_at(nx, ny).abs_diff(here) <= 1)
            })
        })
    }

    #[must_use]
    pub fn leaf_count(&self) -> u32 {
        self.size * self.size
    }
}

/// One leaf node the recursive quadtree traversal emitted (§4.K steps 1-2):
/// unlike [`DesiredDepthGrid`]'s uniform fine-grid model (kept for the
/// restriction-invariant tests below), each leaf here spans
/// `world_size / 2^depth`, the actual variable cell size a GPU quadtree
/// traversal produces — coarse footprints far from the camera, fine ones
/// close to it, rather than one patch per fine-grid cell.
#[derive(Debug, Clone, Copy)]
pub struct QuadtreeLeaf {
    pub depth: u32,
    pub center_x: f32,
    pub center_z: f32,
    pub half_extent: f32,
}

/// Recursively descends from a node's center, splitting into four children
/// whenever the camera is close enough to want a finer depth than this
/// node's (`desired_depth(distance, ..) > depth`) and `depth < max_depth`
/// (§4.K Mark Splits), emitting a leaf otherwise (§4.K Emit Leaves).
///
/// Stops appending once `out.len()` reaches `max_patches`, incrementing
/// `dropped` once per node that would have been emitted past the cap so the
/// caller can report exactly how much was truncated (§4.K "MaxPatches ≤
/// 8192"). Does not explicitly re-balance neighboring subtrees against each
/// other (SPEC_FULL §9 Open Question 3 note in `DESIGN.md`) — CDLOD's
/// range-doubling per level bounds the depth gap between a node and its
/// children to one by construction; gaps between unrelated branches are the
/// same approximation the original flat per-cell emission made.
#[allow(clippy::too_many_arguments)]
pub fn collect_leaves(
    center_x: f32,
    center_z: f32,
    half_extent: f32,
    depth: u32,
    max_depth: u32,
    lod_range0: f32,
    camera_xz: (f32, f32),
    max_patches: u32,
    out: &mut Vec<QuadtreeLeaf>,
    dropped: &mut u32,
) {
    if out.len() as u32 >= max_patches {
        *dropped += 1;
        return;
    }

    let dx = center_x - camera_xz.0;
    let dz = center_z - camera_xz.1;
    let distance = (dx * dx + dz * dz).sqrt();

    if depth < max_depth && desired_depth(distance, lod_range0, max_depth) > depth {
        let child_half = half_extent / 2.0;
        for (ox, oz) in [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)] {
            collect_leaves(
                center_x + ox * child_half,
                center_z + oz * child_half,
                child_half,
                depth + 1,
                max_depth,
                lod_range0,
                camera_xz,
                max_patches,
                out,
                dropped,
            );
        }
    } else {
        out.push(QuadtreeLeaf { depth, center_x, center_z, half_extent });
    }
}

/// One-time min/max height pyramid build (§3 Lifecycles: "built once at
/// startup... immutable thereafter"). `heightmap` is a `side x side`
/// row-major sample grid; returns one `(y_min, y_max)` per mip level, mip 0
/// being the full-resolution samples downsampled by 2 each level.
#[must_use]
pub fn build_min_max_pyramid(heightmap: &[f32], side: u32) -> Vec<Vec<(f32, f32)>> {
    let mut levels = Vec::new();
    let mut current: Vec<(f32, f32)> = heightmap.iter().map(|&h| (h, h)).collect();
    let mut current_side = side;
    levels.push(current.clone());

    while current_side > 1 {
        let next_side = current_side.div_ceil(2);
        let mut next = Vec::with_capacity((next_side * next_side) as usize);
        for y in 0..next_side {
            for x in 0..next_side {
                let mut lo = f32::MAX;
                let mut hi = f32::MIN;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let sx = (x * 2 + dx).min(current_side - 1);
                        let sy = (y * 2 + dy).min(current_side - 1);
                        let (cell_lo, cell_hi) = current[(sy * current_side + sx) as usize];
                        lo = lo.min(cell_lo);
                        hi = hi.max(cell_hi);
                    }
                }
                next.push((lo, hi));
            }
        }
        levels.push(next.clone());
        current = next;
        current_side = next_side;
    }

    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_nodes_matches_geometric_series_formula() {
        assert_eq!(total_nodes(0), 1);
        assert_eq!(total_nodes(1), 5);
        assert_eq!(total_nodes(2), 21);
    }

    #[test]
    fn desired_depth_is_non_increasing_with_distance() {
        let near = desired_depth(1.0, 64.0, 7);
        let mid = desired_depth(500.0, 64.0, 7);
        let far = desired_depth(100_000.0, 64.0, 7);
        assert!(near >= mid);
        assert!(mid >= far);
        assert_eq!(far, 0);
        assert_eq!(near, 7);
    }

    #[test]
    fn restriction_enforcement_bounds_adjacent_depth_gap_to_one() {
        // A small synthetic tree: a single cell forced to max depth in the
        // middle of an otherwise coarse grid should force its neighbors to
        // step down gradually rather than leave a depth-7 cliff next to a
        // depth-0 cell.
        let size = 8;
        let mut depths = vec![0u32; (size * size) as usize];
        depths[(size / 2 * size + size / 2) as usize] = 7;
        let mut grid = DesiredDepthGrid {
            size,
            max_depth: 7,
            depths,
        };
        assert!(!grid.is_restricted());

        let rounds = grid.enforce_restriction();
        assert!(rounds <= 7);
        assert!(grid.is_restricted());
    }

    #[test]
    fn average_depth_drops_as_camera_moves_away() {
        let near = DesiredDepthGrid::from_camera_distance(32, 7, 64.0, 1000.0, (0.0, 0.0));
        let far = DesiredDepthGrid::from_camera_distance(32, 7, 64.0, 1000.0, (5000.0, 5000.0));
        let avg = |g: &DesiredDepthGrid| g.depths.iter().sum::<u32>() as f32 / g.depths.len() as f32;
        assert!(avg(&near) >= avg(&far));
    }

    #[test]
    fn min_max_pyramid_top_level_covers_full_range() {
        let heightmap = vec![0.0, 1.0, 2.0, 3.0];
        let pyramid = build_min_max_pyramid(&heightmap, 2);
        let top = pyramid.last().unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0], (0.0, 3.0));
    }
}
