//! Pure-Rust reference model of the five-pass cull/group pipeline (§4.G).
//!
//! Exercises the same index arithmetic the WGSL kernels encode
//! (Visibility → Histogram → Prefix Sum → Scatter → Command Emit) so the
//! partitioning invariants in §8 are checked without a GPU device. Not used
//! by the production path; `#[cfg(test)]`-only.

use crate::cull::frustum::Frustum;
use crate::types::{BoundingSphere, MeshPartId};
use glam::{Mat4, Vec3};

pub struct SimInstance {
    pub transform: Mat4,
    pub bounds: BoundingSphere,
    pub sub_batch_id: MeshPartId,
}

pub struct SimResult {
    pub visibility_flags: Vec<bool>,
    /// Indexed by `MeshPartId.0`.
    pub histogram: Vec<u32>,
    /// Exclusive scan of `histogram`; indexed by `MeshPartId.0`.
    pub sub_batch_offsets: Vec<u32>,
    pub visible_indices: Vec<u32>,
    /// `instance_count` per sub-batch, indexed by `MeshPartId.0`. Sub-batches
    /// with zero visible instances still get an entry (cardinality =
    /// `mesh_part_count`), matching §4.G's command-emit rule.
    pub command_instance_counts: Vec<u32>,
}

/// Runs the reference pipeline against `instances`, treating every distinct
/// `MeshPartId` in `0..mesh_part_count` as a sub-batch slot.
#[must_use]
pub fn run(frustum: &Frustum, instances: &[SimInstance], mesh_part_count: u32) -> SimResult {
    let n = instances.len();

    // Pass 1: Visibility.
    let visibility_flags: Vec<bool> = instances
        .iter()
        .map(|inst| {
            let center = inst.transform.transform_point3(Vec3::from(inst.bounds.center));
            // Approximate the world-space radius via the transform's largest
            // axis scale, matching how the WGSL kernel derives a conservative
            // scaled radius from the instance's model matrix.
            let scale = inst.transform.to_scale_rotation_translation().0;
            let radius = inst.bounds.radius * scale.x.max(scale.y).max(scale.z);
            !frustum.rejects(center, radius)
        })
        .collect();

    // Pass 2: Histogram.
    let mut histogram = vec![0u32; mesh_part_count as usize];
    for (inst, &visible) in instances.iter().zip(&visibility_flags) {
        if visible {
            histogram[inst.sub_batch_id.0 as usize] += 1;
        }
    }

    // Pass 3: Histogram Prefix Sum (exclusive scan).
    let mut sub_batch_offsets = vec![0u32; mesh_part_count as usize];
    let mut running = 0u32;
    for (offset, &count) in sub_batch_offsets.iter_mut().zip(histogram.iter()) {
        *offset = running;
        running += count;
    }

    // Pass 4: Global Scatter.
    let total_visible = running as usize;
    let mut visible_indices = vec![u32::MAX; total_visible];
    let mut cursors = vec![0u32; mesh_part_count as usize];
    for (i, (inst, &visible)) in instances.iter().zip(&visibility_flags).enumerate() {
        if !visible {
            continue;
        }
        let sub_batch = inst.sub_batch_id.0 as usize;
        let pos = sub_batch_offsets[sub_batch] + cursors[sub_batch];
        cursors[sub_batch] += 1;
        visible_indices[pos as usize] = i as u32;
    }
    let _ = n;

    // Pass 5: Command Emit (cardinality = mesh_part_count, zero-count
    // sub-batches still emit a command per §4.G).
    let command_instance_counts = histogram.clone();

    SimResult {
        visibility_flags,
        histogram,
        sub_batch_offsets,
        visible_indices,
        command_instance_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    fn frustum() -> Frustum {
        let proj = Mat4::perspective_rh(1.2, 1.0, 0.1, 2000.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 5.0, -10.0), Vec3::ZERO, Vec3::Y);
        Frustum::from_view_projection(proj * view)
    }

    #[test]
    fn cull_totals_invariant_holds() {
        let frustum = frustum();
        let instances = vec![
            SimInstance {
                transform: Mat4::IDENTITY,
                bounds: BoundingSphere::new([0.0; 3], 1.0),
                sub_batch_id: MeshPartId(0),
            },
            SimInstance {
                transform: Mat4::from_translation(Vec3::new(0.0, 0.0, -1000.0)),
                bounds: BoundingSphere::new([0.0; 3], 1.0),
                sub_batch_id: MeshPartId(0),
            },
        ];
        let result = run(&frustum, &instances, 1);

        let popcount = result.visibility_flags.iter().filter(|&&v| v).count() as u32;
        let histogram_sum: u32 = result.histogram.iter().sum();
        let command_sum: u32 = result.command_instance_counts.iter().sum();
        assert_eq!(histogram_sum, popcount);
        assert_eq!(histogram_sum, command_sum);
    }

    #[test]
    fn scatter_partition_matches_expected_indices() {
        let frustum = frustum();
        let instances = vec![
            SimInstance { transform: Mat4::IDENTITY, bounds: BoundingSphere::new([0.0; 3], 1.0), sub_batch_id: MeshPartId(0) },
            SimInstance { transform: Mat4::IDENTITY, bounds: BoundingSphere::new([0.0; 3], 1.0), sub_batch_id: MeshPartId(1) },
            SimInstance { transform: Mat4::IDENTITY, bounds: BoundingSphere::new([0.0; 3], 1.0), sub_batch_id: MeshPartId(0) },
        ];
        let result = run(&frustum, &instances, 2);

        assert_eq!(result.histogram, vec![2, 1]);
        assert_eq!(result.sub_batch_offsets, vec![0, 2]);

        let region_0 = &result.visible_indices[0..2];
        let region_1 = &result.visible_indices[2..3];
        assert!(region_0.contains(&0) && region_0.contains(&2));
        assert_eq!(region_1, &[1]);
    }

    #[test]
    fn zero_visible_sub_batch_still_emits_a_command() {
        let frustum = frustum();
        let instances = vec![SimInstance {
            transform: Mat4::from_translation(Vec3::new(0.0, 0.0, -1000.0)),
            bounds: BoundingSphere::new([0.0; 3], 1.0),
            sub_batch_id: MeshPartId(0),
        }];
        let result = run(&frustum, &instances, 1);
        assert_eq!(result.command_instance_counts.len(), 1);
        assert_eq!(result.command_instance_counts[0], 0);
    }
}
