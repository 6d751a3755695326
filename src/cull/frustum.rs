//! Frustum plane extraction and the GPU-facing constant blocks §4.H reads.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

bitflags! {
    /// Debug toggles packed into `FrustumConstants::debug_mode`. Rust-side
    /// API boundary only — the GPU side reads the raw bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CullDebugFlags: u32 {
        /// Skip the Hi-Z occlusion test; frustum-only culling.
        const DISABLE_HI_Z = 1 << 0;
        /// Force every instance visible, bypassing both tests.
        const FORCE_VISIBLE = 1 << 1;
        /// Freeze the occlusion view-projection to the current frame's VP
        /// instead of the resident pyramid's build VP (debug only).
        const FREEZE_OCCLUSION_VP = 1 << 2;
    }
}

/// Six frustum planes as `Vec4(normal.xyz, -distance)`, extracted via
/// Gribb-Hartmann from a combined view-projection matrix, in the same form
/// the teacher's `Frustum` type uses for its CPU-side culling pass.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Vec4; 6],
}

impl Frustum {
    #[must_use]
    pub fn from_view_projection(vp: Mat4) -> Self {
        let rows = vp.transpose();
        let (r0, r1, r2, r3) = (rows.x_axis, rows.y_axis, rows.z_axis, rows.w_axis);

        let mut planes = [
            r3 + r0, // left
            r3 - r0, // right
            r3 + r1, // bottom
            r3 - r1, // top
            r3 + r2, // near
            r3 - r2, // far
        ];
        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > f32::EPSILON {
                *plane /= len;
            }
        }
        Self { planes }
    }

    /// True if the sphere is fully outside at least one plane (i.e. it
    /// fails the frustum test and should be culled).
    #[must_use]
    pub fn rejects(&self, center: glam::Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .any(|p| p.truncate().dot(center) + p.w < -radius)
    }
}

/// Per-frame-ring constant buffer §4.H describes: six frustum planes plus
/// Hi-Z metadata, sized and aligned for direct `queue.write_buffer` upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrustumConstants {
    pub planes: [[f32; 4]; 6],
    /// Previous frame's view-projection, the one the sampled Hi-Z mip was
    /// built from (see SPEC_FULL §9 Open Question 2).
    pub occlusion_view_projection: [[f32; 4]; 4],
    pub hzb_srv: u32,
    pub hzb_width: u32,
    pub hzb_height: u32,
    pub hzb_mip_count: u32,
    pub near_plane: f32,
    pub cull_stats_uav: u32,
    pub debug_mode: u32,
    pub _pad: u32,
}

impl FrustumConstants {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frustum: Frustum,
        occlusion_vp: Mat4,
        hzb_srv: u32,
        hzb_width: u32,
        hzb_height: u32,
        near_plane: f32,
        cull_stats_uav: u32,
        debug_flags: CullDebugFlags,
    ) -> Self {
        let mut planes = [[0.0f32; 4]; 6];
        for (dst, src) in planes.iter_mut().zip(frustum.planes.iter()) {
            *dst = src.to_array();
        }
        Self {
            planes,
            occlusion_view_projection: occlusion_vp.to_cols_array_2d(),
            hzb_srv,
            hzb_width,
            hzb_height,
            hzb_mip_count: crate::config::RendererConfig::hzb_mip_count(hzb_width, hzb_height),
            near_plane,
            cull_stats_uav,
            debug_mode: debug_flags.bits(),
            _pad: 0,
        }
    }
}

/// Per-cascade frustum block used by the Shadow-Visibility kernel (§4.G
/// shadow variant): four cascades' worth of plane data in one CBV.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShadowCascadeConstants {
    pub cascade_planes: [[[f32; 4]; 6]; 4],
    pub cascade_count: u32,
    pub _pad: [u32; 3],
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn look_at_perspective() -> Mat4 {
        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 5.0, -10.0), Vec3::ZERO, Vec3::Y);
        proj * view
    }

    #[test]
    fn sphere_at_origin_is_not_rejected() {
        let frustum = Frustum::from_view_projection(look_at_perspective());
        assert!(!frustum.rejects(Vec3::ZERO, 1.0));
    }

    #[test]
    fn sphere_far_behind_camera_is_rejected() {
        let frustum = Frustum::from_view_projection(look_at_perspective());
        assert!(frustum.rejects(Vec3::new(0.0, 0.0, -1000.0), 1.0));
    }

    #[test]
    fn hzb_mip_count_is_embedded_in_constants() {
        let frustum = Frustum::from_view_projection(look_at_perspective());
        let constants = FrustumConstants::new(frustum, Mat4::IDENTITY, 0, 1920, 1080, 0.1, 1, CullDebugFlags::empty());
        assert_eq!(constants.hzb_mip_count, crate::config::RendererConfig::hzb_mip_count(1920, 1080));
    }

    #[test]
    fn debug_flags_are_packed_into_debug_mode() {
        let frustum = Frustum::from_view_projection(look_at_perspective());
        let flags = CullDebugFlags::DISABLE_HI_Z | CullDebugFlags::FORCE_VISIBLE;
        let constants = FrustumConstants::new(frustum, Mat4::IDENTITY, 0, 1920, 1080, 0.1, 1, flags);
        assert_eq!(constants.debug_mode, flags.bits());
    }
}
