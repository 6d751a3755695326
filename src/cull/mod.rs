//! §4.G cull pipeline support, §4.H Culler Service, §4.I Hi-Z, §4.J SDSM.

pub mod culler;
pub mod frustum;
pub mod hzb;
pub mod readback;
pub mod sdsm;

#[cfg(test)]
pub mod sim;

pub use culler::{CullStats, CullerService, KernelKind};
pub use frustum::{CullDebugFlags, Frustum, FrustumConstants, ShadowCascadeConstants};
