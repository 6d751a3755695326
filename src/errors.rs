//! Crate-wide error type.
//!
//! Fatal configuration errors (pool exhaustion, PSO creation failure) are
//! returned as `Err` from init-time calls. Per-frame soft faults never reach
//! this type — they are absorbed into no-ops with a rate-limited log line
//! (see [`crate::util::RateLimitedLog`]).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bindless resource table exhausted (capacity {capacity})")]
    BindlessTableExhausted { capacity: u32 },

    #[error("transform store exhausted: {max_slots} slots already allocated")]
    TransformStoreExhausted { max_slots: u32 },

    #[error("sub-batch count exceeded MaxSubBatches ({max}); batch would need {requested}")]
    TooManySubBatches { max: u32, requested: u32 },

    #[error("terrain quadtree depth {depth} exceeds configured max_depth {max_depth}")]
    TerrainDepthExceeded { depth: u32, max_depth: u32 },

    #[error("failed to create compute pipeline '{name}': {reason}")]
    PipelineCreateFailed { name: &'static str, reason: String },

    #[error("shader module '{name}' failed to compile: {reason}")]
    ShaderCompileFailed { name: &'static str, reason: String },

    #[error("GPU device lost: {reason}")]
    DeviceLost { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
