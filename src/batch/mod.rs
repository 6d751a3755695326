//! §4.F Draw Batcher and §4.G Instance Batch.

pub mod batcher;
pub mod bucket_registry;
pub mod gpu_buffers;
pub mod instance_batch;

pub use batcher::{DrawBatcher, PassId};
pub use gpu_buffers::{InstanceBatchGpuBuffers, InstanceBatchGpuSlot};
pub use instance_batch::{GrowthEvent, InstanceBatch, MergedColumns};
