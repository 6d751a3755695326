//! §4.E Per-Instance Staging (Draw Bucket).
//!
//! One [`DrawBucket`] per producer thread per frame. Producers call
//! [`DrawBucket::add`] to append a draw; the Draw Batcher later merges all
//! non-empty buckets into the target Instance Batch's columns.
//!
//! Optional per-instance channels (bones, terrain patch rects, ...) are
//! staged through [`ChannelValue`], a tagged union rather than a trait
//! object, per the Design Notes' guidance to avoid virtual dispatch on this
//! hot path.

use crate::types::{BoundingSphere, InstanceDescriptor, MeshPartId, TransformSlot};
use rustc_hash::{FxHashMap, FxHashSet};

/// One optional per-instance parameter value staged alongside the fixed
/// columns. Scalars and small arrays are copied byte-for-byte; textures are
/// bindless indices and never enter the per-instance channel bytes (the
/// spec's `add()` explicitly skips texture parameters).
#[derive(Debug, Clone)]
pub enum ChannelValue {
    Scalar(f32),
    Vec4([f32; 4]),
    Mat4([f32; 16]),
    Array(Vec<u8>),
}

impl ChannelValue {
    /// Copies this value's raw bytes into `dest` at `offset`, returning the
    /// number of bytes written.
    pub fn copy_to_staging(&self, dest: &mut [u8], offset: usize) -> usize {
        let bytes: &[u8] = match self {
            ChannelValue::Scalar(v) => bytemuck::bytes_of(v),
            ChannelValue::Vec4(v) => bytemuck::bytes_of(v),
            ChannelValue::Mat4(v) => bytemuck::bytes_of(v),
            ChannelValue::Array(bytes) => bytes.as_slice(),
        };
        dest[offset..offset + bytes.len()].copy_from_slice(bytes);
        bytes.len()
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            ChannelValue::Scalar(_) => 4,
            ChannelValue::Vec4(_) => 16,
            ChannelValue::Mat4(_) => 64,
            ChannelValue::Array(bytes) => bytes.len(),
        }
    }
}

/// Parameter binding identity, the stable hash computed once at shader-load
/// time (here: whatever the caller passes in, typically a hash of the
/// binding name). Not computed by this module.
pub type ChannelKey = u64;

/// Open-ended per-instance channel: one growable byte column per binding,
/// keyed by `ChannelKey`, with a known per-instance stride.
pub struct Channel {
    pub push_constant_slot: u32,
    pub element_stride: usize,
    pub elements_per_instance: u32,
    pub bytes: Vec<u8>,
}

impl Channel {
    fn new(push_constant_slot: u32, element_stride: usize, elements_per_instance: u32) -> Self {
        Self {
            push_constant_slot,
            element_stride,
            elements_per_instance,
            bytes: Vec::new(),
        }
    }

    fn append_row(&mut self, value: &ChannelValue) {
        let start = self.bytes.len();
        self.bytes.resize(start + value.byte_len(), 0);
        value.copy_to_staging(&mut self.bytes, start);
    }
}

/// One producer thread's per-frame draw bucket (§4.E).
#[derive(Default)]
pub struct DrawBucket {
    pub descriptors: Vec<InstanceDescriptor>,
    pub bounding_spheres: Vec<BoundingSphere>,
    pub sub_batch_ids: Vec<MeshPartId>,
    pub channels: FxHashMap<ChannelKey, Channel>,
    seen_mesh_parts: FxHashSet<MeshPartId>,
}

impl DrawBucket {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    #[must_use]
    pub fn unique_mesh_parts(&self) -> &FxHashSet<MeshPartId> {
        &self.seen_mesh_parts
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.bounding_spheres.clear();
        self.sub_batch_ids.clear();
        self.seen_mesh_parts.clear();
        for channel in self.channels.values_mut() {
            channel.bytes.clear();
        }
    }

    /// Appends one draw. `channel_values` pairs each optional channel's key
    /// (with its push-constant slot, element stride, and elements-per-
    /// instance layout) with the raw value to stage this row; texture
    /// parameters must be excluded by the caller before reaching here.
    pub fn add(
        &mut self,
        part: MeshPartId,
        material_id: u32,
        transform_slot: TransformSlot,
        bounds: BoundingSphere,
        custom_data_index: u32,
        channel_values: &[(ChannelKey, u32, usize, u32, ChannelValue)],
    ) {
        self.descriptors.push(InstanceDescriptor {
            transform_slot: transform_slot.0,
            material_id,
            custom_data_index,
        });
        self.bounding_spheres.push(bounds);
        self.sub_batch_ids.push(part);
        self.seen_mesh_parts.insert(part);

        for (key, push_constant_slot, stride, per_instance, value) in channel_values {
            let channel = self
                .channels
                .entry(*key)
                .or_insert_with(|| Channel::new(*push_constant_slot, *stride, *per_instance));
            channel.append_row(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_appends_to_every_column_in_lockstep() {
        let mut bucket = DrawBucket::new();
        bucket.add(
            MeshPartId(3),
            7,
            TransformSlot(1),
            BoundingSphere::new([0.0; 3], 1.0),
            0,
            &[],
        );
        bucket.add(
            MeshPartId(3),
            7,
            TransformSlot(2),
            BoundingSphere::new([0.0; 3], 1.0),
            0,
            &[],
        );
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.unique_mesh_parts().len(), 1);
    }

    #[test]
    fn clear_empties_every_column_including_channels() {
        let mut bucket = DrawBucket::new();
        bucket.add(
            MeshPartId(0),
            0,
            TransformSlot(0),
            BoundingSphere::new([0.0; 3], 1.0),
            0,
            &[(99, 16, 64, 1, ChannelValue::Mat4([0.0; 16]))],
        );
        assert_eq!(bucket.channels.get(&99).unwrap().bytes.len(), 64);
        bucket.clear();
        assert!(bucket.is_empty());
        assert_eq!(bucket.channels.get(&99).unwrap().bytes.len(), 0);
    }

    #[test]
    fn channel_value_copies_correct_byte_count() {
        let mut dest = vec![0u8; 16];
        let written = ChannelValue::Vec4([1.0, 2.0, 3.0, 4.0]).copy_to_staging(&mut dest, 0);
        assert_eq!(written, 16);
    }
}
