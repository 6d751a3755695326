//! Shared GPU handles threaded explicitly through every component (Design
//! Notes: "no global GPU state; device/queue/bindless heap live in a
//! RenderContext handed to every component that needs them").

use crate::bindless::BindlessResourceTable;
use crate::config::RendererConfig;
use crate::upload::RingUploadArena;
use std::sync::Arc;

pub struct RenderContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub config: RendererConfig,
    pub bindless: BindlessResourceTable,
    pub upload_arena: RingUploadArena,
}

impl RenderContext {
    #[must_use]
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, config: RendererConfig) -> Self {
        let bindless = BindlessResourceTable::new(4096);
        let upload_arena = RingUploadArena::new(config.upload_arena_bytes);
        Self { device, queue, config, bindless, upload_arena }
    }
}
