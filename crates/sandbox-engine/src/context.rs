//! Headless GPU context acquisition.

use anyhow::{Context as _, Result};

/// Texture format every pass renders into. Float targets keep feedback
/// loops (position accumulators, simulation state) at full precision.
pub const PASS_TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

/// Instance, adapter, device, and queue for off-screen rendering.
///
/// Construction fails (rather than degrading) when no adapter can sample
/// filterable 32-bit float textures, since every pass target uses that
/// format.
#[derive(Debug)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .context("no suitable GPU adapter found")?;

        let info = adapter.get_info();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            "acquired adapter"
        );

        if !adapter
            .features()
            .contains(wgpu::Features::FLOAT32_FILTERABLE)
        {
            anyhow::bail!(
                "adapter '{}' cannot filter 32-bit float textures; pass targets require it",
                info.name
            );
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("sandbox-device"),
            required_features: wgpu::Features::FLOAT32_FILTERABLE,
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        }))
        .context("failed to acquire GPU device")?;

        Ok(Self {
            device,
            queue,
            adapter,
        })
    }
}
