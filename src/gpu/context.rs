//! wgpu device acquisition.

use log::info;
use pollster::FutureExt;

use super::errors::{GpuError, GpuResult};

/// Device and queue shared by every GPU resource of a runtime.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Requests the default high-performance adapter and a device with the
    /// adapter's own limits, so large arenas are not capped by the
    /// conservative defaults.
    pub fn request() -> GpuResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .block_on()
            .ok_or_else(|| GpuError::DeviceNotAvailable {
                message: "no compatible adapter found".to_string(),
            })?;

        let adapter_info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("aot-mnist device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .block_on()
            .map_err(|err| GpuError::DeviceNotAvailable {
                message: err.to_string(),
            })?;

        info!(
            "using GPU adapter '{}' ({:?})",
            adapter_info.name, adapter_info.backend
        );

        Ok(Self {
            device,
            queue,
            adapter_info,
        })
    }
}
