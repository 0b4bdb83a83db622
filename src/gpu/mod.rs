//! GPU backend running exported SPIR-V tasks through wgpu.
//!
//! # Architecture
//!
//! Every task of the required kernels is a standalone SPIR-V module named
//! after the task (`<task>.spv`) with a single `main` entry point. wgpu
//! translates the module for the platform API (Metal, Vulkan, DX12), so the
//! same bundle runs everywhere the exporter's output is valid SPIR-V.
//!
//! # Memory Layout
//!
//! All fields live in one storage buffer (the arena) sized from the
//! metadata. Tasks additionally bind a global temporaries buffer and a
//! 16-byte scalar argument record when their metadata asks for them:
//! - Arena (root buffer) - every named field at its metadata offset
//! - Global temporaries - scratch space, zero-initialized
//! - Scalar arguments - one `f32` plus padding per launch
//!
//! # Usage
//!
//! ```ignore
//! use aot_mnist::gpu::WgpuBackend;
//! use aot_mnist::{AotMetadata, KernelRuntime};
//!
//! let metadata = AotMetadata::load("bundle/metadata.json")?;
//! let backend = WgpuBackend::new("bundle")?;
//! let mut runtime = KernelRuntime::with_defaults(metadata, backend)?;
//! runtime.initialize_parameters(None)?;
//! ```

pub mod context;
pub mod errors;
pub mod shader_library;
pub mod wgpu_backend;

pub use context::GpuContext;
pub use errors::{GpuError, GpuResult};
pub use shader_library::{SHADER_ENTRY_POINT, ShaderLibrary, spirv_words};
pub use wgpu_backend::WgpuBackend;
