//! GPU-specific error types.

use thiserror::Error;

/// Errors specific to the wgpu backend.
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("GPU device not available: {message}")]
    DeviceNotAvailable { message: String },

    #[error("Shader library for task '{task}' not found at {path}")]
    MissingShader { task: String, path: String },

    #[error("Failed to read shader library {path}: {source}")]
    ShaderRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid SPIR-V: {message}")]
    InvalidSpirv { message: String },

    #[error("Shader compilation failed for task '{task}': {message}")]
    ShaderCompilationFailed { task: String, message: String },

    #[error("Buffer creation failed: {message}")]
    BufferCreationFailed { message: String },

    #[error("Buffer mapping failed: {message}")]
    BufferMapFailed { message: String },
}

pub type GpuResult<T> = std::result::Result<T, GpuError>;
