//! Error types for shader bundling.

use thiserror::Error;

use crate::gpu::GpuError;

/// Errors that can occur while bundling exported shaders.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("AOT directory not found: {path}")]
    MissingAotDir { path: String },

    #[error("No .spv files found in {path}")]
    NoShaders { path: String },

    #[error("Failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed metadata in {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Shader {path} is not a valid SPIR-V module: {source}")]
    InvalidShader {
        path: String,
        #[source]
        source: GpuError,
    },

    #[error("Translator command template is empty")]
    EmptyTranslator,

    #[error("Command failed: {command}\n{stderr}")]
    TranslatorFailed { command: String, stderr: String },

    #[error("Failed to write manifest: {source}")]
    Manifest {
        #[from]
        source: serde_json::Error,
    },
}
