//! Loading of per-task SPIR-V shader libraries.

use std::fs;
use std::path::{Path, PathBuf};

use super::errors::{GpuError, GpuResult};

/// Entry point every exported task exposes.
pub const SHADER_ENTRY_POINT: &str = "main";

/// SPIR-V magic number in the module's native word order.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Converts raw SPIR-V bytes into words, validating the header.
///
/// Modules written in the opposite byte order are swapped to native order.
pub fn spirv_words(bytes: &[u8]) -> GpuResult<Vec<u32>> {
    if bytes.len() < 20 {
        return Err(GpuError::InvalidSpirv {
            message: format!("module of {} bytes is shorter than the header", bytes.len()),
        });
    }
    if bytes.len() % 4 != 0 {
        return Err(GpuError::InvalidSpirv {
            message: format!("module length {} is not a multiple of 4", bytes.len()),
        });
    }

    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] == SPIRV_MAGIC.swap_bytes() {
        for word in &mut words {
            *word = word.swap_bytes();
        }
    }
    if words[0] != SPIRV_MAGIC {
        return Err(GpuError::InvalidSpirv {
            message: format!("bad magic number {:#010x}", words[0]),
        });
    }
    Ok(words)
}

/// Directory of compiled task libraries, one `<task>.spv` per task.
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    root: PathBuf,
}

impl ShaderLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the library for a task.
    pub fn path_for(&self, task: &str) -> PathBuf {
        self.root.join(format!("{task}.spv"))
    }

    /// Reads and validates the library of a task.
    pub fn load(&self, task: &str) -> GpuResult<Vec<u32>> {
        let path = self.path_for(task);
        if !path.is_file() {
            return Err(GpuError::MissingShader {
                task: task.to_string(),
                path: path.display().to_string(),
            });
        }
        let bytes = fs::read(&path).map_err(|source| GpuError::ShaderRead {
            path: path.display().to_string(),
            source,
        })?;
        spirv_words(&bytes)
    }
}
