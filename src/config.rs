//! Runtime configuration loaded from JSON.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::autodiff::AutodiffNames;
use crate::errors::{ConfigError, ConfigResult};
use crate::layout::{FieldNames, KernelNames};
use crate::training::TrainConfig;

/// Paths and names the runtime and CLI need. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding the exporter's `.spv` files and `metadata.json`.
    pub aot_dir: PathBuf,
    /// Bundle directory the GPU backend loads `<task>.spv` from.
    pub shader_dir: PathBuf,
    pub dataset_path: PathBuf,
    pub kernels: KernelNames,
    pub fields: FieldNames,
    pub training: TrainConfig,
    /// Bundle directory of the autodiff export used by the gradient check.
    pub autodiff_dir: PathBuf,
    pub autodiff: AutodiffNames,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            aot_dir: PathBuf::from("build/aot_mnist"),
            shader_dir: PathBuf::from("build/shaders"),
            dataset_path: PathBuf::from("data/mnist_subset.bin"),
            kernels: KernelNames::default(),
            fields: FieldNames::default(),
            training: TrainConfig::default(),
            autodiff_dir: PathBuf::from("build/shaders_autodiff"),
            autodiff: AutodiffNames::default(),
        }
    }
}

impl RuntimeConfig {
    /// Metadata file inside the shader bundle.
    pub fn metadata_path(&self) -> PathBuf {
        self.shader_dir.join("metadata.json")
    }

    /// Metadata file of the autodiff bundle.
    pub fn autodiff_metadata_path(&self) -> PathBuf {
        self.autodiff_dir.join("metadata.json")
    }
}

/// Configuration loader that handles JSON files with fallbacks
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a configuration file, falling back to defaults when it is absent
    pub fn load_config<T>(path: impl AsRef<Path>, config_name: &str) -> ConfigResult<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => {
                info!("Loading {} configuration from '{}'", config_name, path.display());
                serde_json::from_str(&content).map_err(|e| ConfigError::ConfigParseError {
                    path: path.display().to_string(),
                    source: e,
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Config file '{}' not found, using default configuration for {}",
                    path.display(),
                    config_name
                );
                Ok(T::default())
            }
            Err(e) => Err(ConfigError::ConfigReadError {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    /// Load the runtime configuration
    pub fn load_runtime_config(path: impl AsRef<Path>) -> ConfigResult<RuntimeConfig> {
        Self::load_config(path, "runtime")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"shader_dir": "bundle", "training": {"epochs": 5}, "fields": {"input": "pixels"}}"#,
        )
        .unwrap();
        assert_eq!(config.shader_dir, PathBuf::from("bundle"));
        assert_eq!(config.metadata_path(), PathBuf::from("bundle/metadata.json"));
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training.progress_interval, 100);
        assert_eq!(config.fields.input, "pixels");
        assert_eq!(config.fields.loss, "loss");
        assert_eq!(config.kernels, KernelNames::default());
        assert_eq!(config.autodiff.backward, "backward");
        assert_eq!(
            config.autodiff_metadata_path(),
            PathBuf::from("build/shaders_autodiff/metadata.json")
        );
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = ConfigLoader::load_runtime_config("does/not/exist.json").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }
}
