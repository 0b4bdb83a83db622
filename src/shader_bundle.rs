//! Packaging exported SPIR-V into a bundle the runtime can load.
//!
//! Every `*.spv` in the export directory is validated and copied to
//! `<out>/<task>.spv`, the metadata is copied alongside, and a
//! `manifest.json` records which kernel each task belongs to. An external
//! translator (for example `spirv-cross {input} --msl --stage comp --output
//! {output}`) can additionally produce native shader source per task.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{BundleError, BundleResult};
use crate::gpu::spirv_words;
use crate::metadata::AotMetadata;

pub const METADATA_FILE: &str = "metadata.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOptions {
    /// Command template with `{input}` and `{output}` placeholders.
    pub translator: Option<String>,
    /// Extension of translated outputs.
    pub translated_extension: String,
    /// Name translated outputs after the task instead of its kernel.
    pub preserve_task_names: bool,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            translator: None,
            translated_extension: "metal".to_string(),
            preserve_task_names: true,
        }
    }
}

/// One bundled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kernel: String,
    pub task: String,
    /// Source module in the export directory.
    pub spv: String,
    /// Copy of the module inside the bundle.
    pub output: String,
    /// Translated shader source, when a translator ran.
    pub translated: Option<String>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BundleError + '_ {
    move |source| BundleError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Maps every task in `metadata.json` to its kernel. Missing metadata yields
/// an empty map.
fn task_owners(aot_dir: &Path) -> BundleResult<Vec<(String, String)>> {
    let path = aot_dir.join(METADATA_FILE);
    if !path.is_file() {
        warn!("{} not found, naming kernels after their tasks", path.display());
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path).map_err(io_error(&path))?;
    let metadata: AotMetadata =
        serde_json::from_str(&content).map_err(|source| BundleError::Metadata {
            path: path.display().to_string(),
            source,
        })?;
    Ok(metadata
        .task_owners()
        .map(|(task, kernel)| (task.to_string(), kernel.to_string()))
        .collect())
}

fn find_shaders(aot_dir: &Path) -> BundleResult<Vec<PathBuf>> {
    let mut shaders: Vec<PathBuf> = fs::read_dir(aot_dir)
        .map_err(io_error(aot_dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "spv"))
        .collect();
    shaders.sort();
    Ok(shaders)
}

/// Expands the translator template for one module.
pub fn translator_command(template: &str, input: &Path, output: &Path) -> BundleResult<Vec<String>> {
    let args: Vec<String> = template
        .split_whitespace()
        .map(|arg| {
            arg.replace("{input}", &input.display().to_string())
                .replace("{output}", &output.display().to_string())
        })
        .collect();
    if args.is_empty() {
        return Err(BundleError::EmptyTranslator);
    }
    Ok(args)
}

fn run_translator(args: &[String]) -> BundleResult<()> {
    let command = args.join(" ");
    let output = Command::new(&args[0])
        .args(&args[1..])
        .output()
        .map_err(|err| BundleError::TranslatorFailed {
            command: command.clone(),
            stderr: err.to_string(),
        })?;
    if !output.status.success() {
        let mut stderr = String::from_utf8_lossy(&output.stdout).into_owned();
        stderr.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(BundleError::TranslatorFailed { command, stderr });
    }
    Ok(())
}

/// Bundles the exported shaders in `aot_dir` into `out_dir`.
pub fn bundle_shaders(
    aot_dir: &Path,
    out_dir: &Path,
    options: &BundleOptions,
) -> BundleResult<Vec<ManifestEntry>> {
    if !aot_dir.is_dir() {
        return Err(BundleError::MissingAotDir {
            path: aot_dir.display().to_string(),
        });
    }
    let shaders = find_shaders(aot_dir)?;
    if shaders.is_empty() {
        return Err(BundleError::NoShaders {
            path: aot_dir.display().to_string(),
        });
    }
    let owners = task_owners(aot_dir)?;
    fs::create_dir_all(out_dir).map_err(io_error(out_dir))?;

    let mut manifest = Vec::with_capacity(shaders.len());
    for spv in &shaders {
        let task = spv
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kernel = owners
            .iter()
            .find(|(owned, _)| *owned == task)
            .map(|(_, kernel)| kernel.clone())
            .unwrap_or_else(|| task.clone());

        let bytes = fs::read(spv).map_err(io_error(spv))?;
        spirv_words(&bytes).map_err(|source| BundleError::InvalidShader {
            path: spv.display().to_string(),
            source,
        })?;
        let output = out_dir.join(format!("{task}.spv"));
        fs::write(&output, &bytes).map_err(io_error(&output))?;

        let translated = match &options.translator {
            Some(template) => {
                let logical = if options.preserve_task_names { &task } else { &kernel };
                let target = out_dir.join(format!("{logical}.{}", options.translated_extension));
                run_translator(&translator_command(template, spv, &target)?)?;
                Some(target.display().to_string())
            }
            None => None,
        };

        manifest.push(ManifestEntry {
            kernel,
            task,
            spv: spv.display().to_string(),
            output: output.display().to_string(),
            translated,
        });
    }

    let metadata = aot_dir.join(METADATA_FILE);
    if metadata.is_file() {
        let target = out_dir.join(METADATA_FILE);
        fs::copy(&metadata, &target).map_err(io_error(&target))?;
    }

    let manifest_path = out_dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(&manifest_path, json).map_err(io_error(&manifest_path))?;

    info!(
        "bundled {} shaders from {} into {}",
        manifest.len(),
        aot_dir.display(),
        out_dir.display()
    );
    Ok(manifest)
}
