//! Error types for runtime driver construction, dispatch, training and inference.

use thiserror::Error;

use super::DatasetError;
use crate::gpu::GpuError;

/// Errors that can occur while building or driving a [`crate::KernelRuntime`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed metadata: {source}")]
    MetadataParse {
        #[from]
        source: serde_json::Error,
    },

    #[error("Kernel '{name}' is not present in the metadata")]
    MissingKernel { name: String },

    #[error("Kernel '{name}' has no tasks")]
    EmptyKernel { name: String },

    #[error("Field '{name}' is not present in the metadata")]
    MissingField { name: String },

    #[error(
        "Field '{name}' spans bytes {offset}..{end} which exceeds the arena size {arena_size}"
    )]
    FieldOutsideArena {
        name: String,
        offset: usize,
        end: usize,
        arena_size: usize,
    },

    #[error("Field '{name}' at offset {offset} has a shape too large to address")]
    FieldSizeOverflow { name: String, offset: usize },

    #[error("Fields '{first}' and '{second}' overlap in the arena")]
    OverlappingFields { first: String, second: String },

    #[error("Gradient field '{grad}' holds {actual} elements but '{field}' holds {expected}")]
    GradientShapeMismatch {
        field: String,
        grad: String,
        expected: usize,
        actual: usize,
    },

    #[error("Write of {actual} bytes exceeds the {capacity} byte extent of the field at offset {offset}")]
    FieldOverflow {
        offset: usize,
        capacity: usize,
        actual: usize,
    },

    #[error("Arena access at offset {offset} with length {len} is not 4-byte aligned")]
    MisalignedAccess { offset: usize, len: usize },

    #[error("Arena access {offset}..{end} is outside the arena of {arena_size} bytes")]
    ArenaOutOfBounds {
        offset: usize,
        end: usize,
        arena_size: usize,
    },

    #[error("Arena of {size} bytes exceeds the {max} byte limit of the {backend} backend")]
    ArenaTooLarge {
        backend: String,
        size: usize,
        max: usize,
    },

    #[error("Arena has not been allocated")]
    ArenaNotAllocated,

    #[error("Task '{task}' binds unsupported buffer kind {kind}")]
    UnsupportedBufferBinding { task: String, kind: u32 },

    #[error("No host implementation registered for task '{task}'")]
    MissingHostTask { task: String },

    #[error("Task '{task}' was dispatched before it was loaded")]
    TaskNotLoaded { task: String },

    #[error("Dataset images have {dataset} elements but field '{field}' holds {field_elements}")]
    ImageSizeMismatch {
        field: String,
        dataset: usize,
        field_elements: usize,
    },

    #[error("{pixels} pixels cannot form rows of width {width}")]
    InvalidImageShape { pixels: usize, width: usize },

    #[error("Failed to write image {path}: {source}")]
    ImageWrite {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("The {split} split is empty")]
    EmptySplit { split: String },

    #[error("Dispatch of task '{task}' failed: {message}")]
    DispatchFailed { task: String, message: String },

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}
