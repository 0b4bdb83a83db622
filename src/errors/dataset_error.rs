//! Error types for dataset containers and IDX source files.

use thiserror::Error;

/// Errors that can occur while loading, preparing or indexing a dataset.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "IDX file {stem} (or {stem}.gz) not found in {dir}; MNIST files are not downloaded, place them there first"
    )]
    MissingIdxFile { dir: String, stem: String },

    #[error("Invalid dataset format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Label {label} at {split} index {index} is outside 0..{num_classes}")]
    LabelOutOfRange {
        split: String,
        index: usize,
        label: u8,
        num_classes: u8,
    },

    #[error("Index {index} is out of bounds for the {split} split of {count} samples")]
    IndexOutOfBounds {
        split: String,
        index: usize,
        count: usize,
    },

    #[error("Invalid IDX file {path}: expected magic {expected}, got {actual}")]
    InvalidIdxMagic {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("Truncated IDX file {path}: expected {expected} payload bytes, got {actual}")]
    TruncatedIdx {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("IDX image count {images} does not match label count {labels}")]
    IdxCountMismatch { images: usize, labels: usize },

    #[error("Requested {requested} samples but only {available} are available")]
    SubsetTooLarge { requested: usize, available: usize },
}
