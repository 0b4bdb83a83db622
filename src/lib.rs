//! Runtime for compiler-exported compute kernels, training an MNIST classifier.
//!
//! The exporter emits one SPIR-V module per task and a `metadata.json`
//! describing the fields of a single shared arena and the tasks of every
//! kernel. This library bundles those modules, loads them on a compute
//! backend, binds the arena by byte offset and drives forward, backward and
//! gradient-apply dispatches to train and evaluate the classifier. A second,
//! smaller export is checked against its analytic gradient.

pub mod autodiff;
pub mod backend;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod gpu;
pub mod inference;
pub mod layout;
pub mod metadata;
pub mod reference_kernels;
pub mod render;
pub mod runtime;
pub mod session;
pub mod shader_bundle;
pub mod training;

pub use autodiff::{AutodiffNames, GradientCheck};
pub use backend::{ComputeBackend, HostBackend};
pub use config::{ConfigLoader, RuntimeConfig};
pub use dataset::MnistSubset;
pub use gpu::WgpuBackend;
pub use inference::InferenceResult;
pub use layout::{FieldNames, KernelNames, KernelProgram, KernelRole};
pub use metadata::AotMetadata;
pub use reference_kernels::{AutodiffReference, ReferenceModel};
pub use runtime::KernelRuntime;
pub use session::{Hyperparameters, SessionEvent, TrainingSession};
pub use training::{TrainConfig, TrainingProgress, TrainingSummary};
