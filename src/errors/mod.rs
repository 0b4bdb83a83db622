//! Error types for the kernel runtime.
//!
//! Each concern gets its own enum so callers can match on precise variants,
//! avoiding generic error wrappers like `anyhow` or `Box<dyn Error>`.

mod bundle_error;
mod config_error;
mod dataset_error;
mod runtime_error;
mod session_error;

pub use bundle_error::BundleError;
pub use config_error::ConfigError;
pub use dataset_error::DatasetError;
pub use runtime_error::RuntimeError;
pub use session_error::SessionError;

/// Result type alias for runtime driver operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Result type alias for dataset loading and preparation.
pub type DatasetResult<T> = std::result::Result<T, DatasetError>;

/// Result type alias for shader bundling.
pub type BundleResult<T> = std::result::Result<T, BundleError>;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for background session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;
