use thiserror::Error;

use super::RuntimeError;

/// Errors reported by the background session controller.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A run is already in progress")]
    Busy,

    #[error("Runtime lock was poisoned by a panicked worker")]
    Poisoned,

    #[error("Worker thread panicked during execution")]
    ThreadPanicked,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
