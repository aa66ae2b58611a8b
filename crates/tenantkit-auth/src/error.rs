//! Error types.

use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The policy backing store could not be consulted.
    #[error("tenant policy unavailable: {0}")]
    PolicyUnavailable(String),

    /// No tenant is established on the current task.
    #[error("no tenant in scope")]
    MissingTenant,
}
