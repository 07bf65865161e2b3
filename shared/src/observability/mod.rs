//! Logging setup shared by the sandbox services

pub mod logging;

pub use logging::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("Invalid logging option: {0}")]
    InvalidOption(String),
}

pub type ObservabilityResult<T> = Result<T, ObservabilityError>;
