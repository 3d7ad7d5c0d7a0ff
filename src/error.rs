//! Error types for the recomputation engine.
//!
//! Application-level code (CLI, state files, configuration) uses `anyhow`;
//! the engine itself reports the few failures a caller can act on through
//! [`Error`].

use thiserror::Error;

/// Errors raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The template has unbalanced or invalid placeholder syntax.
    #[error("malformed template at byte {position}: {reason}")]
    MalformedTemplate { position: usize, reason: String },

    /// The parameter was never set nor referenced by a template.
    #[error("unknown parameter {0:?}")]
    UnknownParameter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
