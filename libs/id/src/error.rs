//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing identifiers or worker names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A worker name contains a character backends reject.
    #[error("invalid character {found:?} in worker name")]
    InvalidCharacter { found: char },

    /// A worker name is longer than a DNS label.
    #[error("worker name is {len} characters, limit is {max}")]
    TooLong { len: usize, max: usize },
}

impl IdError {
    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. } | IdError::MissingSeparator)
    }
}
