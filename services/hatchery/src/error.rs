//! Provisioning error taxonomy.
//!
//! Every backend failure is classified into a [`ProvisioningErrorKind`]. The
//! kind decides what the rest of the hatchery does with it:
//!
//! | Kind            | Governor          | Job                      |
//! |-----------------|-------------------|--------------------------|
//! | `Transient`     | counts to backoff | retried after a delay    |
//! | `Timeout`       | counts to backoff | retried after a delay    |
//! | `QuotaExceeded` | counts to backoff | retried after a delay    |
//! | `Auth`          | halts admissions  | left for other hatcheries|
//! | `NotFound`      | ignored           | n/a (kill: success)      |
//! | `Invalid`       | ignored           | retried after a delay    |

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Classification of a provisioning failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningErrorKind {
    /// Network failure or a 5xx from the backend.
    Transient,

    /// The per-operation deadline elapsed.
    Timeout,

    /// The backend refused for lack of capacity or quota.
    QuotaExceeded,

    /// Credentials rejected; the backend session is unusable.
    Auth,

    /// The resource does not exist.
    NotFound,

    /// The request itself was rejected (bad image, bad spec).
    Invalid,
}

impl ProvisioningErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Invalid => "invalid",
        }
    }

    /// Returns true if repeated failures of this kind should slow admissions.
    pub fn counts_toward_backoff(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout | Self::QuotaExceeded)
    }

    /// Returns true if the backend session cannot recover on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth)
    }
}

impl std::fmt::Display for ProvisioningErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified backend failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProvisioningError {
    pub kind: ProvisioningErrorKind,
    pub message: String,
}

impl ProvisioningError {
    pub fn new(kind: ProvisioningErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProvisioningErrorKind::Transient, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ProvisioningErrorKind::QuotaExceeded, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProvisioningErrorKind::Auth, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProvisioningErrorKind::NotFound, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ProvisioningErrorKind::Invalid, message)
    }

    /// The per-operation deadline elapsed.
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::new(
            ProvisioningErrorKind::Timeout,
            format!("{operation} did not complete within {after:?}"),
        )
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let kind = match status.as_u16() {
            401 | 403 => ProvisioningErrorKind::Auth,
            404 => ProvisioningErrorKind::NotFound,
            429 | 507 => ProvisioningErrorKind::QuotaExceeded,
            408 | 504 => ProvisioningErrorKind::Timeout,
            400..=499 => ProvisioningErrorKind::Invalid,
            _ => ProvisioningErrorKind::Transient,
        };
        Self::new(kind, format!("{status}: {body}"))
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProvisioningErrorKind::NotFound
    }
}

impl From<reqwest::Error> for ProvisioningError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::new(ProvisioningErrorKind::Timeout, err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(status, &err.to_string());
        }
        if err.is_decode() {
            return Self::invalid(err.to_string());
        }
        Self::transient(err.to_string())
    }
}
