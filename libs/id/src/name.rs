//! Backend-facing worker names.

use serde::{Deserialize, Serialize};

use crate::{IdError, Ulid, WorkerId};

/// Longest name accepted by every supported backend (one DNS label).
pub const MAX_WORKER_NAME_LEN: usize = 63;

const HATCHERY_PART_LEN: usize = 20;
const MODEL_PART_LEN: usize = 15;
const SUFFIX_LEN: usize = 26;

/// Name of a spawned worker as seen by the provisioning backend.
///
/// Format: `{hatchery}-{model}-{ulid}`, every part lowercased and reduced to
/// `[a-z0-9-]`. The hatchery and model parts are truncated so the whole name
/// fits in [`MAX_WORKER_NAME_LEN`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerName(String);

impl WorkerName {
    /// Builds the name for a new worker.
    #[must_use]
    pub fn generate(hatchery: &str, model: &str, id: WorkerId) -> Self {
        Self(format!("{}{}", Self::model_prefix(hatchery, model), id.suffix()))
    }

    /// Parses and validates an existing name.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_WORKER_NAME_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: MAX_WORKER_NAME_LEN,
            });
        }
        if let Some(found) = s
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(IdError::InvalidCharacter { found });
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the worker ID from the name suffix, if the name was
    /// produced by [`WorkerName::generate`].
    pub fn worker_id(&self) -> Option<WorkerId> {
        let start = self.0.len().checked_sub(SUFFIX_LEN)?;
        let suffix = self.0.get(start..)?;
        suffix
            .to_ascii_uppercase()
            .parse::<Ulid>()
            .ok()
            .map(WorkerId::from_ulid)
    }

    /// Prefix shared by every worker this hatchery spawns.
    pub fn namespace(hatchery: &str) -> String {
        format!("{}-", sanitize(hatchery, HATCHERY_PART_LEN, "hatchery"))
    }

    /// Returns true if this name was generated for `hatchery` and `model`.
    pub fn belongs_to(&self, hatchery: &str, model: &str) -> bool {
        let prefix = Self::model_prefix(hatchery, model);
        self.0.len() == prefix.len() + SUFFIX_LEN
            && self.0.starts_with(&prefix)
            && self.worker_id().is_some()
    }

    fn model_prefix(hatchery: &str, model: &str) -> String {
        format!(
            "{}{}-",
            Self::namespace(hatchery),
            sanitize(model, MODEL_PART_LEN, "model")
        )
    }
}

impl std::fmt::Display for WorkerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for WorkerName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WorkerName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WorkerName> for String {
    fn from(name: WorkerName) -> Self {
        name.0
    }
}

impl AsRef<str> for WorkerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercases, maps anything outside `[a-z0-9]` to `-`, collapses runs of
/// dashes and trims them from both ends.
fn sanitize(input: &str, max: usize, fallback: &str) -> String {
    let mut out = String::with_capacity(input.len().min(max));
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
        if out.len() >= max {
            break;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
