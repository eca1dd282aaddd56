//! # hatchery-id
//!
//! Typed identifiers and worker naming for the hatchery.
//!
//! ## ID Format
//!
//! Process-level identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! - `hat_01HV4Z2WQXKJNM8GPQY6VBKC3D` (one hatchery process)
//! - `wkr_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (one spawned worker)
//!
//! ## Worker Names
//!
//! Worker names are what backends see. They are DNS-label safe
//! (`[a-z0-9-]`, at most 63 characters) and end with the lowercase ULID of
//! the worker's [`WorkerId`]:
//!
//! ```text
//! ci-east-linux-large-01hv4z3mxnkpqr9hstz7wcld4e
//! ```
//!
//! The ULID suffix keeps names unique for the lifetime of a process and
//! across restarts that share a backend namespace.

mod error;
mod macros;
mod name;
mod types;

pub use error::IdError;
pub use name::{WorkerName, MAX_WORKER_NAME_LEN};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
