//! Worker lifecycle: states, the census and its transitions.

mod manager;
mod state;
pub mod token;

pub use manager::{
    LifecycleError, Listing, ReconcileReport, Registration, ReserveError, WorkerLifecycleManager,
};
pub use state::{Teardown, Timeouts, WorkerRecord, WorkerState, WorkerStatus, WorkerView};
