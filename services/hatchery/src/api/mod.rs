//! HTTP API: worker registration, heartbeats and health.

pub mod error;
mod health;
mod workers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::governor::ConcurrencyGovernor;
use crate::lifecycle::WorkerLifecycleManager;

pub use workers::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse};

/// State shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    hatchery: String,
    heartbeat_interval: Duration,
    manager: Arc<WorkerLifecycleManager>,
    governor: Arc<ConcurrencyGovernor>,
}

impl AppState {
    pub fn new(
        config: &Config,
        manager: Arc<WorkerLifecycleManager>,
        governor: Arc<ConcurrencyGovernor>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                hatchery: config.name.clone(),
                heartbeat_interval: config.limits.heartbeat_interval(),
                manager,
                governor,
            }),
        }
    }

    pub fn hatchery(&self) -> &str {
        &self.inner.hatchery
    }

    /// How often workers are told to heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        self.inner.heartbeat_interval
    }

    pub fn manager(&self) -> &WorkerLifecycleManager {
        &self.inner.manager
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.inner.governor
    }
}

/// Build the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1", workers::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::fixtures::model;

    /// Hatchery "ci" with one `linux` model and room for two workers.
    pub(crate) fn app_state() -> AppState {
        let mut config = Config::local("ci", vec![model("linux", &["linux"])]);
        config.limits.max_workers = 2;

        let manager = Arc::new(WorkerLifecycleManager::new(
            &config.name,
            config.mode,
            &config.limits,
        ));
        let governor = Arc::new(ConcurrencyGovernor::new(&config.limits));
        AppState::new(&config, manager, governor)
    }
}
