//! Main control loop.
//!
//! Each tick:
//!
//! 1. refresh the pending-job view
//! 2. decide which jobs get a worker (records are reserved synchronously)
//! 3. dispatch one task per spawn intent: claim, then spawn
//! 4. list the backend and reconcile the census against it
//! 5. dispatch one task per due kill, bounded by a semaphore
//! 6. wait at the tick boundary for the dispatched tasks
//!
//! Every backend and queue call carries the per-operation timeout, so the
//! wait in step 6 is bounded. Shutdown stops ticking, drains idle workers and
//! gives in-flight tasks until the grace deadline before aborting them.

use std::sync::Arc;
use std::time::Duration;

use hatchery_id::WorkerName;
use hatchery_reconcile::RetryVerdict;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendHandle, ProvisioningBackend, WorkerSpec};
use crate::config::Config;
use crate::decision::{SpawnDecisionEngine, SpawnIntent};
use crate::error::ProvisioningError;
use crate::governor::ConcurrencyGovernor;
use crate::lifecycle::{Listing, WorkerLifecycleManager};
use crate::model::{JobFilter, JobId};
use crate::queue::{ClaimOutcome, QueueError, QueuePoller, QueueService};

/// Timing of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlLoopConfig {
    pub tick_interval: Duration,
    pub operation_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrent_kills: usize,
}

impl ControlLoopConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick_interval: config.limits.tick_interval,
            operation_timeout: config.limits.operation_timeout,
            shutdown_grace: config.limits.shutdown_grace,
            max_concurrent_kills: config.limits.max_concurrent_kills.max(1),
        }
    }
}

/// What one tick dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub pending: usize,
    pub spawns: usize,
    pub skipped: usize,
    pub kills: usize,
    pub adopted: usize,
    pub vanished: usize,
    pub timed_out: usize,
    pub abandoned: usize,
    pub listed: bool,
}

impl TickSummary {
    /// Nothing was spawned, killed or changed state.
    pub fn is_idle(&self) -> bool {
        self.spawns == 0
            && self.kills == 0
            && self.adopted == 0
            && self.vanished == 0
            && self.timed_out == 0
            && self.abandoned == 0
    }
}

/// Shared by the spawn and kill tasks.
struct TaskContext {
    hatchery: String,
    api_url: String,
    operation_timeout: Duration,
    backend: Arc<dyn ProvisioningBackend>,
    queue: Arc<dyn QueueService>,
    manager: Arc<WorkerLifecycleManager>,
    governor: Arc<ConcurrencyGovernor>,
    engine: Arc<SpawnDecisionEngine>,
}

/// Top-level driver of the hatchery.
pub struct MainControlLoop {
    config: ControlLoopConfig,
    poller: QueuePoller,
    ctx: Arc<TaskContext>,
    kill_slots: Arc<Semaphore>,
    spawns: JoinSet<()>,
    kills: JoinSet<()>,
}

impl MainControlLoop {
    pub fn new(
        config: &Config,
        backend: Arc<dyn ProvisioningBackend>,
        queue: Arc<dyn QueueService>,
        manager: Arc<WorkerLifecycleManager>,
        governor: Arc<ConcurrencyGovernor>,
    ) -> Self {
        let loop_config = ControlLoopConfig::from_config(config);
        let engine = Arc::new(SpawnDecisionEngine::new(
            config.models.clone(),
            config.mode,
            Arc::clone(&manager),
            Arc::clone(&governor),
        ));
        let poller = QueuePoller::new(
            Arc::clone(&queue),
            JobFilter::for_models(&config.models),
            loop_config.operation_timeout,
        );

        Self {
            config: loop_config,
            poller,
            ctx: Arc::new(TaskContext {
                hatchery: config.name.clone(),
                api_url: config.public_url.clone(),
                operation_timeout: loop_config.operation_timeout,
                backend,
                queue,
                manager,
                governor,
                engine,
            }),
            kill_slots: Arc::new(Semaphore::new(loop_config.max_concurrent_kills)),
            spawns: JoinSet::new(),
            kills: JoinSet::new(),
        }
    }

    /// Run until `shutdown` turns true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            operation_timeout_secs = self.config.operation_timeout.as_secs(),
            backend = self.ctx.backend.name(),
            "Starting control loop"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = interval.tick() => {}
            }

            self.tick().await;

            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = self.join_in_flight() => {}
            }
        }

        self.shutdown().await;
    }

    /// Run one tick and dispatch its operations without waiting for them.
    #[instrument(skip_all, fields(hatchery = %self.ctx.hatchery))]
    pub async fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();

        let pending = self.poller.refresh().await;
        summary.pending = pending.len();

        let decision = self.ctx.engine.decide(pending, Instant::now());
        summary.spawns = decision.intents.len();
        summary.skipped = decision.skipped.len();
        for intent in decision.intents {
            self.spawns.spawn(spawn_worker(Arc::clone(&self.ctx), intent));
        }

        let listing = self.list().await;
        summary.listed = listing.is_some();

        let report = self.ctx.manager.reconcile(listing.as_ref(), Instant::now());
        summary.kills = report.kills.len();
        summary.adopted = report.adopted.len();
        summary.vanished = report.vanished.len();
        summary.timed_out = report.timed_out.len();
        summary.abandoned = report.abandoned.len();
        self.give_back(report.abandoned);
        self.dispatch_kills(report.kills);

        if !summary.is_idle() {
            info!(
                pending = summary.pending,
                spawns = summary.spawns,
                skipped = summary.skipped,
                kills = summary.kills,
                adopted = summary.adopted,
                vanished = summary.vanished,
                timed_out = summary.timed_out,
                abandoned = summary.abandoned,
                live = self.ctx.manager.live_count(),
                "Tick dispatched"
            );
        } else {
            debug!(pending = summary.pending, "Tick idle");
        }
        summary
    }

    async fn list(&self) -> Option<Listing> {
        let listed_at = Instant::now();
        let result = match timeout(self.config.operation_timeout, self.ctx.backend.list()).await {
            Ok(result) => result,
            Err(_) => Err(ProvisioningError::timeout("list", self.config.operation_timeout)),
        };

        match result {
            Ok(handles) => Some(Listing { handles, listed_at }),
            Err(err) => {
                self.ctx.governor.record_failure(&err, Instant::now());
                warn!(
                    component = "control_loop",
                    kind = %err.kind,
                    error = %err.message,
                    "Backend listing failed; skipping reconciliation against it"
                );
                None
            }
        }
    }

    /// Hand jobs back to the queue after their worker never registered. The
    /// job is retried once its spawn-failure delay has passed.
    fn give_back(&mut self, abandoned: Vec<(WorkerName, JobId)>) {
        let now = Instant::now();
        for (worker, job_id) in abandoned {
            let retry = self.ctx.engine.record_spawn_failure(&job_id, now);
            warn!(
                component = "control_loop",
                kind = "registration_timeout",
                worker = %worker,
                job_id = %job_id,
                retry = ?retry,
                "Worker never registered; releasing its job"
            );
            let ctx = Arc::clone(&self.ctx);
            self.spawns.spawn(async move {
                release_claim(&ctx, &job_id, &worker).await;
            });
        }
    }

    fn dispatch_kills(&mut self, handles: Vec<BackendHandle>) {
        for handle in handles {
            self.kills.spawn(kill_worker(
                Arc::clone(&self.ctx),
                Arc::clone(&self.kill_slots),
                handle,
            ));
        }
    }

    /// Wait for every dispatched spawn and kill task.
    pub async fn join_in_flight(&mut self) {
        while let Some(result) = self.spawns.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Spawn task panicked");
                }
            }
        }
        while let Some(result) = self.kills.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Kill task panicked");
                }
            }
        }
    }

    /// Operations still running.
    pub fn in_flight(&self) -> usize {
        self.spawns.len() + self.kills.len()
    }

    async fn shutdown(mut self) {
        let now = Instant::now();
        let deadline = now + self.config.shutdown_grace;

        let drained = self.ctx.manager.drain_idle(now);
        let report = self.ctx.manager.reconcile(None, now);
        info!(
            drained,
            kills = report.kills.len(),
            in_flight = self.in_flight(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Control loop shutting down"
        );
        self.give_back(report.abandoned);
        self.dispatch_kills(report.kills);

        if tokio::time::timeout_at(deadline, self.join_in_flight()).await.is_err() {
            warn!(
                abandoned = self.in_flight(),
                "Grace period elapsed; abandoning in-flight operations"
            );
            self.spawns.abort_all();
            self.kills.abort_all();
            while self.spawns.join_next().await.is_some() {}
            while self.kills.join_next().await.is_some() {}
        }

        info!(live = self.ctx.manager.live_count(), "Control loop stopped");
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn spawn_worker(ctx: Arc<TaskContext>, intent: SpawnIntent) {
    let SpawnIntent {
        worker_name,
        model,
        job,
        permit,
    } = intent;
    let job_id = job.as_ref().map(|j| j.id.clone());
    let op_timeout = ctx.operation_timeout;

    if let Some(job_id) = &job_id {
        let outcome = match timeout(op_timeout, ctx.queue.acknowledge_claim(job_id, &worker_name)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(op_timeout)),
        };
        match outcome {
            Ok(ClaimOutcome::Acknowledged) => {}
            Ok(ClaimOutcome::Conflict) => {
                debug!(worker = %worker_name, job_id = %job_id, "Claim lost to another hatchery");
                ctx.manager.release(&worker_name);
                return;
            }
            Err(e) => {
                warn!(worker = %worker_name, job_id = %job_id, error = %e, "Claim acknowledgement failed");
                ctx.manager.release(&worker_name);
                return;
            }
        }
    }

    let spec = WorkerSpec {
        name: worker_name.clone(),
        hatchery: ctx.hatchery.clone(),
        model,
        job: job_id.clone(),
        api_url: ctx.api_url.clone(),
    };

    let result = match timeout(op_timeout, ctx.backend.spawn(&spec)).await {
        Ok(result) => result,
        Err(_) => Err(ProvisioningError::timeout("spawn", op_timeout)),
    };
    drop(permit);
    let now = Instant::now();

    match result {
        Ok(handle) => {
            ctx.governor.record_success();
            if let Some(job_id) = &job_id {
                ctx.engine.record_spawn_success(job_id);
            }
            if ctx.manager.attach_handle(&worker_name, handle.clone(), now).is_err() {
                warn!(worker = %worker_name, "Spawned worker is no longer tracked; killing it");
                if let Ok(Err(e)) = timeout(op_timeout, ctx.backend.kill(&handle)).await {
                    warn!(worker = %worker_name, error = %e, "Kill of untracked worker failed");
                }
            }
        }
        Err(err) => {
            ctx.governor.record_failure(&err, now);
            ctx.manager.mark_spawn_failed(&worker_name, &err.to_string(), now);

            let retry = job_id
                .as_ref()
                .map(|job_id| ctx.engine.record_spawn_failure(job_id, now));
            warn!(
                component = "control_loop",
                kind = %err.kind,
                worker = %worker_name,
                job_id = ?job_id,
                retry = ?retry,
                error = %err.message,
                "Spawn failed"
            );

            if let Some(job_id) = &job_id {
                release_claim(&ctx, job_id, &worker_name).await;
            }
        }
    }
}

/// Best effort: a claim left behind expires on the queue side.
async fn release_claim(ctx: &TaskContext, job_id: &JobId, worker: &WorkerName) {
    match timeout(ctx.operation_timeout, ctx.queue.release_claim(job_id, worker)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(job_id = %job_id, error = %e, "Claim release failed"),
        Err(_) => debug!(job_id = %job_id, "Claim release timed out"),
    }
}

async fn kill_worker(ctx: Arc<TaskContext>, slots: Arc<Semaphore>, handle: BackendHandle) {
    let Ok(_slot) = slots.acquire_owned().await else {
        return;
    };

    let op_timeout = ctx.operation_timeout;
    let result = match timeout(op_timeout, ctx.backend.kill(&handle)).await {
        Ok(result) => result,
        Err(_) => Err(ProvisioningError::timeout("kill", op_timeout)),
    };
    let now = Instant::now();

    match result {
        Ok(()) => {
            ctx.manager.kill_confirmed(&handle.name, now);
        }
        Err(err) if err.is_not_found() => {
            ctx.manager.kill_confirmed(&handle.name, now);
        }
        Err(err) => {
            ctx.governor.record_failure(&err, now);
            match ctx.manager.kill_failed(&handle.name, &err.to_string(), now) {
                Some(RetryVerdict::RetryAfter(delay)) => warn!(
                    component = "control_loop",
                    kind = %err.kind,
                    worker = %handle.name,
                    ?delay,
                    error = %err.message,
                    "Kill failed; will retry"
                ),
                Some(RetryVerdict::Exhausted { .. }) | None => {}
            }
        }
    }
}
