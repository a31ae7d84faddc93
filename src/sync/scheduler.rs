//! Sync scheduler
//!
//! Decides when a pass runs. Three lanes feed the coordinator:
//!
//! - reactive: a disconnected to connected transition
//! - periodic: a recurring backstop job, pushed out after failed passes
//! - manual: explicit requests, latest wins while not yet started
//!
//! All schedule state lives in [`SchedulerState`], handed in at construction
//! and handed back when the scheduler stops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::connectivity::{ConnectivityMonitor, ConnectivitySubscription};
use super::coordinator::SyncCoordinator;
use super::runtime::{FiredJob, JobRuntime, OneTimeJob, PeriodicJob};
use crate::config::SchedulerSettings;
use crate::error::SyncError;
use crate::models::SyncPassResult;

/// Tag carried by the periodic job
pub const PERIODIC_JOB_TAG: &str = "clinic-sync-periodic";
/// Tag carried by manual jobs
pub const MANUAL_JOB_TAG: &str = "clinic-sync-manual";
/// Unique key of the periodic job
pub const PERIODIC_JOB_KEY: &str = "clinic-sync-periodic";
/// Unique key of the pending manual job
pub const MANUAL_JOB_KEY: &str = "clinic-sync-manual";

/// State of one scheduling lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneState {
    #[default]
    Idle,
    Scheduled,
    Running,
    BackoffWait,
}

/// Scheduling lane that requested a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Reactive,
    Periodic,
    Manual,
}

/// Everything the scheduler knows between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    pub reactive: LaneState,
    pub periodic: LaneState,
    pub manual: LaneState,
    /// Passes in a row that reported failures
    pub consecutive_failures: u32,
    /// Interval the periodic job currently runs at; zero until first scheduled
    pub periodic_delay: Duration,
    pub last_result: Option<SyncPassResult>,
    pub last_pass_at: Option<DateTime<Utc>>,
    /// Pass requests issued across all lanes; requests the coordinator
    /// merges into one pass are each counted
    pub pass_requests: u64,
    /// Distinct passes whose results were recorded
    pub passes_completed: u64,
}

impl SchedulerState {
    /// Read a state saved by [`SchedulerState::save`]; a missing file is a fresh state
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(SyncError::StatePersistence(e.to_string())),
        };
        serde_json::from_str(&content).map_err(|e| SyncError::StatePersistence(e.to_string()))
    }

    /// Write the state as JSON, replacing the file atomically
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::StatePersistence(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| SyncError::StatePersistence(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| SyncError::StatePersistence(e.to_string()))
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneState {
        match lane {
            Lane::Reactive => &mut self.reactive,
            Lane::Periodic => &mut self.periodic,
            Lane::Manual => &mut self.manual,
        }
    }
}

/// Drives the coordinator from connectivity, timer and manual triggers
pub struct SyncScheduler {
    coordinator: Arc<SyncCoordinator>,
    runtime: Arc<dyn JobRuntime>,
    settings: SchedulerSettings,
    policy: BackoffPolicy,
    state: SchedulerState,
    published: Arc<RwLock<SchedulerState>>,
    connectivity: ConnectivitySubscription,
    shutdown_rx: broadcast::Receiver<()>,
    manual_rx: mpsc::Receiver<()>,
    manual_tx: mpsc::Sender<()>,
    /// Sequence number of the last pass result folded into the state
    last_recorded_pass: u64,
}

impl SyncScheduler {
    /// Create a scheduler
    ///
    /// The connectivity subscription is taken here, so transitions reported
    /// after construction are never missed.
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        runtime: Arc<dyn JobRuntime>,
        monitor: &ConnectivityMonitor,
        settings: SchedulerSettings,
        state: SchedulerState,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (manual_tx, manual_rx) = mpsc::channel(1);
        let policy = BackoffPolicy::from_settings(&settings);

        Self {
            coordinator,
            runtime,
            settings,
            policy,
            published: Arc::new(RwLock::new(state.clone())),
            state,
            connectivity: monitor.subscribe(),
            shutdown_rx,
            manual_rx,
            manual_tx,
            last_recorded_pass: 0,
        }
    }

    /// Replace the backoff policy derived from the settings
    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Handle for manual triggers and state snapshots
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            manual_tx: self.manual_tx.clone(),
            state: self.published.clone(),
        }
    }

    /// Run until shutdown, then return the final state
    ///
    /// On shutdown, scheduled jobs are cancelled and the connectivity
    /// subscription is dropped; passes already running are awaited.
    pub async fn run(mut self) -> SchedulerState {
        info!(
            interval_secs = self.policy.base().as_secs(),
            require_network = self.settings.require_network,
            "Starting sync scheduler"
        );

        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<FiredJob>();
        let mut passes: JoinSet<(Lane, Result<SyncPassResult, SyncError>)> = JoinSet::new();

        let delay = self.policy.delay_for(self.state.consecutive_failures);
        self.schedule_periodic(delay, &job_tx).await;
        self.publish().await;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping sync scheduler");
                    break;
                }
                transition = self.connectivity.next() => {
                    match transition {
                        Some(t) if t.is_reconnect() => {
                            info!(transport = %t.current.transport, "Reconnected, starting sync pass");
                            self.start_pass(Lane::Reactive, &mut passes);
                        }
                        Some(t) => {
                            debug!(connected = t.current.connected, "Connectivity change ignored");
                        }
                        None => {
                            warn!("Connectivity stream ended, stopping sync scheduler");
                            break;
                        }
                    }
                }
                Some(job) = job_rx.recv() => {
                    match job.key.as_str() {
                        PERIODIC_JOB_KEY => {
                            debug!(fired_at = %job.fired_at, "Periodic sync job fired");
                            self.start_pass(Lane::Periodic, &mut passes);
                        }
                        MANUAL_JOB_KEY => {
                            info!("Manual sync job fired");
                            self.start_pass(Lane::Manual, &mut passes);
                        }
                        other => warn!(key = other, "Unknown job fired"),
                    }
                }
                Some(()) = self.manual_rx.recv() => {
                    self.schedule_manual(&job_tx).await;
                }
                Some(joined) = passes.join_next(), if !passes.is_empty() => {
                    self.record_pass(joined, Some(&job_tx)).await;
                }
            }
            self.publish().await;
        }

        self.stop(passes).await
    }

    async fn stop(
        mut self,
        mut passes: JoinSet<(Lane, Result<SyncPassResult, SyncError>)>,
    ) -> SchedulerState {
        let cancelled = self.runtime.cancel_all_by_tag(PERIODIC_JOB_TAG).await
            + self.runtime.cancel_all_by_tag(MANUAL_JOB_TAG).await;
        debug!(cancelled = cancelled, "Cancelled scheduled sync jobs");

        self.state.periodic = LaneState::Idle;
        if self.state.manual == LaneState::Scheduled {
            self.state.manual = LaneState::Idle;
        }

        // In-flight passes still report, but nothing is rescheduled
        while let Some(joined) = passes.join_next().await {
            self.record_pass(joined, None).await;
        }
        self.state.periodic = LaneState::Idle;
        self.publish().await;

        info!(
            consecutive_failures = self.state.consecutive_failures,
            "Sync scheduler stopped"
        );
        self.state
    }

    fn start_pass(
        &mut self,
        lane: Lane,
        passes: &mut JoinSet<(Lane, Result<SyncPassResult, SyncError>)>,
    ) {
        *self.state.lane_mut(lane) = LaneState::Running;
        self.state.pass_requests += 1;

        let coordinator = self.coordinator.clone();
        passes.spawn(async move { (lane, coordinator.run_pass().await) });
    }

    async fn schedule_periodic(
        &mut self,
        interval: Duration,
        job_tx: &mpsc::UnboundedSender<FiredJob>,
    ) {
        let job = PeriodicJob {
            key: PERIODIC_JOB_KEY.to_string(),
            tag: PERIODIC_JOB_TAG.to_string(),
            interval,
            require_network: self.settings.require_network,
        };
        if !self.runtime.schedule_periodic(job, job_tx.clone()).await {
            debug!("Existing periodic sync job kept");
        }
        self.state.periodic_delay = interval;
        self.state.periodic = self.periodic_waiting_state();
    }

    async fn schedule_manual(&mut self, job_tx: &mpsc::UnboundedSender<FiredJob>) {
        let job = OneTimeJob {
            key: MANUAL_JOB_KEY.to_string(),
            tag: MANUAL_JOB_TAG.to_string(),
            delay: Duration::from_millis(self.settings.manual_debounce_ms),
            require_network: self.settings.require_network,
        };
        self.runtime.schedule_once(job, job_tx.clone()).await;
        if self.state.manual != LaneState::Running {
            self.state.manual = LaneState::Scheduled;
        }
        debug!("Manual sync scheduled");
    }

    async fn record_pass(
        &mut self,
        joined: Result<(Lane, Result<SyncPassResult, SyncError>), JoinError>,
        job_tx: Option<&mpsc::UnboundedSender<FiredJob>>,
    ) {
        let (lane, outcome) = match joined {
            Ok(done) => done,
            Err(err) => {
                warn!(error = %err, "Sync pass task failed");
                // The lane of a failed task is unknown
                for lane in [Lane::Reactive, Lane::Periodic, Lane::Manual] {
                    self.finish_lane(lane);
                }
                self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
                return;
            }
        };

        self.finish_lane(lane);

        let failed = match &outcome {
            Ok(result) if result.pass != 0 && result.pass <= self.last_recorded_pass => {
                debug!(lane = ?lane, pass = result.pass, "Shared pass result already recorded");
                return;
            }
            Ok(result) => {
                self.last_recorded_pass = result.pass;
                self.state.passes_completed += 1;
                self.state.last_pass_at = Some(result.finished_at);
                self.state.last_result = Some(result.clone());
                result.has_failures()
            }
            Err(err) => {
                warn!(lane = ?lane, error = %err, "Sync pass did not complete");
                true
            }
        };

        self.state.consecutive_failures = if failed {
            self.state.consecutive_failures.saturating_add(1)
        } else {
            0
        };

        let Some(job_tx) = job_tx else {
            return;
        };

        let delay = self.policy.delay_for(self.state.consecutive_failures);
        if delay != self.state.periodic_delay {
            info!(
                consecutive_failures = self.state.consecutive_failures,
                delay_secs = delay.as_secs(),
                "Rescheduling periodic sync"
            );
            self.runtime.cancel_all_by_tag(PERIODIC_JOB_TAG).await;
            self.schedule_periodic(delay, job_tx).await;
        }
    }

    /// Leave the running state; the periodic lane goes back to waiting on its job
    fn finish_lane(&mut self, lane: Lane) {
        let waiting = self.periodic_waiting_state();
        let lane_state = self.state.lane_mut(lane);
        if *lane_state == LaneState::Running {
            *lane_state = match lane {
                Lane::Periodic => waiting,
                Lane::Reactive | Lane::Manual => LaneState::Idle,
            };
        }
    }

    fn periodic_waiting_state(&self) -> LaneState {
        if self.state.periodic_delay > self.policy.base() {
            LaneState::BackoffWait
        } else {
            LaneState::Scheduled
        }
    }

    async fn publish(&self) {
        *self.published.write().await = self.state.clone();
    }
}

/// Handle for triggering manual syncs and reading scheduler state
#[derive(Clone)]
pub struct SchedulerHandle {
    manual_tx: mpsc::Sender<()>,
    state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Request a manual sync
    ///
    /// Requests that arrive before the scheduler picks up the previous one
    /// collapse into it.
    pub fn trigger_manual_sync(&self) -> Result<(), SyncError> {
        match self.manual_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SyncError::SchedulerStopped),
        }
    }

    /// Snapshot of the scheduler state
    pub async fn state(&self) -> SchedulerState {
        self.state.read().await.clone()
    }
}
