//! Background job runtime
//!
//! The scheduler only asks for jobs; when and how they fire is the runtime's
//! business. Fired jobs are delivered to a channel owned by the requester.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::connectivity::ConnectivityMonitor;

/// Channel receiving fired jobs
pub type JobSink = mpsc::UnboundedSender<FiredJob>;

/// Notification that a scheduled job is due
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredJob {
    pub key: String,
    pub fired_at: DateTime<Utc>,
}

/// Recurring job request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicJob {
    pub key: String,
    pub tag: String,
    pub interval: Duration,
    /// Hold the firing until the device is connected
    pub require_network: bool,
}

/// One-shot job request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimeJob {
    pub key: String,
    pub tag: String,
    pub delay: Duration,
    pub require_network: bool,
}

/// Durable timer source used by the scheduler
#[async_trait]
pub trait JobRuntime: Send + Sync {
    /// Schedule a recurring job, keeping an existing one with the same key
    ///
    /// Returns false when the request was dropped in favour of the existing job.
    async fn schedule_periodic(&self, job: PeriodicJob, sink: JobSink) -> bool;

    /// Schedule a one-shot job, replacing a not-yet-fired one with the same key
    async fn schedule_once(&self, job: OneTimeJob, sink: JobSink);

    /// Cancel every job carrying `tag`; returns the number cancelled
    async fn cancel_all_by_tag(&self, tag: &str) -> usize;
}

struct ScheduledJob {
    tag: String,
    handle: JoinHandle<()>,
}

/// In-process job runtime on tokio timers
///
/// Jobs live as long as the process. Intervals are used as given; the
/// 15 minute platform minimum is enforced by configuration validation.
pub struct TokioJobRuntime {
    monitor: Arc<ConnectivityMonitor>,
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

impl TokioJobRuntime {
    pub fn new(monitor: Arc<ConnectivityMonitor>) -> Self {
        Self {
            monitor,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Keys of jobs that have not finished
    pub async fn pending_keys(&self) -> Vec<String> {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|_, job| !job.handle.is_finished());
        let mut keys: Vec<String> = jobs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl JobRuntime for TokioJobRuntime {
    async fn schedule_periodic(&self, job: PeriodicJob, sink: JobSink) -> bool {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|_, scheduled| !scheduled.handle.is_finished());

        if jobs.contains_key(&job.key) {
            debug!(key = job.key, "Periodic job already scheduled, keeping existing");
            return false;
        }

        debug!(
            key = job.key,
            interval_secs = job.interval.as_secs(),
            require_network = job.require_network,
            "Scheduling periodic job"
        );

        let monitor = self.monitor.clone();
        let key = job.key.clone();
        let interval = job.interval;
        let require_network = job.require_network;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if require_network {
                    monitor.wait_until_connected().await;
                }
                let fired = FiredJob {
                    key: key.clone(),
                    fired_at: Utc::now(),
                };
                if sink.send(fired).is_err() {
                    debug!(key = key, "Job sink closed, stopping periodic job");
                    break;
                }
            }
        });

        jobs.insert(
            job.key,
            ScheduledJob {
                tag: job.tag,
                handle,
            },
        );
        true
    }

    async fn schedule_once(&self, job: OneTimeJob, sink: JobSink) {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|_, scheduled| !scheduled.handle.is_finished());

        if let Some(existing) = jobs.remove(&job.key) {
            debug!(key = job.key, "Replacing pending one-time job");
            existing.handle.abort();
        }

        let monitor = self.monitor.clone();
        let key = job.key.clone();
        let delay = job.delay;
        let require_network = job.require_network;

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if require_network {
                monitor.wait_until_connected().await;
            }
            let _ = sink.send(FiredJob {
                key,
                fired_at: Utc::now(),
            });
        });

        jobs.insert(
            job.key,
            ScheduledJob {
                tag: job.tag,
                handle,
            },
        );
    }

    async fn cancel_all_by_tag(&self, tag: &str) -> usize {
        let mut jobs = self.jobs.lock().await;
        let keys: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| job.tag == tag)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(job) = jobs.remove(key) {
                job.handle.abort();
            }
        }

        debug!(tag = tag, cancelled = keys.len(), "Cancelled jobs by tag");
        keys.len()
    }
}
