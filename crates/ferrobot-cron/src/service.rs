//! Cron service — async scheduler with job persistence.
//!
//! Jobs live in `~/.ferrobot/cron/jobs.json`. The timer sleeps until the
//! nearest `next_run_at_ms`, then fires every due job. A fired job with
//! `deliver=true` re-enters the agent through the bus as a synthetic
//! `system` inbound message (marked internal), so cron is just another
//! producer from the loop's point of view.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use ferrobot_core::bus::queue::MessageBus;
use ferrobot_core::bus::types::InboundMessage;

use crate::types::{compute_next_run_from, CronJob, CronPayload, CronSchedule, CronStore, JobStatus};

/// Most jobs a single bot may keep scheduled (enabled) at once.
pub const MAX_ACTIVE_JOBS: usize = 10;

/// Cron scheduler — manages jobs, persistence, and timed execution.
pub struct CronService {
    store_path: PathBuf,
    store: Arc<Mutex<CronStore>>,
    bus: Arc<MessageBus>,
    shutdown: Arc<Notify>,
    /// Wakes the timer when jobs are added/removed/toggled.
    rearm: Arc<Notify>,
}

impl CronService {
    /// Create a new cron service.
    ///
    /// If `store_path` is `None`, defaults to `~/.ferrobot/cron/jobs.json`.
    pub fn new(bus: Arc<MessageBus>, store_path: Option<PathBuf>) -> Self {
        let path = store_path.unwrap_or_else(|| {
            ferrobot_core::utils::get_data_path()
                .join("cron")
                .join("jobs.json")
        });

        Self {
            store_path: path,
            store: Arc::new(Mutex::new(CronStore::new())),
            bus,
            shutdown: Arc::new(Notify::new()),
            rearm: Arc::new(Notify::new()),
        }
    }

    // ─────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────

    /// Load the store from disk.
    pub async fn load(&self) -> anyhow::Result<()> {
        if !self.store_path.exists() {
            debug!(path = %self.store_path.display(), "no cron store file, starting empty");
            return Ok(());
        }

        let data = tokio::fs::read_to_string(&self.store_path).await?;
        let loaded: CronStore = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("failed to parse cron store: {}", e))?;

        let mut store = self.store.lock().await;
        *store = loaded;
        info!(
            path = %self.store_path.display(),
            jobs = store.jobs.len(),
            "loaded cron store"
        );
        Ok(())
    }

    /// Save the store to disk.
    pub async fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.store_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let store = self.store.lock().await;
        let json = serde_json::to_string_pretty(&*store)?;
        tokio::fs::write(&self.store_path, json).await?;
        Ok(())
    }

    // ─────────────────────────────────────────
    // Job management
    // ─────────────────────────────────────────

    /// Add a job. Computes the first run time and saves.
    ///
    /// Rejects the add when [`MAX_ACTIVE_JOBS`] are already scheduled.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_job(
        &self,
        name: &str,
        schedule: CronSchedule,
        message: &str,
        deliver: bool,
        channel: Option<String>,
        to: Option<String>,
        delete_after_run: bool,
    ) -> anyhow::Result<CronJob> {
        let payload = CronPayload {
            message: message.to_string(),
            deliver,
            channel,
            to,
        };

        let mut job = CronJob::new(name, schedule, payload);
        job.delete_after_run = job.delete_after_run || delete_after_run;

        let now_ms = Utc::now().timestamp_millis();
        job.state.next_run_at_ms = compute_next_run_from(&job.schedule, now_ms);

        {
            let mut store = self.store.lock().await;
            if store.jobs.len() >= MAX_ACTIVE_JOBS {
                anyhow::bail!(
                    "maximum of {MAX_ACTIVE_JOBS} scheduled jobs reached; remove old jobs first"
                );
            }
            store.add(job.clone());
        }
        self.save().await?;
        self.rearm.notify_one();
        info!(id = %job.id, name = %job.name, "added cron job");
        Ok(job)
    }

    /// Remove a job by ID.
    pub async fn remove_job(&self, id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut store = self.store.lock().await;
            store.remove(id)
        };
        if removed {
            self.save().await?;
            self.rearm.notify_one();
            info!(id = %id, "removed cron job");
        }
        Ok(removed)
    }

    /// List jobs (snapshot). `include_disabled=false` filters paused jobs.
    pub async fn list_jobs(&self, include_disabled: bool) -> Vec<CronJob> {
        let store = self.store.lock().await;
        store
            .jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    /// Get a single job by ID.
    pub async fn get_job(&self, id: &str) -> Option<CronJob> {
        let store = self.store.lock().await;
        store.find(id).cloned()
    }

    // ─────────────────────────────────────────
    // Timer loop
    // ─────────────────────────────────────────

    /// Start the scheduler loop.
    ///
    /// Loads the store, then repeatedly:
    /// 1. Find the nearest `next_run_at_ms`
    /// 2. Sleep until then (or a shutdown/rearm signal)
    /// 3. Fire all due jobs
    pub async fn start(&self) -> anyhow::Result<()> {
        if let Err(e) = self.load().await {
            warn!(error = %e, "failed to load cron store, starting empty");
        }

        info!("cron service started");

        loop {
            let sleep_ms = {
                let store = self.store.lock().await;
                Self::next_wake_ms(&store)
            };

            let sleep_duration = if let Some(ms) = sleep_ms {
                let delay = (ms - Utc::now().timestamp_millis()).max(0) as u64;
                std::time::Duration::from_millis(delay)
            } else {
                // No scheduled jobs — rearm will wake us.
                std::time::Duration::from_secs(3600)
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.fire_due_jobs().await;
                }
                _ = self.rearm.notified() => {
                    debug!("cron timer re-armed");
                }
                _ = self.shutdown.notified() => {
                    info!("cron service shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Stop the scheduler.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    fn next_wake_ms(store: &CronStore) -> Option<i64> {
        store
            .jobs
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.state.next_run_at_ms)
            .min()
    }

    /// Fire all due jobs.
    pub async fn fire_due_jobs(&self) {
        let due_ids: Vec<String> = {
            let store = self.store.lock().await;
            store.due_jobs().iter().map(|j| j.id.clone()).collect()
        };

        for id in &due_ids {
            self.fire_job(id).await;
        }
    }

    /// Fire a single job by ID.
    ///
    /// Delivery publishes a synthetic inbound message:
    /// `{channel: "system", sender_id: "cron", chat_id: "{channel}:{to}",
    ///   content: message, metadata: {internal: true}}`.
    pub async fn fire_job(&self, id: &str) {
        let job = {
            let store = self.store.lock().await;
            store.find(id).cloned()
        };

        let job = match job {
            Some(j) => j,
            None => {
                warn!(id = %id, "cron job not found for firing");
                return;
            }
        };

        info!(id = %job.id, name = %job.name, "cron job fired");

        let mut status = JobStatus::Ok;
        if job.payload.deliver {
            if let (Some(channel), Some(to)) = (job.payload.channel.as_ref(), job.payload.to.as_ref()) {
                let mut msg = InboundMessage::new(
                    "system",
                    "cron",
                    format!("{channel}:{to}"),
                    &job.payload.message,
                );
                msg.metadata.insert("internal".into(), json!(true));
                msg.metadata
                    .insert("session_key_override".into(), json!(format!("{channel}:{to}")));

                if let Err(e) = self.bus.publish_inbound(msg).await {
                    error!(id = %id, error = %e, "failed to publish cron message");
                    status = JobStatus::Error;
                }
            } else {
                warn!(id = %id, "cron job has deliver=true but no channel/to");
            }
        }

        // Update job state, reschedule or retire.
        let now_ms = Utc::now().timestamp_millis();
        let mut should_delete = false;

        {
            let mut store = self.store.lock().await;
            if let Some(j) = store.find_mut(id) {
                j.state.last_run_at_ms = Some(now_ms);
                j.state.last_status = Some(status);

                if j.delete_after_run {
                    should_delete = true;
                } else {
                    j.state.next_run_at_ms = compute_next_run_from(&j.schedule, now_ms);
                }
                j.updated_at_ms = now_ms;
            }

            if should_delete {
                store.remove(id);
            }
        }

        if let Err(e) = self.save().await {
            error!(error = %e, "failed to save cron store after firing");
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
