//! Cron type system — schedule, payload, job state, and persistence.
//!
//! All types derive `Serialize`/`Deserialize` with `camelCase` keys for
//! JSON compatibility.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────
// CronSchedule
// ─────────────────────────────────────────────

/// Schedule variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// One-shot: fire at a specific timestamp.
    At,
    /// Interval: fire every N milliseconds.
    Every,
    /// Standard 5-field cron expression.
    Cron,
}

/// When a cron job fires.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub kind: ScheduleKind,
    /// One-shot timestamp (Unix epoch milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_ms: Option<i64>,
    /// Interval in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub every_ms: Option<i64>,
    /// Cron expression (e.g. `"0 9 * * *"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

impl CronSchedule {
    /// Create a one-shot schedule.
    pub fn at(at_ms: i64) -> Self {
        Self {
            kind: ScheduleKind::At,
            at_ms: Some(at_ms),
            every_ms: None,
            expr: None,
        }
    }

    /// Create an interval schedule.
    pub fn every(every_ms: i64) -> Self {
        Self {
            kind: ScheduleKind::Every,
            at_ms: None,
            every_ms: Some(every_ms),
            expr: None,
        }
    }

    /// Create a cron-expression schedule.
    pub fn cron(expr: impl Into<String>) -> Self {
        Self {
            kind: ScheduleKind::Cron,
            at_ms: None,
            every_ms: None,
            expr: Some(expr.into()),
        }
    }
}

// ─────────────────────────────────────────────
// CronPayload
// ─────────────────────────────────────────────

/// What a cron job does when it fires.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronPayload {
    /// Prompt text re-injected into the agent.
    #[serde(default)]
    pub message: String,
    /// Whether firing publishes a synthetic inbound message.
    #[serde(default)]
    pub deliver: bool,
    /// Origin channel name for reply routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Origin chat within the channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

// ─────────────────────────────────────────────
// CronJobState
// ─────────────────────────────────────────────

/// Run status of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Error,
}

/// Mutable state for a cron job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<JobStatus>,
}

// ─────────────────────────────────────────────
// CronJob
// ─────────────────────────────────────────────

/// A scheduled job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    /// Unique identifier (first 8 chars of a UUID v4).
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    #[serde(default)]
    pub state: CronJobState,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
    /// Remove the job after a single run. Always `true` for `at` jobs.
    #[serde(default)]
    pub delete_after_run: bool,
}

fn default_true() -> bool {
    true
}

impl CronJob {
    /// Create a new job with a generated ID.
    ///
    /// One-shot (`at`) schedules force `delete_after_run` so a fired timer
    /// never lingers in the store.
    pub fn new(name: impl Into<String>, schedule: CronSchedule, payload: CronPayload) -> Self {
        let now = Utc::now().timestamp_millis();
        let delete_after_run = schedule.kind == ScheduleKind::At;
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            name: name.into(),
            enabled: true,
            schedule,
            payload,
            state: CronJobState::default(),
            created_at_ms: now,
            updated_at_ms: now,
            delete_after_run,
        }
    }

    /// Whether this job is due to run (now >= next_run_at_ms).
    pub fn is_due(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.state.next_run_at_ms {
            Some(next) => Utc::now().timestamp_millis() >= next,
            None => false,
        }
    }
}

/// Compute the next run time from a given timestamp (for testability).
pub fn compute_next_run_from(schedule: &CronSchedule, now_ms: i64) -> Option<i64> {
    match schedule.kind {
        ScheduleKind::At => schedule.at_ms,
        ScheduleKind::Every => {
            let interval = schedule.every_ms.unwrap_or(60_000);
            Some(now_ms + interval)
        }
        ScheduleKind::Cron => {
            let expr = schedule.expr.as_deref()?;
            // The `cron` crate wants 6/7 fields; prepend seconds to a
            // standard 5-field expression.
            let normalized = if expr.split_whitespace().count() == 5 {
                format!("0 {expr}")
            } else {
                expr.to_string()
            };
            let parsed: cron::Schedule = normalized.parse().ok()?;
            let next = parsed.upcoming(Utc).next()?;
            Some(next.timestamp_millis())
        }
    }
}

// ─────────────────────────────────────────────
// CronStore
// ─────────────────────────────────────────────

/// Persistent store for cron jobs (JSON file).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStore {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

fn default_version() -> u32 {
    1
}

impl Default for CronStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CronStore {
    pub fn new() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&CronJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut CronJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn add(&mut self, job: CronJob) {
        self.jobs.push(job);
    }

    /// Remove a job by ID. Returns whether it was found.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.id != id);
        self.jobs.len() < before
    }

    /// All currently enabled jobs.
    pub fn active_jobs(&self) -> Vec<&CronJob> {
        self.jobs.iter().filter(|j| j.enabled).collect()
    }

    /// All due jobs.
    pub fn due_jobs(&self) -> Vec<&CronJob> {
        self.jobs.iter().filter(|j| j.is_due()).collect()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
