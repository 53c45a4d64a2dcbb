//! Cron scheduling: persistent job store plus an async timer service that
//! re-enters the agent through the message bus.

pub mod service;
pub mod types;

pub use service::CronService;
pub use types::{CronJob, CronPayload, CronSchedule, ScheduleKind};
