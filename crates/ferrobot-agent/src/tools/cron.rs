//! Cron tool — schedule reminders and recurring tasks from the LM.
//!
//! A fired job re-enters the agent as a synthetic system message routed to
//! the conversation that scheduled it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use ferrobot_core::tool::{optional_i64, optional_string, require_string, Tool};
use ferrobot_cron::{CronSchedule, CronService, ScheduleKind};

/// Tool to schedule reminders and recurring tasks.
pub struct CronTool {
    cron: Arc<CronService>,
    /// Current origin (channel, chat_id) — written by the loop per turn.
    context: Mutex<(String, String)>,
}

impl CronTool {
    pub fn new(cron: Arc<CronService>) -> Self {
        Self {
            cron,
            context: Mutex::new((String::new(), String::new())),
        }
    }

    /// Set the current session context for delivery.
    pub async fn set_context(&self, channel: &str, chat_id: &str) {
        let mut ctx = self.context.lock().await;
        *ctx = (channel.to_string(), chat_id.to_string());
    }

    async fn add_job(
        &self,
        message: &str,
        in_seconds: Option<i64>,
        every_seconds: Option<i64>,
        cron_expr: Option<String>,
    ) -> anyhow::Result<String> {
        if message.is_empty() {
            anyhow::bail!("message is required for add");
        }

        let (channel, chat_id) = {
            let ctx = self.context.lock().await;
            ctx.clone()
        };
        if channel.is_empty() || chat_id.is_empty() {
            anyhow::bail!("no session context (channel/chat_id)");
        }

        let (schedule, delete_after) = if let Some(secs) = in_seconds {
            // One-shot timer: fire once after N seconds, then auto-delete.
            let at_ms = Utc::now().timestamp_millis() + secs * 1000;
            (CronSchedule::at(at_ms), true)
        } else if let Some(secs) = every_seconds {
            (CronSchedule::every(secs * 1000), false)
        } else if let Some(expr) = cron_expr {
            (CronSchedule::cron(expr), false)
        } else {
            anyhow::bail!("one of in_seconds, every_seconds, or cron_expr is required");
        };

        let name: String = message.chars().take(40).collect();
        let job = self
            .cron
            .add_job(
                &name,
                schedule,
                message,
                true,
                Some(channel),
                Some(chat_id),
                delete_after,
            )
            .await?;

        if let Some(secs) = in_seconds {
            let mins = secs / 60;
            let rem = secs % 60;
            let time_str = if mins > 0 {
                format!("{mins}m {rem}s")
            } else {
                format!("{rem}s")
            };
            Ok(format!(
                "Timer set! Job '{}' (id: {}) will fire in {time_str}. \
                 I will execute the task and send you the result automatically.",
                job.name, job.id
            ))
        } else if let Some(secs) = every_seconds {
            Ok(format!(
                "Recurring job '{}' (id: {}) - runs every {secs}s",
                job.name, job.id
            ))
        } else {
            Ok(format!(
                "Scheduled job '{}' (id: {}) - cron: {}",
                job.name,
                job.id,
                job.schedule.expr.as_deref().unwrap_or("")
            ))
        }
    }

    async fn list_jobs(&self) -> String {
        let jobs = self.cron.list_jobs(false).await;
        if jobs.is_empty() {
            return "No scheduled jobs.".into();
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut lines = Vec::new();
        for j in jobs {
            let sched_info = match j.schedule.kind {
                ScheduleKind::At => match j.state.next_run_at_ms {
                    Some(next) => {
                        let remaining_s = ((next - now_ms) / 1000).max(0);
                        format!("fires in {remaining_s}s (one-shot)")
                    }
                    None => "one-shot (done)".to_string(),
                },
                ScheduleKind::Every => {
                    format!("every {}s", j.schedule.every_ms.unwrap_or(0) / 1000)
                }
                ScheduleKind::Cron => {
                    format!("cron: {}", j.schedule.expr.as_deref().unwrap_or(""))
                }
            };
            lines.push(format!("- {} (id: {}, {})", j.name, j.id, sched_info));
        }

        format!("Scheduled jobs:\n{}", lines.join("\n"))
    }

    async fn remove_job(&self, job_id: Option<String>) -> anyhow::Result<String> {
        let id = job_id.ok_or_else(|| anyhow::anyhow!("job_id is required for remove"))?;
        if self.cron.remove_job(&id).await? {
            Ok(format!("Removed job {id}"))
        } else {
            Ok(format!("Job {id} not found"))
        }
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Schedule tasks, reminders, and timers. \
         Use 'in_seconds' for one-shot delayed tasks (e.g. 'do X in 2 minutes' -> in_seconds=120). \
         Use 'every_seconds' for recurring tasks (e.g. 'check X every hour' -> every_seconds=3600). \
         Use 'cron_expr' for scheduled recurring tasks (e.g. 'every day at 9am' -> cron_expr='0 9 * * *'). \
         Actions: add, list, remove."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "Action to perform"
                },
                "message": {
                    "type": "string",
                    "description": "The task/reminder message. Describe what the agent should do when the timer fires."
                },
                "in_seconds": {
                    "type": "integer",
                    "description": "Fire ONCE after this many seconds (one-shot timer). The job auto-deletes after execution."
                },
                "every_seconds": {
                    "type": "integer",
                    "description": "Fire repeatedly every N seconds (recurring)."
                },
                "cron_expr": {
                    "type": "string",
                    "description": "Cron expression like '0 9 * * *' (for recurring tasks at specific times)"
                },
                "job_id": {
                    "type": "string",
                    "description": "Job ID (for remove action)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let action = require_string(&params, "action")?;
        match action.as_str() {
            "add" => {
                let message = optional_string(&params, "message").unwrap_or_default();
                self.add_job(
                    &message,
                    optional_i64(&params, "in_seconds"),
                    optional_i64(&params, "every_seconds"),
                    optional_string(&params, "cron_expr"),
                )
                .await
            }
            "list" => Ok(self.list_jobs().await),
            "remove" => self.remove_job(optional_string(&params, "job_id")).await,
            other => anyhow::bail!("Unknown action: {other}"),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
