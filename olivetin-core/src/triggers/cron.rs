//! `execOnCron` schedules
//!
//! Lines are standard 5-field cron expressions, or 6-field (leading seconds)
//! when `cronSupportForSeconds` is set. Each line runs as its own task that
//! sleeps until the next occurrence in local time.

use super::fire;
use crate::config::{Action, Config};
use crate::executor::Executor;
use anyhow::{bail, Context, Result};
use chrono::Local;
use cron::Schedule;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub fn parse_cron_line(line: &str, with_seconds: bool) -> Result<Schedule> {
    let fields = line.split_whitespace().count();
    let expected = if with_seconds { 6 } else { 5 };

    if fields != expected {
        bail!("expected {} fields, found {}", expected, fields);
    }

    // The cron crate always wants a seconds field.
    let normalized = if with_seconds {
        line.trim().to_string()
    } else {
        format!("0 {}", line.trim())
    };

    Schedule::from_str(&normalized).with_context(|| format!("Invalid cron line '{}'", line))
}

/// Spawns one task per valid cron line. Returns how many were scheduled.
pub fn schedule(executor: &Arc<Executor>, cfg: &Config, cancel: CancellationToken) -> usize {
    let mut scheduled = 0;

    for action in &cfg.actions {
        for line in &action.exec_on_cron {
            match parse_cron_line(line, cfg.cron_support_for_seconds) {
                Ok(schedule) => {
                    info!(action_title = %action.title, cronline = %line, "Scheduling action for cron");
                    spawn_job(Arc::clone(executor), action, schedule, cancel.clone());
                    scheduled += 1;
                }
                Err(e) => {
                    error!(action_title = %action.title, cronline = %line, error = %format!("{:#}", e), "Cron schedule error");
                }
            }
        }
    }

    scheduled
}

fn spawn_job(executor: Arc<Executor>, action: &Action, schedule: Schedule, cancel: CancellationToken) {
    let action_id = action.id.clone();
    let title = action.title.clone();

    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Local).next() else {
                debug!(action_title = %title, "Cron schedule has no further occurrences");
                return;
            };

            let wait = (next - Local::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(action_title = %title, "Cron job cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            debug!(action_title = %title, "Cron job fired");
            fire(&executor, &action_id, "cron", "cron", BTreeMap::new()).await;
        }
    });
}
