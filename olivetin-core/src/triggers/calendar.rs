//! `execOnCalendarFile` timers
//!
//! The calendar file is a YAML list of RFC3339 instants. Every (re)load
//! cancels the timers scheduled from the previous contents and arms one timer
//! per future instant.

use super::fire;
use super::watch::watch_file;
use crate::config::Config;
use crate::executor::Executor;
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reads the raw entries of a calendar file.
pub fn read_calendar_file(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
    let entries: Option<Vec<Option<String>>> =
        serde_yaml_ng::from_str(&raw).with_context(|| format!("Could not parse {}", path.display()))?;

    Ok(entries.unwrap_or_default().into_iter().flatten().collect())
}

/// Parses entries and keeps the ones after `now`. Empty, invalid and stale
/// entries are skipped.
pub fn future_instants(action_title: &str, entries: &[String], now: DateTime<Utc>) -> Vec<DateTime<FixedOffset>> {
    let mut instants = Vec::new();

    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let instant = match DateTime::parse_from_rfc3339(entry) {
            Ok(instant) => instant,
            Err(e) => {
                warn!(instant = entry, action_title, error = %e, "Invalid calendar entry, skipping");
                continue;
            }
        };

        if instant.with_timezone(&Utc) <= now {
            warn!(instant = entry, action_title, "Not scheduling stale calendar action");
            continue;
        }

        instants.push(instant);
    }

    instants
}

/// Starts one watcher per action with a calendar file. Returns how many were
/// started.
pub fn schedule(executor: &Arc<Executor>, cfg: &Config, cancel: CancellationToken) -> usize {
    let mut started = 0;

    for action in cfg.actions.iter().filter(|a| !a.exec_on_calendar_file.is_empty()) {
        let path = cfg.resolve_path(&action.exec_on_calendar_file);

        let changes = match watch_file(&path, cancel.clone()) {
            Ok(rx) => rx,
            Err(e) => {
                error!(file = %path.display(), error = %format!("{:#}", e), "Cannot watch calendar file");
                continue;
            }
        };

        let calendar = CalendarAction {
            executor: Arc::clone(executor),
            action_id: action.id.clone(),
            action_title: action.title.clone(),
            path,
        };

        tokio::spawn(calendar.run(changes, cancel.clone()));
        started += 1;
    }

    started
}

struct CalendarAction {
    executor: Arc<Executor>,
    action_id: String,
    action_title: String,
    path: PathBuf,
}

impl CalendarAction {
    async fn run(self, mut changes: tokio::sync::mpsc::UnboundedReceiver<PathBuf>, cancel: CancellationToken) {
        let this = Arc::new(self);
        let mut timers = this.reload(&cancel);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => {
                    if change.is_none() {
                        break;
                    }
                    info!(action_title = %this.action_title, "Clearing existing scheduled actions from calendar");
                    timers.cancel();
                    timers = this.reload(&cancel);
                }
            }
        }

        timers.cancel();
    }

    /// Parses the file and arms timers under a fresh child token.
    fn reload(self: &Arc<Self>, parent: &CancellationToken) -> CancellationToken {
        let timers = parent.child_token();

        info!(action_title = %self.action_title, file = %self.path.display(), "Parsing calendar file");

        let entries = match read_calendar_file(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Could not load calendar file");
                return timers;
            }
        };

        for instant in future_instants(&self.action_title, &entries, Utc::now()) {
            info!(action_title = %self.action_title, %instant, "Scheduling action on calendar");
            tokio::spawn(Arc::clone(self).sleep_until(instant, timers.clone()));
        }

        timers
    }

    async fn sleep_until(self: Arc<Self>, instant: DateTime<FixedOffset>, cancel: CancellationToken) {
        let wait = (instant.with_timezone(&Utc) - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(action_title = %self.action_title, %instant, "Cancelled scheduled action");
            }
            _ = tokio::time::sleep(wait) => {
                info!(action_title = %self.action_title, %instant, "Executing action from calendar");
                fire(&self.executor, &self.action_id, "calendar", "calendar", BTreeMap::new()).await;
            }
        }
    }
}
