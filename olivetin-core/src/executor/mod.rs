//! Execution engine
//!
//! Every trigger source (UI, cron, webhook, file events, chained actions)
//! ends up in [`Executor::exec_request`]. A request is enrolled in the log
//! store straight away and then walked through a fixed chain of steps in
//! [`pipeline`]; any step may stop the chain, after which the entry is
//! finalised regardless.

use crate::acl::{self, AuthenticatedUser};
use crate::config::{Config, RateSpec};
use crate::entities::EntityStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod arguments;
pub mod bindings;
pub mod logs;
pub mod persist;
pub mod pipeline;
pub mod process;

use bindings::{ActionBinding, BindingMap};
use logs::{matches_date_filter, paginate, InternalLogEntry, LogStore, PagingResult};

/// Exit code of an execution that never started a process
pub const DEFAULT_EXIT_CODE_NOT_EXECUTED: i32 = -1337;

/// Chained triggers stop at this depth
pub const MAX_TRIGGER_DEPTH: u32 = 10;

/// Observers of execution progress, such as the event bus.
#[async_trait]
pub trait ExecutionListener: Send + Sync {
    async fn on_execution_started(&self, cfg: &Config, entry: &InternalLogEntry);

    async fn on_output_chunk(&self, cfg: &Config, tracking_id: &str, binding: &Arc<ActionBinding>, chunk: &str);

    async fn on_execution_finished(&self, cfg: &Config, entry: &InternalLogEntry);

    async fn on_action_map_rebuilt(&self);
}

/// One attempt to run a binding.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub binding: Option<Arc<ActionBinding>>,
    pub user: AuthenticatedUser,
    pub arguments: BTreeMap<String, String>,
    /// Empty to have one generated
    pub tracking_id: String,
    pub tags: Vec<String>,
    pub trigger_depth: u32,
}

impl ExecutionRequest {
    pub fn new(binding: Option<Arc<ActionBinding>>, user: AuthenticatedUser) -> Self {
        Self {
            binding,
            user,
            arguments: BTreeMap::new(),
            tracking_id: String::new(),
            tags: Vec::new(),
            trigger_depth: 0,
        }
    }

    pub fn with_arguments(mut self, arguments: BTreeMap<String, String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = tracking_id.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Returned by `exec_request` as soon as the request is enrolled.
pub struct ExecutionHandle {
    pub tracking_id: String,
    done: JoinHandle<()>,
}

impl ExecutionHandle {
    /// Waits until the execution, including its after-hook, has finished.
    pub async fn wait(self) {
        if let Err(e) = self.done.await {
            warn!(tracking_id = %self.tracking_id, error = %e, "Execution task failed");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillResult {
    pub found: bool,
    pub killed: bool,
    pub already_completed: bool,
}

#[derive(Default)]
struct Counters {
    actions_requested: AtomicU64,
    config_reloads: AtomicU64,
    config_action_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub actions_requested: u64,
    pub config_reloads: u64,
    pub config_action_count: u64,
}

pub struct Executor {
    config: RwLock<Arc<Config>>,
    entities: Arc<EntityStore>,
    bindings: BindingMap,
    logs: LogStore,
    listeners: Vec<Arc<dyn ExecutionListener>>,
    counters: Counters,
    /// Serialises enrollment and the admission checks
    admission: Mutex<()>,
}

impl Executor {
    pub fn new(cfg: Arc<Config>, entities: Arc<EntityStore>) -> Self {
        Self {
            config: RwLock::new(cfg),
            entities,
            bindings: BindingMap::new(),
            logs: LogStore::new(),
            listeners: Vec::new(),
            counters: Counters::default(),
            admission: Mutex::new(()),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.push(listener);
    }

    pub async fn config(&self) -> Arc<Config> {
        Arc::clone(&*self.config.read().await)
    }

    /// Swaps in a new configuration generation and rebuilds the bindings.
    /// Executions already running keep the generation they started with.
    pub async fn set_config(&self, cfg: Arc<Config>) {
        *self.config.write().await = cfg;
        self.counters.config_reloads.fetch_add(1, Ordering::Relaxed);
        self.rebuild_action_map().await;
    }

    pub fn entities(&self) -> &Arc<EntityStore> {
        &self.entities
    }

    pub fn bindings(&self) -> &BindingMap {
        &self.bindings
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub async fn rebuild_action_map(&self) {
        let cfg = self.config().await;
        let count = self.bindings.rebuild(&cfg, &self.entities).await;

        self.counters
            .config_action_count
            .store(cfg.actions.len() as u64, Ordering::Relaxed);

        info!(bindings = count, actions = cfg.actions.len(), "Action map rebuilt");

        for listener in &self.listeners {
            listener.on_action_map_rebuilt().await;
        }
    }

    pub async fn find_binding_by_id(&self, id: &str) -> Option<Arc<ActionBinding>> {
        self.bindings.find_by_id(id).await
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            actions_requested: self.counters.actions_requested.load(Ordering::Relaxed),
            config_reloads: self.counters.config_reloads.load(Ordering::Relaxed),
            config_action_count: self.counters.config_action_count.load(Ordering::Relaxed),
        }
    }

    /// Reads saved results back into the log store.
    pub async fn load_logs_from_disk(&self) {
        let cfg = self.config().await;
        let entries = persist::load_logs_from_disk(&cfg, &self.bindings).await;
        if entries.is_empty() {
            return;
        }

        let added = self.logs.restore(entries).await;
        info!(added, "Restored persisted logs");
    }

    /// Kills the process group of a running execution.
    pub async fn kill(&self, tracking_id: &str, user: &AuthenticatedUser) -> KillResult {
        let mut result = KillResult::default();

        let Some(handle) = self.logs.get(tracking_id).await else {
            return result;
        };
        result.found = true;

        let (pid, binding, finished) = {
            let entry = handle.read().await;
            (entry.pid, entry.binding.clone(), entry.execution_finished)
        };

        let cfg = self.config().await;
        if let Some(binding) = &binding {
            if !acl::is_allowed_kill(&cfg, user, &binding.action) {
                warn!(tracking_id, username = %user.username, "Kill denied by ACL");
                return result;
            }
        }

        match pid {
            Some(pid) if !finished => match process::kill_process_group(pid) {
                Ok(()) => {
                    info!(tracking_id, pid, "Killed execution");
                    result.killed = true;
                }
                Err(e) => {
                    debug!(tracking_id, pid, error = %e, "Kill failed, assuming completed");
                    result.already_completed = true;
                }
            },
            _ => result.already_completed = true,
        }

        result
    }

    /// Unix seconds at which every rate window of the binding frees up
    /// again, or 0 when it is not limited right now.
    pub async fn get_time_until_available(&self, binding: &ActionBinding) -> i64 {
        if binding.action.max_rate.is_empty() {
            return 0;
        }

        let mut started = Vec::new();
        for handle in self.logs.by_binding(&binding.id).await {
            let entry = handle.read().await;
            if !entry.blocked {
                if let Some(t) = entry.datetime_started {
                    started.push(t);
                }
            }
        }

        rate_limit_expiry(&binding.action.max_rate, &started, Utc::now())
            .map(|t| t.timestamp())
            .unwrap_or(0)
    }

    /// A page of log entries the user may see, newest first.
    pub async fn get_log_tracking_ids_acl(
        &self,
        user: &AuthenticatedUser,
        start_offset: i64,
        page_size: i64,
        date_filter: &str,
    ) -> (Vec<InternalLogEntry>, PagingResult) {
        let cfg = self.config().await;
        let visible = self
            .logs
            .snapshots_where(|entry| {
                let allowed = match &entry.binding {
                    Some(binding) => acl::is_allowed_logs(&cfg, user, &binding.action),
                    None => false,
                };
                allowed && matches_date_filter(entry, date_filter)
            })
            .await;

        paginate(&visible, start_offset, page_size)
    }

    /// A page of one binding's history, newest first.
    pub async fn get_action_logs_acl(
        &self,
        binding: &ActionBinding,
        user: &AuthenticatedUser,
        start_offset: i64,
        page_size: i64,
    ) -> (Vec<InternalLogEntry>, PagingResult) {
        let cfg = self.config().await;
        if !acl::is_allowed_logs(&cfg, user, &binding.action) {
            return paginate(&[], start_offset, page_size);
        }

        let mut entries = Vec::new();
        for handle in self.logs.by_binding(&binding.id).await {
            entries.push(handle.read().await.clone());
        }

        paginate(&entries, start_offset, page_size)
    }
}

/// Window length for a rate spec. Durations that don't parse, or that are too
/// large to subtract from a timestamp, disable the window.
pub fn rate_window(rate: &RateSpec) -> Option<ChronoDuration> {
    let parsed = humantime::parse_duration(rate.duration.trim())
        .map_err(|e| e.to_string())
        .and_then(|d| ChronoDuration::from_std(d).map_err(|e| e.to_string()))
        .and_then(|d| match Utc::now().checked_sub_signed(d) {
            Some(_) => Ok(d),
            None => Err("duration out of range".to_string()),
        });

    match parsed {
        Ok(d) => Some(d),
        Err(error) => {
            warn!(duration = %rate.duration, %error, "Could not parse duration, rate limit disabled");
            None
        }
    }
}

/// Latest moment at which a saturated rate window expires.
pub fn rate_limit_expiry(rates: &[RateSpec], started: &[DateTime<Utc>], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut latest: Option<DateTime<Utc>> = None;

    for rate in rates {
        let Some(window) = rate_window(rate) else {
            continue;
        };

        let Some(since) = now.checked_sub_signed(window) else {
            continue;
        };
        let in_window: Vec<&DateTime<Utc>> = started.iter().filter(|t| **t > since).collect();

        if in_window.len() < rate.limit {
            continue;
        }

        if let Some(oldest) = in_window.into_iter().min() {
            let Some(expiry) = oldest.checked_add_signed(window) else {
                continue;
            };
            if expiry > now && latest.map_or(true, |l| expiry > l) {
                latest = Some(expiry);
            }
        }
    }

    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rate(duration: &str) -> RateSpec {
        RateSpec { limit: 1, duration: duration.into() }
    }

    #[test]
    fn test_rate_window() {
        assert_eq!(rate_window(&rate("30s")), Some(ChronoDuration::seconds(30)));
        assert_eq!(rate_window(&rate("1m")), Some(ChronoDuration::minutes(1)));
        assert_eq!(rate_window(&rate("1h 30m")), Some(ChronoDuration::minutes(90)));
        assert_eq!(rate_window(&rate("250ms")), Some(ChronoDuration::milliseconds(250)));
        assert_eq!(rate_window(&rate("ten minutes")), None);
        assert_eq!(rate_window(&rate("10")), None);
        assert_eq!(rate_window(&rate("")), None);
    }

    #[test]
    fn test_oversized_rate_window_is_disabled() {
        assert_eq!(rate_window(&rate("99999999999999999999h")), None);
        assert_eq!(rate_window(&rate("100000000years")), None);

        let now = Utc::now();
        let rates = vec![rate("99999999999999999999h")];
        assert_eq!(rate_limit_expiry(&rates, &[now], now), None);
    }

    #[test]
    fn test_rate_limit_expiry() {
        let now = Utc::now();
        let rates = vec![RateSpec { limit: 2, duration: "1m".into() }];
        let oldest = now - ChronoDuration::seconds(50);
        let newest = now - ChronoDuration::seconds(10);

        assert_eq!(rate_limit_expiry(&rates, &[newest], now), None);

        let expiry = rate_limit_expiry(&rates, &[oldest, newest], now).unwrap();
        assert_eq!(expiry, oldest + ChronoDuration::seconds(60));

        let stale = now - ChronoDuration::seconds(120);
        assert_eq!(rate_limit_expiry(&rates, &[stale, newest], now), None);
    }
}
