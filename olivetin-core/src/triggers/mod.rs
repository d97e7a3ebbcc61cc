//! Trigger sources
//!
//! Startup, cron, calendar files and directory watchers. Each source turns an
//! event into an [`ExecutionRequest`] for the action's entity-less binding and
//! hands it to the executor. Webhooks live in [`crate::webhooks`]; chained
//! triggers are part of the execution chain itself.

pub mod calendar;
pub mod cron;
pub mod fileindir;
pub mod startup;
pub mod watch;

use crate::acl::AuthenticatedUser;
use crate::executor::{ExecutionHandle, ExecutionRequest, Executor};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Registers cron jobs, calendar timers and directory watchers for the
/// executor's current configuration. They all stop when `cancel` fires.
pub async fn schedule_all(executor: &Arc<Executor>, cancel: &CancellationToken) {
    let cfg = executor.config().await;

    let cron_jobs = cron::schedule(executor, &cfg, cancel.clone());
    let calendars = calendar::schedule(executor, &cfg, cancel.clone());
    let watched_dirs = fileindir::watch(executor, &cfg, cancel.clone());

    info!(cron_jobs, calendars, watched_dirs, "Trigger sources scheduled");
}

/// Fires the entity-less binding of `action_id` as the system user
/// `system_user`, tagged with `tag`.
pub async fn fire(
    executor: &Arc<Executor>,
    action_id: &str,
    system_user: &str,
    tag: &str,
    arguments: BTreeMap<String, String>,
) -> Option<ExecutionHandle> {
    let cfg = executor.config().await;

    let Some(binding) = executor.bindings().find_with_no_entity(action_id).await else {
        warn!(action_id, tag, "No binding for triggered action, it may have been removed");
        return None;
    };

    let req = ExecutionRequest::new(Some(binding), AuthenticatedUser::from_system(&cfg, system_user))
        .with_arguments(arguments)
        .with_tag(tag);

    Some(executor.exec_request(req).await)
}
