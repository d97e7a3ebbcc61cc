//! Actions with `execOnStartup`

use super::fire;
use crate::executor::{ExecutionHandle, Executor};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const STARTUP_USER: &str = "startup-user";

/// Starts every `execOnStartup` action once. Returns the handles so callers
/// may wait on them.
pub async fn execute(executor: &Arc<Executor>) -> Vec<ExecutionHandle> {
    let cfg = executor.config().await;
    let mut handles = Vec::new();

    for action in cfg.actions.iter().filter(|a| a.exec_on_startup) {
        info!(action_title = %action.title, "Startup action");

        if let Some(handle) = fire(executor, &action.id, STARTUP_USER, "startup", BTreeMap::new()).await {
            handles.push(handle);
        }
    }

    handles
}
