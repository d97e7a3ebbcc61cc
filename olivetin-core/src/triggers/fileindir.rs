//! `execOnFileCreatedInDir` / `execOnFileChangedInDir`

use super::fire;
use super::watch::{watch_path, WatchInterest};
use crate::config::{Action, Config};
use crate::executor::Executor;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Arguments describing the file that fired the trigger. The `stat`-derived
/// ones are absent when the file is already gone.
pub fn file_arguments(path: &Path) -> BTreeMap<String, String> {
    let mut args = BTreeMap::new();

    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let dir = path.parent().map(|p| p.display().to_string()).unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    args.insert("filepath".to_string(), path.display().to_string());
    args.insert("filename".to_string(), name);
    args.insert("filedir".to_string(), dir);
    args.insert("fileext".to_string(), ext);

    if let Ok(meta) = std::fs::metadata(path) {
        args.insert("filesizebytes".to_string(), meta.len().to_string());
        args.insert("filemode".to_string(), file_mode(&meta));
        if let Ok(modified) = meta.modified() {
            let mtime: DateTime<Local> = modified.into();
            args.insert("filemtime".to_string(), mtime.format("%Y-%m-%d %H:%M:%S%.f %z").to_string());
        }
        args.insert("fileisdir".to_string(), meta.is_dir().to_string());
    }

    args
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("0{:o}", meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> String {
    if meta.permissions().readonly() {
        "0444".to_string()
    } else {
        "0666".to_string()
    }
}

/// Starts the directory watchers. Returns how many were started.
pub fn watch(executor: &Arc<Executor>, cfg: &Config, cancel: CancellationToken) -> usize {
    let mut started = 0;

    for action in &cfg.actions {
        for dir in &action.exec_on_file_created_in_dir {
            started += watch_one(executor, cfg, action, dir, WatchInterest::Create, &cancel) as usize;
        }
        for dir in &action.exec_on_file_changed_in_dir {
            started += watch_one(executor, cfg, action, dir, WatchInterest::CreateOrWrite, &cancel) as usize;
        }
    }

    started
}

fn watch_one(
    executor: &Arc<Executor>,
    cfg: &Config,
    action: &Action,
    dir: &str,
    interest: WatchInterest,
    cancel: &CancellationToken,
) -> bool {
    let dir = cfg.resolve_path(dir);

    let mut changes = match watch_path(&dir, None, interest, cancel.clone()) {
        Ok(rx) => rx,
        Err(e) => {
            error!(dir = %dir.display(), action_title = %action.title, error = %format!("{:#}", e), "Cannot watch directory");
            return false;
        }
    };

    let executor = Arc::clone(executor);
    let action_id = action.id.clone();

    tokio::spawn(async move {
        while let Some(path) = changes.recv().await {
            debug!(path = %path.display(), action_id = %action_id, "File trigger");
            fire(&executor, &action_id, "fileindir", "fileindir", file_arguments(&path)).await;
        }
    });

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_arguments_for_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, "a,b\n").unwrap();

        let args = file_arguments(&path);

        assert_eq!(args["filename"], "report.csv");
        assert_eq!(args["fileext"], ".csv");
        assert_eq!(args["filedir"], dir.path().display().to_string());
        assert_eq!(args["filesizebytes"], "4");
        assert_eq!(args["fileisdir"], "false");
        assert!(args["filemode"].starts_with('0'));
        assert!(args.contains_key("filemtime"));
    }

    #[test]
    fn test_arguments_for_vanished_file() {
        let args = file_arguments(Path::new("/nonexistent/dir/notes"));

        assert_eq!(args["filename"], "notes");
        assert_eq!(args["fileext"], "");
        assert!(!args.contains_key("filesizebytes"));
    }
}
