//! On-disk mirror of finished executions
//!
//! `<resultsDirectory>/<title>.<unixStart>.<trackingId>.yaml` holds the entry,
//! `<outputDirectory>/<title>.<unixStart>.<trackingId>.log` the raw output.
//! Results files are read back at startup.

use super::bindings::BindingMap;
use super::logs::InternalLogEntry;
use crate::config::{Action, Config};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn first_non_empty<'a>(one: &'a str, two: &'a str) -> &'a str {
    if one.is_empty() {
        two
    } else {
        one
    }
}

pub fn log_file_stem(entry: &InternalLogEntry) -> String {
    format!(
        "{}.{}.{}",
        entry.action_title,
        entry.datetime_started.map(|t| t.timestamp()).unwrap_or(0),
        entry.execution_tracking_id
    )
}

/// Writes whichever of the results/output files are configured. Failures are
/// logged and otherwise ignored.
pub fn save_log(cfg: &Config, action: &Action, entry: &InternalLogEntry) {
    let stem = log_file_stem(entry);

    let results_dir = first_non_empty(&action.save_logs.results_directory, &cfg.save_logs.results_directory);
    if !results_dir.is_empty() {
        let path = cfg.resolve_path(results_dir).join(format!("{}.yaml", stem));
        if let Err(e) = write_results(&path, entry) {
            warn!(path = %path.display(), error = %format!("{:#}", e), "Could not save log results");
        }
    }

    let output_dir = first_non_empty(&action.save_logs.output_directory, &cfg.save_logs.output_directory);
    if !output_dir.is_empty() {
        let path = cfg.resolve_path(output_dir).join(format!("{}.log", stem));
        if let Err(e) = std::fs::write(&path, &entry.output) {
            warn!(path = %path.display(), error = %e, "Could not save log output");
        }
    }
}

fn write_results(path: &Path, entry: &InternalLogEntry) -> Result<()> {
    let yaml = serde_yaml_ng::to_string(entry).context("Could not serialize log entry")?;
    std::fs::write(path, yaml).with_context(|| format!("Could not write {}", path.display()))?;
    debug!(path = %path.display(), "Saved log results");
    Ok(())
}

/// Reads every `*.yaml` in the results directory, reattaches bindings by
/// config title and entity key, and returns the entries oldest first.
pub async fn load_logs_from_disk(cfg: &Config, bindings: &BindingMap) -> Vec<InternalLogEntry> {
    if cfg.save_logs.results_directory.is_empty() {
        return Vec::new();
    }

    let dir = cfg.resolve_path(&cfg.save_logs.results_directory);
    if !dir.is_dir() {
        debug!(directory = %dir.display(), "Logs directory does not exist, skipping log loading");
        return Vec::new();
    }

    info!(directory = %dir.display(), "Loading persisted logs from disk");

    let files = match list_yaml_files(&dir) {
        Ok(files) => files,
        Err(e) => {
            warn!(directory = %dir.display(), error = %format!("{:#}", e), "Failed to read logs directory");
            return Vec::new();
        }
    };

    let mut loaded = Vec::new();
    let mut skipped = 0;

    for path in files {
        match read_entry(&path) {
            Ok(entry) if entry.execution_tracking_id.is_empty() => {
                warn!(file = %path.display(), "Log file missing execution tracking ID, skipping");
                skipped += 1;
            }
            Ok(mut entry) => {
                entry.binding = bindings
                    .find_by_config_title(&entry.action_config_title, &entry.entity_prefix)
                    .await;
                if entry.binding.is_none() {
                    debug!(file = %path.display(), title = %entry.action_config_title, "No binding for saved log");
                }
                loaded.push(entry);
            }
            Err(e) => {
                warn!(file = %path.display(), error = %format!("{:#}", e), "Failed to load log file");
                skipped += 1;
            }
        }
    }

    loaded.sort_by_key(|e| e.datetime_started);

    info!(loaded = loaded.len(), skipped, "Finished reading persisted logs");
    loaded
}

fn list_yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_entry(path: &Path) -> Result<InternalLogEntry> {
    let raw = std::fs::read_to_string(path).context("Failed to read log file")?;
    serde_yaml_ng::from_str(&raw).context("Failed to parse log file")
}
