//! Filesystem watching shared by config reload, entity files, calendar files
//! and directory triggers.
//!
//! `notify` delivers events on its own thread; they are forwarded into a tokio
//! channel, filtered by kind (and optionally file name), debounced, and handed
//! to the consumer as plain paths.

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Editors often produce a burst of events for one save.
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchInterest {
    Create,
    Write,
    CreateOrWrite,
}

impl WatchInterest {
    fn matches(&self, kind: &EventKind) -> bool {
        let created = matches!(kind, EventKind::Create(_));
        let written = matches!(kind, EventKind::Modify(m) if !matches!(m, ModifyKind::Metadata(_)));

        match self {
            WatchInterest::Create => created,
            WatchInterest::Write => written,
            WatchInterest::CreateOrWrite => created || written,
        }
    }
}

/// Watches a single file for create or write events.
pub fn watch_file(path: &Path, cancel: CancellationToken) -> Result<mpsc::UnboundedReceiver<PathBuf>> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    watch_path(
        &dir,
        path.file_name().map(|n| n.to_os_string()),
        WatchInterest::CreateOrWrite,
        cancel,
    )
}

/// Watches a directory (non-recursively). When `file_name` is set only events
/// for that entry are forwarded.
pub fn watch_path(
    dir: &Path,
    file_name: Option<OsString>,
    interest: WatchInterest,
    cancel: CancellationToken,
) -> Result<mpsc::UnboundedReceiver<PathBuf>> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("Could not create filesystem watcher")?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Could not watch {}", dir.display()))?;

    debug!(dir = %dir.display(), ?file_name, ?interest, "Watching path");

    let dir_display = dir.display().to_string();

    tokio::spawn(async move {
        // The watcher stops when dropped, so it lives as long as this task.
        let _watcher = watcher;

        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = raw_rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };

            let mut pending = BTreeSet::new();
            collect_relevant(first, file_name.as_ref(), interest, &mut pending);
            if pending.is_empty() {
                continue;
            }

            let deadline = tokio::time::sleep(DEBOUNCE_DELAY);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    ev = raw_rx.recv() => match ev {
                        Some(ev) => collect_relevant(ev, file_name.as_ref(), interest, &mut pending),
                        None => break,
                    },
                }
            }

            for path in pending {
                debug!(path = %path.display(), "Filesystem change");
                if out_tx.send(path).is_err() {
                    return;
                }
            }
        }

        debug!(dir = %dir_display, "Stopped watching path");
    });

    Ok(out_rx)
}

fn collect_relevant(
    event: notify::Result<Event>,
    file_name: Option<&OsString>,
    interest: WatchInterest,
    pending: &mut BTreeSet<PathBuf>,
) {
    let event = match event {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "Error from filesystem watcher");
            return;
        }
    };

    if !interest.matches(&event.kind) {
        trace!(?event, "Ignoring irrelevant filesystem event");
        return;
    }

    for path in event.paths {
        if let Some(name) = file_name {
            if path.file_name() != Some(name.as_os_str()) {
                continue;
            }
        }
        pending.insert(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind};

    #[test]
    fn test_interest_matching() {
        let create = EventKind::Create(CreateKind::File);
        let write = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        let chmod = EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions));

        assert!(WatchInterest::Create.matches(&create));
        assert!(!WatchInterest::Create.matches(&write));
        assert!(WatchInterest::Write.matches(&write));
        assert!(!WatchInterest::Write.matches(&chmod));
        assert!(WatchInterest::CreateOrWrite.matches(&create));
    }

    #[test]
    fn test_file_name_filter() {
        let mut pending = BTreeSet::new();
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/tmp/a/config.yaml"))
            .add_path(PathBuf::from("/tmp/a/other.yaml"));

        collect_relevant(
            Ok(event),
            Some(&OsString::from("config.yaml")),
            WatchInterest::CreateOrWrite,
            &mut pending,
        );

        assert_eq!(pending.len(), 1);
        assert!(pending.contains(Path::new("/tmp/a/config.yaml")));
    }
}
