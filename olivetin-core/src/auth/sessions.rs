//! Persistent login sessions (`sessions.db.yaml` in the config directory)
//!
//! Layout on disk: `providers.<provider>.sessions.<sid> = {username, expiry}`
//! where `expiry` is a unix timestamp in seconds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

pub const SESSIONS_FILE: &str = "sessions.db.yaml";

/// One year, in seconds.
pub const SESSION_LIFETIME_SECS: i64 = 31_556_952;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub username: String,
    pub expiry: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SessionProvider {
    #[serde(default)]
    sessions: BTreeMap<String, UserSession>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SessionStorage {
    #[serde(default)]
    providers: BTreeMap<String, SessionProvider>,
}

impl SessionStorage {
    fn prune(&mut self, now: i64) -> usize {
        let mut pruned = 0;
        for provider in self.providers.values_mut() {
            let before = provider.sessions.len();
            provider.sessions.retain(|_, s| s.expiry >= now);
            pruned += before - provider.sessions.len();
        }
        pruned
    }
}

/// The session registry. One lock guards the map and the file write, so
/// concurrent registrations never interleave on disk.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    storage: Mutex<SessionStorage>,
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SessionStore {
    /// An empty store that will persist to `<config_dir>/sessions.db.yaml`.
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(SESSIONS_FILE),
            storage: Mutex::new(SessionStorage::default()),
        }
    }

    /// Loads the file, dropping expired sessions. Read or parse failures are
    /// logged and leave the store empty.
    pub fn load(config_dir: &Path) -> Self {
        let mut store = Self::new(config_dir);

        match read_storage(&store.path) {
            Ok(Some(mut storage)) => {
                let pruned = storage.prune(now_unix());
                debug!(path = %store.path.display(), pruned, "Loaded user sessions");
                store.storage = Mutex::new(storage);
            }
            Ok(None) => {
                debug!(path = %store.path.display(), "No sessions file, starting empty");
            }
            Err(e) => {
                warn!(path = %store.path.display(), error = %e, "Failed to load sessions, starting empty");
            }
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a session valid for one year and rewrites the file.
    pub async fn register(&self, provider: &str, sid: &str, username: &str) {
        let mut storage = self.storage.lock().await;

        storage
            .providers
            .entry(provider.to_string())
            .or_default()
            .sessions
            .insert(
                sid.to_string(),
                UserSession {
                    username: username.to_string(),
                    expiry: now_unix() + SESSION_LIFETIME_SECS,
                },
            );

        if let Err(e) = write_storage(&self.path, &storage).await {
            error!(path = %self.path.display(), error = %e, "Failed to save sessions");
        }
    }

    /// Looks up a live session. An expired one is removed on the way.
    pub async fn get(&self, provider: &str, sid: &str) -> Option<UserSession> {
        let mut storage = self.storage.lock().await;
        let sessions = &mut storage.providers.get_mut(provider)?.sessions;

        let session = sessions.get(sid)?;
        if session.expiry < now_unix() {
            sessions.remove(sid);
            return None;
        }

        Some(session.clone())
    }

    /// Forgets a session, used on logout.
    pub async fn revoke(&self, provider: &str, sid: &str) {
        let mut storage = self.storage.lock().await;
        let removed = storage
            .providers
            .get_mut(provider)
            .and_then(|p| p.sessions.remove(sid))
            .is_some();

        if removed {
            if let Err(e) = write_storage(&self.path, &storage).await {
                error!(path = %self.path.display(), error = %e, "Failed to save sessions");
            }
        }
    }

    pub async fn len(&self) -> usize {
        let storage = self.storage.lock().await;
        storage.providers.values().map(|p| p.sessions.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn read_storage(path: &Path) -> Result<Option<SessionStorage>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if content.trim().is_empty() {
        return Ok(Some(SessionStorage::default()));
    }

    let storage = serde_yaml_ng::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(Some(storage))
}

async fn write_storage(path: &Path, storage: &SessionStorage) -> Result<()> {
    let content = serde_yaml_ng::to_string(storage).context("Failed to serialize sessions")?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_register_persists_and_reloads() {
        let dir = TempDir::new().unwrap();

        let store = SessionStore::load(dir.path());
        assert!(store.is_empty().await);

        store.register("local", "sid-1", "alice").await;
        assert!(store.path().exists());

        let reloaded = SessionStore::load(dir.path());
        let session = reloaded.get("local", "sid-1").await.unwrap();
        assert_eq!(session.username, "alice");
        assert!(session.expiry > now_unix());
        assert!(reloaded.get("oauth2", "sid-1").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_pruned_on_load() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            "providers:\n  local:\n    sessions:\n      old:\n        username: bob\n        expiry: 1\n      new:\n        username: carol\n        expiry: {}\n",
            now_unix() + 3600
        );
        std::fs::write(dir.path().join(SESSIONS_FILE), yaml).unwrap();

        let store = SessionStore::load(dir.path());

        assert_eq!(store.len().await, 1);
        assert!(store.get("local", "old").await.is_none());
        assert_eq!(store.get("local", "new").await.unwrap().username, "carol");
    }

    #[tokio::test]
    async fn test_unparsable_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SESSIONS_FILE), "providers: [not, a, map").unwrap();

        let store = SessionStore::load(dir.path());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_revoke() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.register("local", "sid", "alice").await;

        store.revoke("local", "sid").await;

        assert!(store.get("local", "sid").await.is_none());
        assert!(SessionStore::load(dir.path()).is_empty().await);
    }
}
