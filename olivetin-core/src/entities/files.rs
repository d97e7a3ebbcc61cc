//! Loading entity files (JSON or YAML) and reloading them on change

use super::EntityStore;
use crate::config::Config;
use crate::triggers::watch::watch_file;
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Parses an entity file. `.json` files hold a stream of objects (or arrays of
/// objects); anything else is read as a YAML sequence of mappings.
pub fn parse_entity_file(path: &Path) -> Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read entity file {}", path.display()))?;

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");

    if is_json {
        parse_json_stream(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
    } else {
        parse_yaml_sequence(&raw).with_context(|| format!("Invalid YAML in {}", path.display()))
    }
}

fn parse_json_stream(raw: &str) -> Result<Vec<Value>> {
    let mut records = Vec::new();

    for doc in serde_json::Deserializer::from_str(raw).into_iter::<Value>() {
        match doc? {
            Value::Array(items) => records.extend(items),
            other => records.push(other),
        }
    }

    Ok(records)
}

fn parse_yaml_sequence(raw: &str) -> Result<Vec<Value>> {
    let value: Option<Value> = serde_yaml_ng::from_str(raw)?;

    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => bail!("expected a list of entities"),
    }
}

/// Relative entity paths resolve against the config directory, or its `var`
/// subdirectory when one exists.
pub fn resolve_entities_base_dir(cfg: &Config) -> PathBuf {
    let dev_var = cfg.config_dir().join("var");
    if dev_var.is_dir() {
        return dev_var;
    }
    cfg.config_dir().to_path_buf()
}

pub async fn load_entity_file(store: &EntityStore, path: &Path, class: &str) {
    info!(file = %path.display(), name = class, "Loading entity file");

    match parse_entity_file(path) {
        Ok(records) => store.replace_class(class, records).await,
        Err(e) => error!(error = %format!("{:#}", e), "Failed to load entity file"),
    }
}

/// Loads every configured entity file once, then keeps reloading each on
/// change until `cancel` fires.
pub async fn spawn_entity_watchers(
    cfg: &Config,
    store: Arc<EntityStore>,
    cancel: CancellationToken,
) {
    let base_dir = resolve_entities_base_dir(cfg);

    for entity_file in &cfg.entities {
        let path = if Path::new(&entity_file.file).is_absolute() {
            PathBuf::from(&entity_file.file)
        } else {
            base_dir.join(&entity_file.file)
        };
        let class = entity_file.name.clone();

        load_entity_file(&store, &path, &class).await;

        let mut changes = match watch_file(&path, cancel.clone()) {
            Ok(rx) => rx,
            Err(e) => {
                error!(file = %path.display(), error = %format!("{:#}", e), "Cannot watch entity file");
                continue;
            }
        };

        let store = Arc::clone(&store);
        tokio::spawn(async move {
            while changes.recv().await.is_some() {
                debug!(file = %path.display(), "Entity file changed");
                load_entity_file(&store, &path, &class).await;
            }
        });
    }
}
