//! Entity store
//!
//! Entities are opaque records loaded from external files and grouped by class
//! name. Actions that reference a class are fanned out into one binding per
//! instance. A class is always replaced as a whole.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

pub mod files;

pub use files::{parse_entity_file, spawn_entity_watchers};

const TITLE_KEYS: [&str; 6] = ["title", "name", "id", "hostname", "host", "label"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub data: Value,
    pub unique_key: String,
    pub title: String,
}

impl Entity {
    pub fn new(unique_key: impl Into<String>, data: Value) -> Self {
        let title = find_entity_title(&data);
        Self {
            data,
            unique_key: unique_key.into(),
            title,
        }
    }
}

/// The first populated string among the well-known title keys, matched
/// case-insensitively.
pub fn find_entity_title(data: &Value) -> String {
    if let Value::Object(map) = data {
        for wanted in TITLE_KEYS {
            let found = map
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(wanted))
                .and_then(|(_, v)| v.as_str());

            if let Some(title) = found {
                return title.to_string();
            }
        }
    }

    "Untitled Entity".to_string()
}

/// Instances of one class, in source order.
pub type EntityInstances = Vec<Arc<Entity>>;

pub struct EntityStore {
    classes: RwLock<BTreeMap<String, EntityInstances>>,
    changed: broadcast::Sender<String>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (changed, _) = broadcast::channel(16);
        Self {
            classes: RwLock::new(BTreeMap::new()),
            changed,
        }
    }

    /// Receives the class name every time a class is replaced.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changed.subscribe()
    }

    pub async fn get_entities(&self) -> BTreeMap<String, EntityInstances> {
        self.classes.read().await.clone()
    }

    pub async fn get_entity_instances(&self, class: &str) -> EntityInstances {
        self.classes
            .read()
            .await
            .get(class)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_entity(&self, class: &str, key: &str) -> Option<Arc<Entity>> {
        self.classes
            .read()
            .await
            .get(class)
            .and_then(|instances| instances.iter().find(|e| e.unique_key == key).cloned())
    }

    /// Adds or replaces a single instance.
    pub async fn add_entity(&self, class: &str, key: &str, data: Value) {
        let entity = Arc::new(Entity::new(key, data));
        let mut classes = self.classes.write().await;
        let instances = classes.entry(class.to_string()).or_default();

        match instances.iter_mut().find(|e| e.unique_key == key) {
            Some(existing) => *existing = entity,
            None => instances.push(entity),
        }
    }

    pub async fn clear_entities_of_type(&self, class: &str) {
        self.classes.write().await.remove(class);
    }

    /// Atomically replaces a class with freshly loaded records keyed `0, 1, ...`
    /// and notifies listeners.
    pub async fn replace_class(&self, class: &str, records: Vec<Value>) {
        let instances: EntityInstances = records
            .into_iter()
            .enumerate()
            .map(|(i, data)| Arc::new(Entity::new(i.to_string(), data)))
            .collect();

        debug!(class, count = instances.len(), "Replacing entity class");

        self.classes
            .write()
            .await
            .insert(class.to_string(), instances);

        // No receivers is fine; nothing is listening yet during startup.
        let _ = self.changed.send(class.to_string());
    }
}
