//! Binding map
//!
//! An action from the config is a template. Rebuilding expands it into
//! concrete bindings: one per action, or one per entity instance when the
//! action names an entity class. Binding IDs depend only on the action ID and
//! the entity key, so they survive rebuilds.

use crate::config::{Action, Config, DashboardComponent};
use crate::entities::{Entity, EntityStore};
use crate::tpl;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
pub struct ActionBinding {
    pub id: String,
    pub action: Arc<Action>,
    pub entity: Option<Arc<Entity>>,
    pub config_order: usize,
    pub is_on_dashboard: bool,
}

impl ActionBinding {
    /// The action title rendered against the binding's entity.
    pub fn title(&self) -> String {
        tpl::parse_template_with(&self.action.title, self.entity.as_deref())
    }

    pub fn entity_prefix(&self) -> &str {
        self.entity
            .as_ref()
            .map(|e| e.unique_key.as_str())
            .unwrap_or("")
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

pub fn binding_id(action: &Action, entity: Option<&Entity>) -> String {
    match entity {
        Some(entity) => sha256_hex(&format!("{}.{}", action.id, entity.unique_key)),
        None if !action.id.is_empty() => action.id.clone(),
        None => sha256_hex(&action.title),
    }
}

/// Titles of every link on every dashboard, recursively.
pub fn dashboard_link_titles(cfg: &Config) -> HashSet<String> {
    let mut titles = HashSet::new();
    for dashboard in &cfg.dashboards {
        collect_link_titles(&dashboard.contents, &mut titles);
    }
    titles
}

fn collect_link_titles(components: &[DashboardComponent], titles: &mut HashSet<String>) {
    for component in components {
        if component.contents.is_empty() {
            if component.is_link() {
                titles.insert(component.title.clone());
            }
        } else {
            collect_link_titles(&component.contents, titles);
        }
    }
}

#[derive(Default)]
pub struct BindingMap {
    bindings: RwLock<HashMap<String, Arc<ActionBinding>>>,
}

impl BindingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole map in one write. Returns the number of bindings.
    pub async fn rebuild(&self, cfg: &Config, entities: &EntityStore) -> usize {
        let on_dashboard = dashboard_link_titles(cfg);
        let mut next = HashMap::new();

        for (config_order, action) in cfg.actions.iter().enumerate() {
            let action = Arc::new(action.clone());

            if action.entity.is_empty() {
                insert_binding(&mut next, &action, None, config_order, &on_dashboard);
            } else {
                for instance in entities.get_entity_instances(&action.entity).await {
                    insert_binding(&mut next, &action, Some(instance), config_order, &on_dashboard);
                }
            }
        }

        let count = next.len();
        *self.bindings.write().await = next;

        debug!(count, "Rebuilt action map");
        count
    }

    pub async fn find_by_id(&self, id: &str) -> Option<Arc<ActionBinding>> {
        self.bindings.read().await.get(id).cloned()
    }

    pub async fn find_with_no_entity(&self, action_id: &str) -> Option<Arc<ActionBinding>> {
        self.bindings
            .read()
            .await
            .values()
            .find(|b| b.action.id == action_id && b.entity.is_none())
            .cloned()
    }

    /// Used when replaying saved logs, which only know the config title.
    pub async fn find_by_config_title(&self, title: &str, entity_prefix: &str) -> Option<Arc<ActionBinding>> {
        self.bindings
            .read()
            .await
            .values()
            .find(|b| b.action.title == title && b.entity_prefix() == entity_prefix)
            .cloned()
    }

    /// Every binding, in config order then entity order.
    pub async fn all(&self) -> Vec<Arc<ActionBinding>> {
        let mut all: Vec<_> = self.bindings.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.config_order
                .cmp(&b.config_order)
                .then_with(|| entity_order(a).cmp(&entity_order(b)))
        });
        all
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }
}

// Entity keys are positions ("0", "1", ...) for file-loaded classes.
fn entity_order(binding: &ActionBinding) -> (usize, String) {
    let key = binding.entity_prefix();
    (key.parse().unwrap_or(usize::MAX), key.to_string())
}

fn insert_binding(
    map: &mut HashMap<String, Arc<ActionBinding>>,
    action: &Arc<Action>,
    entity: Option<Arc<Entity>>,
    config_order: usize,
    on_dashboard: &HashSet<String>,
) {
    let id = binding_id(action, entity.as_deref());
    let rendered_title = tpl::parse_template_with(&action.title, entity.as_deref());
    let is_on_dashboard = on_dashboard.contains(&rendered_title);

    map.insert(
        id.clone(),
        Arc::new(ActionBinding {
            id,
            action: Arc::clone(action),
            entity,
            config_order,
            is_on_dashboard,
        }),
    );
}
