//! Dashboard rendering
//!
//! Rendering works on a snapshot of the binding map, the entity store and
//! the rate-limit expiries, taken once per request. Everything below the
//! snapshot is synchronous.

use super::types::{format_unix, ApiAction, ApiActionArgument, ApiArgumentChoice, Dashboard, DashboardNode};
use crate::acl::{self, AuthenticatedUser};
use crate::config::{Action, ActionArgument, ComponentKind, Config, DashboardComponent};
use crate::entities::{Entity, EntityInstances};
use crate::executor::bindings::ActionBinding;
use crate::executor::Executor;
use crate::tpl;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_DASHBOARD_TITLE: &str = "Default";

/// Titles that address the generated default dashboard.
pub fn is_default_dashboard(title: &str) -> bool {
    matches!(title, "default" | "" | "Actions")
}

/// `canExec` is also gated on this. Empty means enabled; otherwise the
/// rendered text must be `true` (any case) or a non-zero integer.
pub fn evaluate_enabled_expression(action: &Action, entity: Option<&Entity>) -> bool {
    if action.enabled_expression.is_empty() {
        return true;
    }

    let rendered = tpl::parse_template_with(&action.enabled_expression, entity);
    let result = rendered.trim();

    if result.is_empty() {
        return false;
    }

    if result.starts_with("tpl ") && result.contains("error") {
        warn!(
            action_title = %action.title,
            enabled_expression = %action.enabled_expression,
            result,
            "enabledExpression template evaluation failed, treating as disabled"
        );
        return false;
    }

    if result.eq_ignore_ascii_case("true") {
        return true;
    }

    result.parse::<i64>().map(|n| n != 0).unwrap_or(false)
}

/// Actions with an order come first, by order then title.
fn sort_nodes(nodes: &mut [DashboardNode]) {
    nodes.sort_by(|a, b| match (a.action(), b.action()) {
        (Some(x), Some(y)) => x.order.cmp(&y.order).then_with(|| x.title.cmp(&y.title)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

pub struct RenderContext<'a> {
    cfg: &'a Config,
    user: &'a AuthenticatedUser,
    bindings: Vec<Arc<ActionBinding>>,
    entities: BTreeMap<String, EntityInstances>,
    rate_expiry: HashMap<String, i64>,
}

impl<'a> RenderContext<'a> {
    pub async fn new(executor: &Executor, cfg: &'a Config, user: &'a AuthenticatedUser) -> RenderContext<'a> {
        let bindings = executor.bindings().all().await;

        let mut rate_expiry = HashMap::new();
        for binding in bindings.iter().filter(|b| !b.action.max_rate.is_empty()) {
            let expiry = executor.get_time_until_available(binding).await;
            if expiry > 0 {
                rate_expiry.insert(binding.id.clone(), expiry);
            }
        }

        RenderContext {
            cfg,
            user,
            bindings,
            entities: executor.entities().get_entities().await,
            rate_expiry,
        }
    }

    pub fn build_action(&self, binding: &ActionBinding) -> ApiAction {
        let action = &binding.action;
        let entity = binding.entity.as_deref();

        let can_exec =
            acl::is_allowed_exec(self.cfg, self.user, action) && evaluate_enabled_expression(action, entity);

        ApiAction {
            binding_id: binding.id.clone(),
            title: tpl::parse_template_with(&action.title, entity),
            icon: tpl::parse_template_with(&action.icon, entity),
            can_exec,
            popup_on_start: action.popup_on_start.clone(),
            order: binding.config_order,
            timeout: action.timeout,
            datetime_rate_limit_expires: format_unix(self.rate_expiry.get(&binding.id).copied().unwrap_or(0)),
            arguments: action
                .arguments
                .iter()
                .map(|arg| self.build_argument(arg, entity))
                .collect(),
        }
    }

    fn build_argument(&self, arg: &ActionArgument, entity: Option<&Entity>) -> ApiActionArgument {
        let default_value = if arg.default.is_empty() {
            String::new()
        } else {
            tpl::parse_template_with(&arg.default, entity)
        };

        ApiActionArgument {
            name: arg.name.clone(),
            title: arg.title.clone(),
            arg_type: arg.arg_type.clone(),
            description: arg.description.clone(),
            default_value,
            choices: self.build_choices(arg),
            suggestions: arg.suggestions.clone(),
            suggestions_browser_key: arg.suggestions_browser_key.clone(),
        }
    }

    /// A single choice on an entity-bound argument is a template, repeated
    /// for every instance of the entity class.
    fn build_choices(&self, arg: &ActionArgument) -> Vec<ApiArgumentChoice> {
        if !arg.entity.is_empty() && arg.choices.len() == 1 {
            let template = &arg.choices[0];
            return self
                .entities
                .get(&arg.entity)
                .map(|instances| {
                    instances
                        .iter()
                        .map(|ent| ApiArgumentChoice {
                            value: tpl::parse_template_with(&template.value, Some(ent)),
                            title: tpl::parse_template_with(&template.title, Some(ent)),
                        })
                        .collect()
                })
                .unwrap_or_default();
        }

        arg.choices
            .iter()
            .map(|c| ApiArgumentChoice {
                value: c.value.clone(),
                title: c.title.clone(),
            })
            .collect()
    }

    /// Finds the binding for a config title, scoped to an entity instance
    /// when one is given. Actions the user may not view are not found.
    fn find_action(&self, title: &str, entity: Option<(&str, &Entity)>) -> Option<ApiAction> {
        let binding = self.bindings.iter().find(|b| {
            b.action.title == title
                && match (entity, &b.entity) {
                    (None, None) => true,
                    (Some((class, ent)), Some(bound)) => b.action.entity == class && bound.unique_key == ent.unique_key,
                    _ => false,
                }
        })?;

        if !acl::is_allowed_view(self.cfg, self.user, &binding.action) {
            return None;
        }

        Some(self.build_action(binding))
    }

    fn directory_icon(&self, item: &DashboardComponent) -> String {
        if item.icon.is_empty() {
            self.cfg.default_icon_for_directories.clone()
        } else {
            item.icon.clone()
        }
    }

    /// Every viewable binding that is neither hidden nor linked from a
    /// custom dashboard, in one `Default` fieldset.
    pub fn default_dashboard(&self) -> Dashboard {
        let mut links: Vec<DashboardNode> = self
            .bindings
            .iter()
            .filter(|b| !b.action.hidden && !b.is_on_dashboard)
            .filter(|b| acl::is_allowed_view(self.cfg, self.user, &b.action))
            .map(|b| {
                let action = self.build_action(b);
                DashboardNode::Link {
                    title: action.title.clone(),
                    icon: action.icon.clone(),
                    css_class: String::new(),
                    action,
                }
            })
            .collect();

        sort_nodes(&mut links);

        let contents = if links.is_empty() {
            Vec::new()
        } else {
            vec![DashboardNode::Fieldset {
                title: DEFAULT_DASHBOARD_TITLE.to_string(),
                css_class: String::new(),
                contents: links,
                entity_type: String::new(),
                entity_key: String::new(),
            }]
        };

        Dashboard {
            title: DEFAULT_DASHBOARD_TITLE.to_string(),
            contents,
        }
    }

    /// `None` when there is no such dashboard or nothing in it is visible.
    pub fn custom_dashboard(&self, title: &str) -> Option<Dashboard> {
        let dashboard = self.cfg.dashboards.iter().find(|d| d.title == title)?;

        let mut contents = self.render_contents(&dashboard.contents);
        if contents.is_empty() {
            return None;
        }
        sort_nodes(&mut contents);

        Some(Dashboard {
            title: dashboard.title.clone(),
            contents,
        })
    }

    /// Resolves a `GetDashboard` call. With an entity, `title` names a
    /// directory inside a fieldset of that entity class.
    pub fn dashboard(&self, title: &str, entity_type: &str, entity_key: &str) -> Option<Dashboard> {
        if is_default_dashboard(title) {
            return Some(self.default_dashboard());
        }

        if !entity_type.is_empty() && !entity_key.is_empty() {
            return self.entity_directory(title, entity_type, entity_key);
        }

        self.custom_dashboard(title)
    }

    /// `Actions` when the default dashboard has anything, then every custom
    /// dashboard with visible contents.
    pub fn root_dashboards(&self) -> Vec<String> {
        let mut roots = Vec::new();

        if !self.default_dashboard().contents.is_empty() {
            roots.push("Actions".to_string());
        }

        for dashboard in &self.cfg.dashboards {
            if self.custom_dashboard(&dashboard.title).is_some() {
                roots.push(dashboard.title.clone());
            }
        }

        roots
    }

    fn render_contents(&self, items: &[DashboardComponent]) -> Vec<DashboardNode> {
        let mut out = Vec::new();

        for item in items {
            if item.component_type == "fieldset" && !item.entity.is_empty() {
                out.extend(self.entity_fieldsets(item));
            } else if let Some(node) = self.render_component(item) {
                out.push(node);
            }
        }

        out
    }

    fn render_component(&self, item: &DashboardComponent) -> Option<DashboardNode> {
        match item.kind() {
            ComponentKind::Link => {
                let action = self.find_action(&item.title, None)?;
                Some(DashboardNode::Link {
                    title: item.title.clone(),
                    icon: if item.icon.is_empty() { action.icon.clone() } else { item.icon.clone() },
                    css_class: item.css_class.clone(),
                    action,
                })
            }
            ComponentKind::StdoutMostRecentExecution => Some(DashboardNode::StdoutMostRecentExecution {
                title: item.title.clone(),
                css_class: item.css_class.clone(),
                action: self.find_action(&item.title, None)?,
            }),
            ComponentKind::Display => Some(DashboardNode::Display {
                title: item.title.clone(),
                css_class: item.css_class.clone(),
            }),
            ComponentKind::Directory => {
                let contents = self.render_contents(&item.contents);
                if contents.is_empty() {
                    return None;
                }
                Some(DashboardNode::Directory {
                    title: item.title.clone(),
                    icon: self.directory_icon(item),
                    css_class: item.css_class.clone(),
                    contents,
                    entity_type: String::new(),
                    entity_key: String::new(),
                })
            }
            ComponentKind::Fieldset => {
                let contents = self.render_contents(&item.contents);
                if contents.is_empty() {
                    return None;
                }
                Some(DashboardNode::Fieldset {
                    title: item.title.clone(),
                    css_class: item.css_class.clone(),
                    contents,
                    entity_type: String::new(),
                    entity_key: String::new(),
                })
            }
        }
    }

    /// One fieldset per instance of `item.entity`; empty ones are dropped.
    fn entity_fieldsets(&self, item: &DashboardComponent) -> Vec<DashboardNode> {
        let class = item.entity.as_str();
        let Some(instances) = self.entities.get(class) else {
            return Vec::new();
        };

        instances
            .iter()
            .filter_map(|ent| {
                let contents = self.render_entity_contents(&item.contents, class, ent);
                if contents.is_empty() {
                    return None;
                }
                Some(DashboardNode::Fieldset {
                    title: tpl::parse_template_with(&item.title, Some(ent)),
                    css_class: tpl::parse_template_with(&item.css_class, Some(ent)),
                    contents,
                    entity_type: class.to_string(),
                    entity_key: ent.unique_key.clone(),
                })
            })
            .collect()
    }

    fn render_entity_contents(&self, items: &[DashboardComponent], class: &str, ent: &Entity) -> Vec<DashboardNode> {
        items
            .iter()
            .filter_map(|item| self.render_entity_item(item, class, ent))
            .collect()
    }

    /// Links prefer the entity's own binding and fall back to the plain
    /// action of the same title.
    fn render_entity_item(&self, item: &DashboardComponent, class: &str, ent: &Entity) -> Option<DashboardNode> {
        let title = tpl::parse_template_with(&item.title, Some(ent));
        let css_class = tpl::parse_template_with(&item.css_class, Some(ent));
        let lookup = || {
            self.find_action(&item.title, Some((class, ent)))
                .or_else(|| self.find_action(&item.title, None))
        };

        match item.kind() {
            ComponentKind::Link => {
                let action = lookup()?;
                Some(DashboardNode::Link {
                    title,
                    icon: if item.icon.is_empty() { action.icon.clone() } else { item.icon.clone() },
                    css_class,
                    action,
                })
            }
            ComponentKind::StdoutMostRecentExecution => Some(DashboardNode::StdoutMostRecentExecution {
                title,
                css_class,
                action: lookup()?,
            }),
            ComponentKind::Display => Some(DashboardNode::Display { title, css_class }),
            ComponentKind::Directory => {
                let contents = self.render_entity_contents(&item.contents, class, ent);
                if contents.is_empty() {
                    return None;
                }
                Some(DashboardNode::Directory {
                    title,
                    icon: self.directory_icon(item),
                    css_class,
                    contents,
                    entity_type: class.to_string(),
                    entity_key: ent.unique_key.clone(),
                })
            }
            ComponentKind::Fieldset => {
                let contents = self.render_entity_contents(&item.contents, class, ent);
                if contents.is_empty() {
                    return None;
                }
                Some(DashboardNode::Fieldset {
                    title,
                    css_class,
                    contents,
                    entity_type: class.to_string(),
                    entity_key: ent.unique_key.clone(),
                })
            }
        }
    }

    fn entity_directory(&self, title: &str, entity_type: &str, entity_key: &str) -> Option<Dashboard> {
        let ent = self
            .entities
            .get(entity_type)?
            .iter()
            .find(|e| e.unique_key == entity_key)?;
        let directory = find_entity_directory(&self.cfg.dashboards, title, entity_type)?;

        Some(Dashboard {
            title: tpl::parse_template_with(&directory.title, Some(ent)),
            contents: self.render_entity_contents(&directory.contents, entity_type, ent),
        })
    }
}

fn find_entity_directory<'c>(
    components: &'c [DashboardComponent],
    title: &str,
    entity_type: &str,
) -> Option<&'c DashboardComponent> {
    for component in components {
        if component.entity == entity_type {
            let found = component
                .contents
                .iter()
                .find(|sub| sub.kind() == ComponentKind::Directory && sub.title == title);
            if found.is_some() {
                return found;
            }
        }

        if let Some(found) = find_entity_directory(&component.contents, title, entity_type) {
            return Some(found);
        }
    }

    None
}

/// Dashboards that show `entity`: the parent of each component bound to it,
/// or `<title> [Entity Directory]` for a directory bound to it.
pub fn used_on_dashboards(entity: &str, dashboards: &[DashboardComponent]) -> Vec<String> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    collect_used_on(entity, "", dashboards, &mut found, &mut seen);
    found
}

fn collect_used_on(
    entity: &str,
    parent_title: &str,
    components: &[DashboardComponent],
    found: &mut Vec<String>,
    seen: &mut HashSet<String>,
) {
    for component in components {
        if component.entity == entity {
            if component.component_type == "directory" {
                let title = format!("{} [Entity Directory]", component.title);
                if seen.insert(title.clone()) {
                    found.push(title);
                    seen.insert(component.title.clone());
                }
            } else if !parent_title.is_empty() && seen.insert(parent_title.to_string()) {
                found.push(parent_title.to_string());
            }
        }

        if !component.contents.is_empty() {
            collect_used_on(entity, &component.title, &component.contents, found, seen);
        }
    }
}

/// Titles of the directories placed directly inside components bound to
/// `entity_type`.
pub fn entity_directories(entity_type: &str, dashboards: &[DashboardComponent]) -> Vec<String> {
    let mut directories = Vec::new();
    for dashboard in dashboards {
        collect_directories(entity_type, dashboard, &mut directories);
    }
    directories
}

fn collect_directories(entity_type: &str, component: &DashboardComponent, directories: &mut Vec<String>) {
    if component.entity == entity_type {
        directories.extend(
            component
                .contents
                .iter()
                .filter(|sub| sub.component_type == "directory")
                .map(|sub| sub.title.clone()),
        );
    }

    for sub in &component.contents {
        collect_directories(entity_type, sub, directories);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config(yaml: &str) -> Config {
        let mut cfg: Config = serde_yaml_ng::from_str(yaml).unwrap();
        cfg.sanitize().unwrap();
        cfg
    }

    async fn executor(cfg: &Config) -> Executor {
        let entities = Arc::new(EntityStore::new());
        entities
            .replace_class("server", vec![json!({"hostname": "alpha"}), json!({"hostname": "beta"})])
            .await;
        let executor = Executor::new(Arc::new(cfg.clone()), entities);
        executor.rebuild_action_map().await;
        executor
    }

    const YAML: &str = r#"
actions:
  - id: ping
    title: Ping
    shell: echo ping
  - id: backup
    title: Backup
    shell: echo backup
  - id: secret
    title: Secret
    shell: echo secret
    hidden: true
  - id: uptime
    title: Uptime
    shell: uptime
  - id: restart
    title: Restart {{ .CurrentEntity.hostname }}
    shell: echo restart
    entity: server
dashboards:
  - title: Ops
    contents:
      - title: Backup
      - title: Missing action
      - title: Notes
        type: display
      - title: "{{ .CurrentEntity.hostname }}"
        type: fieldset
        entity: server
        contents:
          - title: Restart {{ .CurrentEntity.hostname }}
          - title: Tools
            type: directory
            contents:
              - title: Uptime
"#;

    #[test]
    fn test_enabled_expression() {
        let mut action = Action::default();
        assert!(evaluate_enabled_expression(&action, None));

        for (expr, expected) in [("true", true), ("TRUE", true), ("1", true), ("0", false), ("nope", false), ("  ", false)] {
            action.enabled_expression = expr.to_string();
            assert_eq!(evaluate_enabled_expression(&action, None), expected, "{}", expr);
        }

        let ent = Entity::new("0", json!({"up": "true"}));
        action.enabled_expression = "{{ .CurrentEntity.up }}".into();
        assert!(evaluate_enabled_expression(&action, Some(&ent)));
    }

    #[tokio::test]
    async fn test_default_dashboard_skips_hidden_and_linked() {
        let cfg = config(YAML);
        let executor = executor(&cfg).await;
        let user = AuthenticatedUser::guest(&cfg);
        let ctx = RenderContext::new(&executor, &cfg, &user).await;

        let dashboard = ctx.default_dashboard();

        assert_eq!(dashboard.contents.len(), 1);
        let titles: Vec<&str> = dashboard.contents[0].contents().iter().map(|n| n.title()).collect();
        assert_eq!(titles, vec!["Ping"]);
    }

    #[tokio::test]
    async fn test_custom_dashboard_with_entity_fieldsets() {
        let cfg = config(YAML);
        let executor = executor(&cfg).await;
        let user = AuthenticatedUser::guest(&cfg);
        let ctx = RenderContext::new(&executor, &cfg, &user).await;

        let dashboard = ctx.custom_dashboard("Ops").unwrap();
        let titles: Vec<&str> = dashboard.contents.iter().map(|n| n.title()).collect();
        assert_eq!(titles, vec!["Backup", "Notes", "alpha", "beta"]);

        let DashboardNode::Fieldset { contents, entity_type, entity_key, .. } = &dashboard.contents[2] else {
            panic!("expected a fieldset");
        };
        assert_eq!(entity_type, "server");
        assert_eq!(entity_key, "0");
        assert_eq!(contents[0].title(), "Restart alpha");
        assert_eq!(contents[0].action().unwrap().title, "Restart alpha");

        let DashboardNode::Directory { contents: tools, entity_key, .. } = &contents[1] else {
            panic!("expected a directory");
        };
        assert_eq!(entity_key, "0");
        assert_eq!(tools[0].action().unwrap().binding_id, "uptime");

        assert_eq!(ctx.root_dashboards(), vec!["Actions".to_string(), "Ops".to_string()]);
        assert!(ctx.custom_dashboard("Nope").is_none());
    }

    #[tokio::test]
    async fn test_view_acl_hides_everything() {
        let cfg = config(&format!("defaultPermissions: {{ view: false }}\n{}", YAML));
        let executor = executor(&cfg).await;
        let user = AuthenticatedUser::guest(&cfg);
        let ctx = RenderContext::new(&executor, &cfg, &user).await;

        assert!(ctx.default_dashboard().contents.is_empty());
        let dashboard = ctx.custom_dashboard("Ops").unwrap();
        assert_eq!(dashboard.contents.len(), 1);
        assert_eq!(dashboard.contents[0].title(), "Notes");
    }

    #[tokio::test]
    async fn test_entity_directory_dashboard() {
        let cfg = config(YAML);
        let executor = executor(&cfg).await;
        let user = AuthenticatedUser::guest(&cfg);
        let ctx = RenderContext::new(&executor, &cfg, &user).await;

        let dashboard = ctx.dashboard("Tools", "server", "1").unwrap();
        assert_eq!(dashboard.contents[0].title(), "Uptime");
        assert!(ctx.dashboard("Tools", "server", "9").is_none());
    }

    #[test]
    fn test_entity_usage_helpers() {
        let cfg = config(YAML);
        assert_eq!(used_on_dashboards("server", &cfg.dashboards), vec!["Ops".to_string()]);
        assert_eq!(entity_directories("server", &cfg.dashboards), vec!["Tools".to_string()]);
        assert!(used_on_dashboards("vm", &cfg.dashboards).is_empty());
    }
}
