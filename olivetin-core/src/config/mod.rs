//! Configuration model
//!
//! The configuration is read from YAML (`config.yaml` plus an optional include
//! directory) into these types. Every field carries a default so that partial
//! files load; `sanitize` then fills in derived values.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub mod loader;
pub mod sanitize;

pub use loader::{find_config_file, load_config, ConfigError, ConfigSource};

/// Default port used for the single HTTP frontend
pub const DEFAULT_BASE_PORT: u16 = 1337;

/// An action as written in the configuration file (a template; see bindings).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Action {
    pub id: String,
    pub title: String,
    pub icon: String,
    pub shell: String,
    /// Direct argv form; takes precedence over `shell` when non-empty
    pub exec: Vec<String>,
    pub shell_after_completed: String,
    /// Seconds
    pub timeout: u64,
    pub acls: Vec<String>,
    pub entity: String,
    pub hidden: bool,
    pub exec_on_startup: bool,
    pub exec_on_cron: Vec<String>,
    pub exec_on_file_created_in_dir: Vec<String>,
    pub exec_on_file_changed_in_dir: Vec<String>,
    pub exec_on_calendar_file: String,
    pub exec_on_webhook: Vec<WebhookConfig>,
    pub triggers: Vec<String>,
    pub max_concurrent: usize,
    pub max_rate: Vec<RateSpec>,
    pub arguments: Vec<ActionArgument>,
    pub popup_on_start: String,
    pub save_logs: SaveLogsConfig,
    pub enabled_expression: String,
}

impl Action {
    /// Finds an argument by name, including the implicit ones available to
    /// `shellAfterCompleted`.
    pub fn find_arg(&self, name: &str) -> Option<ActionArgument> {
        if let Some(arg) = self.arguments.iter().find(|a| a.name == name) {
            return Some(arg.clone());
        }

        match name {
            "stdout" | "exitCode" => Some(ActionArgument {
                name: name.to_string(),
                arg_type: "very_dangerous_raw_string".to_string(),
                ..Default::default()
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionArgument {
    pub name: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub arg_type: String,
    pub default: String,
    pub choices: Vec<ActionArgumentChoice>,
    pub entity: String,
    pub reject_null: bool,
    pub suggestions: BTreeMap<String, String>,
    pub suggestions_browser_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionArgumentChoice {
    pub value: String,
    pub title: String,
}

/// At most `limit` executions per `duration` (e.g. `30s`, `5m`, `1h 30m`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateSpec {
    pub limit: usize,
    pub duration: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveLogsConfig {
    pub results_directory: String,
    pub output_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    /// Preset name such as `github-push`
    pub template: String,
    pub auth_type: String,
    pub auth_header: String,
    pub secret: String,
    pub match_headers: BTreeMap<String, String>,
    pub match_query: BTreeMap<String, String>,
    /// `<jsonpath>` or `<jsonpath>=<value>`
    pub match_path: String,
    /// Argument name to JSONPath
    pub extract: BTreeMap<String, String>,
}

/// A file of entity records, published under `name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityFile {
    pub file: String,
    pub name: String,
    pub icon: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionsList {
    pub view: bool,
    pub exec: bool,
    pub logs: bool,
    pub kill: bool,
}

impl PermissionsList {
    pub fn all() -> Self {
        Self {
            view: true,
            exec: true,
            logs: true,
            kill: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigurationPolicy {
    pub show_diagnostics: bool,
    pub show_log_list: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessControlList {
    pub name: String,
    pub add_to_every_action: bool,
    pub match_usergroups: Vec<String>,
    pub match_usernames: Vec<String>,
    pub permissions: PermissionsList,
    pub policy: ConfigurationPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthLocalUsersConfig {
    pub enabled: bool,
    pub users: Vec<LocalUser>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalUser {
    pub username: String,
    pub usergroup: String,
    /// Argon2id PHC string
    pub password: String,
}

/// Only the public face of an OAuth2 provider; the handshake itself is not served.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OAuth2Provider {
    pub title: String,
    pub icon: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NavigationLink {
    pub title: String,
    pub url: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusConfig {
    pub enabled: bool,
    pub default_go_metrics: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogDebugOptions {
    pub single_frontend_requests: bool,
    pub single_frontend_request_headers: bool,
    pub acl_check_started: bool,
    pub acl_matched: bool,
    pub acl_not_matched: bool,
    pub acl_none_matched: bool,
}

/// A node of a dashboard as written in YAML. The `type` string is resolved
/// into a [`ComponentKind`] when dashboards are rendered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardComponent {
    pub title: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub entity: String,
    pub icon: String,
    pub css_class: String,
    pub contents: Vec<DashboardComponent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Link,
    Directory,
    Fieldset,
    Display,
    StdoutMostRecentExecution,
}

impl DashboardComponent {
    pub fn kind(&self) -> ComponentKind {
        if !self.contents.is_empty() {
            if self.component_type == "fieldset" {
                return ComponentKind::Fieldset;
            }
            return ComponentKind::Directory;
        }

        match self.component_type.as_str() {
            "display" => ComponentKind::Display,
            "stdout-most-recent-execution" => ComponentKind::StdoutMostRecentExecution,
            _ => ComponentKind::Link,
        }
    }

    /// Leaves of type `link` (or untyped) are references to actions by title.
    pub fn is_link(&self) -> bool {
        self.component_type.is_empty() || self.component_type == "link"
    }
}

/// The global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[serde(rename = "listenAddressSingleHTTPFrontend")]
    pub listen_address_single_http_frontend: String,
    pub log_level: String,
    pub log_debug_options: LogDebugOptions,
    pub log_history_page_size: i64,
    pub actions: Vec<Action>,
    pub entities: Vec<EntityFile>,
    pub dashboards: Vec<DashboardComponent>,
    pub check_for_updates: bool,
    pub page_title: String,
    pub show_footer: bool,
    pub show_navigation: bool,
    pub show_new_versions: bool,
    pub show_navigate_on_start_icons: bool,
    pub enable_custom_js: bool,
    pub auth_http_header_username: String,
    pub auth_http_header_user_group: String,
    pub auth_http_header_user_group_sep: String,
    pub auth_local_users: AuthLocalUsersConfig,
    pub auth_login_url: String,
    pub auth_require_guests_to_login: bool,
    #[serde(rename = "authOAuth2Providers")]
    pub auth_oauth2_providers: BTreeMap<String, OAuth2Provider>,
    #[serde(deserialize_with = "permissions_over_all")]
    pub default_permissions: PermissionsList,
    #[serde(deserialize_with = "policy_over_all")]
    pub default_policy: ConfigurationPolicy,
    pub access_control_lists: Vec<AccessControlList>,
    pub cron_support_for_seconds: bool,
    pub section_navigation_style: String,
    pub default_popup_on_start: String,
    pub insecure_allow_dump_vars: bool,
    pub insecure_allow_dump_sos: bool,
    pub insecure_allow_dump_action_map: bool,
    pub prometheus: PrometheusConfig,
    pub save_logs: SaveLogsConfig,
    pub default_icon_for_actions: String,
    pub default_icon_for_directories: String,
    pub default_icon_for_back: String,
    pub additional_navigation_links: Vec<NavigationLink>,
    pub style_mods: Vec<String>,
    pub banner_message: String,
    pub banner_css: String,
    pub include: String,

    /// Directory of the primary config file; relative paths resolve against it
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_base_port(DEFAULT_BASE_PORT)
    }
}

impl Config {
    pub fn with_base_port(base_port: u16) -> Self {
        Self {
            listen_address_single_http_frontend: format!("0.0.0.0:{}", base_port),
            log_level: "INFO".to_string(),
            log_debug_options: LogDebugOptions::default(),
            log_history_page_size: 10,
            actions: Vec::new(),
            entities: Vec::new(),
            dashboards: Vec::new(),
            check_for_updates: false,
            page_title: "OliveTin".to_string(),
            show_footer: true,
            show_navigation: true,
            show_new_versions: true,
            show_navigate_on_start_icons: true,
            enable_custom_js: false,
            auth_http_header_username: String::new(),
            auth_http_header_user_group: String::new(),
            auth_http_header_user_group_sep: String::new(),
            auth_local_users: AuthLocalUsersConfig::default(),
            auth_login_url: String::new(),
            auth_require_guests_to_login: false,
            auth_oauth2_providers: BTreeMap::new(),
            default_permissions: PermissionsList::all(),
            default_policy: ConfigurationPolicy {
                show_diagnostics: true,
                show_log_list: true,
            },
            access_control_lists: Vec::new(),
            cron_support_for_seconds: false,
            section_navigation_style: "sidebar".to_string(),
            default_popup_on_start: "nothing".to_string(),
            insecure_allow_dump_vars: false,
            insecure_allow_dump_sos: false,
            insecure_allow_dump_action_map: false,
            prometheus: PrometheusConfig::default(),
            save_logs: SaveLogsConfig::default(),
            default_icon_for_actions: "&#x1F600;".to_string(),
            default_icon_for_directories: "&#128193".to_string(),
            default_icon_for_back: "&laquo;".to_string(),
            additional_navigation_links: Vec::new(),
            style_mods: Vec::new(),
            banner_message: String::new(),
            banner_css: String::new(),
            include: String::new(),
            config_dir: PathBuf::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn find_action_by_id(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn find_user_by_username(&self, username: &str) -> Option<&LocalUser> {
        self.auth_local_users
            .users
            .iter()
            .find(|u| u.username == username)
    }

    pub fn find_acl(&self, name: &str) -> Option<&AccessControlList> {
        self.access_control_lists.iter().find(|acl| acl.name == name)
    }

    /// Resolves a possibly relative path against the config directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() || self.config_dir.as_os_str().is_empty() {
            p.to_path_buf()
        } else {
            self.config_dir.join(p)
        }
    }
}

// `defaultPermissions` and `defaultPolicy` start from "everything allowed", so
// a partial mapping only switches off the keys it names.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialPermissions {
    view: Option<bool>,
    exec: Option<bool>,
    logs: Option<bool>,
    kill: Option<bool>,
}

fn permissions_over_all<'de, D>(deserializer: D) -> Result<PermissionsList, D::Error>
where
    D: Deserializer<'de>,
{
    let partial = PartialPermissions::deserialize(deserializer)?;
    Ok(PermissionsList {
        view: partial.view.unwrap_or(true),
        exec: partial.exec.unwrap_or(true),
        logs: partial.logs.unwrap_or(true),
        kill: partial.kill.unwrap_or(true),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialPolicy {
    show_diagnostics: Option<bool>,
    show_log_list: Option<bool>,
}

fn policy_over_all<'de, D>(deserializer: D) -> Result<ConfigurationPolicy, D::Error>
where
    D: Deserializer<'de>,
{
    let partial = PartialPolicy::deserialize(deserializer)?;
    Ok(ConfigurationPolicy {
        show_diagnostics: partial.show_diagnostics.unwrap_or(true),
        show_log_list: partial.show_log_list.unwrap_or(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_default_permissions_keep_unnamed_bits() {
        let cfg: Config = serde_yaml_ng::from_str("defaultPermissions:\n  exec: false\n").unwrap();

        assert_eq!(
            cfg.default_permissions,
            PermissionsList {
                view: true,
                exec: false,
                logs: true,
                kill: true,
            }
        );
    }

    #[test]
    fn test_acl_permissions_default_to_denied() {
        let yaml = r#"
accessControlLists:
  - name: admins
    matchUsergroups: [admin]
    permissions:
      view: true
"#;
        let cfg: Config = serde_yaml_ng::from_str(yaml).unwrap();
        let acl = cfg.find_acl("admins").unwrap();

        assert!(acl.permissions.view);
        assert!(!acl.permissions.exec);
        assert!(!acl.policy.show_diagnostics);
    }

    #[test]
    fn test_defaults_for_empty_document() {
        let cfg: Config = serde_yaml_ng::from_str("{}").unwrap();

        assert_eq!(cfg.log_history_page_size, 10);
        assert_eq!(cfg.listen_address_single_http_frontend, "0.0.0.0:1337");
        assert!(cfg.default_policy.show_log_list);
        assert_eq!(cfg.default_popup_on_start, "nothing");
    }

    #[test]
    fn test_component_kind_resolution() {
        let leaf = DashboardComponent {
            title: "Ping".into(),
            ..Default::default()
        };
        let dir = DashboardComponent {
            title: "Tools".into(),
            contents: vec![leaf.clone()],
            ..Default::default()
        };
        let fieldset = DashboardComponent {
            component_type: "fieldset".into(),
            contents: vec![leaf.clone()],
            ..Default::default()
        };
        let display = DashboardComponent {
            component_type: "display".into(),
            ..Default::default()
        };

        assert_eq!(leaf.kind(), ComponentKind::Link);
        assert_eq!(dir.kind(), ComponentKind::Directory);
        assert_eq!(fieldset.kind(), ComponentKind::Fieldset);
        assert_eq!(display.kind(), ComponentKind::Display);
    }

    #[test]
    fn test_find_arg_implicit_names() {
        let action = Action::default();

        assert_eq!(
            action.find_arg("exitCode").map(|a| a.arg_type),
            Some("very_dangerous_raw_string".to_string())
        );
        assert!(action.find_arg("nope").is_none());
    }
}
