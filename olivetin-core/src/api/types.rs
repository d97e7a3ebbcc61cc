//! Wire types of the control-plane API
//!
//! All bodies are camelCase JSON. Requests default every field so that an
//! empty body (or `{}`) is always accepted.

use crate::config::ConfigurationPolicy;
use crate::executor::logs::{InternalLogEntry, PagingResult};
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Local wall-clock time, or empty.
pub fn format_datetime(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.with_timezone(&Local).format(DATETIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// Unix seconds as local wall-clock time; `0` (not limited) is empty.
pub fn format_unix(secs: i64) -> String {
    if secs <= 0 {
        return String::new();
    }

    match Local.timestamp_opt(secs, 0).single() {
        Some(t) => t.format(DATETIME_FORMAT).to_string(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEntry {
    pub action_title: String,
    pub action_icon: String,
    pub datetime_started: String,
    pub datetime_finished: String,
    pub datetime_index: usize,
    pub output: String,
    pub timed_out: bool,
    pub blocked: bool,
    pub exit_code: i32,
    pub tags: Vec<String>,
    pub execution_tracking_id: String,
    pub execution_started: bool,
    pub execution_finished: bool,
    pub user: String,
    pub binding_id: String,
    pub datetime_rate_limit_expires: String,
    pub can_kill: bool,
}

impl LogEntry {
    /// Caller-independent view. `can_kill` and `datetime_rate_limit_expires`
    /// are filled in by the API, which knows who is asking.
    pub fn from_internal(entry: &InternalLogEntry) -> Self {
        Self {
            action_title: entry.action_title.clone(),
            action_icon: entry.action_icon.clone(),
            datetime_started: format_datetime(entry.datetime_started),
            datetime_finished: format_datetime(entry.datetime_finished),
            datetime_index: entry.index,
            output: entry.output.clone(),
            timed_out: entry.timed_out,
            blocked: entry.blocked,
            exit_code: entry.exit_code,
            tags: entry.tags.clone(),
            execution_tracking_id: entry.execution_tracking_id.clone(),
            execution_started: entry.execution_started,
            execution_finished: entry.execution_finished,
            user: entry.username.clone(),
            binding_id: entry.binding_id.clone(),
            datetime_rate_limit_expires: String::new(),
            can_kill: false,
        }
    }
}

/// An action as the UI sees it: one per binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiAction {
    pub binding_id: String,
    pub title: String,
    pub icon: String,
    pub can_exec: bool,
    pub popup_on_start: String,
    pub order: usize,
    pub timeout: u64,
    pub datetime_rate_limit_expires: String,
    pub arguments: Vec<ApiActionArgument>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiActionArgument {
    pub name: String,
    pub title: String,
    #[serde(rename = "type")]
    pub arg_type: String,
    pub description: String,
    pub default_value: String,
    pub choices: Vec<ApiArgumentChoice>,
    pub suggestions: BTreeMap<String, String>,
    pub suggestions_browser_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiArgumentChoice {
    pub value: String,
    pub title: String,
}

/// A rendered dashboard node, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DashboardNode {
    Link {
        title: String,
        icon: String,
        #[serde(default)]
        css_class: String,
        action: ApiAction,
    },
    Directory {
        title: String,
        icon: String,
        #[serde(default)]
        css_class: String,
        contents: Vec<DashboardNode>,
        #[serde(default)]
        entity_type: String,
        #[serde(default)]
        entity_key: String,
    },
    Fieldset {
        title: String,
        #[serde(default)]
        css_class: String,
        contents: Vec<DashboardNode>,
        #[serde(default)]
        entity_type: String,
        #[serde(default)]
        entity_key: String,
    },
    Display {
        title: String,
        #[serde(default)]
        css_class: String,
    },
    StdoutMostRecentExecution {
        title: String,
        #[serde(default)]
        css_class: String,
        action: ApiAction,
    },
}

impl DashboardNode {
    pub fn title(&self) -> &str {
        match self {
            DashboardNode::Link { title, .. }
            | DashboardNode::Directory { title, .. }
            | DashboardNode::Fieldset { title, .. }
            | DashboardNode::Display { title, .. }
            | DashboardNode::StdoutMostRecentExecution { title, .. } => title,
        }
    }

    pub fn action(&self) -> Option<&ApiAction> {
        match self {
            DashboardNode::Link { action, .. } | DashboardNode::StdoutMostRecentExecution { action, .. } => Some(action),
            _ => None,
        }
    }

    pub fn contents(&self) -> &[DashboardNode] {
        match self {
            DashboardNode::Directory { contents, .. } | DashboardNode::Fieldset { contents, .. } => contents,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dashboard {
    pub title: String,
    pub contents: Vec<DashboardNode>,
}

// Init

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublicOAuth2Provider {
    pub title: String,
    pub icon: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdditionalLink {
    pub title: String,
    pub url: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitResponse {
    pub show_footer: bool,
    pub show_navigation: bool,
    pub show_new_versions: bool,
    pub current_version: String,
    pub page_title: String,
    pub section_navigation_style: String,
    pub default_icon_for_back: String,
    pub enable_custom_js: bool,
    pub auth_login_url: String,
    pub auth_local_login: bool,
    #[serde(rename = "oAuth2Providers")]
    pub oauth2_providers: Vec<PublicOAuth2Provider>,
    pub additional_links: Vec<AdditionalLink>,
    pub style_mods: Vec<String>,
    pub root_dashboards: Vec<String>,
    pub authenticated_user: String,
    pub authenticated_user_provider: String,
    pub effective_policy: ConfigurationPolicy,
    pub banner_message: String,
    pub banner_css: String,
    pub show_diagnostics: bool,
    pub show_log_list: bool,
    pub login_required: bool,
    pub show_navigate_on_start_icons: bool,
}

// Dashboards and bindings

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetDashboardRequest {
    pub title: String,
    pub entity_type: String,
    pub entity_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetDashboardResponse {
    pub dashboard: Dashboard,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindingRequest {
    #[serde(alias = "actionId")]
    pub binding_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetActionBindingResponse {
    pub action: ApiAction,
}

// Starting and stopping

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartActionArgument {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartActionRequest {
    #[serde(alias = "actionId")]
    pub binding_id: String,
    pub arguments: Vec<StartActionArgument>,
    pub unique_tracking_id: String,
}

impl StartActionRequest {
    pub fn argument_map(&self) -> BTreeMap<String, String> {
        self.arguments
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartActionResponse {
    pub execution_tracking_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEntryResponse {
    pub log_entry: LogEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackingIdRequest {
    pub execution_tracking_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KillActionResponse {
    pub execution_tracking_id: String,
    pub found: bool,
    pub killed: bool,
    pub already_completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionStatusRequest {
    pub execution_tracking_id: String,
    pub action_id: String,
}

// Logs

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetLogsRequest {
    pub start_offset: i64,
    pub date_filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetActionLogsRequest {
    #[serde(alias = "actionId")]
    pub binding_id: String,
    pub start_offset: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogsResponse {
    pub logs: Vec<LogEntry>,
    pub count_remaining: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub start_offset: usize,
}

impl LogsResponse {
    pub fn new(logs: Vec<LogEntry>, paging: PagingResult) -> Self {
        Self {
            logs,
            count_remaining: paging.count_remaining,
            page_size: paging.page_size,
            total_count: paging.total_count,
            start_offset: paging.start_offset,
        }
    }
}

// Arguments

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidateArgumentTypeRequest {
    pub value: String,
    #[serde(rename = "type")]
    pub arg_type: String,
    pub binding_id: String,
    pub argument_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidateArgumentTypeResponse {
    pub valid: bool,
    pub description: String,
}

// Identity and login

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhoAmIResponse {
    pub authenticated_user: String,
    pub usergroup: String,
    pub provider: String,
    pub sid: String,
    pub acls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PasswordHashRequest {
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PasswordHashResponse {
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalUserLoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalUserLoginResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

// Entities

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiEntity {
    pub title: String,
    pub unique_key: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityDefinition {
    pub title: String,
    pub used_on_dashboards: Vec<String>,
    pub instances: Vec<ApiEntity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetEntitiesResponse {
    pub entity_definitions: Vec<EntityDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetEntityRequest {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub unique_key: String,
}

// Diagnostics

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertResponse {
    pub alert: String,
}

/// Empty unless the caller's policy allows diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetDiagnosticsResponse {
    pub ssh_found_key: String,
    pub ssh_found_config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugBinding {
    pub action_title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DumpPublicIdActionMapResponse {
    pub alert: String,
    pub contents: BTreeMap<String, DebugBinding>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadyzResponse {
    pub status: String,
}
