//! Control-plane API over HTTP
//!
//! Every operation is `POST /api/<Operation>` with a camelCase JSON body.
//! The caller is resolved from headers and cookies by [`crate::auth`] before
//! the handler runs. Webhooks and the readiness probe share the router.

pub mod dashboards;
pub mod error;
pub mod types;

use crate::acl::{self, AuthenticatedUser};
use crate::auth::{self, local, sessions::SessionStore, LOCAL_SESSION_COOKIE, OAUTH2_SESSION_COOKIE};
use crate::config::Config;
use crate::events::EventBus;
use crate::executor::arguments::{self, retain_declared};
use crate::executor::bindings::ActionBinding;
use crate::executor::logs::InternalLogEntry;
use crate::executor::{ExecutionRequest, Executor};
use crate::installation;
use crate::tpl;
use crate::webhooks::{self, WebhookRequest};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use dashboards::{entity_directories, used_on_dashboards, RenderContext};
use error::ApiError;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use types::*;

type ApiResult<T> = Result<Json<T>, ApiError>;

const SOS_REPORT_LOGGED: &str = "Your SOS Report has been logged to OliveTin logs.\n\nIf you are in a safe network, you can temporarily set `insecureAllowDumpSos: true` in your config.yaml, restart OliveTin, and refresh this page - it will put the output directly in the browser.";

/// Shared state behind every handler.
pub struct ApiState {
    pub executor: Arc<Executor>,
    pub sessions: Arc<SessionStore>,
    pub events: Arc<EventBus>,
    /// Ends open event streams so the server can drain
    pub shutdown: CancellationToken,
}

impl ApiState {
    async fn caller(&self, headers: &HeaderMap, operation: &str) -> (Arc<Config>, AuthenticatedUser) {
        let cfg = self.executor.config().await;

        if cfg.log_debug_options.single_frontend_request_headers {
            debug!(operation, headers = ?headers, "API request headers");
        }

        let user = auth::user_from_request(&cfg, headers, &self.sessions).await;

        if cfg.log_debug_options.single_frontend_requests {
            debug!(operation, username = %user.username, "API request");
        }

        (cfg, user)
    }

    /// Wire form of a log entry, with the fields that depend on the caller
    /// and on the rest of the log store.
    async fn api_log_entry(&self, cfg: &Config, user: &AuthenticatedUser, entry: &InternalLogEntry) -> LogEntry {
        let mut out = LogEntry::from_internal(entry);

        if let Some(binding) = &entry.binding {
            out.datetime_rate_limit_expires = format_unix(self.executor.get_time_until_available(binding).await);
            out.can_kill = !entry.execution_finished && acl::is_allowed_kill(cfg, user, &binding.action);
        }

        out
    }

    async fn find_binding(&self, binding_id: &str) -> Result<Arc<ActionBinding>, ApiError> {
        self.executor
            .find_binding_by_id(binding_id)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("action not found: {}", binding_id)))
    }

    /// Starts `binding` and returns its tracking ID straight away.
    async fn start(
        &self,
        binding: Arc<ActionBinding>,
        user: AuthenticatedUser,
        arguments: BTreeMap<String, String>,
        tracking_id: &str,
    ) -> crate::executor::ExecutionHandle {
        let arguments = retain_declared(&binding.action, arguments);
        let req = ExecutionRequest::new(Some(binding), user)
            .with_arguments(arguments)
            .with_tracking_id(tracking_id);

        self.executor.exec_request(req).await
    }

    /// Starts `binding` and waits for it to finish.
    async fn start_and_wait(
        &self,
        cfg: &Config,
        binding: Arc<ActionBinding>,
        user: AuthenticatedUser,
        arguments: BTreeMap<String, String>,
    ) -> Result<LogEntry, ApiError> {
        let handle = self.start(binding, user.clone(), arguments, "").await;
        let tracking_id = handle.tracking_id.clone();
        handle.wait().await;

        let entry = self
            .executor
            .logs()
            .get(&tracking_id)
            .await
            .ok_or_else(|| ApiError::Internal(format!("execution vanished: {}", tracking_id)))?;
        let snapshot = entry.read().await.clone();

        Ok(self.api_log_entry(cfg, &user, &snapshot).await)
    }
}

/// Guests are turned away when the config demands a login.
fn check_dashboard_access(cfg: &Config, user: &AuthenticatedUser) -> Result<(), ApiError> {
    if cfg.auth_require_guests_to_login && user.is_guest() {
        return Err(ApiError::guests_denied());
    }
    Ok(())
}

/// An empty body is the same as `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/Init", post(init))
        .route("/api/GetDashboard", post(get_dashboard))
        .route("/api/GetActionBinding", post(get_action_binding))
        .route("/api/StartAction", post(start_action))
        .route("/api/StartActionAndWait", post(start_action_and_wait))
        .route("/api/StartActionByGet", post(start_action_by_get))
        .route("/api/StartActionByGet/:binding_id", get(start_action_by_get_path))
        .route("/api/StartActionByGetAndWait", post(start_action_by_get_and_wait))
        .route("/api/StartActionByGetAndWait/:binding_id", get(start_action_by_get_and_wait_path))
        .route("/api/RestartAction", post(restart_action))
        .route("/api/KillAction", post(kill_action))
        .route("/api/ExecutionStatus", post(execution_status))
        .route("/api/GetLogs", post(get_logs))
        .route("/api/GetActionLogs", post(get_action_logs))
        .route("/api/ValidateArgumentType", post(validate_argument_type))
        .route("/api/WhoAmI", post(who_am_i))
        .route("/api/GetEntities", post(get_entities))
        .route("/api/GetEntity", post(get_entity))
        .route("/api/PasswordHash", post(password_hash))
        .route("/api/LocalUserLogin", post(local_user_login))
        .route("/api/Logout", post(logout))
        .route("/api/DumpVars", post(dump_vars))
        .route("/api/DumpPublicIdActionMap", post(dump_public_id_action_map))
        .route("/api/SosReport", post(sos_report))
        .route("/api/GetDiagnostics", post(get_diagnostics))
        .route("/api/GetReadyz", post(get_readyz))
        .route("/api/EventStream", get(event_stream).post(event_stream))
        .route("/webhooks", any(webhook).layer(DefaultBodyLimit::max(webhooks::MAX_REQUEST_BYTES)))
        .route(
            "/webhooks/*path",
            any(webhook).layer(DefaultBodyLimit::max(webhooks::MAX_REQUEST_BYTES)),
        )
        .route("/readyz", get(|| async { "OK" }))
        .with_state(state)
}

async fn init(State(api): State<Arc<ApiState>>, headers: HeaderMap) -> ApiResult<InitResponse> {
    let (cfg, user) = api.caller(&headers, "Init").await;
    let ctx = RenderContext::new(&api.executor, &cfg, &user).await;

    Ok(Json(InitResponse {
        show_footer: cfg.show_footer,
        show_navigation: cfg.show_navigation,
        show_new_versions: cfg.show_new_versions,
        current_version: installation::BUILD.version.clone(),
        page_title: cfg.page_title.clone(),
        section_navigation_style: cfg.section_navigation_style.clone(),
        default_icon_for_back: cfg.default_icon_for_back.clone(),
        enable_custom_js: cfg.enable_custom_js,
        auth_login_url: cfg.auth_login_url.clone(),
        auth_local_login: cfg.auth_local_users.enabled,
        oauth2_providers: cfg
            .auth_oauth2_providers
            .iter()
            .map(|(key, provider)| PublicOAuth2Provider {
                title: provider.title.clone(),
                icon: provider.icon.clone(),
                key: key.clone(),
            })
            .collect(),
        additional_links: cfg
            .additional_navigation_links
            .iter()
            .map(|link| AdditionalLink {
                title: link.title.clone(),
                url: link.url.clone(),
                target: link.target.clone(),
            })
            .collect(),
        style_mods: cfg.style_mods.clone(),
        root_dashboards: ctx.root_dashboards(),
        authenticated_user: user.username.clone(),
        authenticated_user_provider: user.provider.clone(),
        effective_policy: user.effective_policy,
        banner_message: cfg.banner_message.clone(),
        banner_css: cfg.banner_css.clone(),
        show_diagnostics: user.effective_policy.show_diagnostics,
        show_log_list: user.effective_policy.show_log_list,
        login_required: cfg.auth_require_guests_to_login && user.is_guest(),
        show_navigate_on_start_icons: cfg.show_navigate_on_start_icons,
    }))
}

async fn get_dashboard(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<GetDashboardResponse> {
    let req: GetDashboardRequest = parse_body(&body)?;
    let (cfg, user) = api.caller(&headers, "GetDashboard").await;
    check_dashboard_access(&cfg, &user)?;

    let ctx = RenderContext::new(&api.executor, &cfg, &user).await;
    let dashboard = ctx
        .dashboard(&req.title, &req.entity_type, &req.entity_key)
        .ok_or_else(|| ApiError::NotFound(format!("dashboard not found: {}", req.title)))?;

    Ok(Json(GetDashboardResponse { dashboard }))
}

async fn get_action_binding(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<GetActionBindingResponse> {
    let req: BindingRequest = parse_body(&body)?;
    let (cfg, user) = api.caller(&headers, "GetActionBinding").await;
    check_dashboard_access(&cfg, &user)?;

    let binding = api.find_binding(&req.binding_id).await?;
    let ctx = RenderContext::new(&api.executor, &cfg, &user).await;

    Ok(Json(GetActionBindingResponse {
        action: ctx.build_action(&binding),
    }))
}

async fn start_action(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StartActionResponse> {
    let req: StartActionRequest = parse_body(&body)?;
    let (_, user) = api.caller(&headers, "StartAction").await;

    let binding = api.find_binding(&req.binding_id).await?;
    let handle = api
        .start(binding, user, req.argument_map(), &req.unique_tracking_id)
        .await;

    Ok(Json(StartActionResponse {
        execution_tracking_id: handle.tracking_id,
    }))
}

async fn start_action_and_wait(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<LogEntryResponse> {
    let req: StartActionRequest = parse_body(&body)?;
    let (cfg, user) = api.caller(&headers, "StartActionAndWait").await;

    let binding = api.find_binding(&req.binding_id).await?;
    let log_entry = api.start_and_wait(&cfg, binding, user, req.argument_map()).await?;

    Ok(Json(LogEntryResponse { log_entry }))
}

async fn start_by_get(api: &ApiState, headers: &HeaderMap, binding_id: &str) -> ApiResult<StartActionResponse> {
    let (_, user) = api.caller(headers, "StartActionByGet").await;

    let binding = api.find_binding(binding_id).await?;
    let handle = api.start(binding, user, BTreeMap::new(), "").await;

    Ok(Json(StartActionResponse {
        execution_tracking_id: handle.tracking_id,
    }))
}

async fn start_action_by_get(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StartActionResponse> {
    let req: BindingRequest = parse_body(&body)?;
    start_by_get(&api, &headers, &req.binding_id).await
}

async fn start_action_by_get_path(
    State(api): State<Arc<ApiState>>,
    Path(binding_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StartActionResponse> {
    start_by_get(&api, &headers, &binding_id).await
}

async fn start_by_get_and_wait(api: &ApiState, headers: &HeaderMap, binding_id: &str) -> ApiResult<LogEntryResponse> {
    let (cfg, user) = api.caller(headers, "StartActionByGetAndWait").await;

    let binding = api.find_binding(binding_id).await?;
    let log_entry = api.start_and_wait(&cfg, binding, user, BTreeMap::new()).await?;

    Ok(Json(LogEntryResponse { log_entry }))
}

async fn start_action_by_get_and_wait(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<LogEntryResponse> {
    let req: BindingRequest = parse_body(&body)?;
    start_by_get_and_wait(&api, &headers, &req.binding_id).await
}

async fn start_action_by_get_and_wait_path(
    State(api): State<Arc<ApiState>>,
    Path(binding_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<LogEntryResponse> {
    start_by_get_and_wait(&api, &headers, &binding_id).await
}

async fn restart_action(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StartActionResponse> {
    let req: TrackingIdRequest = parse_body(&body)?;
    let (_, user) = api.caller(&headers, "RestartAction").await;

    let Some(handle) = api.executor.logs().get(&req.execution_tracking_id).await else {
        warn!(tracking_id = %req.execution_tracking_id, "Cannot restart execution, tracking ID not found");
        return Err(ApiError::NotFound(format!(
            "execution not found: {}",
            req.execution_tracking_id
        )));
    };

    let (binding, arguments) = {
        let entry = handle.read().await;
        (entry.binding.clone(), entry.arguments.clone())
    };

    let Some(binding) = binding else {
        return Err(ApiError::NotFound(format!(
            "action of execution not found: {}",
            req.execution_tracking_id
        )));
    };

    info!(tracking_id = %req.execution_tracking_id, binding_id = %binding.id, "Restarting execution");
    let started = api.start(binding, user, arguments, "").await;

    Ok(Json(StartActionResponse {
        execution_tracking_id: started.tracking_id,
    }))
}

async fn kill_action(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<KillActionResponse> {
    let req: TrackingIdRequest = parse_body(&body)?;
    let (_, user) = api.caller(&headers, "KillAction").await;

    let result = api.executor.kill(&req.execution_tracking_id, &user).await;

    Ok(Json(KillActionResponse {
        execution_tracking_id: req.execution_tracking_id,
        found: result.found,
        killed: result.killed,
        already_completed: result.already_completed,
    }))
}

async fn execution_status(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<LogEntryResponse> {
    let req: ExecutionStatusRequest = parse_body(&body)?;
    let (cfg, user) = api.caller(&headers, "ExecutionStatus").await;
    check_dashboard_access(&cfg, &user)?;

    let handle = if !req.execution_tracking_id.is_empty() {
        api.executor.logs().get(&req.execution_tracking_id).await
    } else {
        match api.executor.find_binding_by_id(&req.action_id).await {
            Some(binding) => api.executor.logs().by_binding(&binding.id).await.pop(),
            None => None,
        }
    };

    let Some(handle) = handle else {
        return Err(ApiError::NotFound(format!(
            "execution not found by tracking ID {:?} or action ID {:?}",
            req.execution_tracking_id, req.action_id
        )));
    };

    let snapshot = handle.read().await.clone();
    let log_entry = api.api_log_entry(&cfg, &user, &snapshot).await;

    Ok(Json(LogEntryResponse { log_entry }))
}

async fn get_logs(State(api): State<Arc<ApiState>>, headers: HeaderMap, body: Bytes) -> ApiResult<LogsResponse> {
    let req: GetLogsRequest = parse_body(&body)?;
    let (cfg, user) = api.caller(&headers, "GetLogs").await;
    check_dashboard_access(&cfg, &user)?;

    let (entries, paging) = api
        .executor
        .get_log_tracking_ids_acl(&user, req.start_offset, cfg.log_history_page_size, &req.date_filter)
        .await;

    let mut logs = Vec::with_capacity(entries.len());
    for entry in &entries {
        logs.push(api.api_log_entry(&cfg, &user, entry).await);
    }

    Ok(Json(LogsResponse::new(logs, paging)))
}

async fn get_action_logs(
    State(api): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<LogsResponse> {
    let req: GetActionLogsRequest = parse_body(&body)?;
    let (cfg, user) = api.caller(&headers, "GetActionLogs").await;
    check_dashboard_access(&cfg, &user)?;

    let binding = api.find_binding(&req.binding_id).await?;
    let (entries, paging) = api
        .executor
        .get_action_logs_acl(&binding, &user, req.start_offset, cfg.log_history_page_size)
        .await;

    let mut logs = Vec::with_capacity(entries.len());
    for entry in &entries {
        logs.push(api.api_log_entry(&cfg, &user, entry).await);
    }

    Ok(Json(LogsResponse::new(logs, paging)))
}

async fn validate_argument_type(
    State(api): State<Arc<ApiState>>,
    body: Bytes,
) -> ApiResult<ValidateArgumentTypeResponse> {
    let req: ValidateArgumentTypeRequest = parse_body(&body)?;

    let result = if req.binding_id.is_empty() || req.argument_name.is_empty() {
        arguments::type_safety_check("", &req.value, &req.arg_type).map_err(|e| e.to_string())
    } else {
        let arg = api
            .executor
            .find_binding_by_id(&req.binding_id)
            .await
            .and_then(|binding| binding.action.arguments.iter().find(|a| a.name == req.argument_name).cloned());

        match arg {
            Some(arg) => {
                let value = arguments::mangle_argument_value(&arg, &req.value);
                arguments::typecheck_action_argument(&arg, &value, api.executor.entities())
                    .await
                    .map_err(|e| e.to_string())
            }
            None => Err("argument not found".to_string()),
        }
    };

    Ok(Json(match result {
        Ok(()) => ValidateArgumentTypeResponse {
            valid: true,
            description: String::new(),
        },
        Err(description) => ValidateArgumentTypeResponse {
            valid: false,
            description,
        },
    }))
}

async fn who_am_i(State(api): State<Arc<ApiState>>, headers: HeaderMap) -> ApiResult<WhoAmIResponse> {
    let (cfg, user) = api.caller(&headers, "WhoAmI").await;
    check_dashboard_access(&cfg, &user)?;

    Ok(Json(WhoAmIResponse {
        authenticated_user: user.username,
        usergroup: user.usergroup_line,
        provider: user.provider,
        sid: user.sid,
        acls: user.acls,
    }))
}

fn field_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn get_entities(State(api): State<Arc<ApiState>>, headers: HeaderMap) -> ApiResult<GetEntitiesResponse> {
    let (cfg, user) = api.caller(&headers, "GetEntities").await;
    check_dashboard_access(&cfg, &user)?;

    let entity_definitions = api
        .executor
        .entities()
        .get_entities()
        .await
        .into_iter()
        .map(|(name, instances)| {
            let mut instances: Vec<ApiEntity> = instances
                .iter()
                .map(|e| ApiEntity {
                    title: e.title.clone(),
                    unique_key: e.unique_key.clone(),
                    entity_type: name.clone(),
                    ..Default::default()
                })
                .collect();
            instances.sort_by(|a, b| a.unique_key.cmp(&b.unique_key));

            EntityDefinition {
                title: name.clone(),
                used_on_dashboards: used_on_dashboards(&name, &cfg.dashboards),
                instances,
            }
        })
        .collect();

    Ok(Json(GetEntitiesResponse { entity_definitions }))
}

async fn get_entity(State(api): State<Arc<ApiState>>, headers: HeaderMap, body: Bytes) -> ApiResult<ApiEntity> {
    let req: GetEntityRequest = parse_body(&body)?;
    let (cfg, user) = api.caller(&headers, "GetEntity").await;
    check_dashboard_access(&cfg, &user)?;

    let entities = api.executor.entities();
    if entities.get_entity_instances(&req.entity_type).await.is_empty() {
        return Err(ApiError::NotFound(format!("entity type {} not found", req.entity_type)));
    }

    let entity = entities
        .get_entity(&req.entity_type, &req.unique_key)
        .await
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "entity with unique key {} not found in type {}",
                req.unique_key, req.entity_type
            ))
        })?;

    let fields = match &entity.data {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), field_to_string(v))).collect(),
        _ => BTreeMap::new(),
    };

    Ok(Json(ApiEntity {
        title: entity.title.clone(),
        unique_key: entity.unique_key.clone(),
        entity_type: req.entity_type.clone(),
        directories: entity_directories(&req.entity_type, &cfg.dashboards),
        fields,
    }))
}

async fn password_hash(body: Bytes) -> ApiResult<PasswordHashResponse> {
    let req: PasswordHashRequest = parse_body(&body)?;

    let hash = tokio::task::spawn_blocking(move || local::create_hash(&req.password))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(PasswordHashResponse { hash }))
}

async fn local_user_login(State(api): State<Arc<ApiState>>, body: Bytes) -> Result<Response, ApiError> {
    let req: LocalUserLoginRequest = parse_body(&body)?;
    let cfg = api.executor.config().await;

    if !cfg.auth_local_users.enabled {
        return Ok(Json(LocalUserLoginResponse { success: false }).into_response());
    }

    let username = req.username.clone();
    let check_cfg = Arc::clone(&cfg);
    let matched = tokio::task::spawn_blocking(move || local::check_user_password(&check_cfg, &req.username, &req.password))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if !matched {
        warn!(target: "audit", username = %username, "Local user login failed");
        return Ok(Json(LocalUserLoginResponse { success: false }).into_response());
    }

    let sid = uuid::Uuid::new_v4().to_string();
    api.sessions.register("local", &sid, &username).await;
    info!(username = %username, "Local user logged in, session registered");

    Ok((
        AppendHeaders([(SET_COOKIE, auth::session_cookie(&sid))]),
        Json(LocalUserLoginResponse { success: true }),
    )
        .into_response())
}

async fn logout(State(api): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    let (_, user) = api.caller(&headers, "Logout").await;

    if user.provider == "local" && !user.sid.is_empty() {
        api.sessions.revoke("local", &user.sid).await;
    }

    info!(username = %user.username, provider = %user.provider, "User logged out");

    (
        AppendHeaders([
            (SET_COOKIE, auth::expired_cookie(LOCAL_SESSION_COOKIE)),
            (SET_COOKIE, auth::expired_cookie(OAUTH2_SESSION_COOKIE)),
        ]),
        Json(Empty {}),
    )
        .into_response()
}

async fn dump_vars(State(api): State<Arc<ApiState>>) -> ApiResult<AlertResponse> {
    let cfg = api.executor.config().await;

    if !cfg.insecure_allow_dump_vars {
        return Ok(Json(AlertResponse {
            alert: "Dumping variables is not allowed by default because it is insecure.".to_string(),
        }));
    }

    match serde_json::to_string_pretty(&tpl::general_context()) {
        Ok(vars) => info!(vars = %vars, "Dumping template variables"),
        Err(e) => warn!(error = %e, "Could not serialise template variables"),
    }

    Ok(Json(AlertResponse {
        alert: "Dumping variables has been enabled in the configuration. Please set InsecureAllowDumpVars = false again after you don't need it anymore".to_string(),
    }))
}

async fn dump_public_id_action_map(State(api): State<Arc<ApiState>>) -> ApiResult<DumpPublicIdActionMapResponse> {
    let cfg = api.executor.config().await;

    if !cfg.insecure_allow_dump_action_map {
        return Ok(Json(DumpPublicIdActionMapResponse {
            alert: "Dumping Public IDs is disallowed.".to_string(),
            contents: BTreeMap::new(),
        }));
    }

    let contents = api
        .executor
        .bindings()
        .all()
        .await
        .iter()
        .map(|b| {
            (
                b.id.clone(),
                DebugBinding {
                    action_title: b.action.title.clone(),
                },
            )
        })
        .collect();

    Ok(Json(DumpPublicIdActionMapResponse {
        alert: "Dumping variables has been enabled in the configuration. Please set InsecureAllowDumpActionMap = false again after you don't need it anymore".to_string(),
        contents,
    }))
}

async fn get_diagnostics(State(api): State<Arc<ApiState>>, headers: HeaderMap) -> ApiResult<GetDiagnosticsResponse> {
    let (_, user) = api.caller(&headers, "GetDiagnostics").await;

    if !user.effective_policy.show_diagnostics {
        return Ok(Json(GetDiagnosticsResponse::default()));
    }

    let ssh = installation::ssh_diagnostics();
    Ok(Json(GetDiagnosticsResponse {
        ssh_found_key: ssh.found_key,
        ssh_found_config: ssh.found_config,
    }))
}

async fn sos_report(State(api): State<Arc<ApiState>>) -> ApiResult<AlertResponse> {
    let cfg = api.executor.config().await;
    let report = installation::sos_report(&cfg);

    if !cfg.insecure_allow_dump_sos {
        info!("{}", report);
        return Ok(Json(AlertResponse {
            alert: SOS_REPORT_LOGGED.to_string(),
        }));
    }

    Ok(Json(AlertResponse { alert: report }))
}

async fn get_readyz() -> ApiResult<ReadyzResponse> {
    Ok(Json(ReadyzResponse {
        status: "OK".to_string(),
    }))
}

async fn event_stream(State(api): State<Arc<ApiState>>, headers: HeaderMap) -> Result<Response, ApiError> {
    let (cfg, user) = api.caller(&headers, "EventStream").await;
    check_dashboard_access(&cfg, &user)?;

    let subscription = api.events.subscribe(user).await;

    // The bus drops the client on its next send once `rx` is gone.
    let stream = futures::stream::unfold(subscription.rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((SseEvent::default().json_data(&event), rx))
    })
    .take_until(api.shutdown.clone().cancelled_owned());

    Ok((
        [("X-Accel-Buffering", "no")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response())
}

async fn webhook(State(api): State<Arc<ApiState>>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let mut header_map = BTreeMap::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            header_map
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let request = WebhookRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or("").to_string(),
        headers: header_map,
        body: body.to_vec(),
    };

    let started = webhooks::handle_webhook(&api.executor, request).await;
    debug!(started = started.len(), path = %uri.path(), "Webhook handled");

    "OK".into_response()
}
