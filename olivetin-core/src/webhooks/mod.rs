//! Inbound webhooks
//!
//! Every `execOnWebhook` entry of every action is tried against the request:
//! presets are applied, the entry must match, the request must authenticate,
//! then arguments are extracted and the action is started with tag `webhook`.
//! The caller always receives `OK`; failures only show up in the logs.

pub mod auth;
pub mod github;
pub mod jsonpath;
pub mod matcher;

use crate::acl::AuthenticatedUser;
use crate::config::{Action, WebhookConfig};
use crate::executor::{ExecutionHandle, ExecutionRequest, Executor};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Larger bodies are truncated before matching.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Request size the HTTP layer accepts on webhook routes. Bodies between
/// this and [`MAX_PAYLOAD_BYTES`] are read, then truncated.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

/// Transport-independent view of an inbound webhook.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: String,
    /// Header names are lower-cased; only the first value of each is kept
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn json_body(&self) -> Option<Value> {
        match serde_json::from_slice(&self.body) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "Webhook payload is not valid JSON");
                None
            }
        }
    }
}

struct MatchedWebhook<'a> {
    action: &'a Action,
    webhook: WebhookConfig,
}

/// Handles one webhook delivery. Returns the handles of the executions it
/// started.
pub async fn handle_webhook(executor: &Arc<Executor>, mut request: WebhookRequest) -> Vec<ExecutionHandle> {
    request.body.truncate(MAX_PAYLOAD_BYTES);

    let cfg = executor.config().await;
    let body = request.json_body();

    let mut matched = Vec::new();
    for action in &cfg.actions {
        for webhook in &action.exec_on_webhook {
            let webhook = github::apply_template(webhook);
            if matcher::matches(&webhook, &request, body.as_ref()) {
                matched.push(MatchedWebhook { action, webhook });
            }
        }
    }

    if matched.is_empty() {
        debug!(path = %request.path, method = %request.method, "No matching webhook actions found");
        return Vec::new();
    }

    let mut handles = Vec::new();
    let matched_count = matched.len();

    for MatchedWebhook { action, webhook } in matched {
        if !auth::verify(&webhook, &request) {
            warn!(
                target: "audit",
                action_title = %action.title,
                auth_type = %webhook.auth_type,
                path = %request.path,
                "Webhook authentication failed"
            );
            continue;
        }

        let arguments = match matcher::extract_arguments(&webhook, &request, body.as_ref()) {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(action_title = %action.title, error = %e, "Failed to extract webhook arguments");
                continue;
            }
        };

        let Some(binding) = executor.bindings().find_with_no_entity(&action.id).await else {
            warn!(action_title = %action.title, "Action binding not found, skipping execution");
            continue;
        };

        let req = ExecutionRequest::new(Some(binding), AuthenticatedUser::from_system(&cfg, "webhook"))
            .with_arguments(arguments)
            .with_tag("webhook");

        handles.push(executor.exec_request(req).await);
    }

    info!(matched = matched_count, processed = handles.len(), "Webhook processed");

    handles
}
