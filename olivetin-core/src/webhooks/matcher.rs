//! Deciding whether a webhook entry applies, and extracting its arguments

use super::jsonpath::{self, JsonPathError};
use super::WebhookRequest;
use crate::config::WebhookConfig;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Webhook payload is not JSON, cannot extract {0}")]
    NotJson(String),
}

/// Exact match, or a regex search when `expected` starts with `regex:`.
fn compare(actual: &str, expected: &str) -> bool {
    match expected.strip_prefix("regex:") {
        Some(pattern) => match Regex::new(pattern) {
            Ok(re) => re.is_match(actual),
            Err(e) => {
                warn!(pattern, error = %e, "Invalid regex pattern in webhook match");
                false
            }
        },
        None => actual == expected,
    }
}

/// Headers, query parameters and the JSON path condition must all match.
pub fn matches(webhook: &WebhookConfig, request: &WebhookRequest, body: Option<&Value>) -> bool {
    for (name, expected) in &webhook.match_headers {
        let actual = request.header(name).unwrap_or("");
        if !compare(actual, expected) {
            debug!(header = %name, expected = %expected, actual, "Header mismatch");
            return false;
        }
    }

    for (name, expected) in &webhook.match_query {
        let actual = request.query_param(name).unwrap_or_default();
        if !compare(&actual, expected) {
            debug!(query = %name, expected = %expected, actual = %actual, "Query parameter mismatch");
            return false;
        }
    }

    if !webhook.match_path.is_empty() {
        return match_path(&webhook.match_path, body);
    }

    true
}

/// `<jsonpath>` must resolve; `<jsonpath>=<value>` must resolve to `value`.
fn match_path(condition: &str, body: Option<&Value>) -> bool {
    let Some(body) = body else {
        debug!("matchPath set but payload is not JSON");
        return false;
    };

    let (path, expected) = match condition.split_once('=') {
        Some((path, expected)) => (path, Some(expected)),
        None => (condition, None),
    };

    match (jsonpath::select(body, path), expected) {
        (Ok(_), None) => true,
        (Ok(value), Some(expected)) => jsonpath::value_to_string(value) == expected,
        (Err(e), _) => {
            debug!(json_path = path, error = %e, "JSONPath did not match");
            false
        }
    }
}

/// `extract` values from the body, plus `webhook_method`, `webhook_path`,
/// `webhook_query` and one `webhook_header_<name>` per header.
pub fn extract_arguments(
    webhook: &WebhookConfig,
    request: &WebhookRequest,
    body: Option<&Value>,
) -> Result<BTreeMap<String, String>, ExtractError> {
    let mut args = BTreeMap::new();

    if !webhook.extract.is_empty() {
        let Some(body) = body else {
            let names: Vec<&str> = webhook.extract.keys().map(String::as_str).collect();
            return Err(ExtractError::NotJson(names.join(", ")));
        };

        for (arg, path) in &webhook.extract {
            match jsonpath::select(body, path) {
                Ok(value) => {
                    args.insert(arg.clone(), jsonpath::value_to_string(value));
                }
                Err(e @ JsonPathError::MissingRoot(_)) | Err(e @ JsonPathError::Syntax { .. }) => {
                    warn!(arg = %arg, json_path = %path, error = %e, "Invalid JSONPath in webhook extract");
                }
                Err(e) => {
                    debug!(arg = %arg, json_path = %path, error = %e, "Failed to extract value");
                }
            }
        }
    }

    args.insert("webhook_method".to_string(), request.method.clone());
    args.insert("webhook_path".to_string(), request.path.clone());
    args.insert("webhook_query".to_string(), request.query.clone());

    for (name, value) in &request.headers {
        args.insert(format!("webhook_header_{}", name.to_ascii_lowercase()), value.clone());
    }

    Ok(args)
}
