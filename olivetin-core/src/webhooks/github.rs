//! Webhook presets for GitHub events
//!
//! A preset only fills in what the user left unset.

use crate::config::WebhookConfig;

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
const EVENT_HEADER: &str = "X-GitHub-Event";

/// (event header value, [(argument, jsonpath)])
fn preset(template: &str) -> Option<(&'static str, &'static [(&'static str, &'static str)])> {
    let preset: (&str, &[(&str, &str)]) = match template {
        "github-push" => (
            "push",
            &[
                ("git_repository", "$.repository.full_name"),
                ("git_ref", "$.ref"),
                ("git_commit", "$.head_commit.id"),
                ("git_branch", "$.ref"),
                ("git_message", "$.head_commit.message"),
                ("git_author", "$.head_commit.author.name"),
            ],
        ),
        "github-pr" | "github-pull-request" => (
            "pull_request",
            &[
                ("pr_number", "$.number"),
                ("pr_title", "$.pull_request.title"),
                ("pr_author", "$.pull_request.user.login"),
                ("pr_action", "$.action"),
                ("git_repository", "$.repository.full_name"),
                ("pr_state", "$.pull_request.state"),
                ("pr_head_sha", "$.pull_request.head.sha"),
            ],
        ),
        "github-release" => (
            "release",
            &[
                ("release_action", "$.action"),
                ("release_tag", "$.release.tag_name"),
                ("release_name", "$.release.name"),
                ("git_repository", "$.repository.full_name"),
                ("release_author", "$.release.author.login"),
            ],
        ),
        "github-workflow" => (
            "workflow_run",
            &[
                ("workflow_name", "$.workflow_run.name"),
                ("workflow_status", "$.workflow_run.status"),
                ("workflow_conclusion", "$.workflow_run.conclusion"),
                ("git_repository", "$.repository.full_name"),
                ("git_commit", "$.workflow_run.head_sha"),
                ("git_branch", "$.workflow_run.head_branch"),
            ],
        ),
        _ => return None,
    };
    Some(preset)
}

/// Returns `webhook` with the defaults of its `template` applied. Unknown
/// templates leave it unchanged.
pub fn apply_template(webhook: &WebhookConfig) -> WebhookConfig {
    let mut out = webhook.clone();

    let Some((event, extractions)) = preset(&webhook.template) else {
        return out;
    };

    if out.auth_header.is_empty() {
        out.auth_header = SIGNATURE_HEADER.to_string();
    }
    if out.auth_type.is_empty() {
        out.auth_type = "hmac-sha256".to_string();
    }

    out.match_headers
        .entry(EVENT_HEADER.to_string())
        .or_insert_with(|| event.to_string());

    for (arg, path) in extractions {
        out.extract.entry(arg.to_string()).or_insert_with(|| path.to_string());
    }

    out
}
