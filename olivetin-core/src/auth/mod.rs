//! Resolving the caller of an HTTP request
//!
//! Checked in order: trusted proxy headers, the local session cookie, then
//! the guest. Whatever wins is run through ACL resolution before the API
//! sees it.

pub mod local;
pub mod sessions;

use crate::acl::AuthenticatedUser;
use crate::config::Config;
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use sessions::{SessionStore, SESSION_LIFETIME_SECS};
use tracing::{debug, warn};

pub const LOCAL_SESSION_COOKIE: &str = "olivetin-sid-local";
pub const OAUTH2_SESSION_COOKIE: &str = "olivetin-sid-oauth";

/// Identity found by one link of the chain, before ACLs are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Claimed {
    username: String,
    usergroup_line: String,
    provider: String,
    sid: String,
}

fn first_header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Looks up a cookie by name across every `Cookie` header.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
        .filter(|v| !v.is_empty())
}

fn user_from_headers(cfg: &Config, headers: &HeaderMap) -> Option<Claimed> {
    if cfg.auth_http_header_username.is_empty() {
        return None;
    }

    let username = first_header(headers, &cfg.auth_http_header_username);
    if username.is_empty() {
        return None;
    }

    let usergroup_line = if cfg.auth_http_header_user_group.is_empty() {
        ""
    } else {
        first_header(headers, &cfg.auth_http_header_user_group)
    };

    let provider = match first_header(headers, "provider") {
        "" => "header",
        p => p,
    };

    Some(Claimed {
        username: username.to_string(),
        usergroup_line: usergroup_line.to_string(),
        provider: provider.to_string(),
        sid: String::new(),
    })
}

async fn user_from_local_session(cfg: &Config, headers: &HeaderMap, sessions: &SessionStore) -> Option<Claimed> {
    let sid = cookie_value(headers, LOCAL_SESSION_COOKIE)?;

    let Some(session) = sessions.get("local", sid).await else {
        warn!(sid, provider = "local", "Stale local session");
        return None;
    };

    let Some(user) = cfg.find_user_by_username(&session.username) else {
        warn!(username = %session.username, "Local session user not in config");
        return None;
    };

    Some(Claimed {
        username: user.username.clone(),
        usergroup_line: user.usergroup.clone(),
        provider: "local".to_string(),
        sid: sid.to_string(),
    })
}

/// Resolves the caller of a request, falling back to the guest.
pub async fn user_from_request(cfg: &Config, headers: &HeaderMap, sessions: &SessionStore) -> AuthenticatedUser {
    let claimed = match user_from_headers(cfg, headers) {
        Some(claimed) => Some(claimed),
        None => user_from_local_session(cfg, headers, sessions).await,
    };

    let user = match claimed {
        Some(c) => AuthenticatedUser::resolve(cfg, &c.username, &c.usergroup_line, &c.provider, &c.sid),
        None => AuthenticatedUser::guest(cfg),
    };

    debug!(
        username = %user.username,
        usergroup_line = %user.usergroup_line,
        provider = %user.provider,
        acls = ?user.acls,
        "Authenticated API request"
    );

    user
}

/// `Set-Cookie` value for a freshly registered local session.
pub fn session_cookie(sid: &str) -> String {
    format!("{LOCAL_SESSION_COOKIE}={sid}; Path=/; Max-Age={SESSION_LIFETIME_SECS}; HttpOnly")
}

/// `Set-Cookie` value that makes the browser drop `name`.
pub fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; Max-Age=0; HttpOnly")
}
