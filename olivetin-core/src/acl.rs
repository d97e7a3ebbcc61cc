//! Access control
//!
//! Users pick up ACLs by username or usergroup when they are resolved. An
//! action check then looks only at ACLs that the user holds *and* that apply
//! to the action (`addToEveryAction` or listed in the action's `acls`). The
//! first such ACL granting the bit wins; otherwise `defaultPermissions`.

use crate::config::{AccessControlList, Action, Config, ConfigurationPolicy, PermissionsList};
use serde::Serialize;
use std::ops::BitOr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermissionBits(u8);

impl PermissionBits {
    pub const VIEW: Self = Self(1);
    pub const EXEC: Self = Self(2);
    pub const LOGS: Self = Self(4);
    pub const KILL: Self = Self(8);

    pub fn has(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for PermissionBits {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<PermissionsList> for PermissionBits {
    fn from(p: PermissionsList) -> Self {
        let mut bits = PermissionBits::default();
        for (enabled, bit) in [
            (p.view, Self::VIEW),
            (p.exec, Self::EXEC),
            (p.logs, Self::LOGS),
            (p.kill, Self::KILL),
        ] {
            if enabled {
                bits = bits | bit;
            }
        }
        bits
    }
}

/// A resolved caller. Built by the HTTP boundary, trigger sources, or the
/// system itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub username: String,
    pub usergroup_line: String,
    pub provider: String,
    #[serde(skip)]
    pub sid: String,
    pub acls: Vec<String>,
    pub effective_policy: ConfigurationPolicy,
}

impl AuthenticatedUser {
    fn unresolved(username: &str, usergroup_line: &str, provider: &str) -> Self {
        Self {
            username: username.to_string(),
            usergroup_line: usergroup_line.to_string(),
            provider: provider.to_string(),
            sid: String::new(),
            acls: Vec::new(),
            effective_policy: ConfigurationPolicy::default(),
        }
    }

    /// Builds a user and attaches matching ACLs and the effective policy.
    pub fn resolve(
        cfg: &Config,
        username: &str,
        usergroup_line: &str,
        provider: &str,
        sid: &str,
    ) -> Self {
        let mut user = Self::unresolved(username, usergroup_line, provider);
        user.sid = sid.to_string();
        build_user_acls(cfg, &mut user);
        user
    }

    pub fn guest(cfg: &Config) -> Self {
        Self::resolve(cfg, "guest", "guest", "system", "")
    }

    /// Identity used by trigger sources (`cron`, `webhook`, ...).
    pub fn from_system(cfg: &Config, username: &str) -> Self {
        Self::resolve(cfg, username, "system", "system", "")
    }

    pub fn is_guest(&self) -> bool {
        self.username == "guest" && self.provider == "system"
    }

    fn usergroups(&self, sep: &str) -> Vec<&str> {
        if sep.is_empty() {
            self.usergroup_line.split_whitespace().collect()
        } else {
            self.usergroup_line
                .split(sep)
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .collect()
        }
    }

    fn matches_usergroup_acl(&self, match_usergroups: &[String], sep: &str) -> bool {
        self.usergroups(sep)
            .iter()
            .any(|g| match_usergroups.iter().any(|m| m == g))
    }
}

fn build_user_acls(cfg: &Config, user: &mut AuthenticatedUser) {
    for acl in &cfg.access_control_lists {
        if acl.match_usernames.contains(&user.username)
            || user.matches_usergroup_acl(&acl.match_usergroups, &cfg.auth_http_header_user_group_sep)
        {
            user.acls.push(acl.name.clone());
        }
    }

    user.effective_policy = effective_policy(cfg, user);
}

fn effective_policy(cfg: &Config, user: &AuthenticatedUser) -> ConfigurationPolicy {
    let mut policy = cfg.default_policy;

    for acl in &cfg.access_control_lists {
        if user.acls.contains(&acl.name) {
            log_acl_matched(cfg, "GetEffectivePolicy", user, None, acl);
            policy.show_diagnostics |= acl.policy.show_diagnostics;
            policy.show_log_list |= acl.policy.show_log_list;
        }
    }

    policy
}

fn is_relevant(acl: &AccessControlList, action: &Action, user: &AuthenticatedUser) -> bool {
    user.acls.contains(&acl.name) && (acl.add_to_every_action || action.acls.contains(&acl.name))
}

fn acl_check(
    cfg: &Config,
    required: PermissionBits,
    default_value: bool,
    check: &str,
    user: &AuthenticatedUser,
    action: &Action,
) -> bool {
    let relevant: Vec<&AccessControlList> = cfg
        .access_control_lists
        .iter()
        .filter(|acl| is_relevant(acl, action, user))
        .collect();

    if cfg.log_debug_options.acl_check_started {
        debug!(
            action_title = %action.title,
            username = %user.username,
            usergroup_line = %user.usergroup_line,
            relevant_acls = relevant.len(),
            required = required.bits(),
            "ACL check - {}",
            check
        );
    }

    for acl in relevant {
        if PermissionBits::from(acl.permissions).has(required) {
            log_acl_matched(cfg, check, user, Some(action), acl);
            return true;
        }

        if cfg.log_debug_options.acl_not_matched {
            debug!(user = %user.username, action = %action.title, acl = %acl.name, "{} - ACL Not Matched", check);
        }
    }

    if cfg.log_debug_options.acl_none_matched {
        debug!(
            user = %user.username,
            action = %action.title,
            default = default_value,
            "{} - No ACLs Matched, returning default permission",
            check
        );
    }

    default_value
}

fn log_acl_matched(
    cfg: &Config,
    check: &str,
    user: &AuthenticatedUser,
    action: Option<&Action>,
    acl: &AccessControlList,
) {
    if cfg.log_debug_options.acl_matched {
        debug!(
            user = %user.username,
            action = action.map(|a| a.title.as_str()).unwrap_or("N/A"),
            acl = %acl.name,
            "{} - Matched ACL",
            check
        );
    }
}

pub fn is_allowed_view(cfg: &Config, user: &AuthenticatedUser, action: &Action) -> bool {
    if action.hidden {
        return false;
    }
    acl_check(cfg, PermissionBits::VIEW, cfg.default_permissions.view, "isAllowedView", user, action)
}

pub fn is_allowed_exec(cfg: &Config, user: &AuthenticatedUser, action: &Action) -> bool {
    acl_check(cfg, PermissionBits::EXEC, cfg.default_permissions.exec, "isAllowedExec", user, action)
}

pub fn is_allowed_logs(cfg: &Config, user: &AuthenticatedUser, action: &Action) -> bool {
    acl_check(cfg, PermissionBits::LOGS, cfg.default_permissions.logs, "isAllowedLogs", user, action)
}

pub fn is_allowed_kill(cfg: &Config, user: &AuthenticatedUser, action: &Action) -> bool {
    acl_check(cfg, PermissionBits::KILL, cfg.default_permissions.kill, "isAllowedKill", user, action)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let yaml = r#"
defaultPermissions:
  view: true
  exec: false
  logs: true
  kill: false
accessControlLists:
  - name: admins
    matchUsergroups: [admin]
    addToEveryAction: true
    permissions: { view: true, exec: true, logs: true, kill: true }
    policy: { showDiagnostics: true }
  - name: deployers
    matchUsernames: [dana]
    permissions: { exec: true }
"#;
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn action(acls: &[&str]) -> Action {
        Action {
            title: "Deploy".into(),
            acls: acls.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_usergroup_match_attaches_acl() {
        let cfg = cfg();
        let user = AuthenticatedUser::resolve(&cfg, "alice", "staff admin", "header", "");

        assert_eq!(user.acls, vec!["admins"]);
        assert!(is_allowed_exec(&cfg, &user, &action(&[])));
        assert!(is_allowed_kill(&cfg, &user, &action(&[])));
    }

    #[test]
    fn test_custom_group_separator() {
        let mut cfg = cfg();
        cfg.auth_http_header_user_group_sep = ",".into();
        let user = AuthenticatedUser::resolve(&cfg, "bob", "staff, admin", "header", "");

        assert_eq!(user.acls, vec!["admins"]);
    }

    #[test]
    fn test_acl_must_be_listed_on_action() {
        let cfg = cfg();
        let dana = AuthenticatedUser::resolve(&cfg, "dana", "", "local", "");

        assert!(!is_allowed_exec(&cfg, &dana, &action(&[])));
        assert!(is_allowed_exec(&cfg, &dana, &action(&["deployers"])));
    }

    #[test]
    fn test_defaults_apply_when_nothing_matches() {
        let cfg = cfg();
        let guest = AuthenticatedUser::guest(&cfg);

        assert!(guest.is_guest());
        assert!(guest.acls.is_empty());
        assert!(is_allowed_view(&cfg, &guest, &action(&[])));
        assert!(!is_allowed_exec(&cfg, &guest, &action(&[])));
        assert!(is_allowed_logs(&cfg, &guest, &action(&[])));
    }

    #[test]
    fn test_hidden_actions_are_never_viewable() {
        let cfg = cfg();
        let admin = AuthenticatedUser::resolve(&cfg, "alice", "admin", "header", "");
        let mut hidden = action(&[]);
        hidden.hidden = true;

        assert!(!is_allowed_view(&cfg, &admin, &hidden));
        assert!(is_allowed_exec(&cfg, &admin, &hidden));
    }

    #[test]
    fn test_effective_policy_widens_defaults() {
        let mut cfg = cfg();
        cfg.default_policy = ConfigurationPolicy::default();
        let admin = AuthenticatedUser::resolve(&cfg, "alice", "admin", "header", "");
        let guest = AuthenticatedUser::guest(&cfg);

        assert!(admin.effective_policy.show_diagnostics);
        assert!(!admin.effective_policy.show_log_list);
        assert!(!guest.effective_policy.show_diagnostics);
    }

    #[test]
    fn test_system_user() {
        let cfg = cfg();
        let user = AuthenticatedUser::from_system(&cfg, "cron");

        assert_eq!(user.usergroup_line, "system");
        assert_eq!(user.provider, "system");
        assert!(!user.is_guest());
    }
}
