//! Post-load fix-ups: fill in derived fields and clamp out-of-range values.

use super::{Action, ActionArgument, Config, ConfigError};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::{info, warn};

pub const MIN_TIMEOUT_SECONDS: u64 = 3;

const POPUP_ON_START_VALUES: [&str; 4] = [
    "execution-dialog",
    "execution-dialog-output-html",
    "execution-dialog-stdout-only",
    "execution-button",
];

static ICON_SHORTCUTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("poop", "&#x1f4a9;"),
        ("smile", "&#x1F600;"),
        ("ping", "&#x1f4e1;"),
        ("backup", "&#128190;"),
        ("reboot", "&#128260;"),
        ("restart", "&#128260;"),
        ("box", "&#128230;"),
        ("ashtonished", "&#128562;"),
        ("clock", "&#128338;"),
        ("disk", "&#128189;"),
        ("logs", "&#128269;"),
        ("light", "&#128161;"),
        ("robot", "&#129302;"),
        ("ssh", "&#128272;"),
        ("theme", "&#127912;"),
    ])
});

/// Resolves an icon shortcut (`ping`, `backup`, ...) or a custom image path.
pub fn lookup_html_icon(key: &str, default_icon: &str) -> String {
    if key.is_empty() {
        return default_icon.to_string();
    }

    if let Some(icon) = ICON_SHORTCUTS.get(key) {
        return icon.to_string();
    }

    if key.contains('/') && !key.starts_with('<') {
        return format!("<img src = \"/custom-webui/{}\" />", key);
    }

    key.to_string()
}

impl Config {
    /// Fills in defaults that depend on other fields. Runs after every load,
    /// including hot reloads.
    pub fn sanitize(&mut self) -> Result<(), ConfigError> {
        if self.auth_require_guests_to_login {
            info!("authRequireGuestsToLogin is enabled, all defaultPermissions except kill are now false");
            self.default_permissions.view = false;
            self.default_permissions.exec = false;
            self.default_permissions.logs = false;
        }

        if self.log_history_page_size < 10 {
            warn!(
                requested = self.log_history_page_size,
                "logHistoryPageSize is too low, setting it to 10"
            );
            self.log_history_page_size = 10;
        } else if self.log_history_page_size > 100 {
            warn!(
                requested = self.log_history_page_size,
                "logHistoryPageSize is too high, setting it to 100"
            );
            self.log_history_page_size = 100;
        }

        let default_icon = self.default_icon_for_actions.clone();
        let default_popup = self.default_popup_on_start.clone();

        for action in &mut self.actions {
            sanitize_action(action, &default_icon, &default_popup)?;
        }

        Ok(())
    }
}

fn sanitize_action(
    action: &mut Action,
    default_icon: &str,
    default_popup: &str,
) -> Result<(), ConfigError> {
    if action.id.is_empty() {
        action.id = uuid::Uuid::new_v4().to_string();
    } else if action.id.contains("{{") {
        return Err(ConfigError::TemplatedActionId {
            id: action.id.clone(),
        });
    }

    if action.timeout < MIN_TIMEOUT_SECONDS {
        action.timeout = MIN_TIMEOUT_SECONDS;
    }

    if action.max_concurrent < 1 {
        action.max_concurrent = 1;
    }

    action.icon = lookup_html_icon(&action.icon, default_icon);

    if !POPUP_ON_START_VALUES.contains(&action.popup_on_start.as_str()) {
        action.popup_on_start = default_popup.to_string();
    }

    for arg in &mut action.arguments {
        sanitize_argument(arg);
    }

    Ok(())
}

fn sanitize_argument(arg: &mut ActionArgument) {
    if arg.title.is_empty() {
        arg.title = arg.name.clone();
    }

    for choice in &mut arg.choices {
        if choice.title.is_empty() {
            choice.title = choice.value.clone();
        }
    }

    if arg.choices.is_empty() && arg.arg_type.is_empty() {
        warn!(
            arg = %arg.name,
            "Argument type isn't set, will default to 'ascii' but this may not be safe. You should set a type specifically."
        );
        arg.arg_type = "ascii".to_string();
    }
}
