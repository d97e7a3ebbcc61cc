//! Argument validation and substitution
//!
//! Values arrive as strings from the UI, webhooks or file events. Before a
//! command is rendered every value is mangled into canonical form, checked
//! against its declared type, and only then substituted.

use crate::config::{Action, ActionArgument};
use crate::entities::{Entity, EntityStore};
use crate::tpl;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

/// Implicit arguments injected by the engine for every execution.
pub const ARG_TRACKING_ID: &str = "ot_executionTrackingId";
pub const ARG_USERNAME: &str = "ot_username";

pub const REDACTED: &str = "<redacted>";

static TYPE_PATTERNS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("very_dangerous_raw_string", ""),
        ("int", r"^\d+$"),
        ("unicode_identifier", r"^[\w\-\.\d]+$"),
        ("ascii", r"^[a-zA-Z0-9]+$"),
        ("ascii_identifier", r"^[a-zA-Z0-9\-\._]+$"),
        ("ascii_sentence", r"^[a-zA-Z0-9\-\._, ]+$"),
    ])
});

static COMMAND_REPLACEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{ *?([a-zA-Z0-9_]+?) *?\}\}").expect("static regex"));

static LEGACY_ARGUMENT_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{ *?\.Arguments\.([a-zA-Z0-9_]+?) *?\}\}").expect("static regex"));

static DATETIME_WITHOUT_SECONDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}$").expect("static regex"));

static EMAIL_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[^<>@\s]+@[^<>@\s]+\.[^<>@\s]+|[^<>]*<[^<>@\s]+@[^<>@\s]+\.[^<>@\s]+>)$")
        .expect("static regex")
});

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Validation failures. The display text is what ends up in a log entry's
/// output, so it is part of the user-facing surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("Required arg not provided: {0}")]
    NotProvided(String),

    #[error("Action arg not defined: {0}")]
    NotDefined(String),

    #[error("argument name cannot be empty")]
    EmptyName,

    #[error("null values are not allowed")]
    NullNotAllowed,

    #[error("argument value is not one of the predefined choices")]
    NotAChoice,

    #[error("argument value cannot be found in entities")]
    NotInEntities,

    #[error("argument type not implemented {arg_type} for arg: {name}")]
    UnknownType { arg_type: String, name: String },

    #[error("invalid argument {name}, doesn't match {arg_type}")]
    Mismatch { name: String, arg_type: String },

    #[error("mail: invalid address {0:?}")]
    InvalidEmail(String),

    #[error("parse {0:?}: invalid URI for request")]
    InvalidUrl(String),

    #[error("parsing time {0:?}: expected YYYY-MM-DDThh:mm:ss")]
    InvalidDatetime(String),
}

/// Rewrites values into their canonical form before validation. Applying it
/// twice gives the same result as applying it once.
pub fn mangle_argument_value(arg: &ActionArgument, value: &str) -> String {
    match arg.arg_type.as_str() {
        "datetime" if DATETIME_WITHOUT_SECONDS.is_match(value) => format!("{}:00", value),
        "checkbox" => arg
            .choices
            .iter()
            .find(|c| c.title == value)
            .map(|c| c.value.clone())
            .unwrap_or_else(|| value.to_string()),
        _ => value.to_string(),
    }
}

/// Mangles every schema argument present in `values`, in place.
pub fn mangle_invalid_argument_values(action: &Action, values: &mut BTreeMap<String, String>) {
    for arg in &action.arguments {
        if let Some(value) = values.get_mut(&arg.name) {
            let mangled = mangle_argument_value(arg, value);
            if mangled != *value {
                debug!(arg = %arg.name, old = %value, new = %mangled, "Mangled argument value");
                *value = mangled;
            }
        }
    }
}

/// Full check of one value: null policy, choices, then the type.
pub async fn typecheck_action_argument(
    arg: &ActionArgument,
    value: &str,
    entities: &EntityStore,
) -> Result<(), ArgumentError> {
    if arg.arg_type == "confirmation" {
        return Ok(());
    }

    if arg.name.is_empty() {
        return Err(ArgumentError::EmptyName);
    }

    if value.is_empty() {
        return if arg.reject_null {
            Err(ArgumentError::NullNotAllowed)
        } else {
            Ok(())
        };
    }

    if !arg.choices.is_empty() {
        return typecheck_choice(arg, value, entities).await;
    }

    type_safety_check(&arg.name, value, &arg.arg_type)
}

async fn typecheck_choice(
    arg: &ActionArgument,
    value: &str,
    entities: &EntityStore,
) -> Result<(), ArgumentError> {
    if !arg.entity.is_empty() {
        let template = &arg.choices[0].value;

        for instance in entities.get_entity_instances(&arg.entity).await {
            if tpl::parse_template_with(template, Some(&instance)) == value {
                return Ok(());
            }
        }

        return Err(ArgumentError::NotInEntities);
    }

    if arg.choices.iter().any(|c| c.value == value) {
        Ok(())
    } else {
        Err(ArgumentError::NotAChoice)
    }
}

/// Checks a value against a type name alone.
pub fn type_safety_check(name: &str, value: &str, arg_type: &str) -> Result<(), ArgumentError> {
    match arg_type {
        "password" | "raw_string_multiline" | "checkbox" => Ok(()),
        "email" => check_email(value),
        "url" => check_url(value),
        "datetime" => check_datetime(value),
        _ => check_against_regex(name, value, arg_type),
    }
}

fn check_email(value: &str) -> Result<(), ArgumentError> {
    if EMAIL_ADDRESS.is_match(value.trim()) {
        Ok(())
    } else {
        Err(ArgumentError::InvalidEmail(value.to_string()))
    }
}

// Absolute URLs, or absolute paths as accepted in a request line.
fn check_url(value: &str) -> Result<(), ArgumentError> {
    if value.starts_with('/') || url::Url::parse(value).is_ok() {
        Ok(())
    } else {
        Err(ArgumentError::InvalidUrl(value.to_string()))
    }
}

fn check_datetime(value: &str) -> Result<(), ArgumentError> {
    chrono::NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
        .map(|_| ())
        .map_err(|_| ArgumentError::InvalidDatetime(value.to_string()))
}

fn check_against_regex(name: &str, value: &str, arg_type: &str) -> Result<(), ArgumentError> {
    let pattern = match arg_type.strip_prefix("regex:") {
        Some(custom) => custom,
        None => match TYPE_PATTERNS.get(arg_type) {
            Some(p) => p,
            None => {
                return Err(ArgumentError::UnknownType {
                    arg_type: arg_type.to_string(),
                    name: name.to_string(),
                })
            }
        },
    };

    let matched = match Regex::new(pattern) {
        Ok(re) => re.is_match(value),
        Err(e) => {
            warn!(arg = name, pattern, error = %e, "Argument regex does not compile");
            false
        }
    };

    if matched {
        Ok(())
    } else {
        Err(ArgumentError::Mismatch {
            name: name.to_string(),
            arg_type: arg_type.to_string(),
        })
    }
}

/// Names referenced by a command, either `{{ name }}` or `{{ .Arguments.name }}`.
pub fn referenced_argument_names(command: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();

    for re in [&*COMMAND_REPLACEMENT, &*LEGACY_ARGUMENT_REFERENCE] {
        for caps in re.captures_iter(command) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    names
}

fn is_implicit(name: &str) -> bool {
    name == ARG_TRACKING_ID || name == ARG_USERNAME
}

/// Every name the command references must have a value; a referenced name
/// must also be known, either from the schema, the implicit set, or the
/// values supplied by the trigger.
pub fn check_referenced_arguments(
    action: &Action,
    command: &str,
    values: &BTreeMap<String, String>,
) -> Result<(), ArgumentError> {
    for name in referenced_argument_names(command) {
        if values.contains_key(&name) {
            continue;
        }

        if is_implicit(&name) || action.find_arg(&name).is_some() {
            return Err(ArgumentError::NotProvided(name));
        }

        return Err(ArgumentError::NotDefined(name));
    }

    Ok(())
}

/// Validates every schema argument against its submitted value.
pub async fn validate_arguments(
    action: &Action,
    values: &BTreeMap<String, String>,
    entities: &EntityStore,
) -> Result<(), ArgumentError> {
    for arg in &action.arguments {
        let value = values.get(&arg.name).map(String::as_str).unwrap_or("");
        typecheck_action_argument(arg, value, entities).await?;
    }

    Ok(())
}

/// Validates, then renders one command string.
pub async fn parse_command_for_replacements(
    action: &Action,
    command: &str,
    values: &BTreeMap<String, String>,
    entity: Option<&Entity>,
    entities: &EntityStore,
) -> Result<String, ArgumentError> {
    check_referenced_arguments(action, command, values)?;
    validate_arguments(action, values, entities).await?;

    Ok(tpl::parse_template_with_args(command, entity, values))
}

/// Copy of `values` with every non-empty password replaced, for logging.
pub fn redact_passwords(action: &Action, values: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(k, v)| {
            let is_password = action
                .arguments
                .iter()
                .any(|a| &a.name == k && a.arg_type == "password");

            if is_password && !v.is_empty() {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// Only names declared by the action survive; used for caller supplied maps.
pub fn retain_declared(action: &Action, values: BTreeMap<String, String>) -> BTreeMap<String, String> {
    values
        .into_iter()
        .filter(|(k, _)| action.arguments.iter().any(|a| &a.name == k))
        .collect()
}
