//! Build and runtime facts exposed to templates and diagnostics

use crate::config::Config;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::path::Path;

pub static BUILD: Lazy<BuildInfo> = Lazy::new(|| BuildInfo {
    version: env!("CARGO_PKG_VERSION").to_string(),
    commit: option_env!("OLIVETIN_COMMIT").unwrap_or("nocommit").to_string(),
    date: option_env!("OLIVETIN_BUILD_DATE").unwrap_or("nodate").to_string(),
});

pub static RUNTIME: Lazy<RuntimeInfo> = Lazy::new(RuntimeInfo::detect);

/// Field names follow the template surface (`{{ .OliveTin.Build.Version }}`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildInfo {
    pub version: String,
    pub commit: String,
    pub date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeInfo {
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "OSReleasePrettyName")]
    pub os_release_pretty_name: String,
    pub arch: String,
    pub in_container: bool,
    pub user: String,
    pub uid: String,
}

impl RuntimeInfo {
    fn detect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            os_release_pretty_name: os_release_pretty_name(),
            arch: std::env::consts::ARCH.to_string(),
            in_container: std::path::Path::new("/.dockerenv").exists(),
            user: std::env::var("USER").unwrap_or_default(),
            uid: std::env::var("UID").unwrap_or_default(),
        }
    }
}

fn os_release_pretty_name() -> String {
    match std::fs::read_to_string("/etc/os-release") {
        Ok(contents) => contents
            .lines()
            .find(|l| l.contains("PRETTY_NAME"))
            .map(str::to_string)
            .unwrap_or_else(|| "notfound".to_string()),
        Err(_) => String::new(),
    }
}

/// Where SSH material would be picked up from by actions running as this user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshDiagnostics {
    pub found_key: String,
    pub found_config: String,
}

/// Looked up on every call so that keys added after startup show up.
pub fn ssh_diagnostics() -> SshDiagnostics {
    let ssh_dir = dirs::home_dir().unwrap_or_default().join(".ssh");

    SshDiagnostics {
        found_key: describe_found(&ssh_dir.join("id_rsa")),
        found_config: describe_found(&ssh_dir.join("config")),
    }
}

fn describe_found(path: &Path) -> String {
    if path.exists() {
        path.display().to_string()
    } else {
        format!("none-found at {}", path.display())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SosReportConfig {
    count_of_actions: usize,
    count_of_dashboards: usize,
    log_level: String,
    #[serde(rename = "ListenAddressSingleHTTPFrontend")]
    listen_address_single_http_frontend: String,
    time_now: String,
    config_directory: String,
}

/// Plain-text support report, meant to be pasted into bug reports.
pub fn sos_report(cfg: &Config) -> String {
    let summary = SosReportConfig {
        count_of_actions: cfg.actions.len(),
        count_of_dashboards: cfg.dashboards.len(),
        log_level: cfg.log_level.clone(),
        listen_address_single_http_frontend: cfg.listen_address_single_http_frontend.clone(),
        time_now: chrono::Local::now().to_rfc3339(),
        config_directory: cfg.config_dir().display().to_string(),
    };

    let mut out = String::from("### SOSREPORT START (copy all text to SOSREPORT END)\n");
    out.push_str(&format!("# Build: \n{}\n", to_yaml(&*BUILD)));
    out.push_str(&format!("# Runtime:\n{}\n", to_yaml(&*RUNTIME)));
    out.push_str(&format!("# Config:\n{}\n", to_yaml(&summary)));
    out.push_str("### SOSREPORT END  (copy all text from SOSREPORT START)\n");
    out
}

fn to_yaml<T: Serialize>(value: &T) -> String {
    serde_yaml_ng::to_string(value).unwrap_or_else(|e| format!("error: {}", e))
}
