//! Config file discovery, include merging and loading

use super::Config;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml_ng::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

static ENV_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{ *?(\S+?) *?\}\}").expect("static regex"));

/// Errors raised while reading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Failed to read include directory {path}")]
    Include {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Action IDs cannot contain variables: {id}")]
    TemplatedActionId { id: String },
}

/// Where a configuration came from, so it can be loaded again on change.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// `None` when no config file was found and defaults are in use
    pub path: Option<PathBuf>,
    pub base_port: u16,
}

impl ConfigSource {
    pub fn load(&self) -> Result<Config, ConfigError> {
        match &self.path {
            Some(path) => load_config(path, self.base_port),
            None => {
                let mut cfg = Config::with_base_port(self.base_port);
                cfg.sanitize()?;
                Ok(cfg)
            }
        }
    }

    /// The include directory of the loaded config, if it has one.
    pub fn include_dir(&self, cfg: &Config) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        if cfg.include.is_empty() {
            return None;
        }
        Some(path.parent().unwrap_or(Path::new(".")).join(&cfg.include))
    }
}

/// Returns the first `config.yaml` found in the search path.
pub fn find_config_file(config_dir: &Path) -> Option<PathBuf> {
    let mut candidates = vec![config_dir.to_path_buf()];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("OliveTin"));
    }
    candidates.push(PathBuf::from("/config"));
    candidates.push(PathBuf::from("/etc/OliveTin"));

    for dir in candidates {
        let candidate = dir.join(CONFIG_FILE_NAME);
        debug!(path = %candidate.display(), "Checking config path");

        if candidate.is_file() {
            return Some(fs::canonicalize(&candidate).unwrap_or(candidate));
        }
    }

    None
}

/// Loads the primary file, merges includes, applies defaults and sanitises.
pub fn load_config(path: &Path, base_port: u16) -> Result<Config, ConfigError> {
    info!(path = %path.display(), "Loading config");

    let mut root = read_yaml(path)?;
    let config_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

    if let Some(include) = root.get("include").and_then(Value::as_str) {
        if !include.is_empty() {
            let include_dir = config_dir.join(include);
            for overlay in read_include_dir(&include_dir)? {
                merge_values(&mut root, overlay);
            }
        }
    }

    interpolate_env(&mut root);

    let has_listen_address = root.get("listenAddressSingleHTTPFrontend").is_some();

    let mut cfg: Config = serde_yaml_ng::from_value(root).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if !has_listen_address {
        cfg.listen_address_single_http_frontend = format!("0.0.0.0:{}", base_port);
    }

    cfg.config_dir = config_dir;
    cfg.sanitize()?;

    info!(
        actions = cfg.actions.len(),
        dashboards = cfg.dashboards.len(),
        entities = cfg.entities.len(),
        "Config loaded"
    );

    Ok(cfg)
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let value: Value = serde_yaml_ng::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    // An empty file parses as null
    Ok(match value {
        Value::Null => Value::Mapping(Mapping::new()),
        other => other,
    })
}

fn read_include_dir(dir: &Path) -> Result<Vec<Value>, ConfigError> {
    if !dir.is_dir() {
        warn!(path = %dir.display(), "Include directory not found");
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| ConfigError::Include {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();

    files.sort();

    let mut overlays = Vec::with_capacity(files.len());
    for file in files {
        info!(path = %file.display(), "Loading included config file");
        overlays.push(read_yaml(&file)?);
    }

    Ok(overlays)
}

/// Mappings merge key by key, sequences append, anything else is replaced.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) => {
            base_seq.extend(overlay_seq);
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

/// Replaces `${{ NAME }}` in every string with the environment variable.
fn interpolate_env(value: &mut Value) {
    match value {
        Value::String(s) if s.contains("${{") => {
            *s = ENV_REFERENCE
                .replace_all(s, |caps: &regex::Captures| {
                    let key = &caps[1];
                    std::env::var(key).unwrap_or_else(|_| {
                        warn!(key, "Config file references unset environment variable");
                        String::new()
                    })
                })
                .into_owned();
        }
        Value::Sequence(seq) => seq.iter_mut().for_each(interpolate_env),
        Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| interpolate_env(v)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_include_directory_appends_lists_and_overrides_scalars() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.yaml"),
            "pageTitle: Base\ninclude: conf.d\nactions:\n  - title: one\n    id: one\n    shell: echo 1\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("conf.d")).unwrap();
        fs::write(
            dir.path().join("conf.d/20-b.yml"),
            "pageTitle: Second\nactions:\n  - title: three\n    id: three\n    shell: echo 3\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("conf.d/10-a.yaml"),
            "pageTitle: First\nactions:\n  - title: two\n    id: two\n    shell: echo 2\n",
        )
        .unwrap();
        fs::write(dir.path().join("conf.d/ignored.txt"), "pageTitle: Nope\n").unwrap();

        let cfg = load_config(&dir.path().join("config.yaml"), 1337).unwrap();

        let titles: Vec<_> = cfg.actions.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["one", "two", "three"]);
        assert_eq!(cfg.page_title, "Second");
        assert_eq!(cfg.config_dir, dir.path());
    }

    #[test]
    fn test_base_port_applies_when_listen_address_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "").unwrap();

        let cfg = load_config(&path, 4000).unwrap();
        assert_eq!(cfg.listen_address_single_http_frontend, "0.0.0.0:4000");

        fs::write(&path, "listenAddressSingleHTTPFrontend: 127.0.0.1:9\n").unwrap();
        let cfg = load_config(&path, 4000).unwrap();
        assert_eq!(cfg.listen_address_single_http_frontend, "127.0.0.1:9");
    }

    #[test]
    #[serial]
    fn test_env_interpolation() {
        std::env::set_var("OLIVETIN_TEST_TITLE", "From Env");
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "pageTitle: \"${{ OLIVETIN_TEST_TITLE }}\"\n").unwrap();

        let cfg = load_config(&path, 1337).unwrap();
        std::env::remove_var("OLIVETIN_TEST_TITLE");

        assert_eq!(cfg.page_title, "From Env");
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "actions: [unclosed\n").unwrap();

        let err = load_config(&path, 1337).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.yaml"));
    }
}
