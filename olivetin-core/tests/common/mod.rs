//! Test helper functions for integration tests
//!
//! Shared across the test files in this directory using the tests/common/
//! pattern. Not every file uses every helper.

#![allow(dead_code)]

use olivetin_core::acl::AuthenticatedUser;
use olivetin_core::config::{ConfigSource, DEFAULT_BASE_PORT};
use olivetin_core::executor::logs::InternalLogEntry;
use olivetin_core::executor::{ExecutionRequest, Executor};
use olivetin_core::Application;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Writes `config.yaml` into `dir` and returns a source pointing at it.
pub fn write_config(dir: &Path, yaml: &str) -> ConfigSource {
    let path = dir.join("config.yaml");
    std::fs::write(&path, yaml).expect("write config.yaml");

    ConfigSource {
        path: Some(path),
        base_port: DEFAULT_BASE_PORT,
    }
}

/// Loads `yaml` from a fresh temp dir and builds the action map, without
/// arming any trigger source.
pub async fn app_from_yaml(yaml: &str) -> (TempDir, Arc<Application>) {
    init_test_logging();

    let dir = TempDir::new().expect("temp dir");
    let app = Application::load(write_config(dir.path(), yaml)).expect("config loads");
    app.executor().rebuild_action_map().await;

    (dir, app)
}

/// Runs a binding as the guest and waits for it to finish.
pub async fn run_and_wait(executor: &Arc<Executor>, binding_id: &str, args: &[(&str, &str)]) -> InternalLogEntry {
    let tracking_id = start(executor, binding_id, args).await;
    wait_for_entry(executor, &tracking_id).await
}

/// Starts a binding as the guest and returns its tracking ID.
pub async fn start(executor: &Arc<Executor>, binding_id: &str, args: &[(&str, &str)]) -> String {
    let binding = executor
        .find_binding_by_id(binding_id)
        .await
        .unwrap_or_else(|| panic!("binding {binding_id} exists"));
    let cfg = executor.config().await;

    let arguments: BTreeMap<String, String> = args
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let req = ExecutionRequest::new(Some(binding), AuthenticatedUser::guest(&cfg)).with_arguments(arguments);
    executor.exec_request(req).await.tracking_id
}

/// Polls the log store until the entry is finished (10s at most).
pub async fn wait_for_entry(executor: &Executor, tracking_id: &str) -> InternalLogEntry {
    for _ in 0..200 {
        if let Some(handle) = executor.logs().get(tracking_id).await {
            let entry = handle.read().await.clone();
            if entry.execution_finished {
                return entry;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("execution {tracking_id} did not finish in time");
}

/// A started application serving on an ephemeral local port. Shuts down
/// when dropped.
pub struct TestServer {
    pub app: Arc<Application>,
    pub base_url: String,
    pub client: reqwest::Client,
    pub dir: TempDir,
}

impl TestServer {
    pub async fn start(yaml: &str) -> Self {
        init_test_logging();

        let dir = TempDir::new().expect("temp dir");
        let app = Application::load(write_config(dir.path(), yaml)).expect("config loads");
        app.start().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base_url = format!("http://{}", listener.local_addr().expect("local addr"));

        let server_app = Arc::clone(&app);
        tokio::spawn(async move { server_app.serve_on(listener).await });

        Self {
            app,
            base_url,
            client: reqwest::Client::new(),
            dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POSTs a JSON body to `/api/<operation>`.
    pub async fn call(&self, operation: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/api/{operation}")))
            .json(&body)
            .send()
            .await
            .expect("request sent")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.app.shutdown();
    }
}
