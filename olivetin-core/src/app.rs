//! The running service
//!
//! [`Application`] owns the registries every other part shares: the
//! executor (with its bindings and log store), the entity store, the event
//! bus and the session store. It also owns the cancellation tree. The root
//! token stops everything; a child token per config generation stops the
//! triggers and entity watchers that belong to an outdated config.

use crate::api::{self, ApiState};
use crate::auth::sessions::SessionStore;
use crate::config::{Config, ConfigSource};
use crate::entities::{files, EntityStore};
use crate::events::{Event, EventBus};
use crate::executor::{ExecutionListener, Executor, Metrics};
use crate::triggers::{self, watch};
use anyhow::{Context, Result};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Application {
    source: ConfigSource,
    executor: Arc<Executor>,
    sessions: Arc<SessionStore>,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
    generation: Mutex<CancellationToken>,
}

impl Application {
    /// Loads the configuration from `source`. A failure here is fatal.
    pub fn load(source: ConfigSource) -> Result<Arc<Self>> {
        let cfg = source.load().context("Failed to load configuration")?;
        Ok(Self::with_config(source, cfg))
    }

    pub fn with_config(source: ConfigSource, cfg: Config) -> Arc<Self> {
        let sessions = if cfg.auth_local_users.enabled {
            SessionStore::load(cfg.config_dir())
        } else {
            SessionStore::new(cfg.config_dir())
        };

        let events = Arc::new(EventBus::new());
        let mut executor = Executor::new(Arc::new(cfg), Arc::new(EntityStore::new()));
        let listener: Arc<dyn ExecutionListener> = events.clone();
        executor.add_listener(listener);

        let shutdown = CancellationToken::new();
        let generation = Mutex::new(shutdown.child_token());

        Arc::new(Self {
            source,
            executor: Arc::new(executor),
            sessions: Arc::new(sessions),
            events,
            shutdown,
            generation,
        })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn metrics(&self) -> Metrics {
        self.executor.metrics()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops watchers, timers and the HTTP server.
    pub fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown.cancel();
    }

    /// Loads entities, builds the action map, restores saved logs, arms
    /// every trigger source and runs the startup actions.
    pub async fn start(self: &Arc<Self>) {
        let cfg = self.executor.config().await;
        let generation = self.next_generation().await;

        files::spawn_entity_watchers(&cfg, Arc::clone(self.executor.entities()), generation.clone()).await;
        self.executor.rebuild_action_map().await;
        self.executor.load_logs_from_disk().await;
        triggers::schedule_all(&self.executor, &generation).await;

        self.spawn_entity_listener();
        self.spawn_config_watchers(&cfg);

        let started = triggers::startup::execute(&self.executor).await;
        info!(startup_actions = started.len(), "Application started");
    }

    /// Re-reads the configuration. On failure the running config stays in
    /// force and `false` is returned.
    pub async fn reload(&self) -> bool {
        let cfg = match self.source.load() {
            Ok(cfg) => Arc::new(cfg),
            Err(e) => {
                error!(error = %format!("{:#}", anyhow::Error::new(e)), "Config reload failed, keeping the previous config");
                return false;
            }
        };

        let generation = self.next_generation().await;

        self.executor.set_config(Arc::clone(&cfg)).await;
        files::spawn_entity_watchers(&cfg, Arc::clone(self.executor.entities()), generation.clone()).await;
        triggers::schedule_all(&self.executor, &generation).await;

        info!(actions = cfg.actions.len(), "Config reloaded");
        true
    }

    pub fn router(&self) -> Router {
        api::router(Arc::new(ApiState {
            executor: Arc::clone(&self.executor),
            sessions: Arc::clone(&self.sessions),
            events: Arc::clone(&self.events),
            shutdown: self.shutdown.clone(),
        }))
    }

    /// Binds `listenAddressSingleHTTPFrontend` and serves until shutdown.
    pub async fn serve(&self) -> Result<()> {
        let address = self.executor.config().await.listen_address_single_http_frontend.clone();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to listen on {}", address))?;

        self.serve_on(listener).await
    }

    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        let address = listener.local_addr().context("Listener has no local address")?;
        info!(%address, "HTTP frontend listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("HTTP frontend failed")?;

        info!("HTTP frontend stopped");
        Ok(())
    }

    /// Cancels the previous generation and hands out a fresh one.
    async fn next_generation(&self) -> CancellationToken {
        let mut current = self.generation.lock().await;
        current.cancel();
        *current = self.shutdown.child_token();
        current.clone()
    }

    /// Entity changes rebuild the bindings and tell clients.
    fn spawn_entity_listener(&self) {
        let mut changed = self.executor.entities().subscribe();
        let executor = Arc::clone(&self.executor);
        let events = Arc::clone(&self.events);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let class = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = changed.recv() => match msg {
                        Ok(class) => class,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Missed entity change notifications");
                            String::new()
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                debug!(class = %class, "Entities changed");
                executor.rebuild_action_map().await;
                events.broadcast(Event::EntityChanged {}).await;
            }
        });
    }

    fn spawn_config_watchers(self: &Arc<Self>, cfg: &Config) {
        let Some(path) = self.source.path.clone() else {
            debug!("No config file, hot reload disabled");
            return;
        };

        match watch::watch_file(&path, self.shutdown.clone()) {
            Ok(rx) => self.reload_on(rx),
            Err(e) => error!(path = %path.display(), error = %format!("{:#}", e), "Cannot watch config file"),
        }

        if let Some(dir) = self.source.include_dir(cfg) {
            match watch::watch_path(&dir, None, watch::WatchInterest::CreateOrWrite, self.shutdown.clone()) {
                Ok(rx) => self.reload_on(rx),
                Err(e) => error!(dir = %dir.display(), error = %format!("{:#}", e), "Cannot watch include directory"),
            }
        }
    }

    fn reload_on(self: &Arc<Self>, mut changes: mpsc::UnboundedReceiver<PathBuf>) {
        let app = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(path) = changes.recv().await {
                info!(path = %path.display(), "Config changed, reloading");
                app.reload().await;
            }
        });
    }
}
