//! Engine supervisor
//!
//! Owns every route. Configuration problems are fatal before anything
//! starts; endpoint-start failures fail one route and leave its peers
//! alone. At most `max_concurrent_routes` routes run at once - the rest
//! wait in a pending set and start as slots free up.
//!
//! Shutdown is hierarchical: cancelling the engine token cancels each
//! route's child token, which cancels its source, in-flight external
//! subprocess, and sinks. Routes get `shutdown_grace` to drain cleanly;
//! whatever is still running after that is aborted (subprocesses die with
//! their owning task).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use virta_core::{Result, RouteError};

use crate::config::EngineConfig;
use crate::endpoint::EndpointRegistry;
use crate::metrics::Metrics;
use crate::route::{RouteExecutor, RouteState, StateBoard};

/// The route supervisor
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(config);
/// let shutdown = engine.shutdown_handle();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.cancel();
/// });
/// engine.run().await?;
/// ```
pub struct Engine {
    config: EngineConfig,
    registry: EndpointRegistry,
    env: Arc<HashMap<String, String>>,
    board: Arc<StateBoard>,
    cancel: CancellationToken,
}

impl Engine {
    /// An engine over the built-in endpoint registry and a snapshot of the
    /// current process environment
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: EndpointRegistry::with_defaults(),
            env: Arc::new(std::env::vars().collect()),
            board: StateBoard::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the endpoint registry (custom schemes, test doubles)
    pub fn with_registry(mut self, registry: EndpointRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the environment snapshot (tests, hermetic deployments)
    pub fn with_env_snapshot(mut self, env: HashMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Per-route state snapshot
    pub fn status(&self) -> HashMap<String, RouteState> {
        self.board.snapshot()
    }

    /// Token that stops the whole engine when cancelled
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validate configuration without starting anything
    ///
    /// Returns every problem found: document shape, missing environment
    /// variables, URIs that don't resolve or name unknown schemes, bad
    /// processor configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.config.validate();

        for var in &self.config.env_vars {
            if !self.env.contains_key(var) {
                errors.push(format!("required environment variable '{var}' is not set"));
            }
        }

        let board = StateBoard::new();
        for spec in &self.config.routes {
            if let Err(RouteError::Config(msg)) = RouteExecutor::build(
                spec,
                &self.registry,
                &self.env,
                &self.config.settings,
                board.clone(),
            ) {
                errors.push(format!("route '{}': {msg}", spec.name));
            }
        }

        errors
    }

    /// Run every route to completion or until the shutdown handle fires
    ///
    /// # Errors
    /// `Config` when the configuration is invalid; the engine refuses to
    /// start and no route runs.
    pub async fn run(&self) -> Result<()> {
        let shape_errors = self.config.validate();
        if !shape_errors.is_empty() {
            return Err(RouteError::Config(shape_errors.join("; ")));
        }
        let missing: Vec<&str> = self
            .config
            .env_vars
            .iter()
            .filter(|var| !self.env.contains_key(var.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(RouteError::Config(format!(
                "required environment variables not set: {}",
                missing.join(", ")
            )));
        }

        // Build every route up front. Config errors abort the engine;
        // endpoint-start errors fail only their route.
        let mut pending: VecDeque<RouteExecutor> = VecDeque::new();
        for spec in &self.config.routes {
            self.board.set(&spec.name, RouteState::Created);
            match RouteExecutor::build(
                spec,
                &self.registry,
                &self.env,
                &self.config.settings,
                Arc::clone(&self.board),
            ) {
                Ok(executor) => pending.push_back(executor),
                Err(RouteError::Config(msg)) => {
                    return Err(RouteError::Config(format!("route '{}': {msg}", spec.name)));
                }
                Err(e) => {
                    warn!(route = %spec.name, error = %e, "route failed to start");
                    if let Some(metrics) = Metrics::get() {
                        metrics.record_error(&spec.name, "startup", e.kind());
                    }
                    self.board.set(&spec.name, RouteState::Failed);
                }
            }
        }

        info!(
            routes = pending.len(),
            max_concurrent = self.config.settings.max_concurrent_routes,
            "engine starting"
        );

        let max_concurrent = self.config.settings.max_concurrent_routes.max(1);
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            while running.len() < max_concurrent {
                match pending.pop_front() {
                    Some(executor) => {
                        let route_cancel = self.cancel.child_token();
                        running.spawn(executor.run(route_cancel));
                    }
                    None => break,
                }
            }
            if running.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                joined = running.join_next() => {
                    if let Some(Err(e)) = joined {
                        error!(error = %e, "route task panicked");
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            // Never-started routes just stop
            for executor in pending.drain(..) {
                self.board.set(executor.name(), RouteState::Stopped);
            }

            let grace = self.config.settings.shutdown_grace();
            info!(grace = ?grace, "shutdown requested, draining routes");
            let drained = tokio::time::timeout(grace, async {
                while running.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!("shutdown grace expired, aborting remaining routes");
                running.abort_all();
                while running.join_next().await.is_some() {}
                for (name, state) in self.board.snapshot() {
                    if !state.is_terminal() {
                        self.board.set(&name, RouteState::Stopped);
                    }
                }
            }
        }

        info!("engine stopped");
        Ok(())
    }
}
