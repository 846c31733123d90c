//! VIRTA Runtime - engine lifecycle wiring
//!
//! Provides [`run()`] for zero-boilerplate engine startup, and
//! [`RuntimeBuilder`] for callers that need control over logging or signal
//! handling (embedding in a larger process, tests).
//!
//! # Quick start
//!
//! ```ignore
//! use virta_engine::EngineConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_json(load_parsed_document()?)?;
//!     virta_runtime::run(config).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;

use tokio::signal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use virta_engine::metrics::Metrics;
use virta_engine::{Engine, EndpointRegistry, EngineConfig};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output for terminals
    #[default]
    Pretty,
    /// One JSON object per line for log shippers
    Json,
}

/// Run an engine with default settings
///
/// Initialises tracing from `settings.log_level`, initialises metrics,
/// starts every route, and stops them cleanly on SIGINT/SIGTERM.
pub async fn run(config: EngineConfig) -> anyhow::Result<()> {
    RuntimeBuilder::new().run(config).await
}

/// Builder for controlling runtime behaviour
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .log_format(LogFormat::Json)
///     .registry(my_registry)
///     .run(config)
///     .await
/// ```
pub struct RuntimeBuilder {
    log_format: LogFormat,
    registry: Option<EndpointRegistry>,
    handle_signals: bool,
}

impl RuntimeBuilder {
    /// A builder with defaults: pretty logs, built-in endpoint registry,
    /// SIGINT/SIGTERM handling
    pub fn new() -> Self {
        Self {
            log_format: LogFormat::default(),
            registry: None,
            handle_signals: true,
        }
    }

    /// Set the log output format
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Use a custom endpoint registry (extra schemes, replaced stubs)
    pub fn registry(mut self, registry: EndpointRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Don't install signal handlers; the embedding process stops the
    /// engine through its shutdown handle instead
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Run the engine to completion
    ///
    /// This is the terminal method - it returns once every route reached a
    /// terminal state or shutdown completed.
    pub async fn run(self, config: EngineConfig) -> anyhow::Result<()> {
        init_tracing(&config.settings.log_level, self.log_format);
        Metrics::init()?;

        let mut engine = Engine::new(config);
        if let Some(registry) = self.registry {
            engine = engine.with_registry(registry);
        }

        if self.handle_signals {
            let shutdown = engine.shutdown_handle();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.cancel();
            });
        }

        engine.run().await?;

        let status = engine.status();
        let failed = status
            .values()
            .filter(|s| **s == virta_engine::RouteState::Failed)
            .count();
        info!(routes = status.len(), failed, "engine finished");
        Ok(())
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialise the tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise the configured level applies.
/// Idempotent so tests can call it repeatedly.
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_completes_for_finite_routes() {
        // No routes: the engine starts, finds nothing to do, and returns
        let config = EngineConfig::from_json(json!({})).unwrap();
        RuntimeBuilder::new()
            .without_signal_handlers()
            .run(config)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_config_surfaces_as_error() {
        let config = EngineConfig::from_json(json!({
            "routes": [{"name": "bad", "from": "quantum://x", "to": "log://"}]
        }))
        .unwrap();

        let err = RuntimeBuilder::new()
            .without_signal_handlers()
            .run(config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quantum"), "{err}");
    }
}
