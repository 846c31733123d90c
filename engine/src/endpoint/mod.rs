//! Endpoint drivers for VIRTA
//!
//! An endpoint is a URI-named party at either end of a route. Sources are
//! long-lived producers pushing messages into the route's bounded queue;
//! sinks accept finalized messages. Both are pluggable via traits, looked
//! up by scheme in the [`EndpointRegistry`]:
//!
//! ```text
//! timer://5s ──► Source ──► MessageTx ──► (route) ──► Sink ──► log://
//! ```
//!
//! # Built-in schemes
//!
//! - `timer` (source) - periodic ticks
//! - `file` (source + sink) - glob watch / file writer
//! - `log` (sink) - stdout or file lines
//! - `http` (source + sink) - listener / JSON POST
//! - `mqtt` (source + sink) - subscribe / publish
//! - `grpc`, `rtsp`, `email`, `webhook` - stubs until an implementation is
//!   registered

mod file;
mod http;
mod log;
mod memory;
mod mqtt;
mod stub;
mod timer;

pub use file::{FileSink, FileSource};
pub use http::{HttpSink, HttpSource};
pub use log::LogSink;
pub use memory::{MemorySink, MemorySource};
pub use mqtt::{MqttSink, MqttSource};
pub use timer::TimerSource;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use virta_core::{keys, Message, Result, RouteError};

use crate::metrics::Metrics;
use crate::uri::EndpointUri;

/// A long-lived producer of messages
///
/// `run` is the driver's whole lifetime: produce messages into `tx` until
/// the source is exhausted (return `Ok`), the route is cancelled (return
/// `Ok` promptly), or something unrecoverable happens (return the error;
/// the route transitions to `Failed`). Drivers must check `cancel` between
/// I/O operations.
#[async_trait]
pub trait Source: Send + Sync + std::fmt::Debug {
    /// Driver name for logging and metrics
    fn name(&self) -> &str;

    /// Produce messages until EOF, cancellation, or an unrecoverable error
    async fn run(&self, tx: MessageTx, cancel: CancellationToken) -> Result<()>;

    /// Release any resources held outside `run`
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// A destination that accepts finalized messages
#[async_trait]
pub trait Sink: Send + Sync {
    /// Driver name for logging and metrics
    fn name(&self) -> &str;

    /// Deliver one message; errors fail only this delivery
    async fn deliver(&self, msg: &Message, cancel: &CancellationToken) -> Result<()>;

    /// Release any resources held across deliveries
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Producer half of a route's bounded queue
///
/// Wraps the channel so drivers never see the collection type, and so the
/// route name is stamped onto every message exactly once.
#[derive(Clone)]
pub struct MessageTx {
    tx: mpsc::Sender<Message>,
    route: String,
}

impl MessageTx {
    pub(crate) fn new(tx: mpsc::Sender<Message>, route: impl Into<String>) -> Self {
        Self {
            tx,
            route: route.into(),
        }
    }

    /// The route this queue feeds
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Enqueue with backpressure: suspends while the queue is full.
    /// Returns `false` once the route has stopped consuming.
    pub async fn send(&self, mut msg: Message) -> bool {
        msg.set(keys::ROUTE, self.route.clone());
        self.tx.send(msg).await.is_ok()
    }

    /// Enqueue without suspending, for sources pushed from network
    /// callbacks that cannot block. A full queue drops the message and
    /// bumps the route's drop counter; returns `false` when dropped.
    pub fn try_send(&self, mut msg: Message, stage: &str) -> bool {
        msg.set(keys::ROUTE, self.route.clone());
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if let Some(metrics) = Metrics::get() {
                    metrics.record_drop(&self.route, stage, "queue_full");
                }
                tracing::warn!(route = %self.route, stage, "queue full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Builds a source driver from a parsed URI
pub type SourceFactory = Arc<dyn Fn(&EndpointUri) -> Result<Arc<dyn Source>> + Send + Sync>;

/// Builds a sink driver from a parsed URI
pub type SinkFactory = Arc<dyn Fn(&EndpointUri) -> Result<Arc<dyn Sink>> + Send + Sync>;

/// Maps URI schemes to driver factories, per role
///
/// Some schemes support both roles; which factory is consulted depends on
/// the endpoint's position in the route (`from` vs `to`).
pub struct EndpointRegistry {
    sources: HashMap<String, SourceFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl EndpointRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            sinks: HashMap::new(),
        }
    }

    /// A registry with every built-in scheme registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_source("timer", |uri| {
            Ok(Arc::new(TimerSource::from_uri(uri)?) as Arc<dyn Source>)
        });
        registry.register_source("file", |uri| {
            Ok(Arc::new(FileSource::from_uri(uri)?) as Arc<dyn Source>)
        });
        registry.register_source("http", |uri| {
            Ok(Arc::new(HttpSource::from_uri(uri)?) as Arc<dyn Source>)
        });
        registry.register_source("mqtt", |uri| {
            Ok(Arc::new(MqttSource::from_uri(uri)?) as Arc<dyn Source>)
        });

        registry.register_sink("file", |uri| {
            Ok(Arc::new(FileSink::from_uri(uri)?) as Arc<dyn Sink>)
        });
        registry.register_sink("log", |uri| {
            Ok(Arc::new(LogSink::from_uri(uri)?) as Arc<dyn Sink>)
        });
        registry.register_sink("http", |uri| {
            Ok(Arc::new(HttpSink::from_uri(uri)?) as Arc<dyn Sink>)
        });
        registry.register_sink("https", |uri| {
            Ok(Arc::new(HttpSink::from_uri(uri)?) as Arc<dyn Sink>)
        });
        registry.register_sink("mqtt", |uri| {
            Ok(Arc::new(MqttSink::from_uri(uri)?) as Arc<dyn Sink>)
        });

        // Optional schemes ship as stubs; registering a real factory for
        // the scheme replaces them.
        for scheme in ["grpc", "rtsp", "email", "webhook"] {
            registry
                .sources
                .insert(scheme.to_string(), stub::source_factory(scheme));
            registry
                .sinks
                .insert(scheme.to_string(), stub::sink_factory(scheme));
        }

        registry
    }

    /// Register (or replace) a source factory for a scheme
    pub fn register_source<F>(&mut self, scheme: impl Into<String>, factory: F)
    where
        F: Fn(&EndpointUri) -> Result<Arc<dyn Source>> + Send + Sync + 'static,
    {
        self.sources.insert(scheme.into(), Arc::new(factory));
    }

    /// Register (or replace) a sink factory for a scheme
    pub fn register_sink<F>(&mut self, scheme: impl Into<String>, factory: F)
    where
        F: Fn(&EndpointUri) -> Result<Arc<dyn Sink>> + Send + Sync + 'static,
    {
        self.sinks.insert(scheme.into(), Arc::new(factory));
    }

    /// Whether a scheme has a source factory
    pub fn has_source(&self, scheme: &str) -> bool {
        self.sources.contains_key(scheme)
    }

    /// Whether a scheme has a sink factory
    pub fn has_sink(&self, scheme: &str) -> bool {
        self.sinks.contains_key(scheme)
    }

    /// Build a source driver for `uri`
    ///
    /// # Errors
    /// `Config` for an unknown scheme; whatever the factory raises
    /// otherwise (typically `EndpointStart`).
    pub fn source(&self, uri: &EndpointUri) -> Result<Arc<dyn Source>> {
        let factory = self.sources.get(&uri.scheme).ok_or_else(|| {
            RouteError::Config(format!("unknown source scheme '{}'", uri.scheme))
        })?;
        factory(uri)
    }

    /// Build a sink driver for `uri`
    pub fn sink(&self, uri: &EndpointUri) -> Result<Arc<dyn Sink>> {
        let factory = self.sinks.get(&uri.scheme).ok_or_else(|| {
            RouteError::Config(format!("unknown sink scheme '{}'", uri.scheme))
        })?;
        factory(uri)
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_required_schemes() {
        let registry = EndpointRegistry::with_defaults();

        for scheme in ["timer", "file", "http", "mqtt", "grpc", "rtsp"] {
            assert!(registry.has_source(scheme), "missing source {scheme}");
        }
        for scheme in ["file", "log", "http", "mqtt", "email", "webhook"] {
            assert!(registry.has_sink(scheme), "missing sink {scheme}");
        }
        // log is sink-only, timer is source-only
        assert!(!registry.has_source("log"));
        assert!(!registry.has_sink("timer"));
    }

    #[test]
    fn test_unknown_scheme_is_config_error() {
        let registry = EndpointRegistry::with_defaults();
        let uri = EndpointUri::parse("carrier-pigeon://coop").unwrap();

        let err = registry.source(&uri).unwrap_err();
        assert!(matches!(err, RouteError::Config(_)), "{err}");
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_stub_schemes_fail_at_start() {
        let registry = EndpointRegistry::with_defaults();
        let uri = EndpointUri::parse("rtsp://cam.local:554/stream").unwrap();

        let err = registry.source(&uri).unwrap_err();
        assert!(matches!(err, RouteError::EndpointStart { .. }), "{err}");
    }

    #[test]
    fn test_registration_replaces_stub() {
        let mut registry = EndpointRegistry::with_defaults();
        registry.register_source("rtsp", |_uri| {
            Ok(MemorySource::new(vec![]) as Arc<dyn Source>)
        });

        let uri = EndpointUri::parse("rtsp://cam.local:554/stream").unwrap();
        assert!(registry.source(&uri).is_ok());
    }

    #[tokio::test]
    async fn test_message_tx_stamps_route() {
        let (tx, mut rx) = mpsc::channel(4);
        let mtx = MessageTx::new(tx, "my-route");

        assert!(mtx.send(Message::new("test://")).await);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.route(), Some("my-route"));
    }

    #[tokio::test]
    async fn test_try_send_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mtx = MessageTx::new(tx, "push-route");

        assert!(mtx.try_send(Message::new("test://"), "http"));
        // Queue holds one message; the second is dropped, not buffered
        assert!(!mtx.try_send(Message::new("test://"), "http"));

        assert!(rx.recv().await.is_some());
        // Only the first message made it through
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_reports_closed_route() {
        let (tx, rx) = mpsc::channel(1);
        let mtx = MessageTx::new(tx, "gone");
        drop(rx);

        assert!(!mtx.send(Message::new("test://")).await);
        assert!(!mtx.try_send(Message::new("test://"), "src"));
    }
}
