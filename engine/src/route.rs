//! Route executor
//!
//! One executor per route. It wires the pieces together and owns them for
//! the route's lifetime:
//!
//! ```text
//! Source task ──► bounded queue ──► processor chain ──► concurrent fan-out
//!                                        ▲
//!                                   poll tick (time-bounded windows)
//! ```
//!
//! Messages move through processors strictly in source order; fan-out to
//! sinks is concurrent per message but message N completes (or times out)
//! at every sink before N+1 is offered, so each sink sees the post-chain
//! stream in order. A failing sink is logged and counted without touching
//! its peers. Per-message errors never stop the route; only a fatal source
//! error does.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use virta_core::{ErrorKind, Message, Result, RouteError};

use crate::config::{RouteSpec, Settings};
use crate::endpoint::{EndpointRegistry, MessageTx, Sink, Source};
use crate::metrics::Metrics;
use crate::processor::{self, Processor};
use crate::uri::EndpointUri;

/// Interval at which time-bounded aggregate windows are checked
const WINDOW_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle state of a route, as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    /// Declared but not yet started
    Created,
    /// Endpoints are being instantiated
    Starting,
    /// Source is producing
    Running,
    /// Draining after EOF or cancellation
    Stopping,
    /// Terminated cleanly
    Stopped,
    /// Source or startup failed unrecoverably
    Failed,
}

impl RouteState {
    /// Whether this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, RouteState::Stopped | RouteState::Failed)
    }
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RouteState::Created => "created",
            RouteState::Starting => "starting",
            RouteState::Running => "running",
            RouteState::Stopping => "stopping",
            RouteState::Stopped => "stopped",
            RouteState::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Shared per-route state snapshot, written by executors and read by
/// `Engine::status`
pub struct StateBoard {
    states: RwLock<HashMap<String, RouteState>>,
}

impl StateBoard {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            states: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn set(&self, route: &str, state: RouteState) {
        debug!(route, state = %state, "route state");
        self.states.write().insert(route.to_string(), state);
    }

    /// Current state of one route
    pub fn get(&self, route: &str) -> Option<RouteState> {
        self.states.read().get(route).copied()
    }

    /// Snapshot of every route's state
    pub fn snapshot(&self) -> HashMap<String, RouteState> {
        self.states.read().clone()
    }
}

/// Executes one route from start to terminal state
pub(crate) struct RouteExecutor {
    name: String,
    source: Arc<dyn Source>,
    processors: Vec<Arc<dyn Processor>>,
    sinks: Vec<(String, Arc<dyn Sink>)>,
    queue_capacity: usize,
    default_timeout: Duration,
    board: Arc<StateBoard>,
}

impl RouteExecutor {
    /// Resolve URIs and instantiate every driver for `spec`
    ///
    /// # Errors
    /// `Config` for invalid URIs, unknown schemes, or bad processor
    /// configuration (fatal for the whole engine); `EndpointStart` when a
    /// driver factory fails (fails only this route).
    pub(crate) fn build(
        spec: &RouteSpec,
        registry: &EndpointRegistry,
        env: &Arc<HashMap<String, String>>,
        settings: &Settings,
        board: Arc<StateBoard>,
    ) -> Result<Self> {
        let source_uri = EndpointUri::expand_and_parse(&spec.from, env)?;
        let source = registry.source(&source_uri)?;

        let mut processors = Vec::with_capacity(spec.processors.len());
        for proc_spec in &spec.processors {
            processors.push(processor::build(proc_spec, env)?);
        }

        let mut sinks = Vec::with_capacity(spec.to.len());
        for raw in &spec.to {
            let uri = EndpointUri::expand_and_parse(raw, env)?;
            let sink = registry.sink(&uri)?;
            sinks.push((uri.raw().to_string(), sink));
        }

        Ok(Self {
            name: spec.name.clone(),
            source,
            processors,
            sinks,
            queue_capacity: settings.queue_capacity.max(1),
            default_timeout: settings.default_timeout(),
            board,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Run the route to a terminal state
    pub(crate) async fn run(self, cancel: CancellationToken) {
        self.board.set(&self.name, RouteState::Starting);

        let (tx, mut rx) = mpsc::channel::<Message>(self.queue_capacity);
        let source_cancel = cancel.child_token();
        let source = Arc::clone(&self.source);
        let source_task = tokio::spawn({
            let tx = MessageTx::new(tx, self.name.clone());
            let cancel = source_cancel.clone();
            async move { source.run(tx, cancel).await }
        });

        self.board.set(&self.name, RouteState::Running);
        info!(route = %self.name, sinks = self.sinks.len(), "route running");

        let mut poll_tick = tokio::time::interval(WINDOW_POLL_INTERVAL);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = rx.recv() => match next {
                    Some(msg) => {
                        if let Some(metrics) = Metrics::get() {
                            metrics.observe_queue_depth(&self.name, rx.len());
                        }
                        self.run_chain(msg, 0, &cancel).await;
                    }
                    // Source finished and dropped its sender: EOF
                    None => break,
                },
                _ = poll_tick.tick() => self.poll_windows(&cancel).await,
            }
        }

        // Stop feeding: unblock a source suspended on a full queue, and
        // tell it to wind down.
        drop(rx);
        source_cancel.cancel();

        let source_result = match tokio::time::timeout(self.default_timeout, source_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(RouteError::SourceFatal(format!(
                "source task panicked: {join_err}"
            ))),
            Err(_) => Err(RouteError::SourceFatal(
                "source ignored cancellation".to_string(),
            )),
        };

        if let Err(e) = &source_result {
            if !cancelled {
                error!(route = %self.name, error = %e, "source failed, route stopping");
                if let Some(metrics) = Metrics::get() {
                    metrics.record_error(&self.name, "source", e.kind());
                }
                self.board.set(&self.name, RouteState::Failed);
                self.stop_drivers().await;
                return;
            }
            debug!(route = %self.name, error = %e, "source errored during shutdown");
        }

        self.board.set(&self.name, RouteState::Stopping);

        // Drain stateful processors once, best-effort: flushed windows run
        // through the rest of the chain and out to the sinks, bounded by
        // the per-delivery timeout even when the route token is cancelled.
        let flush_cancel = CancellationToken::new();
        for idx in 0..self.processors.len() {
            let flushed = self.processors[idx].flush();
            if flushed.is_empty() {
                continue;
            }
            let stage = self.processors[idx].name().to_string();
            debug!(route = %self.name, stage = %stage, count = flushed.len(), "flushing windows");
            for msg in flushed {
                if let Some(metrics) = Metrics::get() {
                    metrics
                        .messages_out
                        .with_label_values(&[&self.name, &stage])
                        .inc();
                }
                self.run_chain(msg, idx + 1, &flush_cancel).await;
            }
        }

        self.stop_drivers().await;
        self.board.set(&self.name, RouteState::Stopped);
        info!(route = %self.name, "route stopped");
    }

    /// Run `msg` through processors `from..`, then fan out to the sinks
    async fn run_chain(&self, mut msg: Message, from: usize, cancel: &CancellationToken) {
        let metrics = Metrics::get();

        for idx in from..self.processors.len() {
            let stage = self.processors[idx].name();
            let started = Instant::now();
            if let Some(m) = metrics {
                m.record_in(&self.name, stage);
            }
            match self.processors[idx].process(msg, cancel).await {
                Ok(Some(next)) => {
                    if let Some(m) = metrics {
                        m.record_out(&self.name, stage, started.elapsed());
                    }
                    msg = next;
                }
                Ok(None) => {
                    if let Some(m) = metrics {
                        m.record_drop(&self.name, stage, "filtered");
                    }
                    return;
                }
                Err(e) => {
                    if let Some(m) = metrics {
                        m.record_error(&self.name, stage, e.kind());
                    }
                    warn!(route = %self.name, stage, error = %e, "message dropped");
                    return;
                }
            }
        }

        self.fan_out(&msg, cancel).await;
    }

    /// Deliver to every sink concurrently, each bounded by the default
    /// timeout; failures are isolated per sink
    async fn fan_out(&self, msg: &Message, cancel: &CancellationToken) {
        let metrics = Metrics::get();

        let deliveries = self.sinks.iter().map(|(label, sink)| async move {
            let started = Instant::now();
            if let Some(m) = metrics {
                m.record_in(&self.name, label);
            }
            match tokio::time::timeout(self.default_timeout, sink.deliver(msg, cancel)).await {
                Ok(Ok(())) => {
                    if let Some(m) = metrics {
                        m.record_out(&self.name, label, started.elapsed());
                    }
                }
                Ok(Err(e)) => {
                    if let Some(m) = metrics {
                        m.record_error(&self.name, label, e.kind());
                    }
                    warn!(route = %self.name, sink = %label, error = %e, "delivery failed");
                }
                Err(_) => {
                    if let Some(m) = metrics {
                        m.record_error(&self.name, label, ErrorKind::Delivery);
                    }
                    warn!(
                        route = %self.name,
                        sink = %label,
                        timeout = ?self.default_timeout,
                        "delivery timed out"
                    );
                }
            }
        });

        futures::future::join_all(deliveries).await;
    }

    /// Close time-bounded windows and push them down the rest of the chain
    async fn poll_windows(&self, cancel: &CancellationToken) {
        let now = Instant::now();
        for idx in 0..self.processors.len() {
            let due = self.processors[idx].poll_due(now);
            if due.is_empty() {
                continue;
            }
            let stage = self.processors[idx].name().to_string();
            for msg in due {
                if let Some(metrics) = Metrics::get() {
                    metrics
                        .messages_out
                        .with_label_values(&[&self.name, &stage])
                        .inc();
                }
                self.run_chain(msg, idx + 1, cancel).await;
            }
        }
    }

    async fn stop_drivers(&self) {
        if let Err(e) = self.source.stop().await {
            debug!(route = %self.name, error = %e, "source stop");
        }
        for (label, sink) in &self.sinks {
            if let Err(e) = sink.stop().await {
                debug!(route = %self.name, sink = %label, error = %e, "sink stop");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::endpoint::{MemorySink, MemorySource};
    use serde_json::json;
    use virta_core::keys;

    fn route_spec(value: serde_json::Value) -> RouteSpec {
        serde_json::from_value(value).unwrap()
    }

    fn test_registry(
        source: Arc<MemorySource>,
        sink: Arc<MemorySink>,
    ) -> EndpointRegistry {
        let mut registry = EndpointRegistry::with_defaults();
        registry.register_source("memory", move |_uri| {
            Ok(Arc::clone(&source) as Arc<dyn Source>)
        });
        registry.register_sink("memory", move |_uri| {
            Ok(Arc::clone(&sink) as Arc<dyn Sink>)
        });
        registry
    }

    fn build(
        spec: &RouteSpec,
        registry: &EndpointRegistry,
    ) -> (RouteExecutor, Arc<StateBoard>) {
        let board = StateBoard::new();
        let executor = RouteExecutor::build(
            spec,
            registry,
            &Arc::new(HashMap::new()),
            &Settings::default(),
            Arc::clone(&board),
        )
        .unwrap();
        (executor, board)
    }

    fn numbers(values: &[i64]) -> Vec<Message> {
        values
            .iter()
            .map(|v| Message::new("memory://in").with_field("v", *v))
            .collect()
    }

    #[tokio::test]
    async fn test_filter_route_end_to_end() {
        let source = MemorySource::new(numbers(&[5, 15, 8, 20]));
        let sink = MemorySink::new();
        let registry = test_registry(source, Arc::clone(&sink));

        let spec = route_spec(json!({
            "name": "filter-e2e",
            "from": "memory://in",
            "processors": [{"type": "filter", "condition": "{{v}} > 10"}],
            "to": "memory://out"
        }));
        let (executor, board) = build(&spec, &registry);

        executor.run(CancellationToken::new()).await;

        let got: Vec<i64> = sink
            .received()
            .iter()
            .map(|m| m.as_i64("v").unwrap())
            .collect();
        assert_eq!(got, vec![15, 20]);
        assert_eq!(board.get("filter-e2e"), Some(RouteState::Stopped));
    }

    #[tokio::test]
    async fn test_transform_route_preserves_fields() {
        let source = MemorySource::new(vec![Message::new("memory://in")
            .with_field("name", "Ada")
            .with_field("n", 3)]);
        let sink = MemorySink::new();
        let registry = test_registry(source, Arc::clone(&sink));

        let spec = route_spec(json!({
            "name": "transform-e2e",
            "from": "memory://in",
            "processors": [{"type": "transform", "template": "Hi {{name}} ({{n}})"}],
            "to": "memory://out"
        }));
        let (executor, _board) = build(&spec, &registry);
        executor.run(CancellationToken::new()).await;

        let received = sink.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].as_str(keys::BODY), Some("Hi Ada (3)"));
        assert_eq!(received[0].as_str("name"), Some("Ada"));
        assert_eq!(received[0].route(), Some("transform-e2e"));
    }

    #[tokio::test]
    async fn test_processing_error_drops_message_but_route_continues() {
        // Second message lacks `v`: predicate errors, message dropped
        let source = MemorySource::new(vec![
            Message::new("memory://in").with_field("v", 15),
            Message::new("memory://in").with_field("other", 1),
            Message::new("memory://in").with_field("v", 20),
        ]);
        let sink = MemorySink::new();
        let registry = test_registry(source, Arc::clone(&sink));

        let spec = route_spec(json!({
            "name": "errors-continue",
            "from": "memory://in",
            "processors": [{"type": "filter", "condition": "{{v}} > 10"}],
            "to": "memory://out"
        }));
        let (executor, board) = build(&spec, &registry);
        executor.run(CancellationToken::new()).await;

        assert_eq!(sink.len(), 2);
        assert_eq!(board.get("errors-continue"), Some(RouteState::Stopped));
    }

    #[tokio::test]
    async fn test_fan_out_delivers_to_all_sinks_in_order() {
        let source = MemorySource::new(numbers(&[1, 2, 3]));
        let sink_a = MemorySink::new();
        let sink_b = MemorySink::new();

        let mut registry = EndpointRegistry::with_defaults();
        registry.register_source("memory", {
            let source = Arc::clone(&source);
            move |_uri| Ok(Arc::clone(&source) as Arc<dyn Source>)
        });
        let a = Arc::clone(&sink_a);
        let b = Arc::clone(&sink_b);
        registry.register_sink("memory", move |uri| {
            Ok(match uri.host.as_str() {
                "a" => Arc::clone(&a) as Arc<dyn Sink>,
                _ => Arc::clone(&b) as Arc<dyn Sink>,
            })
        });

        let spec = route_spec(json!({
            "name": "fan-out",
            "from": "memory://in",
            "to": ["memory://a", "memory://b"]
        }));
        let (executor, _board) = build(&spec, &registry);
        executor.run(CancellationToken::new()).await;

        let values = |sink: &MemorySink| -> Vec<i64> {
            sink.received().iter().map(|m| m.as_i64("v").unwrap()).collect()
        };
        assert_eq!(values(&sink_a), vec![1, 2, 3]);
        assert_eq!(values(&sink_b), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_peers() {
        struct FailingSink;

        #[async_trait::async_trait]
        impl Sink for FailingSink {
            fn name(&self) -> &str {
                "broken"
            }
            async fn deliver(&self, _msg: &Message, _cancel: &CancellationToken) -> Result<()> {
                Err(RouteError::delivery("broken", "always fails"))
            }
        }

        let source = MemorySource::new(numbers(&[1, 2]));
        let sink = MemorySink::new();

        let mut registry = EndpointRegistry::with_defaults();
        registry.register_source("memory", {
            let source = Arc::clone(&source);
            move |_uri| Ok(Arc::clone(&source) as Arc<dyn Source>)
        });
        let good = Arc::clone(&sink);
        registry.register_sink("memory", move |uri| {
            Ok(match uri.host.as_str() {
                "broken" => Arc::new(FailingSink) as Arc<dyn Sink>,
                _ => Arc::clone(&good) as Arc<dyn Sink>,
            })
        });

        let spec = route_spec(json!({
            "name": "sink-isolation",
            "from": "memory://in",
            "to": ["memory://broken", "memory://good"]
        }));
        let (executor, board) = build(&spec, &registry);
        executor.run(CancellationToken::new()).await;

        assert_eq!(sink.len(), 2, "healthy sink got every message");
        assert_eq!(board.get("sink-isolation"), Some(RouteState::Stopped));
    }

    #[tokio::test]
    async fn test_fatal_source_fails_route() {
        #[derive(Debug)]
        struct BrokenSource;

        #[async_trait::async_trait]
        impl Source for BrokenSource {
            fn name(&self) -> &str {
                "broken"
            }
            async fn run(&self, _tx: MessageTx, _cancel: CancellationToken) -> Result<()> {
                Err(RouteError::SourceFatal("handle closed".to_string()))
            }
        }

        let sink = MemorySink::new();
        let mut registry = EndpointRegistry::with_defaults();
        registry.register_source("memory", |_uri| Ok(Arc::new(BrokenSource) as Arc<dyn Source>));
        registry.register_sink("memory", {
            let sink = Arc::clone(&sink);
            move |_uri| Ok(Arc::clone(&sink) as Arc<dyn Sink>)
        });

        let spec = route_spec(json!({
            "name": "fatal-source",
            "from": "memory://in",
            "to": "memory://out"
        }));
        let (executor, board) = build(&spec, &registry);
        executor.run(CancellationToken::new()).await;

        assert_eq!(board.get("fatal-source"), Some(RouteState::Failed));
    }

    #[tokio::test]
    async fn test_aggregate_flushes_once_on_eof() {
        let source = MemorySource::new(numbers(&[1, 2]));
        let sink = MemorySink::new();
        let registry = test_registry(source, Arc::clone(&sink));

        // Window bounds far away: only the EOF drain can emit it
        let spec = route_spec(json!({
            "name": "agg-flush",
            "from": "memory://in",
            "processors": [{"type": "aggregate", "timeout": "1h", "max_size": 100}],
            "to": "memory://out"
        }));
        let (executor, board) = build(&spec, &registry);

        executor.run(CancellationToken::new()).await;

        let received = sink.received();
        assert_eq!(received.len(), 1, "window flushed exactly once");
        assert_eq!(received[0].as_i64(keys::COUNT), Some(2));
        assert_eq!(board.get("agg-flush"), Some(RouteState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_window_closes_on_timeout_without_input() {
        struct SlowThenQuiet(Arc<MemorySource>);

        // A source that emits two messages and then stays alive, quiet
        #[async_trait::async_trait]
        impl Source for SlowThenQuiet {
            fn name(&self) -> &str {
                "slow"
            }
            async fn run(&self, tx: MessageTx, cancel: CancellationToken) -> Result<()> {
                self.0.run(tx, cancel.clone()).await?;
                cancel.cancelled().await;
                Ok(())
            }
        }

        let inner = MemorySource::new(numbers(&[1, 2]));
        let sink = MemorySink::new();
        let mut registry = EndpointRegistry::with_defaults();
        registry.register_source("memory", {
            move |_uri| Ok(Arc::new(SlowThenQuiet(Arc::clone(&inner))) as Arc<dyn Source>)
        });
        registry.register_sink("memory", {
            let sink = Arc::clone(&sink);
            move |_uri| Ok(Arc::clone(&sink) as Arc<dyn Sink>)
        });

        let spec = route_spec(json!({
            "name": "agg-timeout",
            "from": "memory://in",
            "processors": [{"type": "aggregate", "timeout": "500ms", "max_size": 100}],
            "to": "memory://out"
        }));
        let (executor, _board) = build(&spec, &registry);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(executor.run(cancel.clone()));

        // Window opens, then times out with no further input
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.len(), 1, "poll tick closed the window");
        assert_eq!(sink.received()[0].as_i64(keys::COUNT), Some(2));

        cancel.cancel();
        task.await.unwrap();
    }
}
