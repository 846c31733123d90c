//! End-to-end route scenarios
//!
//! Each test drives a full engine - real supervisor, route executor,
//! processors, and drivers - with in-memory endpoints standing in for the
//! network ones. Timing-sensitive scenarios run on tokio's paused clock;
//! subprocess scenarios use `sh` and run in real time.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use virta_core::{keys, Message};
use virta_engine::endpoint::{MemorySink, MemorySource};
use virta_engine::{Engine, EndpointRegistry, EngineConfig, Metrics, RouteState, Sink, Source};

fn config(value: serde_json::Value) -> EngineConfig {
    EngineConfig::from_json(value).unwrap()
}

/// Registry where `memory://…` sources replay `messages` and all
/// `memory://…` sinks share one collector
fn memory_registry(messages: Vec<Message>, sink: Arc<MemorySink>) -> EndpointRegistry {
    let mut registry = EndpointRegistry::with_defaults();
    let source = MemorySource::new(messages);
    registry.register_source("memory", move |_uri| {
        Ok(Arc::clone(&source) as Arc<dyn Source>)
    });
    registry.register_sink("memory", move |_uri| {
        Ok(Arc::clone(&sink) as Arc<dyn Sink>)
    });
    registry
}

// ─────────────────────────────────────────────────────────────────────────
// S1: timer → log
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn s1_timer_to_log_emits_numbered_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("ticks.log");

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "s1",
            "from": "timer://250ms",
            "to": format!("log://{}", log_path.display())
        }]
    })));

    let shutdown = engine.shutdown_handle();
    let engine = Arc::new(engine);
    let task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    tokio::time::sleep(Duration::from_millis(1100)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    let content = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 4, "250ms timer over 1.1s yields 4 ticks");

    let mut last_timestamp = String::new();
    for (expected_id, line) in lines.iter().enumerate() {
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["tick_id"], expected_id as u64);
        assert_eq!(parsed["source"], "timer://250ms");
        let timestamp = parsed["timestamp"].as_str().unwrap().to_string();
        assert!(timestamp >= last_timestamp, "timestamps must not go back");
        last_timestamp = timestamp;
    }

    assert_eq!(engine.status().get("s1"), Some(&RouteState::Stopped));
}

// ─────────────────────────────────────────────────────────────────────────
// S2: filter
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s2_filter_keeps_only_matching_messages() {
    let inputs = [5, 15, 8, 20]
        .iter()
        .map(|v| Message::new("memory://in").with_field("v", *v))
        .collect();
    let sink = MemorySink::new();

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "s2",
            "from": "memory://in",
            "processors": [{"type": "filter", "condition": "{{v}} > 10"}],
            "to": "memory://out"
        }]
    })))
    .with_registry(memory_registry(inputs, Arc::clone(&sink)));

    engine.run().await.unwrap();

    let got: Vec<i64> = sink
        .received()
        .iter()
        .map(|m| m.as_i64("v").unwrap())
        .collect();
    assert_eq!(got, vec![15, 20]);
}

// ─────────────────────────────────────────────────────────────────────────
// S3: transform
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s3_transform_renders_body_and_keeps_fields() {
    let inputs = vec![Message::new("memory://in")
        .with_field("name", "Ada")
        .with_field("n", 3)];
    let sink = MemorySink::new();

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "s3",
            "from": "memory://in",
            "processors": [{"type": "transform", "template": "Hi {{name}} ({{n}})"}],
            "to": "memory://out"
        }]
    })))
    .with_registry(memory_registry(inputs, Arc::clone(&sink)));

    engine.run().await.unwrap();

    let received = sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_str(keys::BODY), Some("Hi Ada (3)"));
    assert_eq!(received[0].as_str("name"), Some("Ada"));
    assert_eq!(received[0].as_i64("n"), Some(3));
}

// ─────────────────────────────────────────────────────────────────────────
// S4: aggregate collect over a timer
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn s4_aggregate_windows_over_timer_source() {
    let sink = MemorySink::new();
    let mut registry = EndpointRegistry::with_defaults();
    registry.register_sink("memory", {
        let sink = Arc::clone(&sink);
        move |_uri| Ok(Arc::clone(&sink) as Arc<dyn Sink>)
    });

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "s4",
            "from": "timer://100ms",
            "processors": [
                {"type": "aggregate", "strategy": "collect", "timeout": "500ms", "max_size": 3}
            ],
            "to": "memory://out"
        }]
    })))
    .with_registry(registry);

    let shutdown = engine.shutdown_handle();
    let engine = Arc::new(engine);
    let task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    tokio::time::sleep(Duration::from_millis(1250)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    let windows = sink.received();
    assert!(windows.len() >= 4, "got {} windows", windows.len());

    for (idx, window) in windows.iter().enumerate() {
        let count = window.as_i64(keys::COUNT).unwrap();
        let items = window.get(keys::ITEMS).unwrap().as_array().unwrap();
        assert_eq!(items.len() as i64, count);
        assert!(count <= 3, "no window may exceed max_size");
        if idx + 1 < windows.len() {
            assert_eq!(count, 3, "only the final window may be partial");
        }
        assert!(window.as_str(keys::WINDOW_START).is_some());
        assert!(window.as_str(keys::WINDOW_END).is_some());
    }

    // Windows partition the tick stream in order
    let ids: Vec<i64> = windows
        .iter()
        .flat_map(|w| w.get(keys::ITEMS).unwrap().as_array().unwrap().clone())
        .map(|item| item["tick_id"].as_i64().unwrap())
        .collect();
    let expected: Vec<i64> = (0..ids.len() as i64).collect();
    assert_eq!(ids, expected);
}

// ─────────────────────────────────────────────────────────────────────────
// S5: external subprocess
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s5_external_subprocess_transforms_message() {
    let inputs = vec![Message::new("memory://in").with_field("n", 21)];
    let sink = MemorySink::new();

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "s5",
            "from": "memory://in",
            "processors": [{
                "type": "external",
                "command": [
                    "sh", "-c",
                    r#"sed 's/}$/,"doubled":42}/' < "${0#--input=}" > "${1#--output=}""#
                ]
            }],
            "to": "memory://out"
        }]
    })))
    .with_registry(memory_registry(inputs, Arc::clone(&sink)));

    let started = std::time::Instant::now();
    engine.run().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let received = sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_i64("n"), Some(21));
    assert_eq!(received[0].as_i64("doubled"), Some(42));
}

#[tokio::test]
async fn s5_missing_binary_drops_message_and_counts_error() {
    let metrics = Metrics::init().unwrap();
    let inputs = vec![Message::new("memory://in").with_field("n", 21)];
    let sink = MemorySink::new();

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "s5-missing",
            "from": "memory://in",
            "processors": [{"type": "external", "command": ["/nonexistent/virta-helper"]}],
            "to": "memory://out"
        }]
    })))
    .with_registry(memory_registry(inputs, Arc::clone(&sink)));

    engine.run().await.unwrap();

    assert!(sink.is_empty(), "message must be dropped");
    assert_eq!(
        metrics
            .errors
            .with_label_values(&["s5-missing", "external", "external_process"])
            .get(),
        1.0
    );
    // The route survives its processor's failure
    assert_eq!(engine.status().get("s5-missing"), Some(&RouteState::Stopped));
}

// ─────────────────────────────────────────────────────────────────────────
// S6: external timeout
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s6_external_timeout_kills_subprocess() {
    let metrics = Metrics::init().unwrap();
    let inputs = vec![Message::new("memory://in").with_field("n", 1)];
    let sink = MemorySink::new();

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "s6",
            "from": "memory://in",
            "processors": [{
                "type": "external",
                "command": ["sh", "-c", "sleep 10"],
                "config": {"timeout": 1}
            }],
            "to": "memory://out"
        }]
    })))
    .with_registry(memory_registry(inputs, Arc::clone(&sink)));

    let started = std::time::Instant::now();
    engine.run().await.unwrap();
    let elapsed = started.elapsed();

    assert!(sink.is_empty(), "timed-out message produces no output");
    assert!(
        elapsed < Duration::from_secs(4),
        "subprocess must die at the deadline, not after 10s (took {elapsed:?})"
    );
    assert_eq!(
        metrics
            .external_timeouts
            .with_label_values(&["s6", "external"])
            .get(),
        1.0
    );
}

// ─────────────────────────────────────────────────────────────────────────
// Cancellation termination
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancel_brings_every_route_to_a_terminal_state() {
    let sink = MemorySink::new();
    let mut registry = EndpointRegistry::with_defaults();
    registry.register_sink("memory", {
        let sink = Arc::clone(&sink);
        move |_uri| Ok(Arc::clone(&sink) as Arc<dyn Sink>)
    });

    let engine = Engine::new(config(json!({
        "routes": [
            {"name": "fast", "from": "timer://50ms", "to": "memory://out"},
            {"name": "slow", "from": "timer://10s", "to": "memory://out"},
            {"name": "broken", "from": "rtsp://cam:554/s", "to": "memory://out"}
        ],
        "settings": {"shutdown_grace": 2}
    })));
    let engine = engine.with_registry(registry);

    let shutdown = engine.shutdown_handle();
    let engine = Arc::new(engine);
    let task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    let status = engine.status();
    assert_eq!(status.len(), 3);
    for (name, state) in &status {
        assert!(state.is_terminal(), "route '{name}' ended in {state}");
    }
    assert_eq!(status.get("broken"), Some(&RouteState::Failed));
}

// ─────────────────────────────────────────────────────────────────────────
// Chained processors
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chain_applies_processors_in_declared_order() {
    let inputs = [2, 12, 30]
        .iter()
        .map(|v| Message::new("memory://in").with_field("v", *v))
        .collect();
    let sink = MemorySink::new();

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "chained",
            "from": "memory://in",
            "processors": [
                {"type": "filter", "condition": "{{v}} > 10"},
                {"type": "debug", "prefix": "kept"},
                {"type": "transform", "template": "value={{v}}"}
            ],
            "to": "memory://out"
        }]
    })))
    .with_registry(memory_registry(inputs, Arc::clone(&sink)));

    engine.run().await.unwrap();

    let bodies: Vec<String> = sink.received().iter().map(|m| m.body_str()).collect();
    assert_eq!(bodies, vec!["value=12", "value=30"]);
}

// ─────────────────────────────────────────────────────────────────────────
// Conservation: in = out + drops + errors per stage
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stage_counters_are_conserved() {
    let metrics = Metrics::init().unwrap();
    // 2 pass, 1 dropped by predicate, 1 predicate error (missing field)
    let inputs = vec![
        Message::new("memory://in").with_field("v", 15),
        Message::new("memory://in").with_field("v", 5),
        Message::new("memory://in").with_field("w", 1),
        Message::new("memory://in").with_field("v", 25),
    ];
    let sink = MemorySink::new();

    let engine = Engine::new(config(json!({
        "routes": [{
            "name": "conserved",
            "from": "memory://in",
            "processors": [{"type": "filter", "condition": "{{v}} > 10"}],
            "to": "memory://out"
        }]
    })))
    .with_registry(memory_registry(inputs, Arc::clone(&sink)));

    engine.run().await.unwrap();

    let label = |vec: &prometheus::CounterVec, labels: &[&str]| vec.with_label_values(labels).get();
    let messages_in = label(&metrics.messages_in, &["conserved", "filter"]);
    let messages_out = label(&metrics.messages_out, &["conserved", "filter"]);
    let drops = label(&metrics.drops, &["conserved", "filter", "filtered"]);
    let errors = metrics
        .errors
        .with_label_values(&["conserved", "filter", "processing"])
        .get();

    assert_eq!(messages_in, 4.0);
    assert_eq!(messages_out, 2.0);
    assert_eq!(drops, 1.0);
    assert_eq!(errors, 1.0);
    assert_eq!(messages_in, messages_out + drops + errors);
    assert_eq!(sink.len(), 2);
}
