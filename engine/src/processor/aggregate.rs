//! Aggregate processor
//!
//! Buffers incoming messages into windows and emits one combined message
//! per window. A window closes when it reaches `max_size` messages or when
//! `timeout` has elapsed since its first message, whichever comes first;
//! with `group_by`, each distinct value of that field gets its own window.
//!
//! The output message is
//!
//! ```text
//! {count, window_start, window_end, items: [...buffered messages]}
//! ```
//!
//! with `items` in arrival order. Time-based closes happen on the route
//! executor's [`poll_due`](super::Processor::poll_due) tick, so a quiet
//! source still flushes its window. On route shutdown any non-empty window
//! is flushed downstream once, best-effort.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use parking_lot::Mutex;
use tokio::time::Instant;
use serde_json::Value;
use virta_core::message::now_iso8601;
use virta_core::{keys, Message, Result, RouteError};

use super::Processor;
use crate::config::AggregateStrategy;

#[derive(Debug)]
struct Window {
    key: String,
    items: Vec<Message>,
    opened: Instant,
    opened_at: String,
}

/// Windowing aggregator
#[derive(Debug)]
pub struct Aggregate {
    timeout: Duration,
    max_size: usize,
    group_by: Option<String>,
    // Windows in open order; group counts are expected to be small
    windows: Mutex<Vec<Window>>,
}

impl Aggregate {
    /// Build an aggregator; `max_size` must be positive
    pub fn new(
        strategy: AggregateStrategy,
        timeout: Duration,
        max_size: usize,
        group_by: Option<String>,
    ) -> Result<Self> {
        // Only `collect` exists today; the match keeps new strategies honest
        match strategy {
            AggregateStrategy::Collect => {}
        }
        if max_size == 0 {
            return Err(RouteError::Config(
                "aggregate max_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            timeout,
            max_size,
            group_by,
            windows: Mutex::new(Vec::new()),
        })
    }

    /// Number of currently buffered messages across all windows
    pub fn pending(&self) -> usize {
        self.windows.lock().iter().map(|w| w.items.len()).sum()
    }

    fn group_key(&self, msg: &Message) -> String {
        match &self.group_by {
            None => String::new(),
            Some(field) => match msg.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            },
        }
    }

    fn combine(&self, window: Window) -> Message {
        debug_assert!(!window.items.is_empty(), "combine on an empty window");

        let first = &window.items[0];
        let mut out = Message::new(first.source().unwrap_or("aggregate").to_string());
        if let Some(route) = first.route() {
            out.set(keys::ROUTE, route);
        }

        out.set(keys::COUNT, window.items.len() as u64);
        out.set(keys::WINDOW_START, window.opened_at);
        out.set(keys::WINDOW_END, now_iso8601());
        if self.group_by.is_some() {
            out.set(keys::GROUP, window.key);
        }
        out.set(
            keys::ITEMS,
            Value::Array(window.items.iter().map(Message::to_json).collect()),
        );
        out
    }
}

#[async_trait]
impl Processor for Aggregate {
    fn name(&self) -> &str {
        "aggregate"
    }

    async fn process(&self, msg: Message, _cancel: &CancellationToken) -> Result<Option<Message>> {
        let key = self.group_key(&msg);
        let mut windows = self.windows.lock();

        let idx = match windows.iter().position(|w| w.key == key) {
            Some(idx) => idx,
            None => {
                windows.push(Window {
                    key: key.clone(),
                    items: Vec::with_capacity(self.max_size),
                    opened: Instant::now(),
                    opened_at: now_iso8601(),
                });
                windows.len() - 1
            }
        };

        windows[idx].items.push(msg);

        let due = windows[idx].items.len() >= self.max_size
            || windows[idx].opened.elapsed() >= self.timeout;
        if due {
            let window = windows.remove(idx);
            drop(windows);
            return Ok(Some(self.combine(window)));
        }

        Ok(None)
    }

    fn poll_due(&self, now: Instant) -> Vec<Message> {
        let mut windows = self.windows.lock();
        let mut due = Vec::new();
        let mut idx = 0;
        while idx < windows.len() {
            if now.duration_since(windows[idx].opened) >= self.timeout {
                due.push(windows.remove(idx));
            } else {
                idx += 1;
            }
        }
        drop(windows);

        // Windows were stored in open order, so output is in completion order
        due.into_iter().map(|w| self.combine(w)).collect()
    }

    fn flush(&self) -> Vec<Message> {
        let windows = std::mem::take(&mut *self.windows.lock());
        windows.into_iter().map(|w| self.combine(w)).collect()
    }
}
