//! In-memory endpoints
//!
//! The test doubles for pipeline scenarios: a source that replays a fixed
//! list of messages and then reaches EOF, and a sink that collects what it
//! receives. Register them for a scheme with a closure capturing the
//! instance:
//!
//! ```ignore
//! let sink = MemorySink::new();
//! registry.register_sink("memory", {
//!     let sink = Arc::clone(&sink);
//!     move |_uri| Ok(Arc::clone(&sink) as Arc<dyn Sink>)
//! });
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use virta_core::{Message, Result};

use super::{MessageTx, Sink, Source};

/// Fixed-list source; EOF once the list is drained
#[derive(Debug)]
pub struct MemorySource {
    messages: Mutex<Vec<Message>>,
}

impl MemorySource {
    /// A source that will replay `messages` in order
    pub fn new(messages: Vec<Message>) -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(messages),
        })
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn run(&self, tx: MessageTx, cancel: CancellationToken) -> Result<()> {
        let messages = std::mem::take(&mut *self.messages.lock());
        for msg in messages {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !tx.send(msg).await {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Collecting sink
pub struct MemorySink {
    received: Mutex<Vec<Message>>,
}

impl MemorySink {
    /// An empty collecting sink
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }

    /// Everything delivered so far, in delivery order
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    /// Number of messages delivered so far
    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    /// Whether nothing has been delivered yet
    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, msg: &Message, _cancel: &CancellationToken) -> Result<()> {
        self.received.lock().push(msg.clone());
        Ok(())
    }
}
