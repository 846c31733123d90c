//! Debug processor
//!
//! Logs the message verbatim under a configured prefix and forwards it
//! unchanged.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use virta_core::{Message, Result};

use super::Processor;

/// Log-and-forward stage
#[derive(Debug)]
pub struct DebugProcessor {
    prefix: String,
}

impl DebugProcessor {
    /// A debug stage with the given log prefix
    pub fn new(prefix: String) -> Self {
        Self { prefix }
    }
}

#[async_trait]
impl Processor for DebugProcessor {
    fn name(&self) -> &str {
        "debug"
    }

    async fn process(&self, msg: Message, _cancel: &CancellationToken) -> Result<Option<Message>> {
        tracing::info!(prefix = %self.prefix, message = %msg, "debug");
        Ok(Some(msg))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forwards_unchanged() {
        let debug = DebugProcessor::new("TRACE".to_string());
        let msg = Message::new("test://").with_field("v", 1);

        let out = debug.process(msg.clone(), &CancellationToken::new()).await.unwrap().unwrap();
        assert_eq!(out, msg);
    }
}
