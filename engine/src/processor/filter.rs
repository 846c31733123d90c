//! Filter processor
//!
//! Evaluates a boolean predicate against each message. True passes the
//! message through unchanged; false drops it cleanly. An evaluation error
//! (unknown variable, type mismatch) is a processing error and also drops
//! the message.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use virta_core::{Message, Result, RouteError};

use super::Processor;
use crate::expr::Predicate;

/// Predicate-based filter
#[derive(Debug)]
pub struct Filter {
    predicate: Predicate,
}

impl Filter {
    /// Parse the condition; parse failures are configuration errors
    pub fn new(condition: &str) -> Result<Self> {
        let predicate = Predicate::parse(condition)
            .map_err(|e| RouteError::Config(format!("filter condition: {e}")))?;
        Ok(Self { predicate })
    }
}

#[async_trait]
impl Processor for Filter {
    fn name(&self) -> &str {
        "filter"
    }

    async fn process(&self, msg: Message, _cancel: &CancellationToken) -> Result<Option<Message>> {
        match self.predicate.eval(&msg) {
            Ok(true) => Ok(Some(msg)),
            Ok(false) => Ok(None),
            Err(e) => Err(RouteError::processing("filter", e.to_string())),
        }
    }
}
