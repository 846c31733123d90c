//! Processor chain stages
//!
//! Processors sit between a route's source and its sinks and run in
//! declared order:
//!
//! ```text
//! queue ──► filter ──► transform ──► aggregate ──► external ──► fan-out
//! ```
//!
//! # Return value contract
//!
//! - `Ok(Some(message))` - pass downstream (possibly a different message)
//! - `Ok(None)` - the message stops here: filter false, aggregate
//!   buffering. Not an error.
//! - `Err(_)` - the message is dropped and the error counted; the route
//!   keeps running.
//!
//! # Lifecycle
//!
//! Aggregate is the only stateful stage. The route executor calls
//! [`Processor::poll_due`] on a short tick so time-bounded windows close
//! without needing new input, and [`Processor::flush`] once on shutdown so
//! a non-empty window is delivered best-effort before the route stops.

mod aggregate;
mod debug;
mod external;
mod filter;
mod transform;

pub use aggregate::Aggregate;
pub use debug::DebugProcessor;
pub use external::External;
pub use filter::Filter;
pub use transform::Transform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use virta_core::{Message, Result};

use crate::config::ProcessorSpec;

/// A stage in a route's processor chain
#[async_trait]
pub trait Processor: Send + Sync + std::fmt::Debug {
    /// Stage name for logging and metrics
    fn name(&self) -> &str;

    /// Process one message
    ///
    /// `cancel` is the route's cancellation signal; stages that suspend
    /// (external subprocesses) must honor it.
    async fn process(&self, msg: Message, cancel: &CancellationToken) -> Result<Option<Message>>;

    /// Windows whose time bound has passed; the executor forwards them to
    /// the stages after this one
    fn poll_due(&self, now: Instant) -> Vec<Message> {
        let _ = now;
        Vec::new()
    }

    /// Buffered messages to deliver before shutdown
    fn flush(&self) -> Vec<Message> {
        Vec::new()
    }
}

/// Build a processor from its configuration
///
/// Configuration problems (bad predicate, bad template, empty command)
/// surface as `Config` errors here, at route build time.
pub fn build(
    spec: &ProcessorSpec,
    env: &Arc<HashMap<String, String>>,
) -> Result<Arc<dyn Processor>> {
    match spec {
        ProcessorSpec::Filter { condition } => {
            Ok(Arc::new(Filter::new(condition)?) as Arc<dyn Processor>)
        }
        ProcessorSpec::Transform { template } => {
            Ok(Arc::new(Transform::new(template)?) as Arc<dyn Processor>)
        }
        ProcessorSpec::Aggregate {
            strategy,
            timeout,
            max_size,
            group_by,
        } => Ok(Arc::new(Aggregate::new(
            *strategy,
            *timeout,
            *max_size,
            group_by.clone(),
        )?) as Arc<dyn Processor>),
        ProcessorSpec::Debug { prefix } => {
            Ok(Arc::new(DebugProcessor::new(prefix.clone())) as Arc<dyn Processor>)
        }
        ProcessorSpec::External {
            command,
            input_format,
            output_format,
            config,
        } => Ok(Arc::new(External::new(
            command.tokens(),
            *input_format,
            *output_format,
            config.clone(),
            Arc::clone(env),
        )?) as Arc<dyn Processor>),
    }
}
