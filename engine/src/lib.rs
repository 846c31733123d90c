//! VIRTA - declarative integration routing
//!
//! A route continuously moves messages from one source endpoint through an
//! ordered chain of processors to one or more destination endpoints:
//!
//! ```text
//! Source ──► bounded queue ──► Processors ──► fan-out ──► Sinks
//! ```
//!
//! Endpoints are named by URI (`timer://5s`, `file:///var/spool/*.json`,
//! `http://0.0.0.0:8080`, `log://`); processors are in-engine stages
//! (filter, transform, aggregate, debug) or external subprocesses speaking
//! JSON over temp files. All three layers are pluggable: register your own
//! schemes in the [`EndpointRegistry`], implement [`Processor`] for custom
//! stages.
//!
//! The [`Engine`] supervises every route: it enforces the global concurrency
//! cap, propagates cancellation downward, and exposes a per-route state
//! snapshot.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod config;
pub mod endpoint;
pub mod expr;
pub mod metrics;
pub mod processor;
pub mod route;
pub mod supervisor;
pub mod template;
pub mod uri;

pub use config::{EngineConfig, ProcessorSpec, RouteSpec, Settings};
pub use endpoint::{EndpointRegistry, MessageTx, Sink, Source};
pub use metrics::Metrics;
pub use processor::Processor;
pub use route::RouteState;
pub use supervisor::Engine;
pub use uri::EndpointUri;

// The envelope and error taxonomy live in virta-core; re-export the names
// drivers use on every line.
pub use virta_core::{keys, ErrorKind, Message, Result, RouteError};
