//! Convenience re-exports for engine embedders
//!
//! ```ignore
//! use virta_runtime::prelude::*;
//! ```

pub use virta_core::{keys, ErrorKind, Message, RouteError};
pub use virta_engine::{
    Engine, EndpointRegistry, EngineConfig, MessageTx, Metrics, Processor, ProcessorSpec,
    RouteSpec, RouteState, Settings, Sink, Source,
};

pub use crate::{run, LogFormat, RuntimeBuilder};
