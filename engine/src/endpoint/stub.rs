//! Stub factories for optional schemes
//!
//! `grpc`, `rtsp`, `email`, and `webhook` are recognized schemes whose wire
//! behavior lives outside the core. Until a real factory is registered for
//! them, building an endpoint fails at route start (not at config load), so
//! one route using an unimplemented scheme never stops its peers.

use std::sync::Arc;

use virta_core::{Result, RouteError};

use super::{Sink, SinkFactory, Source, SourceFactory};
use crate::uri::EndpointUri;

pub(super) fn source_factory(scheme: &'static str) -> SourceFactory {
    Arc::new(move |uri: &EndpointUri| -> Result<Arc<dyn Source>> {
        Err(not_implemented(scheme, uri))
    })
}

pub(super) fn sink_factory(scheme: &'static str) -> SinkFactory {
    Arc::new(move |uri: &EndpointUri| -> Result<Arc<dyn Sink>> {
        Err(not_implemented(scheme, uri))
    })
}

fn not_implemented(scheme: &str, uri: &EndpointUri) -> RouteError {
    RouteError::endpoint_start(
        uri.raw(),
        format!("no '{scheme}' implementation registered"),
    )
}
