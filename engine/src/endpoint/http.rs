//! HTTP endpoints
//!
//! Source: `http://<host>:<port>` opens a listener and turns every request
//! into a message carrying `{method, path, headers, body}`. Requests are
//! pushed from the accept loop and cannot suspend on the route queue, so a
//! full queue drops the message (counted) and answers 503.
//!
//! Sink: `http://<host>:<port>[/path]` sends the message as JSON. The verb
//! defaults to POST and can be overridden with `?method=`. Any non-2xx
//! response is a delivery failure.

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::Router;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use virta_core::{keys, Message, Result, RouteError};

use super::{MessageTx, Sink, Source};
use crate::uri::EndpointUri;

/// Maximum request body the source will buffer
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Listening HTTP source
#[derive(Debug)]
pub struct HttpSource {
    addr: String,
    uri: String,
}

impl HttpSource {
    /// Build from an `http://<host>:<port>` URI
    pub fn from_uri(uri: &EndpointUri) -> Result<Self> {
        if uri.host.is_empty() {
            return Err(RouteError::Config(format!(
                "http source '{}' needs a host",
                uri.raw()
            )));
        }
        let port = uri.port.ok_or_else(|| {
            RouteError::Config(format!("http source '{}' needs a port", uri.raw()))
        })?;
        Ok(Self {
            addr: format!("{}:{}", uri.host, port),
            uri: uri.raw().to_string(),
        })
    }
}

#[derive(Clone)]
struct SourceState {
    tx: MessageTx,
    uri: String,
}

async fn capture(State(state): State<SourceState>, req: Request) -> StatusCode {
    let (parts, body) = req.into_parts();

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE,
    };

    let mut headers = Map::new();
    for (name, value) in parts.headers.iter() {
        headers.insert(
            name.as_str().to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }

    let mut msg = Message::new(state.uri.clone())
        .with_field(keys::METHOD, parts.method.as_str())
        .with_field(keys::PATH, parts.uri.path())
        .with_field(keys::HEADERS, Value::Object(headers));
    match std::str::from_utf8(&bytes) {
        Ok(text) => msg.set(keys::BODY, text),
        Err(_) => msg = msg.with_bytes(keys::BODY, &bytes),
    }

    if state.tx.try_send(msg, "http") {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[async_trait]
impl Source for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn run(&self, tx: MessageTx, cancel: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .map_err(|e| RouteError::endpoint_start(&self.uri, format!("bind {}: {e}", self.addr)))?;

        let app = Router::new().fallback(capture).with_state(SourceState {
            tx,
            uri: self.uri.clone(),
        });

        tracing::info!(addr = %self.addr, "http source listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| RouteError::SourceFatal(format!("http listener: {e}")))
    }
}

/// JSON-posting HTTP sink
pub struct HttpSink {
    url: String,
    query: Vec<(String, String)>,
    method: reqwest::Method,
    client: reqwest::Client,
}

impl HttpSink {
    /// Build from an `http(s)://…` URI; `?method=` overrides the POST verb
    pub fn from_uri(uri: &EndpointUri) -> Result<Self> {
        if uri.host.is_empty() {
            return Err(RouteError::Config(format!(
                "http sink '{}' needs a host",
                uri.raw()
            )));
        }

        let method = match uri.query_param("method") {
            Some(m) => reqwest::Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| RouteError::Config(format!("bad http method '{m}'")))?,
            None => reqwest::Method::POST,
        };

        let port = uri.port.map(|p| format!(":{p}")).unwrap_or_default();
        let url = format!("{}://{}{}{}", uri.scheme, uri.host, port, uri.path);
        let query = uri
            .query
            .iter()
            .filter(|(k, _)| k.as_str() != "method")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            url,
            query,
            method,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn deliver(&self, msg: &Message, cancel: &CancellationToken) -> Result<()> {
        let request = self
            .client
            .request(self.method.clone(), &self.url)
            .query(&self.query)
            .json(&msg.to_json());

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RouteError::delivery("http", "cancelled"));
            }
            res = request.send() => {
                res.map_err(|e| RouteError::delivery("http", e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RouteError::delivery(
                "http",
                format!("{} answered {status}", self.url),
            ));
        }
        Ok(())
    }
}
