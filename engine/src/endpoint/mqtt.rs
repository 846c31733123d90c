//! MQTT endpoints
//!
//! Source: `mqtt://<broker>[:port]/<topic>` subscribes to the topic and
//! emits one message per publish, carrying `{topic, payload, qos}`. The
//! event loop reconnects with a short delay and re-subscribes on every
//! connection acknowledgement, so broker restarts don't kill the route.
//!
//! Sink: publishes the message body to the topic, QoS 0 unless `?qos=` says
//! otherwise. The client is created lazily on first delivery and its event
//! loop pumped in a background task for the life of the route.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use virta_core::{keys, Message, Result, RouteError};

use super::{MessageTx, Sink, Source};
use crate::uri::EndpointUri;

const DEFAULT_PORT: u16 = 1883;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn parse_qos(uri: &EndpointUri) -> Result<QoS> {
    match uri.query_param("qos") {
        None | Some("0") => Ok(QoS::AtMostOnce),
        Some("1") => Ok(QoS::AtLeastOnce),
        Some("2") => Ok(QoS::ExactlyOnce),
        Some(other) => Err(RouteError::Config(format!("bad qos '{other}'"))),
    }
}

fn topic_of(uri: &EndpointUri) -> Result<String> {
    let topic = uri.path.trim_start_matches('/').to_string();
    if topic.is_empty() {
        return Err(RouteError::Config(format!(
            "mqtt endpoint '{}' needs a topic path",
            uri.raw()
        )));
    }
    Ok(topic)
}

fn options_for(uri: &EndpointUri) -> Result<MqttOptions> {
    if uri.host.is_empty() {
        return Err(RouteError::Config(format!(
            "mqtt endpoint '{}' needs a broker host",
            uri.raw()
        )));
    }
    let mut options = MqttOptions::new(
        format!("virta-{}", Ulid::new()),
        uri.host.clone(),
        uri.port.unwrap_or(DEFAULT_PORT),
    );
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(password)) = (&uri.user, &uri.password) {
        options.set_credentials(user.clone(), password.clone());
    }
    Ok(options)
}

/// Subscribing MQTT source
pub struct MqttSource {
    options: MqttOptions,
    topic: String,
    qos: QoS,
    uri: String,
}

impl std::fmt::Debug for MqttSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSource")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("uri", &self.uri)
            .finish()
    }
}

impl MqttSource {
    /// Build from an `mqtt://<broker>[:port]/<topic>[?qos=]` URI
    pub fn from_uri(uri: &EndpointUri) -> Result<Self> {
        Ok(Self {
            options: options_for(uri)?,
            topic: topic_of(uri)?,
            qos: parse_qos(uri)?,
            uri: uri.raw().to_string(),
        })
    }

    /// The subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Source for MqttSource {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn run(&self, tx: MessageTx, cancel: CancellationToken) -> Result<()> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 64);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                event = eventloop.poll() => event,
            };

            match event {
                // Subscribe on every ConnAck so reconnects re-establish it
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    client
                        .subscribe(&self.topic, self.qos)
                        .await
                        .map_err(|e| RouteError::SourceFatal(format!("subscribe: {e}")))?;
                    tracing::info!(topic = %self.topic, "mqtt subscribed");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let qos_level: u8 = match publish.qos {
                        QoS::AtMostOnce => 0,
                        QoS::AtLeastOnce => 1,
                        QoS::ExactlyOnce => 2,
                    };
                    let mut msg = Message::new(self.uri.clone())
                        .with_field(keys::TOPIC, publish.topic.as_str())
                        .with_field(keys::QOS, qos_level);
                    match std::str::from_utf8(&publish.payload) {
                        Ok(text) => msg.set(keys::PAYLOAD, text),
                        Err(_) => msg = msg.with_bytes(keys::PAYLOAD, &publish.payload),
                    }
                    // Pushed from the broker connection; never suspend here
                    tx.try_send(msg, "mqtt");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "mqtt connection lost, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
}

/// Publishing MQTT sink
pub struct MqttSink {
    options: MqttOptions,
    topic: String,
    qos: QoS,
    client: Mutex<Option<AsyncClient>>,
}

impl MqttSink {
    /// Build from an `mqtt://<broker>[:port]/<topic>[?qos=]` URI
    pub fn from_uri(uri: &EndpointUri) -> Result<Self> {
        Ok(Self {
            options: options_for(uri)?,
            topic: topic_of(uri)?,
            qos: parse_qos(uri)?,
            client: Mutex::new(None),
        })
    }

    /// Get or create the client, spawning its event-loop pump
    fn get_client(&self, cancel: &CancellationToken) -> AsyncClient {
        if let Some(client) = self.client.lock().as_ref() {
            return client.clone();
        }

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 64);
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => return,
                    event = eventloop.poll() => {
                        if let Err(e) = event {
                            tracing::debug!(error = %e, "mqtt sink connection retrying");
                            tokio::select! {
                                _ = pump_cancel.cancelled() => return,
                                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            }
                        }
                    }
                }
            }
        });

        *self.client.lock() = Some(client.clone());
        client
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn deliver(&self, msg: &Message, cancel: &CancellationToken) -> Result<()> {
        let client = self.get_client(cancel);
        client
            .publish(&self.topic, self.qos, false, msg.body_str().into_bytes())
            .await
            .map_err(|e| {
                // Stale client: drop it so the next delivery reconnects
                *self.client.lock() = None;
                RouteError::delivery("mqtt", e.to_string())
            })
    }

    async fn stop(&self) -> Result<()> {
        if let Some(client) = self.client.lock().take() {
            let _ = client.try_disconnect();
        }
        Ok(())
    }
}
