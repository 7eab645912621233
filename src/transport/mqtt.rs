//! MQTT transport backed by `rumqttc`.
//!
//! The event loop doubles as the receive loop: each incoming publish is
//! validated and appended to the buffer inline, which is cheap enough that
//! the loop never falls behind the broker. Lost connections are retried with
//! exponential backoff; messages missed while disconnected are not replayed.

use crate::config::BrokerConfig;
use crate::telemetry::SharedStats;
use crate::transport::{Ingestor, MessageSource, Transport, TransportError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Publishing half of the MQTT connection.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

/// Receiving half of the MQTT connection.
pub struct MqttSource {
    client: AsyncClient,
    eventloop: EventLoop,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    stats: SharedStats,
}

impl MqttTransport {
    /// Build both halves of a broker connection.
    ///
    /// No network I/O happens until the returned source is run.
    pub fn connect(config: &BrokerConfig, stats: SharedStats) -> (Self, MqttSource) {
        let client_id = config.client_id.clone().unwrap_or_else(default_client_id);

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some((user, pass)) = config.credentials() {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        (
            Self {
                client: client.clone(),
            },
            MqttSource {
                client,
                eventloop,
                reconnect_initial: config.reconnect_initial,
                reconnect_max: config.reconnect_max,
                stats,
            },
        )
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        // try_publish never waits on a stalled event loop
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

#[async_trait]
impl MessageSource for MqttSource {
    async fn run(self: Box<Self>, ingestor: Ingestor, mut shutdown: watch::Receiver<bool>) {
        let MqttSource {
            client,
            mut eventloop,
            reconnect_initial,
            reconnect_max,
            stats,
        } = *self;
        let subscription = ingestor.topics().subscription();
        let mut backoff = reconnect_initial;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Connected to broker, subscribing to {subscription}");
                        backoff = reconnect_initial;
                        // Clean sessions lose subscriptions, so subscribe on every connect.
                        if let Err(e) = client.try_subscribe(subscription.as_str(), QoS::AtMostOnce) {
                            tracing::warn!("Subscribe request failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        ingestor.handle_message(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let disconnected = TransportError::Disconnected(e.to_string());
                        stats.record_transport_disconnect();
                        tracing::warn!("{disconnected}; retrying in {}s", backoff.as_secs_f64());

                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = next_backoff(backoff, reconnect_max);
                    }
                },
            }
        }

        if let Err(e) = client.try_disconnect() {
            tracing::debug!("Disconnect request failed: {e}");
        }
        tracing::info!("Broker receive loop stopped");
    }
}

/// Double the delay, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Client id derived from the hostname plus a random suffix.
pub fn default_client_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!(
        "floodwatch-{}-{}",
        hostname,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}
