//! In-process transport.
//!
//! Stands in for the broker in tests and `--dry-run` mode: messages injected
//! here travel the same validation path as broker deliveries, and published
//! commands can be inspected afterwards.

use crate::transport::{Ingestor, MessageSource, Transport, TransportError};
use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tokio::sync::watch;

const CHANNEL_CAPACITY: usize = 10_000;

/// A message as it crossed the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publishing half plus a handle for injecting inbound messages.
#[derive(Clone)]
pub struct InMemoryTransport {
    inbound: Sender<TransportMessage>,
    published_tx: Sender<TransportMessage>,
    published_rx: Receiver<TransportMessage>,
}

impl InMemoryTransport {
    /// Create a transport and the source that drains its inbound side.
    pub fn new() -> (Self, InMemorySource) {
        let (inbound, receiver) = bounded(CHANNEL_CAPACITY);
        let (published_tx, published_rx) = bounded(CHANNEL_CAPACITY);
        (
            Self {
                inbound,
                published_tx,
                published_rx,
            },
            InMemorySource { receiver },
        )
    }

    /// Deliver a message as if the broker had sent it. Returns false if the queue is full.
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> bool {
        self.inbound
            .try_send(TransportMessage {
                topic: topic.into(),
                payload: payload.into(),
            })
            .is_ok()
    }

    /// Take everything published so far.
    pub fn take_published(&self) -> Vec<TransportMessage> {
        self.published_rx.try_iter().collect()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.published_tx
            .try_send(TransportMessage {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

/// Receive loop for [`InMemoryTransport`].
pub struct InMemorySource {
    receiver: Receiver<TransportMessage>,
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn run(self: Box<Self>, ingestor: Ingestor, shutdown: watch::Receiver<bool>) {
        let receiver = self.receiver;
        let worker = tokio::task::spawn_blocking(move || {
            while !*shutdown.borrow() {
                match receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(message) => {
                        ingestor.handle_message(&message.topic, &message.payload);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        tracing::info!("In-memory transport closed");
                        break;
                    }
                }
            }
        });

        if let Err(e) = worker.await {
            tracing::error!("In-memory receive loop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::RollingBuffer;
    use crate::telemetry::create_shared_stats;
    use crate::transport::{Channel, Topics};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_publish_is_observable() {
        let (transport, _source) = InMemoryTransport::new();
        transport
            .publish("actuators/Rabat/RAB_1/pump", b"{}".to_vec())
            .await
            .unwrap();

        let published = transport.take_published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "actuators/Rabat/RAB_1/pump");
        assert!(transport.take_published().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_source_feeds_buffer_until_shutdown() {
        let (transport, source) = InMemoryTransport::new();
        let buffer = Arc::new(RollingBuffer::new(600, 100));
        let stats = create_shared_stats();
        let ingestor = Ingestor::new(Topics::default(), Arc::clone(&buffer), Arc::clone(&stats));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(Box::new(source).run(ingestor, shutdown_rx));

        assert!(transport.inject("sensors/Rabat/RAB_1/humidity", "55.0"));
        assert!(transport.inject("sensors/Rabat/RAB_1/humidity", "garbage"));

        for _ in 0..50 {
            if stats.snapshot().malformed_readings == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(buffer.snapshot("RAB_1", Channel::Humidity).len(), 1);
        assert_eq!(stats.snapshot().readings_ingested, 1);
    }
}
