use crate::session::{Message, MessageSink, SessionEvent, SessionEventReceiver, Side};
use anyhow::{Context, Result};
use tracing::{debug, info};

/// Wires the two sessions into a bidirectional forwarder: every message
/// received on one side is republished verbatim on the other. The bridge is
/// the single consumer of both sessions' event streams, so per-session
/// arrival order is preserved through to the peer's publish calls.
pub struct Bridge<S: MessageSink> {
    events: SessionEventReceiver,
    source: S,
    remote: S,
}

impl<S: MessageSink> Bridge<S> {
    pub fn new(events: SessionEventReceiver, source: S, remote: S) -> Self {
        Self {
            events,
            source,
            remote,
        }
    }

    /// Consume session events until a forward fails or both sessions are
    /// gone. A publish failure is fatal and propagates to the supervisor;
    /// no message is ever buffered or retried here.
    pub async fn run(mut self) -> Result<()> {
        while let Some((side, event)) = self.events.recv().await {
            match event {
                SessionEvent::Connected => {
                    info!("{} session is mirroring", side);
                }
                SessionEvent::Disconnected(reason) => {
                    debug!("{} session lost its connection (reason: {:?})", side, reason);
                }
                SessionEvent::Message(message) => {
                    self.forward(side, message).await?;
                }
            }
        }

        // Both senders dropped means both session tasks have already exited;
        // the supervisor reaps them and terminates the process.
        Ok(())
    }

    async fn forward(&self, from: Side, message: Message) -> Result<()> {
        let sink = match from {
            Side::Source => &self.remote,
            Side::Remote => &self.source,
        };

        debug!(
            "Forwarding '{}' ({} bytes, qos {:?}) from {} to {}",
            message.topic,
            message.payload.len(),
            message.qos,
            from,
            sink.side()
        );

        sink.publish(message)
            .await
            .with_context(|| format!("forwarding a {} message to {} failed", from, from.peer()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PublishError, SessionEventSender};
    use async_trait::async_trait;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::PublishProperties;
    use rumqttc::v5::mqttbytes::QoS;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// Records every publish into a log shared across both sides, tagged
    /// with the side it was published on.
    #[derive(Clone)]
    struct RecordingSink {
        side: Side,
        log: Arc<Mutex<Vec<(Side, Message)>>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        fn side(&self) -> Side {
            self.side
        }

        async fn publish(&self, message: Message) -> Result<(), PublishError> {
            self.log.lock().unwrap().push((self.side, message));
            Ok(())
        }
    }

    #[derive(Clone)]
    struct FailingSink {
        side: Side,
    }

    #[async_trait]
    impl MessageSink for FailingSink {
        fn side(&self) -> Side {
            self.side
        }

        async fn publish(&self, _message: Message) -> Result<(), PublishError> {
            Err(PublishError {
                side: self.side,
                reason: "request queue closed".to_string(),
            })
        }
    }

    fn recording_bridge() -> (
        SessionEventSender,
        Arc<Mutex<Vec<(Side, Message)>>>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let log = Arc::new(Mutex::new(Vec::new()));
        let bridge = Bridge::new(
            rx,
            RecordingSink {
                side: Side::Source,
                log: Arc::clone(&log),
            },
            RecordingSink {
                side: Side::Remote,
                log: Arc::clone(&log),
            },
        );
        (tx, log, tokio::spawn(bridge.run()))
    }

    fn message(topic: &str, payload: &[u8]) -> Message {
        Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: None,
        }
    }

    #[tokio::test]
    async fn test_remote_message_is_published_on_source_only() {
        let (tx, log, task) = recording_bridge();

        let m = message("sensors/temp", b"21.5");
        tx.send((Side::Remote, SessionEvent::Message(m.clone())))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(*log, vec![(Side::Source, m)]);
    }

    #[tokio::test]
    async fn test_forwarding_preserves_every_field() {
        let (tx, log, task) = recording_bridge();

        let properties = PublishProperties {
            payload_format_indicator: Some(1),
            message_expiry_interval: Some(300),
            topic_alias: None,
            response_topic: None,
            correlation_data: None,
            user_properties: vec![("ship".to_string(), "crowsnest".to_string())],
            subscription_identifiers: Vec::new(),
            content_type: None,
        };
        let m = Message {
            topic: "nav/position".to_string(),
            payload: Bytes::from_static(b"{\"lat\":57.7}"),
            qos: QoS::AtLeastOnce,
            retain: true,
            properties: Some(properties),
        };

        tx.send((Side::Source, SessionEvent::Message(m.clone())))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(*log, vec![(Side::Remote, m)]);
    }

    #[tokio::test]
    async fn test_per_session_ordering_is_preserved() {
        let (tx, log, task) = recording_bridge();

        let m1 = message("sensors/temp", b"21.5");
        let m2 = message("sensors/temp", b"21.6");
        let m3 = message("commands/reset", b"now");
        tx.send((Side::Source, SessionEvent::Message(m1.clone())))
            .await
            .unwrap();
        tx.send((Side::Source, SessionEvent::Message(m2.clone())))
            .await
            .unwrap();
        tx.send((Side::Remote, SessionEvent::Message(m3.clone())))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                (Side::Remote, m1),
                (Side::Remote, m2),
                (Side::Source, m3),
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_events_publish_nothing() {
        let (tx, log, task) = recording_bridge();

        tx.send((Side::Source, SessionEvent::Connected)).await.unwrap();
        tx.send((Side::Remote, SessionEvent::Disconnected(None)))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_fatal() {
        let (tx, rx) = mpsc::channel(16);
        let bridge = Bridge::new(
            rx,
            FailingSink { side: Side::Source },
            FailingSink { side: Side::Remote },
        );
        let task = tokio::spawn(bridge.run());

        tx.send((
            Side::Remote,
            SessionEvent::Message(message("sensors/temp", b"21.5")),
        ))
        .await
        .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("forwarding a remote message"));
    }
}
