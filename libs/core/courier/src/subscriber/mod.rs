//! Subscriber adapters, one per transport.
//!
//! Every adapter follows `configure → start → (terminal) → close`. The
//! receive loop runs on its own task; Redis and PubNub add a second task fed
//! through a bounded queue so transport reads never wait on the handler.

mod amqp;
mod nano;
#[cfg(feature = "nats")]
mod nats;
#[cfg(feature = "pubnub")]
mod pubnub;
mod redis;
#[cfg(feature = "nats")]
mod stan;

pub use amqp::{amqp_url, AmqpSubConfig, AmqpSubscriber};
pub use nano::{NanoSubConfig, NanoSubscriber};
#[cfg(feature = "nats")]
pub use nats::{nats_url, NatsSubConfig, NatsSubscriber};
#[cfg(feature = "pubnub")]
pub use pubnub::{PubnubSubConfig, PubnubSubscriber};
pub use redis::{RedisSubConfig, RedisSubscriber};
#[cfg(feature = "nats")]
pub use stan::{StanSubConfig, StanSubscriber};

use crate::client::MessageHandler;
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, RawMessage};
use crate::error::{CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::wire;
use std::sync::Arc;

/// Capacity of the receive → process queue of two-task adapters.
pub const PROCESSING_QUEUE_CAPACITY: usize = 1024;

pub(crate) fn require_handler(
    handler: &Option<Arc<dyn MessageHandler>>,
) -> Result<Arc<dyn MessageHandler>> {
    handler
        .clone()
        .ok_or(CourierError::NotConfigured("message handler"))
}

/// The path from raw message to handler: identity, dedup, dispatch.
#[derive(Clone)]
pub(crate) struct Delivery {
    dedup: DedupFilter,
    metrics: AdapterMetrics,
    handler: Arc<dyn MessageHandler>,
}

impl Delivery {
    pub(crate) fn new(
        dedup: DedupFilter,
        metrics: AdapterMetrics,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            dedup,
            metrics,
            handler,
        }
    }

    /// Strip a leading id from bodies with `fields` fields and run the set
    /// variant on it. `None` means the message is a duplicate.
    pub(crate) async fn admit(
        &self,
        mut raw: Box<dyn RawMessage>,
        fields: usize,
    ) -> Option<Box<dyn RawMessage>> {
        self.metrics.received();
        if let Some((id, body)) = wire::strip_leading_id(raw.body(), fields) {
            raw.set_body(body);
            if self.dedup.is_duplicate(&id).await {
                self.metrics.duplicate();
                return None;
            }
        }
        Some(raw)
    }

    /// Read a trailing event id and timestamp, body untouched, and run the
    /// timestamp variant on it.
    pub(crate) async fn admit_event(
        &self,
        raw: Box<dyn RawMessage>,
        fields: usize,
    ) -> Option<Box<dyn RawMessage>> {
        self.metrics.received();
        if let Some((id, timestamp)) = wire::trailing_event(raw.body(), fields) {
            if self.dedup.is_duplicate_at(&id, timestamp).await {
                self.metrics.duplicate();
                return None;
            }
        }
        Some(raw)
    }

    /// Deliver without identity checks (reply servers).
    pub(crate) fn admit_all(&self, raw: Box<dyn RawMessage>) -> Box<dyn RawMessage> {
        self.metrics.received();
        raw
    }

    /// Run the handler and hand the envelope back for post-processing.
    pub(crate) async fn dispatch(&self, mut envelope: Envelope) -> Envelope {
        self.handler.handle(&mut envelope).await;
        self.metrics.delivered();
        envelope
    }

    pub(crate) fn metrics(&self) -> &AdapterMetrics {
        &self.metrics
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::client::MessageHandler;
    use crate::envelope::Envelope;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records bodies and properties; acks when asked to.
    pub struct Recorder {
        tx: mpsc::UnboundedSender<(Vec<u8>, Option<String>)>,
        ack: bool,
    }

    pub fn recorder(
        ack: bool,
    ) -> (
        Arc<Recorder>,
        mpsc::UnboundedReceiver<(Vec<u8>, Option<String>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx, ack }), rx)
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, envelope: &mut Envelope) {
            if self.ack {
                envelope.send_ack(None).await.unwrap();
            }
            let _ = self.tx.send((
                envelope.get_message().to_vec(),
                envelope.get_property("protocol_type").map(str::to_string),
            ));
        }
    }

    /// Next recorded body, failing the test after a second.
    pub async fn next_body(rx: &mut mpsc::UnboundedReceiver<(Vec<u8>, Option<String>)>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("handler channel closed")
            .0
    }

    /// Assert nothing more arrives within a short window.
    pub async fn assert_idle(rx: &mut mpsc::UnboundedReceiver<(Vec<u8>, Option<String>)>) {
        let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err(), "unexpected delivery: {:?}", extra);
    }
}
