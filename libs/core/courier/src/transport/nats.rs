//! NATS bindings: core pub/sub with reply subjects, and durable JetStream
//! subscriptions for the streaming adapters.

use super::{Connector, Deliveries, RawConnection, StreamConnection, StreamTarget};
use crate::envelope::{PlainMessage, RawMessage};
use crate::error::{CourierError, Result};
use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, Context};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Buffered deliveries between the driver and the adapter.
const DELIVERY_BUFFER: usize = 256;

/// Tasks pumping driver streams into adapter channels. Aborting them ends
/// the adapter-side streams.
#[derive(Default)]
struct Forwarders(Mutex<Vec<JoinHandle<()>>>);

impl Forwarders {
    /// Pump `source` into a fresh delivery stream.
    fn spawn<S>(&self, source: S) -> Deliveries
    where
        S: Stream<Item = Result<Box<dyn RawMessage>>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let forwarder = tokio::spawn(async move {
            let mut source = Box::pin(source);
            while let Some(item) = source.next().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        if let Ok(mut forwarders) = self.0.lock() {
            forwarders.push(forwarder);
        }
        ReceiverStream::new(rx).boxed()
    }

    fn abort_all(&self) {
        if let Ok(mut forwarders) = self.0.lock() {
            for forwarder in forwarders.drain(..) {
                forwarder.abort();
            }
        }
    }
}

/// Core NATS connection.
pub struct NatsConnection {
    client: Client,
    forwarders: Forwarders,
}

#[async_trait]
impl RawConnection for NatsConnection {
    async fn subscribe(&self, subject: &str) -> Result<Deliveries> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(CourierError::setup)?;
        debug!(subject, "Subscribed");

        Ok(self.forwarders.spawn(subscriber.map(|message| -> Result<Box<dyn RawMessage>> {
            let mut raw = PlainMessage::new(message.payload.to_vec());
            raw.reply_to = message.reply.map(|reply| reply.to_string());
            Ok(Box::new(raw) as Box<dyn RawMessage>)
        })))
    }

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()> {
        self.client
            .publish(subject.to_string(), body.to_vec().into())
            .await
            .map_err(CourierError::publish)?;
        self.client.flush().await.map_err(CourierError::publish)
    }

    async fn close(&self) -> Result<()> {
        self.forwarders.abort_all();
        self.client.flush().await.map_err(CourierError::publish)
    }
}

/// Opens a [`NatsConnection`] per URL.
pub struct NatsConnector;

#[async_trait]
impl Connector<str, dyn RawConnection> for NatsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RawConnection>> {
        let client = ConnectOptions::new()
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("NATS connected"),
                    Event::Disconnected => warn!("NATS disconnected"),
                    other => debug!(event = %other, "NATS event"),
                }
            })
            .connect(url)
            .await
            .map_err(CourierError::connect)?;
        Ok(Arc::new(NatsConnection {
            client,
            forwarders: Forwarders::default(),
        }))
    }
}

/// JetStream message acknowledged explicitly by the handler.
struct StreamDelivery {
    body: Vec<u8>,
    message: jetstream::Message,
}

#[async_trait]
impl RawMessage for StreamDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    async fn ack(&self, _multiple: bool) -> Result<()> {
        self.message.ack().await.map_err(CourierError::receive)
    }
}

/// Stream name for a subject: `<cluster>_<subject>` with wildcards and
/// separators flattened.
fn stream_name(cluster: &str, subject: &str) -> String {
    format!("{}_{}", cluster, subject)
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Durable streaming over JetStream.
pub struct JetStreamConnection {
    client: Client,
    context: Context,
    cluster: String,
    forwarders: Forwarders,
}

impl JetStreamConnection {
    async fn ensure_stream(&self, subject: &str) -> Result<jetstream::stream::Stream> {
        let name = stream_name(&self.cluster, subject);
        match self.context.get_stream(&name).await {
            Ok(stream) => Ok(stream),
            Err(_) => {
                info!(stream = %name, subject, "Creating stream");
                self.context
                    .create_stream(StreamConfig {
                        name,
                        subjects: vec![subject.to_string()],
                        ..Default::default()
                    })
                    .await
                    .map_err(CourierError::setup)
            }
        }
    }
}

#[async_trait]
impl StreamConnection for JetStreamConnection {
    async fn durable_subscribe(&self, subject: &str, durable_name: &str) -> Result<Deliveries> {
        let stream = self.ensure_stream(subject).await?;
        let consumer = match stream.get_consumer::<ConsumerConfig>(durable_name).await {
            Ok(consumer) => consumer,
            Err(_) => stream
                .create_consumer(ConsumerConfig {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    filter_subject: subject.to_string(),
                    ..Default::default()
                })
                .await
                .map_err(CourierError::setup)?,
        };
        let messages = consumer.messages().await.map_err(CourierError::setup)?;
        debug!(subject, durable_name, "Durable subscription open");

        Ok(self.forwarders.spawn(messages.map(|item| -> Result<Box<dyn RawMessage>> {
            let message = item.map_err(CourierError::receive)?;
            let delivery = StreamDelivery {
                body: message.payload.to_vec(),
                message,
            };
            Ok(Box::new(delivery) as Box<dyn RawMessage>)
        })))
    }

    async fn publish(&self, subject: &str, body: &[u8], ack_wait: Duration) -> Result<()> {
        self.ensure_stream(subject).await?;
        let ack = self
            .context
            .publish(subject.to_string(), body.to_vec().into())
            .await
            .map_err(CourierError::publish)?;
        if ack_wait.is_zero() {
            ack.await.map_err(CourierError::publish)?;
            return Ok(());
        }
        match tokio::time::timeout(ack_wait, ack).await {
            Ok(result) => result.map(|_| ()).map_err(CourierError::publish),
            Err(_) => Err(CourierError::publish(format!(
                "no acknowledgement within {:?}",
                ack_wait
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.forwarders.abort_all();
        self.client.flush().await.map_err(CourierError::publish)
    }
}

/// Opens a [`JetStreamConnection`]; the target's disconnect handler fires
/// when the server link drops.
pub struct JetStreamConnector;

#[async_trait]
impl Connector<StreamTarget, dyn StreamConnection> for JetStreamConnector {
    async fn connect(&self, target: &StreamTarget) -> Result<Arc<dyn StreamConnection>> {
        let on_disconnect = target.on_disconnect.clone();
        let client = ConnectOptions::new()
            .name(target.client_id.clone())
            .event_callback(move |event| {
                let on_disconnect = on_disconnect.clone();
                async move {
                    match event {
                        Event::Disconnected => on_disconnect(event.to_string()),
                        other => debug!(event = %other, "NATS event"),
                    }
                }
            })
            .connect(target.url.as_str())
            .await
            .map_err(CourierError::connect)?;
        info!(cluster = %target.cluster, client_id = %target.client_id, "JetStream connected");

        Ok(Arc::new(JetStreamConnection {
            context: jetstream::new(client.clone()),
            client,
            cluster: target.cluster.clone(),
            forwarders: Forwarders::default(),
        }))
    }
}
