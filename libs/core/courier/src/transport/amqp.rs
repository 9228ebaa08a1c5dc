//! AMQP 0-9-1 binding over `lapin`: one connection and one channel per handle.

use super::{
    ConsumeSpec, Connector, Deliveries, ExchangeSpec, FieldArgs, QueueSpec, RawChannel,
    ReplyProperties,
};
use crate::envelope::RawMessage;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

fn field_table(args: &FieldArgs) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        let value = match value {
            Value::Bool(b) => AMQPValue::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => AMQPValue::LongLongInt(i),
                None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => AMQPValue::LongString(s.clone().into()),
            other => AMQPValue::LongString(other.to_string().into()),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Inbound delivery; acknowledgement goes through the channel's acker.
struct AmqpDelivery {
    body: Vec<u8>,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    acker: Acker,
}

impl From<Delivery> for AmqpDelivery {
    fn from(delivery: Delivery) -> Self {
        let reply_to = delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|s| s.as_str().to_string());
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string());
        Self {
            body: delivery.data,
            reply_to,
            correlation_id,
            acker: delivery.acker,
        }
    }
}

#[async_trait]
impl RawMessage for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    async fn ack(&self, multiple: bool) -> Result<()> {
        self.acker
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(CourierError::receive)
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(CourierError::receive)
    }
}

pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl RawChannel for LapinChannel {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(&spec.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: spec.internal,
                    nowait: spec.no_wait,
                },
                field_table(&spec.args),
            )
            .await
            .map_err(CourierError::setup)
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: spec.no_wait,
                },
                field_table(&spec.args),
            )
            .await
            .map_err(CourierError::setup)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
        args: &FieldArgs,
    ) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: no_wait },
                field_table(args),
            )
            .await
            .map_err(CourierError::setup)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(CourierError::setup)
    }

    async fn consume(&self, spec: &ConsumeSpec) -> Result<Deliveries> {
        let consumer = self
            .channel
            .basic_consume(
                &spec.queue,
                &spec.tag,
                BasicConsumeOptions {
                    no_local: spec.no_local,
                    no_ack: spec.auto_ack,
                    exclusive: spec.exclusive,
                    nowait: spec.no_wait,
                },
                field_table(&spec.args),
            )
            .await
            .map_err(CourierError::setup)?;
        debug!(queue = %spec.queue, tag = %spec.tag, "Consumer registered");

        Ok(consumer
            .map(|item| -> Result<Box<dyn RawMessage>> {
                let delivery = item.map_err(CourierError::receive)?;
                Ok(Box::new(AmqpDelivery::from(delivery)))
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &ReplyProperties,
    ) -> Result<()> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(properties.content_type.clone()));
        if let Some(correlation_id) = &properties.correlation_id {
            props = props.with_correlation_id(ShortString::from(correlation_id.clone()));
        }
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                props,
            )
            .await
            .map_err(CourierError::publish)?
            .await
            .map_err(CourierError::publish)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(CourierError::receive)?;
        self.connection
            .close(200, "OK")
            .await
            .map_err(CourierError::receive)
    }
}

/// Dials `amqp://` URLs and opens one channel per connection.
pub struct LapinConnector;

#[async_trait]
impl Connector<str, dyn RawChannel> for LapinConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RawChannel>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(CourierError::connect)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(CourierError::connect)?;
        info!(channel = channel.id(), "AMQP channel open");
        Ok(Arc::new(LapinChannel {
            connection,
            channel,
        }))
    }
}
