use crate::client::{terminal_channel, MessageHandler, Subscriber, TerminalSignal};
use crate::config::{de, ConfigSet, ProtocolConfig};
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, Responder, PROTOCOL_TYPE, REQREP_MODE};
use crate::error::{CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::subscriber::{amqp_url, require_handler, Delivery};
use crate::transport::{ConsumeSpec, Connector, FieldArgs, QueueSpec, RawChannel};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AmqpReplyConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    #[serde(deserialize_with = "de::string")]
    pub port: String,
    pub queue_name: String,
    #[serde(deserialize_with = "de::boolean")]
    pub queue_durable: bool,
    #[serde(deserialize_with = "de::boolean")]
    pub queue_auto_delete: bool,
    #[serde(deserialize_with = "de::boolean")]
    pub queue_no_wait: bool,
    pub tag: String,
    #[serde(deserialize_with = "de::boolean")]
    pub auto_ack: bool,
    #[serde(deserialize_with = "de::boolean")]
    pub exclusive: bool,
    #[serde(deserialize_with = "de::boolean")]
    pub no_local: bool,
}

impl ProtocolConfig for AmqpReplyConfig {
    const KEYS: &'static [&'static str] = &[
        "user",
        "password",
        "host",
        "port",
        "queueName",
        "queueDurable",
        "queueAutoDelete",
        "queueNoWait",
        "tag",
        "autoAck",
        "exclusive",
        "noLocal",
    ];
    const MANDATORY: &'static [&'static str] =
        &["user", "password", "host", "port", "queueName", "tag"];
}

/// AMQP request/reply server: one queue, prefetch 1, replies to `reply_to`.
pub struct AmqpReply {
    connector: Arc<dyn Connector<str, dyn RawChannel>>,
    config: Option<AmqpReplyConfig>,
    channel: Option<Arc<dyn RawChannel>>,
    queue: String,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl AmqpReply {
    #[cfg(feature = "amqp")]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::transport::amqp::LapinConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector<str, dyn RawChannel>>) -> Self {
        Self {
            connector,
            config: None,
            channel: None,
            queue: String::new(),
            handler: None,
        }
    }

    async fn setup(channel: &dyn RawChannel, config: &AmqpReplyConfig) -> Result<String> {
        let queue = channel
            .queue_declare(&QueueSpec {
                name: config.queue_name.clone(),
                durable: config.queue_durable,
                auto_delete: config.queue_auto_delete,
                exclusive: config.exclusive,
                no_wait: config.queue_no_wait,
                args: FieldArgs::new(),
            })
            .await?;
        channel.qos(1).await?;
        Ok(queue)
    }
}

#[cfg(feature = "amqp")]
impl Default for AmqpReply {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for AmqpReply {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        let config = AmqpReplyConfig::from_map(config.primary())?;
        self.close().await;

        let url = amqp_url(&config.user, &config.password, &config.host, &config.port);
        let channel = self.connector.connect(&url).await?;
        match Self::setup(channel.as_ref(), &config).await {
            Ok(queue) => self.queue = queue,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    warn!(error = %close_err, "Failed to close AMQP channel");
                }
                return Err(e);
            }
        }

        info!(queue = %self.queue, "AMQP reply server configured");
        self.channel = Some(channel);
        self.config = Some(config);
        Ok(())
    }

    fn on_message(&mut self, handler: Arc<dyn MessageHandler>) -> &mut dyn Subscriber {
        self.handler = Some(handler);
        self
    }

    async fn start(&mut self) -> Result<TerminalSignal> {
        let (Some(channel), Some(config)) = (self.channel.clone(), self.config.as_ref()) else {
            return Err(CourierError::NotConfigured("amqp reply server"));
        };
        let handler = require_handler(&self.handler)?;

        let mut requests = channel
            .consume(&ConsumeSpec {
                queue: self.queue.clone(),
                tag: config.tag.clone(),
                auto_ack: config.auto_ack,
                exclusive: config.exclusive,
                no_local: config.no_local,
                no_wait: config.queue_no_wait,
                args: FieldArgs::new(),
            })
            .await?;
        let delivery = Delivery::new(
            DedupFilter::disabled(),
            AdapterMetrics::new("amqp_reply", &self.queue),
            handler,
        );
        let (terminal, signal) = terminal_channel();

        tokio::spawn(async move {
            while let Some(item) = requests.next().await {
                match item {
                    Ok(raw) => {
                        let envelope =
                            Envelope::new(delivery.admit_all(raw), Responder::Channel(channel.clone()))
                                .with_property(PROTOCOL_TYPE, REQREP_MODE);
                        delivery.dispatch(envelope).await;
                    }
                    Err(e) => warn!(error = %e, "Request delivery error"),
                }
            }
            terminal.fire(CourierError::Disconnected(
                "Disconnected from server, connection closed.".to_string(),
            ));
        });

        info!(queue = %self.queue, "AMQP reply server started");
        Ok(signal)
    }

    async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close AMQP channel");
            }
        }
    }
}
