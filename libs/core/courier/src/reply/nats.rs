use crate::client::{terminal_channel, MessageHandler, Subscriber, TerminalSignal};
use crate::config::{ConfigSet, ProtocolConfig};
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, Responder, PROTOCOL_TYPE, REQREP_MODE};
use crate::error::{CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::subscriber::{nats_url, require_handler, Delivery};
use crate::transport::{Connector, RawConnection};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NatsReplyConfig {
    pub name: String,
    pub topic: String,
    pub endpoint: String,
    pub user: String,
    pub password: String,
    pub token: String,
}

impl ProtocolConfig for NatsReplyConfig {
    const KEYS: &'static [&'static str] =
        &["name", "topic", "endpoint", "user", "password", "token"];
    const MANDATORY: &'static [&'static str] = &["name", "topic", "endpoint"];
}

/// NATS request/reply server; acks publish to the request's reply subject.
pub struct NatsReply {
    connector: Arc<dyn Connector<str, dyn RawConnection>>,
    config: Option<NatsReplyConfig>,
    connection: Option<Arc<dyn RawConnection>>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl NatsReply {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::transport::nats::NatsConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector<str, dyn RawConnection>>) -> Self {
        Self {
            connector,
            config: None,
            connection: None,
            handler: None,
        }
    }
}

impl Default for NatsReply {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for NatsReply {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        let config = NatsReplyConfig::from_map(config.primary())?;
        self.close().await;

        let url = nats_url(&config.endpoint, &config.user, &config.password, &config.token);
        let connection = self.connector.connect(&url).await?;
        info!(name = %config.name, topic = %config.topic, "NATS reply server connected");
        self.connection = Some(connection);
        self.config = Some(config);
        Ok(())
    }

    fn on_message(&mut self, handler: Arc<dyn MessageHandler>) -> &mut dyn Subscriber {
        self.handler = Some(handler);
        self
    }

    async fn start(&mut self) -> Result<TerminalSignal> {
        let (Some(connection), Some(config)) = (self.connection.clone(), self.config.as_ref())
        else {
            return Err(CourierError::NotConfigured("nats reply server"));
        };
        let handler = require_handler(&self.handler)?;

        let mut requests = connection.subscribe(&config.topic).await?;
        let delivery = Delivery::new(
            DedupFilter::disabled(),
            AdapterMetrics::new("nats_reply", &config.topic),
            handler,
        );
        let (terminal, signal) = terminal_channel();
        let name = config.name.clone();

        tokio::spawn(async move {
            while let Some(item) = requests.next().await {
                match item {
                    Ok(raw) => {
                        let envelope = Envelope::new(
                            delivery.admit_all(raw),
                            Responder::Connection(connection.clone()),
                        )
                        .with_property(PROTOCOL_TYPE, REQREP_MODE);
                        delivery.dispatch(envelope).await;
                    }
                    Err(e) => warn!(name = %name, error = %e, "Request receive error"),
                }
            }
            terminal.fire(CourierError::Disconnected(format!(
                "Disconnected from nats server for {}",
                name
            )));
        });

        Ok(signal)
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close NATS connection");
            }
        }
    }
}
