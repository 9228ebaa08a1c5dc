use super::{require_handler, Delivery};
use crate::client::{terminal_channel, MessageHandler, Subscriber, TerminalSignal};
use crate::config::{ConfigSet, ProtocolConfig};
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, Responder};
use crate::error::{CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::transport::{Connector, RawConnection};
use crate::wire::STANDARD_FIELDS;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Build a NATS server URL from an endpoint and optional credentials.
///
/// A user takes precedence over a token.
pub fn nats_url(endpoint: &str, user: &str, password: &str, token: &str) -> String {
    if !user.is_empty() {
        format!(
            "nats://{}:{}@{}",
            urlencoding::encode(user),
            urlencoding::encode(password),
            endpoint
        )
    } else if !token.is_empty() {
        format!("nats://{}@{}", urlencoding::encode(token), endpoint)
    } else {
        format!("nats://{}", endpoint)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NatsSubConfig {
    pub name: String,
    pub topic: String,
    pub endpoint: String,
    pub user: String,
    pub password: String,
    pub token: String,
}

impl ProtocolConfig for NatsSubConfig {
    const KEYS: &'static [&'static str] =
        &["name", "topic", "endpoint", "user", "password", "token"];
    const MANDATORY: &'static [&'static str] = &["name", "topic", "endpoint"];
}

impl NatsSubConfig {
    pub fn url(&self) -> String {
        nats_url(&self.endpoint, &self.user, &self.password, &self.token)
    }
}

/// Core NATS subscriber with leading-id dedup.
pub struct NatsSubscriber {
    connector: Arc<dyn Connector<str, dyn RawConnection>>,
    dedup: DedupFilter,
    config: Option<NatsSubConfig>,
    connection: Option<Arc<dyn RawConnection>>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl NatsSubscriber {
    pub fn new(dedup: DedupFilter) -> Self {
        Self::with_connector(Arc::new(crate::transport::nats::NatsConnector), dedup)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector<str, dyn RawConnection>>,
        dedup: DedupFilter,
    ) -> Self {
        Self {
            connector,
            dedup,
            config: None,
            connection: None,
            handler: None,
        }
    }
}

#[async_trait]
impl Subscriber for NatsSubscriber {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        let config = NatsSubConfig::from_map(config.primary())?;
        self.close().await;

        let connection = self.connector.connect(&config.url()).await?;
        info!(name = %config.name, topic = %config.topic, "NATS subscriber connected");
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
            return Err(CourierError::NotConfigured("nats subscriber"));
        };
        let handler = require_handler(&self.handler)?;

        let mut messages = connection.subscribe(&config.topic).await?;
        let delivery = Delivery::new(
            self.dedup.clone(),
            AdapterMetrics::new("nats", &config.topic),
            handler,
        );
        let (terminal, signal) = terminal_channel();
        let name = config.name.clone();

        tokio::spawn(async move {
            while let Some(item) = messages.next().await {
                let raw = match item {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(name = %name, error = %e, "Receive error");
                        continue;
                    }
                };
                if let Some(raw) = delivery.admit(raw, STANDARD_FIELDS).await {
                    let envelope = Envelope::new(raw, Responder::Connection(connection.clone()));
                    delivery.dispatch(envelope).await;
                }
            }
            terminal.fire(CourierError::Disconnected(format!(
                "Disconnected, from server for {}",
                name
            )));
        });

        info!(topic = %config.topic, "NATS subscriber started");
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
