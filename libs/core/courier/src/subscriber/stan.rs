use super::{nats_url, require_handler, Delivery};
use crate::client::{
    terminal_channel, MessageHandler, Subscriber, TerminalSender, TerminalSignal,
};
use crate::config::{ConfigSet, ProtocolConfig};
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, Responder};
use crate::error::{CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::transport::{Connector, StreamConnection, StreamTarget};
use crate::wire::STANDARD_FIELDS;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StanSubConfig {
    pub name: String,
    pub topic: String,
    pub endpoint: String,
    pub cluster: String,
    pub user: String,
    pub password: String,
    pub token: String,
}

impl ProtocolConfig for StanSubConfig {
    const KEYS: &'static [&'static str] = &[
        "name", "topic", "endpoint", "cluster", "user", "password", "token",
    ];
    const MANDATORY: &'static [&'static str] = &["name", "topic", "endpoint", "cluster"];
}

fn connection_lost(reason: &str) -> CourierError {
    CourierError::Disconnected(format!("Connection lost, reason: {}", reason))
}

/// Durable streaming subscriber. The consumer is named after `name`, so a
/// restarted subscriber resumes where the previous one stopped acking.
pub struct StanSubscriber {
    connector: Arc<dyn Connector<StreamTarget, dyn StreamConnection>>,
    dedup: DedupFilter,
    config: Option<StanSubConfig>,
    connection: Option<Arc<dyn StreamConnection>>,
    terminal: Option<(TerminalSender, TerminalSignal)>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl StanSubscriber {
    pub fn new(dedup: DedupFilter) -> Self {
        Self::with_connector(Arc::new(crate::transport::nats::JetStreamConnector), dedup)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector<StreamTarget, dyn StreamConnection>>,
        dedup: DedupFilter,
    ) -> Self {
        Self {
            connector,
            dedup,
            config: None,
            connection: None,
            terminal: None,
            handler: None,
        }
    }
}

#[async_trait]
impl Subscriber for StanSubscriber {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        let config = StanSubConfig::from_map(config.primary())?;
        self.close().await;

        // The disconnect handler exists before the connection, so the
        // terminal channel is created here and handed out by start.
        let (terminal, signal) = terminal_channel();
        let on_lost = terminal.clone();
        let target = StreamTarget {
            url: nats_url(&config.endpoint, &config.user, &config.password, &config.token),
            cluster: config.cluster.clone(),
            client_id: config.name.clone(),
            on_disconnect: Arc::new(move |reason: String| {
                on_lost.fire(connection_lost(&reason));
            }),
        };

        let connection = self.connector.connect(&target).await?;
        info!(
            name = %config.name,
            cluster = %config.cluster,
            topic = %config.topic,
            "Streaming subscriber connected"
        );
        self.connection = Some(connection);
        self.terminal = Some((terminal, signal));
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
            return Err(CourierError::NotConfigured("streaming subscriber"));
        };
        let handler = require_handler(&self.handler)?;
        let Some((terminal, signal)) = self.terminal.take() else {
            return Err(CourierError::NotConfigured("streaming subscriber"));
        };

        let mut messages = connection
            .durable_subscribe(&config.topic, &config.name)
            .await?;
        let delivery = Delivery::new(
            self.dedup.clone(),
            AdapterMetrics::new("nats_streaming", &config.topic),
            handler,
        );
        let name = config.name.clone();

        tokio::spawn(async move {
            while let Some(item) = messages.next().await {
                match item {
                    Ok(raw) => {
                        if let Some(raw) = delivery.admit(raw, STANDARD_FIELDS).await {
                            delivery.dispatch(Envelope::new(raw, Responder::Stream)).await;
                        }
                    }
                    Err(e) => warn!(name = %name, error = %e, "Receive error"),
                }
            }
            terminal.fire(connection_lost("subscription closed"));
        });

        info!(topic = %config.topic, durable = %config.name, "Streaming subscriber started");
        Ok(signal)
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close streaming connection");
            }
        }
    }
}
