use super::{require_handler, Delivery};
use crate::client::{terminal_channel, MessageHandler, Subscriber, TerminalSignal};
use crate::config::{ConfigSet, ProtocolConfig};
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, PlainMessage, Responder};
use crate::error::{CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::transport::{Connector, RawSocket, SocketKind};
use crate::wire::NANO_FIELDS;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NanoSubConfig {
    pub name: String,
    pub topic: String,
    pub endpoint: String,
    pub separator: String,
}

impl ProtocolConfig for NanoSubConfig {
    const KEYS: &'static [&'static str] = &["name", "topic", "endpoint", "separator"];
    const MANDATORY: &'static [&'static str] = &["name", "topic", "endpoint"];
}

/// nanomsg SUB socket subscriber.
pub struct NanoSubscriber {
    connector: Arc<dyn Connector<SocketKind, dyn RawSocket>>,
    dedup: DedupFilter,
    config: Option<NanoSubConfig>,
    socket: Option<Arc<dyn RawSocket>>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl NanoSubscriber {
    #[cfg(feature = "nano")]
    pub fn new(dedup: DedupFilter) -> Self {
        Self::with_connector(Arc::new(crate::transport::nano::NngConnector), dedup)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector<SocketKind, dyn RawSocket>>,
        dedup: DedupFilter,
    ) -> Self {
        Self {
            connector,
            dedup,
            config: None,
            socket: None,
            handler: None,
        }
    }

    async fn setup(socket: &dyn RawSocket, config: &NanoSubConfig) -> Result<()> {
        socket.dial(&config.endpoint).await?;
        socket.subscribe(config.topic.as_bytes()).await
    }
}

#[async_trait]
impl Subscriber for NanoSubscriber {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        let config = NanoSubConfig::from_map(config.primary())?;
        self.close().await;

        let socket = self.connector.connect(&SocketKind::Subscribe).await?;
        if let Err(e) = Self::setup(socket.as_ref(), &config).await {
            if let Err(close_err) = socket.close().await {
                warn!(error = %close_err, "Failed to close nanomsg socket");
            }
            return Err(e);
        }

        info!(
            name = %config.name,
            endpoint = %config.endpoint,
            topic = %config.topic,
            "nanomsg subscriber dialed"
        );
        self.socket = Some(socket);
        self.config = Some(config);
        Ok(())
    }

    fn on_message(&mut self, handler: Arc<dyn MessageHandler>) -> &mut dyn Subscriber {
        self.handler = Some(handler);
        self
    }

    async fn start(&mut self) -> Result<TerminalSignal> {
        let (Some(socket), Some(config)) = (self.socket.clone(), self.config.as_ref()) else {
            return Err(CourierError::NotConfigured("nanomsg subscriber"));
        };
        let handler = require_handler(&self.handler)?;
        let delivery = Delivery::new(
            self.dedup.clone(),
            AdapterMetrics::new("nano", &config.topic),
            handler,
        );
        let (terminal, signal) = terminal_channel();

        tokio::spawn(async move {
            loop {
                let frame = match socket.recv().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        terminal.fire(e);
                        return;
                    }
                };
                let raw = Box::new(PlainMessage::new(frame));
                if let Some(raw) = delivery.admit(raw, NANO_FIELDS).await {
                    let envelope = Envelope::new(raw, Responder::Socket(socket.clone()));
                    delivery.dispatch(envelope).await;
                }
            }
        });

        Ok(signal)
    }

    async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.close().await {
                warn!(error = %e, "Failed to close nanomsg socket");
            }
        }
    }
}
