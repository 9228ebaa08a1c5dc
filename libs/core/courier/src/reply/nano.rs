use crate::client::{terminal_channel, MessageHandler, Subscriber, TerminalSignal};
use crate::config::{ConfigSet, ProtocolConfig};
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, PlainMessage, Responder, PROTOCOL_TYPE, REQREP_MODE};
use crate::error::{CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::subscriber::{require_handler, Delivery};
use crate::transport::{Connector, RawSocket, SocketKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NanoReplyConfig {
    pub name: String,
    pub topic: String,
    pub endpoint: String,
    pub separator: String,
}

impl ProtocolConfig for NanoReplyConfig {
    const KEYS: &'static [&'static str] = &["name", "topic", "endpoint", "separator"];
    const MANDATORY: &'static [&'static str] = &["name", "topic", "endpoint"];
}

/// nanomsg REP server listening on `endpoint`.
pub struct NanoReply {
    connector: Arc<dyn Connector<SocketKind, dyn RawSocket>>,
    config: Option<NanoReplyConfig>,
    socket: Option<Arc<dyn RawSocket>>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl NanoReply {
    #[cfg(feature = "nano")]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::transport::nano::NngConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector<SocketKind, dyn RawSocket>>) -> Self {
        Self {
            connector,
            config: None,
            socket: None,
            handler: None,
        }
    }
}

#[cfg(feature = "nano")]
impl Default for NanoReply {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for NanoReply {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        let config = NanoReplyConfig::from_map(config.primary())?;
        self.close().await;

        let socket = self.connector.connect(&SocketKind::Reply).await?;
        if let Err(e) = socket.listen(&config.endpoint).await {
            if let Err(close_err) = socket.close().await {
                warn!(error = %close_err, "Failed to close nanomsg socket");
            }
            return Err(e);
        }

        info!(name = %config.name, endpoint = %config.endpoint, "nanomsg reply server listening");
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
            return Err(CourierError::NotConfigured("nanomsg reply server"));
        };
        let handler = require_handler(&self.handler)?;
        let delivery = Delivery::new(
            DedupFilter::disabled(),
            AdapterMetrics::new("nano_reply", &config.topic),
            handler,
        );
        let (terminal, signal) = terminal_channel();

        tokio::spawn(async move {
            loop {
                match socket.recv().await {
                    Ok(frame) => {
                        let raw = delivery.admit_all(Box::new(PlainMessage::new(frame)));
                        let envelope = Envelope::new(raw, Responder::Socket(socket.clone()))
                            .with_property(PROTOCOL_TYPE, REQREP_MODE);
                        delivery.dispatch(envelope).await;
                    }
                    Err(e) => {
                        terminal.fire(e);
                        return;
                    }
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
