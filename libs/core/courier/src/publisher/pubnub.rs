use super::observe;
use crate::client::Publisher;
use crate::config::{ConfigSet, ProtocolConfig};
use crate::error::{ConfigError, CourierError, Result};
use crate::transport::{Connector, PubnubKeys, RawPubnubClient};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PubnubPubConfig {
    pub subscribe_key: String,
    pub publish_key: String,
    pub secret_key: String,
}

impl ProtocolConfig for PubnubPubConfig {
    const KEYS: &'static [&'static str] = &["subscribe_key", "publish_key", "secret_key"];
    const MANDATORY: &'static [&'static str] = &["subscribe_key", "publish_key"];

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.publish_key.is_empty() {
            return Err(ConfigError::MissingKey("publish_key".to_string()));
        }
        Ok(())
    }
}

impl PubnubPubConfig {
    pub fn keys(&self) -> PubnubKeys {
        PubnubKeys {
            subscribe_key: self.subscribe_key.clone(),
            publish_key: self.publish_key.clone(),
            secret_key: self.secret_key.clone(),
        }
    }
}

pub struct PubnubPublisher {
    connector: Arc<dyn Connector<PubnubKeys, dyn RawPubnubClient>>,
    client: Option<Arc<dyn RawPubnubClient>>,
}

impl PubnubPublisher {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(
            crate::transport::pubnub::PubnubConnector::default(),
        ))
    }

    pub fn with_connector(connector: Arc<dyn Connector<PubnubKeys, dyn RawPubnubClient>>) -> Self {
        Self {
            connector,
            client: None,
        }
    }
}

impl Default for PubnubPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for PubnubPublisher {
    async fn connect(&mut self, config: &ConfigSet) -> Result<()> {
        let config = PubnubPubConfig::from_map(config.primary())?;
        self.client = Some(self.connector.connect(&config.keys()).await?);
        info!("PubNub publisher ready");
        Ok(())
    }

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()> {
        let Some(client) = &self.client else {
            return Err(CourierError::NotConfigured("pubnub publisher"));
        };
        let result = client
            .publish(subject, body)
            .await
            .map(|time_token| debug!(channel = %subject, time_token, "Published"));
        observe("pubnub", result)
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}
