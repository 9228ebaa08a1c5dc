use super::observe;
use crate::client::Publisher;
use crate::config::{de, ConfigSet, ProtocolConfig};
use crate::error::{CourierError, Result};
use crate::transport::redis::{counter_key, load_scripts, log_key, Scripts};
use crate::transport::{Connector, RawClient, RedisTarget};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisPubConfig {
    pub host: String,
    #[serde(deserialize_with = "de::string")]
    pub port: String,
    pub password: String,
    #[serde(deserialize_with = "de::string")]
    pub db: String,
    #[serde(deserialize_with = "de::boolean")]
    pub tls: bool,
}

impl ProtocolConfig for RedisPubConfig {
    const KEYS: &'static [&'static str] = &["host", "port", "password", "db", "tls"];
    const MANDATORY: &'static [&'static str] = &["host", "port"];
}

impl RedisPubConfig {
    pub fn target(&self) -> RedisTarget {
        RedisTarget::new(
            &format!("{}:{}", self.host, self.port),
            &self.password,
            &self.db,
            self.tls,
        )
    }
}

/// Publishes through the XPUBLISH script so every message is also logged
/// for subscriber replay.
pub struct RedisPublisher {
    connector: Arc<dyn Connector<RedisTarget, dyn RawClient>>,
    client: Option<(Arc<dyn RawClient>, Scripts)>,
}

impl RedisPublisher {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::transport::redis::RedisConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector<RedisTarget, dyn RawClient>>) -> Self {
        Self {
            connector,
            client: None,
        }
    }
}

impl Default for RedisPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn connect(&mut self, config: &ConfigSet) -> Result<()> {
        let config = RedisPubConfig::from_map(config.primary())?;
        let client = self.connector.connect(&config.target()).await?;
        let scripts = load_scripts(client.as_ref()).await?;
        info!(host = %config.host, port = %config.port, "Redis publisher connected");
        self.client = Some((client, scripts));
        Ok(())
    }

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()> {
        let Some((client, scripts)) = &self.client else {
            return Err(CourierError::NotConfigured("redis publisher"));
        };
        let keys = [log_key(subject), counter_key(subject)];
        let args = [
            subject.to_string(),
            String::from_utf8_lossy(body).into_owned(),
            chrono::Utc::now().timestamp_micros().to_string(),
        ];
        let result = client
            .eval_sha(&scripts.publish, &keys, &args)
            .await
            .map(|logged| debug!(subject = %subject, ?logged, "Published"));
        observe("redis", result)
    }

    async fn close(&mut self) -> Result<()> {
        match self.client.take() {
            Some((client, _)) => client.close().await,
            None => Ok(()),
        }
    }
}
