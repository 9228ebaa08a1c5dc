use super::observe;
use crate::client::Publisher;
use crate::config::{de, ConfigSet, ProtocolConfig};
use crate::error::{CourierError, Result};
use crate::subscriber::nats_url;
use crate::transport::{Connector, StreamConnection, StreamTarget};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StanPubConfig {
    pub name: String,
    pub topic: String,
    pub endpoint: String,
    pub cluster: String,
    /// Publish acknowledgement wait in milliseconds.
    #[serde(deserialize_with = "de::unsigned")]
    pub ack_time: u64,
}

impl ProtocolConfig for StanPubConfig {
    const KEYS: &'static [&'static str] = &["name", "topic", "endpoint", "cluster", "ack_time"];
    const MANDATORY: &'static [&'static str] = &["name", "topic", "endpoint", "cluster", "ack_time"];
}

/// Streaming publisher that fails fast once the server link is lost.
pub struct StanPublisher {
    connector: Arc<dyn Connector<StreamTarget, dyn StreamConnection>>,
    connection: Option<Arc<dyn StreamConnection>>,
    connected: Arc<AtomicBool>,
    ack_wait: Duration,
}

impl StanPublisher {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::transport::nats::JetStreamConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector<StreamTarget, dyn StreamConnection>>) -> Self {
        Self {
            connector,
            connection: None,
            connected: Arc::new(AtomicBool::new(false)),
            ack_wait: Duration::ZERO,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Default for StanPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for StanPublisher {
    async fn connect(&mut self, config: &ConfigSet) -> Result<()> {
        let config = StanPubConfig::from_map(config.primary())?;
        let connected = self.connected.clone();
        let target = StreamTarget {
            url: nats_url(&config.endpoint, "", "", ""),
            cluster: config.cluster.clone(),
            client_id: config.name.clone(),
            on_disconnect: Arc::new(move |reason: String| {
                warn!(reason = %reason, "Streaming publisher disconnected");
                connected.store(false, Ordering::SeqCst);
            }),
        };

        let connection = self.connector.connect(&target).await?;
        self.connected.store(true, Ordering::SeqCst);
        self.ack_wait = Duration::from_millis(config.ack_time);
        self.connection = Some(connection);
        info!(name = %config.name, cluster = %config.cluster, "Streaming publisher connected");
        Ok(())
    }

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()> {
        let result = match &self.connection {
            Some(connection) if self.is_connected() => {
                connection.publish(subject, body, self.ack_wait).await
            }
            _ => Err(CourierError::Publish(
                "Unable to publish message, disconnected from server.".to_string(),
            )),
        };
        observe("nats_streaming", result)
    }

    async fn close(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        match self.connection.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::map_of;
    use crate::transport::fake::{FakeStreamConnection, FakeStreamConnector};
    use serde_json::json;

    fn config() -> ConfigSet {
        ConfigSet::single(map_of(&[
            ("name", json!("publisher-1")),
            ("topic", json!("events")),
            ("endpoint", json!("nats:4222")),
            ("cluster", json!("EVENTS")),
            ("ack_time", json!("500")),
        ]))
    }

    #[tokio::test]
    async fn test_publish_while_connected() {
        let connection = Arc::new(FakeStreamConnection::default());
        let connector = Arc::new(FakeStreamConnector::new(connection.clone()));
        let mut publisher = StanPublisher::with_connector(connector.clone());

        publisher.connect(&config()).await.unwrap();
        publisher.publish("events", b"hello").await.unwrap();

        assert_eq!(connector.targets()[0].client_id, "publisher-1");
        assert_eq!(
            connection.published(),
            vec![("events".to_string(), b"hello".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_disconnect_fails_fast() {
        let connection = Arc::new(FakeStreamConnection::default());
        let connector = Arc::new(FakeStreamConnector::new(connection.clone()));
        let mut publisher = StanPublisher::with_connector(connector.clone());
        publisher.connect(&config()).await.unwrap();

        connector.disconnect("stale connection");
        assert!(!publisher.is_connected());

        let err = publisher.publish("events", b"hello").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Publish error: Unable to publish message, disconnected from server."
        );
        assert!(connection.published().is_empty());

        publisher.close().await.unwrap();
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_ack_time_is_mandatory() {
        let mut publisher = StanPublisher::with_connector(Arc::new(FakeStreamConnector::new(
            Arc::new(FakeStreamConnection::default()),
        )));
        let mut map = config().primary().clone();
        map.remove("ack_time");
        let err = publisher.connect(&ConfigSet::single(map)).await.unwrap_err();
        assert_eq!(err.to_string(), "Key Missing : ack_time");
    }
}
