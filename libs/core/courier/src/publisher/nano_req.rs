use super::observe;
use crate::client::Publisher;
use crate::config::{de, ConfigSet, ProtocolConfig};
use crate::error::{CourierError, Result};
use crate::transport::{Connector, RawSocket, SocketKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const OK: &[u8] = b"OK";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NanoRequestConfig {
    pub name: String,
    pub topic: String,
    pub endpoint: String,
    /// Reply wait in milliseconds.
    #[serde(deserialize_with = "de::unsigned")]
    pub timeout: u64,
    pub separator: String,
}

impl ProtocolConfig for NanoRequestConfig {
    const KEYS: &'static [&'static str] = &["name", "topic", "endpoint", "timeout", "separator"];
    const MANDATORY: &'static [&'static str] = &["name", "topic", "endpoint", "timeout"];
}

/// nanomsg REQ client. A publish is one request that the reply server must
/// answer with `OK`.
pub struct NanoRequest {
    connector: Arc<dyn Connector<SocketKind, dyn RawSocket>>,
    socket: Option<Arc<dyn RawSocket>>,
}

impl NanoRequest {
    #[cfg(feature = "nano")]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::transport::nano::NngConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector<SocketKind, dyn RawSocket>>) -> Self {
        Self {
            connector,
            socket: None,
        }
    }
}

#[cfg(feature = "nano")]
impl Default for NanoRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for NanoRequest {
    async fn connect(&mut self, config: &ConfigSet) -> Result<()> {
        let config = NanoRequestConfig::from_map(config.primary())?;
        let socket = self.connector.connect(&SocketKind::Request).await?;

        let setup = async {
            socket.dial(&config.endpoint).await?;
            socket
                .set_recv_timeout(Duration::from_millis(config.timeout))
                .await
        };
        if let Err(e) = setup.await {
            if let Err(close_err) = socket.close().await {
                warn!(error = %close_err, "Failed to close nanomsg socket");
            }
            return Err(e);
        }

        info!(name = %config.name, endpoint = %config.endpoint, "nanomsg request client connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn publish(&self, _subject: &str, body: &[u8]) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Err(CourierError::NotConfigured("nanomsg request client"));
        };
        let result = async {
            socket.send(body).await?;
            let reply = socket.recv().await?;
            if reply != OK {
                warn!(reply = %String::from_utf8_lossy(&reply), "Unexpected reply");
                return Err(CourierError::InvalidAck);
            }
            Ok(())
        }
        .await;
        observe("nano", result)
    }

    async fn close(&mut self) -> Result<()> {
        match self.socket.take() {
            Some(socket) => socket.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::map_of;
    use crate::transport::fake::FakeConnector;
    use crate::transport::MockRawSocket;
    use mockall::Sequence;
    use serde_json::json;

    fn config() -> ConfigSet {
        ConfigSet::single(map_of(&[
            ("name", json!("req")),
            ("topic", json!("rpc")),
            ("endpoint", json!("tcp://127.0.0.1:5555")),
            ("timeout", json!(250)),
        ]))
    }

    fn connected_socket(reply: &'static [u8]) -> MockRawSocket {
        let mut seq = Sequence::new();
        let mut socket = MockRawSocket::new();
        socket
            .expect_dial()
            .withf(|endpoint| endpoint.to_string() == "tcp://127.0.0.1:5555")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        socket
            .expect_set_recv_timeout()
            .withf(|timeout| *timeout == Duration::from_millis(250))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        socket
            .expect_send()
            .withf(|body| body.to_vec() == b"ping".to_vec())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        socket
            .expect_recv()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || Ok(reply.to_vec()));
        socket.expect_close().returning(|| Ok(()));
        socket
    }

    #[tokio::test]
    async fn test_request_acknowledged() {
        let socket: Arc<dyn RawSocket> = Arc::new(connected_socket(b"OK"));
        let mut request = NanoRequest::with_connector(Arc::new(FakeConnector::new(socket)));

        request.connect(&config()).await.unwrap();
        request.publish("rpc", b"ping").await.unwrap();
        request.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_rejected() {
        let socket: Arc<dyn RawSocket> = Arc::new(connected_socket(b"NOK"));
        let mut request = NanoRequest::with_connector(Arc::new(FakeConnector::new(socket)));

        request.connect(&config()).await.unwrap();
        let err = request.publish("rpc", b"ping").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid ack. Please send 'OK'");
    }

    #[tokio::test]
    async fn test_dial_failure_closes_socket() {
        let mut socket = MockRawSocket::new();
        socket
            .expect_dial()
            .returning(|_| Err(CourierError::connect("connection refused")));
        socket.expect_close().times(1).returning(|| Ok(()));
        let socket: Arc<dyn RawSocket> = Arc::new(socket);
        let mut request = NanoRequest::with_connector(Arc::new(FakeConnector::new(socket)));

        let err = request.connect(&config()).await.unwrap_err();
        assert_eq!(err.to_string(), "Connection error: connection refused");
        assert!(matches!(
            request.publish("rpc", b"ping").await,
            Err(CourierError::NotConfigured(_))
        ));
    }
}
