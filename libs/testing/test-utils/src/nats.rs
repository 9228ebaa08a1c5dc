//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that creates a NATS container with JetStream,
//! used by the core and durable streaming binding tests.

use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

// Re-export for test convenience (used by consumers of this crate)
#[allow(unused_imports)]
pub use futures::StreamExt;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
/// JetStream is enabled by default for stream-based testing.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Get a client for your tests
/// let client = nats.client();
///
/// // Or get JetStream context
/// let jetstream = nats.jetstream();
///
/// // Create streams, publish/consume messages, etc.
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Create a new test NATS instance with JetStream enabled
    ///
    /// Uses NATS latest image with JetStream (-js flag).
    pub async fn new() -> Self {
        // Use NATS with JetStream enabled (-js flag)
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]); // Enable JetStream

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client (useful for passing to services)
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for stream operations
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

// Container is automatically cleaned up when TestNats is dropped
impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_request_reply_subject() {
        let nats = TestNats::new().await;
        let client = nats.client();

        let mut subscriber = client.subscribe("test.rpc").await.unwrap();
        let inbox = client.new_inbox();
        let mut replies = client.subscribe(inbox.clone()).await.unwrap();

        client
            .publish_with_reply("test.rpc", inbox, "ping".into())
            .await
            .unwrap();
        client.flush().await.unwrap();

        let request = tokio::time::timeout(tokio::time::Duration::from_secs(5), subscriber.next())
            .await
            .expect("Timeout waiting for request")
            .expect("No request received");
        let reply_to = request.reply.expect("missing reply subject");
        client.publish(reply_to, "OK".into()).await.unwrap();
        client.flush().await.unwrap();

        let reply = tokio::time::timeout(tokio::time::Duration::from_secs(5), replies.next())
            .await
            .expect("Timeout waiting for reply")
            .expect("No reply received");
        assert_eq!(reply.payload.as_ref(), b"OK");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_jetstream_enabled() {
        let nats = TestNats::new().await;
        let jetstream = nats.jetstream();

        let stream = jetstream
            .create_stream(async_nats::jetstream::stream::Config {
                name: "TEST_STREAM".to_string(),
                subjects: vec!["test.>".to_string()],
                ..Default::default()
            })
            .await
            .expect("Failed to create stream");

        let ack = jetstream
            .publish("test.hello", "world".into())
            .await
            .expect("Failed to publish")
            .await
            .expect("Failed to get ack");

        assert!(ack.sequence > 0);
        assert_eq!(stream.cached_info().config.name, "TEST_STREAM");
    }
}
