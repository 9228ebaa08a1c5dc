use super::{require_handler, Delivery, PROCESSING_QUEUE_CAPACITY};
use crate::client::{terminal_channel, MessageHandler, Subscriber, TerminalSignal};
use crate::config::{de, ConfigSet, ProtocolConfig};
use crate::cursor::PersistenceCursor;
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, PlainMessage, RawMessage, Responder};
use crate::error::{CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::transport::redis::{load_scripts, log_key};
use crate::transport::{Connector, RawClient, RedisTarget};
use crate::wire::{split_watermark, STANDARD_FIELDS};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisSubConfig {
    pub name: String,
    pub topic: String,
    pub endpoint: String,
    pub password: String,
    #[serde(deserialize_with = "de::boolean")]
    pub tls: bool,
    pub separator: String,
    #[serde(deserialize_with = "de::boolean")]
    pub persistence: bool,
}

impl ProtocolConfig for RedisSubConfig {
    const KEYS: &'static [&'static str] = &[
        "name",
        "topic",
        "endpoint",
        "password",
        "tls",
        "separator",
        "persistence",
    ];
    const MANDATORY: &'static [&'static str] = &["name", "topic", "endpoint", "persistence"];
}

/// Turn a logged or live payload into a raw message carrying its watermark.
fn logged_message(payload: &str) -> Box<dyn RawMessage> {
    match split_watermark(payload) {
        Some((watermark, body)) => Box::new(PlainMessage::new(body).with_time_token(watermark)),
        None => Box::new(PlainMessage::new(payload)),
    }
}

/// Redis pub/sub subscriber with catch-up replay from the publish log.
///
/// Start subscribes first, replays the log after the stored watermark, then
/// forwards live messages, all through one bounded queue to the process task.
/// Anything published during the replay window arrives twice and is caught by
/// the dedup filter.
pub struct RedisSubscriber {
    connector: Arc<dyn Connector<RedisTarget, dyn RawClient>>,
    dedup: DedupFilter,
    state_dir: Option<PathBuf>,
    config: Option<RedisSubConfig>,
    client: Option<Arc<dyn RawClient>>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl RedisSubscriber {
    pub fn new(dedup: DedupFilter) -> Self {
        Self::with_connector(Arc::new(crate::transport::redis::RedisConnector), dedup)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector<RedisTarget, dyn RawClient>>,
        dedup: DedupFilter,
    ) -> Self {
        Self {
            connector,
            dedup,
            state_dir: None,
            config: None,
            client: None,
            handler: None,
        }
    }

    /// Keep the watermark under `dir` instead of `COURIER_STATE_DIR`.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    fn cursor(&self, topic: &str) -> PersistenceCursor {
        match &self.state_dir {
            Some(dir) => PersistenceCursor::new(dir, topic),
            None => PersistenceCursor::from_env(topic),
        }
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        let config = RedisSubConfig::from_map(config.primary())?;
        self.close().await;

        let target = RedisTarget::new(&config.endpoint, &config.password, "", config.tls);
        let client = self.connector.connect(&target).await?;
        info!(name = %config.name, topic = %config.topic, "Redis subscriber connected");
        self.client = Some(client);
        self.config = Some(config);
        Ok(())
    }

    fn on_message(&mut self, handler: Arc<dyn MessageHandler>) -> &mut dyn Subscriber {
        self.handler = Some(handler);
        self
    }

    async fn start(&mut self) -> Result<TerminalSignal> {
        let (Some(client), Some(config)) = (self.client.clone(), self.config.clone()) else {
            return Err(CourierError::NotConfigured("redis subscriber"));
        };
        let handler = require_handler(&self.handler)?;

        let cursor = self.cursor(&config.topic);
        let watermark = if config.persistence {
            match cursor.load().await {
                Ok(watermark) => Some(watermark),
                Err(e) => {
                    warn!(topic = %config.topic, error = %e, "No watermark, skipping replay");
                    None
                }
            }
        } else {
            None
        };

        let scripts = load_scripts(client.as_ref()).await?;
        let mut live = client.subscribe(&config.topic).await?;

        let metrics = AdapterMetrics::new("redis", &config.topic);
        let delivery = Delivery::new(self.dedup.clone(), metrics.clone(), handler);
        let (queue, mut pending) = mpsc::channel::<Box<dyn RawMessage>>(PROCESSING_QUEUE_CAPACITY);
        let (terminal, signal) = terminal_channel();

        // Receive: replay, then live.
        let topic = config.topic.clone();
        let receive_client = client.clone();
        tokio::spawn(async move {
            if let Some(watermark) = watermark {
                let keys = [log_key(&topic)];
                let args = [topic.clone(), format!("({}", watermark)];
                match receive_client.eval_sha(&scripts.subscribe, &keys, &args).await {
                    Ok(logged) => {
                        info!(topic = %topic, watermark, count = logged.len(), "Replaying missed messages");
                        metrics.replayed(logged.len());
                        for payload in logged {
                            if queue.send(logged_message(&payload)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "Replay failed"),
                }
            }

            while let Some(message) = live.next().await {
                if queue.send(logged_message(&message.payload)).await.is_err() {
                    break;
                }
            }
            terminal.fire(CourierError::Disconnected(
                "Receive channel closed, Subscription ended.".to_string(),
            ));
        });

        // Process: dedup, callback, watermark on ack.
        let persistence = config.persistence;
        tokio::spawn(async move {
            while let Some(raw) = pending.recv().await {
                let watermark = raw.time_token();
                let Some(raw) = delivery.admit(raw, STANDARD_FIELDS).await else {
                    continue;
                };
                let envelope = delivery
                    .dispatch(Envelope::new(raw, Responder::Property))
                    .await;
                if persistence && envelope.is_acked() && watermark > 0 {
                    if let Err(e) = cursor.store(watermark).await {
                        warn!(path = %cursor.path().display(), error = %e, "Failed to persist watermark");
                    }
                }
            }
            debug!("Redis processing queue drained");
        });

        info!(topic = %config.topic, persistence = config.persistence, "Redis subscriber started");
        Ok(signal)
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                warn!(error = %e, "Failed to close Redis client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::map_of;
    use crate::subscriber::testing::{assert_idle, next_body, recorder};
    use crate::transport::fake::{FakeConnector, FakeRedisClient};
    use serde_json::json;
    use std::time::Duration;

    fn config(persistence: bool) -> ConfigSet {
        ConfigSet::single(map_of(&[
            ("name", json!("agent")),
            ("topic", json!("feed/agents")),
            ("endpoint", json!("localhost:6379")),
            ("password", json!("pw")),
            ("persistence", json!(persistence.to_string())),
        ]))
    }

    fn subscriber(client: Arc<FakeRedisClient>, dir: &std::path::Path) -> RedisSubscriber {
        RedisSubscriber::with_connector(
            Arc::new(FakeConnector::<dyn RawClient>::new(client)),
            DedupFilter::in_memory(),
        )
        .with_state_dir(dir)
    }

    async fn wait_for_watermark(cursor: &PersistenceCursor, expected: i64) {
        for _ in 0..50 {
            if cursor.load().await.ok() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("watermark never reached {}", expected);
    }

    #[tokio::test]
    async fn test_missing_persistence_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut sub = subscriber(Arc::new(FakeRedisClient::default()), dir.path());
        let mut map = config(true).primary().clone();
        map.remove("persistence");

        let err = sub.configure(&ConfigSet::single(map)).await.unwrap_err();
        assert_eq!(err.to_string(), "Key Missing : persistence");
    }

    #[tokio::test]
    async fn test_replays_after_watermark_then_goes_live() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = PersistenceCursor::new(dir.path(), "feed/agents");
        cursor.store(50).await.unwrap();

        let client = Arc::new(FakeRedisClient::with_history(vec![
            "60|r1|a|b|c|d|e|missed-1".to_string(),
            "70|r2|a|b|c|d|e|missed-2".to_string(),
        ]));
        let mut sub = subscriber(client.clone(), dir.path());
        let (handler, mut rx) = recorder(true);

        sub.configure(&config(true)).await.unwrap();
        sub.on_message(handler);
        let _signal = sub.start().await.unwrap();

        assert_eq!(next_body(&mut rx).await, b"a|b|c|d|e|missed-1");
        assert_eq!(next_body(&mut rx).await, b"a|b|c|d|e|missed-2");
        let evals = client.evals();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].0, "sha-2");
        assert_eq!(evals[0].1, vec!["{feed/agents}.list"]);
        assert_eq!(evals[0].2, vec!["feed/agents", "(50"]);
        wait_for_watermark(&cursor, 70).await;

        client.push("feed/agents", "80|live-1|a|b|c|d|e|fresh");
        assert_eq!(next_body(&mut rx).await, b"a|b|c|d|e|fresh");
        wait_for_watermark(&cursor, 80).await;
    }

    #[tokio::test]
    async fn test_no_watermark_means_no_replay() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeRedisClient::with_history(vec!["1|x".to_string()]));
        let mut sub = subscriber(client.clone(), dir.path());
        let (handler, mut rx) = recorder(false);

        sub.configure(&config(true)).await.unwrap();
        sub.on_message(handler);
        let _signal = sub.start().await.unwrap();

        assert_eq!(client.subscriptions(), vec!["feed/agents"]);
        assert_idle(&mut rx).await;
        assert!(client.evals().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_message_does_not_advance_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = PersistenceCursor::new(dir.path(), "feed/agents");
        cursor.store(10).await.unwrap();
        let client = Arc::new(FakeRedisClient::default());
        let mut sub = subscriber(client.clone(), dir.path());
        let (handler, mut rx) = recorder(false);

        sub.configure(&config(true)).await.unwrap();
        sub.on_message(handler);
        let _signal = sub.start().await.unwrap();

        client.push("feed/agents", "99|body");
        assert_eq!(next_body(&mut rx).await, b"body");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cursor.load().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_duplicate_live_message_suppressed_and_close_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeRedisClient::default());
        let mut sub = subscriber(client.clone(), dir.path());
        let (handler, mut rx) = recorder(false);

        sub.configure(&config(false)).await.unwrap();
        sub.on_message(handler);
        let mut signal = sub.start().await.unwrap();

        client.push("feed/agents", "5|dup|a|b|c|d|e|once");
        client.push("feed/agents", "6|dup|a|b|c|d|e|once");
        assert_eq!(next_body(&mut rx).await, b"a|b|c|d|e|once");
        assert_idle(&mut rx).await;

        sub.close().await;
        assert!(client.is_closed());
        let err = signal.recv().await.unwrap();
        assert_eq!(err.to_string(), "Receive channel closed, Subscription ended.");
    }
}
