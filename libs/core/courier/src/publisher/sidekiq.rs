use super::observe;
use crate::client::Publisher;
use crate::config::{de, ConfigSet, ProtocolConfig};
use crate::error::{CourierError, Result};
use crate::transport::{Connector, RawClient, RedisTarget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Sorted set of scheduled jobs polled by the Sidekiq scheduler.
pub const SCHEDULE_KEY: &str = "schedule";

/// Delay before a published job becomes due.
const SCHEDULE_DELAY_MS: i64 = 3_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SidekiqConfig {
    pub endpoint: String,
    pub password: String,
    #[serde(deserialize_with = "de::string")]
    pub db: String,
    pub queue: String,
    pub worker: String,
    pub job: String,
}

impl ProtocolConfig for SidekiqConfig {
    const KEYS: &'static [&'static str] = &["endpoint", "password", "db", "queue", "worker", "job"];
    const MANDATORY: &'static [&'static str] = &["endpoint"];
}

/// Sidekiq job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub class: String,
    pub queue: String,
    pub args: Vec<Value>,
    pub retry: bool,
    pub jid: String,
    pub at: f64,
    pub created_at: f64,
    pub enqueued_at: f64,
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1_000.0
}

impl Job {
    fn new(config: &SidekiqConfig, payload: Map<String, Value>, now: DateTime<Utc>) -> Self {
        let queue = if config.queue.is_empty() {
            "default".to_string()
        } else {
            config.queue.clone()
        };
        let mut jid = uuid::Uuid::new_v4().simple().to_string();
        jid.truncate(24);
        let now_secs = epoch_seconds(now);
        Self {
            class: config.worker.clone(),
            queue,
            args: vec![Value::String(config.job.clone()), Value::Object(payload)],
            retry: false,
            jid,
            at: epoch_seconds(now + chrono::Duration::milliseconds(SCHEDULE_DELAY_MS)),
            created_at: now_secs,
            enqueued_at: now_secs,
        }
    }
}

/// Fire-and-forget job sink: every publish schedules a delayed Sidekiq job
/// whose arguments are the configured job name and the JSON body.
pub struct SidekiqPublisher {
    connector: Arc<dyn Connector<RedisTarget, dyn RawClient>>,
    state: Option<(Arc<dyn RawClient>, SidekiqConfig)>,
}

impl SidekiqPublisher {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(crate::transport::redis::RedisConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector<RedisTarget, dyn RawClient>>) -> Self {
        Self {
            connector,
            state: None,
        }
    }
}

impl Default for SidekiqPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for SidekiqPublisher {
    async fn connect(&mut self, config: &ConfigSet) -> Result<()> {
        let config = SidekiqConfig::from_map(config.primary())?;
        let target = RedisTarget::new(&config.endpoint, &config.password, &config.db, false);
        let client = self.connector.connect(&target).await?;
        info!(endpoint = %config.endpoint, worker = %config.worker, "Sidekiq publisher connected");
        self.state = Some((client, config));
        Ok(())
    }

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()> {
        let Some((client, config)) = &self.state else {
            return Err(CourierError::NotConfigured("sidekiq publisher"));
        };
        let result = async {
            let payload: Map<String, Value> = serde_json::from_slice(body)?;
            let job = Job::new(config, payload, Utc::now());
            let member = serde_json::to_string(&job)?;
            client.zadd(SCHEDULE_KEY, job.at, &member).await?;
            debug!(subject = %subject, jid = %job.jid, at = job.at, "Job scheduled");
            Ok::<_, CourierError>(())
        }
        .await;
        observe("sidekiq", result)
    }

    async fn close(&mut self) -> Result<()> {
        self.state = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::map_of;
    use crate::transport::fake::{FakeConnector, FakeRedisClient};
    use serde_json::json;

    fn config(queue: Option<&str>) -> ConfigSet {
        let mut entries = vec![
            ("endpoint", json!("redis:6379")),
            ("worker", json!("AlertWorker")),
            ("job", json!("alert")),
        ];
        if let Some(queue) = queue {
            entries.push(("queue", json!(queue)));
        }
        ConfigSet::single(map_of(&entries))
    }

    #[tokio::test]
    async fn test_schedules_job_three_seconds_ahead() {
        let client = Arc::new(FakeRedisClient::default());
        let mut publisher = SidekiqPublisher::with_connector(Arc::new(
            FakeConnector::<dyn RawClient>::new(client.clone()),
        ));
        publisher
            .connect(&config(None))
            .await
            .unwrap();

        publisher
            .publish("ignored", br#"{"severity":"high"}"#)
            .await
            .unwrap();

        let zadds = client.zadds();
        assert_eq!(zadds.len(), 1);
        let (key, score, member) = &zadds[0];
        assert_eq!(key, SCHEDULE_KEY);

        let job: Job = serde_json::from_str(member).unwrap();
        assert_eq!(job.class, "AlertWorker");
        assert_eq!(job.queue, "default");
        assert_eq!(job.args, vec![json!("alert"), json!({"severity": "high"})]);
        assert!(!job.retry);
        assert_eq!(job.jid.len(), 24);
        assert_eq!(*score, job.at);
        assert!((job.at - job.enqueued_at - 3.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_non_object_body_is_serialization_error() {
        let client = Arc::new(FakeRedisClient::default());
        let mut publisher = SidekiqPublisher::with_connector(Arc::new(
            FakeConnector::<dyn RawClient>::new(client.clone()),
        ));
        publisher
            .connect(&config(Some("critical")))
            .await
            .unwrap();

        let err = publisher.publish("x", b"not json").await.unwrap_err();
        assert!(matches!(err, CourierError::Serialization(_)));
        assert!(client.zadds().is_empty());
    }
}
