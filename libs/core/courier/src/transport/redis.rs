//! Redis binding: pub/sub subscription, the publish/replay scripts and the
//! sorted-set write used by the job sink.

use super::{Connector, PubSubMessage, RawClient, RedisTarget};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Publish `ts|body` on `ARGV[1]` and append it to the sorted set `KEYS[1]`
/// scored by `ts`.
///
/// KEYS: `{channel}.list`, `{channel}.cntr`. ARGV: channel, body, ts.
pub const XPUBLISH: &str = "local channel = ARGV[1]; \
local ts = ARGV[3]; \
local msg = ts .. '|' .. ARGV[2]; \
redis.call('PUBLISH', channel, msg); \
redis.call('ZADD', KEYS[1], ts, msg); \
return {msg}";

/// Every logged message scored at or above `ARGV[2]` (use `(wm` for an
/// exclusive bound), oldest first.
///
/// KEYS: `{channel}.list`. ARGV: channel, lower bound.
pub const XSUBSCRIBE: &str = "return redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[2], '+inf')";

/// Sorted set holding the message log of `channel`.
pub fn log_key(channel: &str) -> String {
    format!("{{{}}}.list", channel)
}

/// Counter key of `channel`, reserved by the publish script.
pub fn counter_key(channel: &str) -> String {
    format!("{{{}}}.cntr", channel)
}

/// SHA1 digests of the loaded scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scripts {
    pub publish: String,
    pub subscribe: String,
}

/// Load both scripts, publish first.
pub async fn load_scripts(client: &dyn RawClient) -> Result<Scripts> {
    let publish = client.script_load(XPUBLISH).await?;
    let subscribe = client.script_load(XSUBSCRIBE).await?;
    debug!(publish = %publish, subscribe = %subscribe, "Redis scripts loaded");
    Ok(Scripts { publish, subscribe })
}

/// Buffered pub/sub messages between the driver and the adapter.
const SUBSCRIPTION_BUFFER: usize = 256;

/// `RawClient` over a `ConnectionManager`; subscriptions get their own
/// pub/sub connection drained by a forwarding task.
pub struct RedisClient {
    client: Client,
    conn: ConnectionManager,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .map_err(CourierError::connect)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(CourierError::connect)?;
        info!("Connected to Redis");
        Ok(Self {
            client,
            conn,
            forwarders: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RawClient for RedisClient {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, PubSubMessage>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(CourierError::connect)?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Dropping non-text pub/sub payload");
                        continue;
                    }
                };
                let message = PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    pattern: msg.get_pattern::<String>().ok(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.push(forwarder);
        }
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn script_load(&self, script: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script)
            .query_async(&mut conn)
            .await?;
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let result: Vec<String> = redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await?;
        Ok(result)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Aborting a forwarder drops its sender, which ends the subscription stream.
        if let Ok(mut forwarders) = self.forwarders.lock() {
            for forwarder in forwarders.drain(..) {
                forwarder.abort();
            }
        }
        Ok(())
    }
}

/// Opens a [`RedisClient`] per target.
pub struct RedisConnector;

#[async_trait]
impl Connector<RedisTarget, dyn RawClient> for RedisConnector {
    async fn connect(&self, target: &RedisTarget) -> Result<Arc<dyn RawClient>> {
        Ok(Arc::new(RedisClient::connect(&target.url).await?))
    }
}
