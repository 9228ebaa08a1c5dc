//! Transport capability interfaces and their bindings.
//!
//! Adapters never touch a driver type directly. Each driver is wrapped in a
//! binding implementing one of the capability traits below, and adapters
//! obtain handles through a [`Connector`]. Tests substitute in-memory fakes
//! at the same seam.
//!
//! | Capability          | Role                               | Binding            |
//! |---------------------|------------------------------------|--------------------|
//! | [`RawChannel`]      | AMQP channel                       | `lapin` (amqp)     |
//! | [`RawSocket`]       | nanomsg SUB/REP/REQ socket         | `nng` (nano)       |
//! | [`RawConnection`]   | NATS core connection               | `async-nats` (nats)|
//! | [`StreamConnection`]| durable streaming connection       | JetStream (nats)   |
//! | [`RawClient`]       | Redis pub/sub + scripting          | `redis`            |
//! | [`RawPubnubClient`] | PubNub REST subscribe/history      | `reqwest` (pubnub) |

use crate::envelope::RawMessage;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "nano")]
pub mod nano;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "pubnub")]
pub mod pubnub;
pub mod redis;

#[cfg(test)]
pub(crate) mod fake;

/// Inbound message stream of a channel, connection or durable subscription.
/// The stream ends when the underlying handle is closed.
pub type Deliveries = BoxStream<'static, Result<Box<dyn RawMessage>>>;

/// Produces a transport handle for a connection target.
#[async_trait]
pub trait Connector<T: ?Sized + Sync, H: ?Sized>: Send + Sync {
    async fn connect(&self, target: &T) -> Result<Arc<H>>;
}

/// Extra AMQP arguments (`x-message-ttl` and friends).
pub type FieldArgs = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub args: FieldArgs,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub args: FieldArgs,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeSpec {
    pub queue: String,
    pub tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub args: FieldArgs,
}

/// Properties attached to an AMQP reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyProperties {
    pub correlation_id: Option<String>,
    pub content_type: String,
}

/// AMQP channel capability.
#[async_trait]
pub trait RawChannel: Send + Sync {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Declare a queue, returning the server-side name.
    async fn queue_declare(&self, spec: &QueueSpec) -> Result<String>;

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
        args: &FieldArgs,
    ) -> Result<()>;

    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    async fn consume(&self, spec: &ConsumeSpec) -> Result<Deliveries>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &ReplyProperties,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Which nanomsg socket pattern to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Subscribe,
    Reply,
    Request,
}

/// nanomsg-style socket capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RawSocket: Send + Sync {
    async fn dial(&self, endpoint: &str) -> Result<()>;

    async fn listen(&self, endpoint: &str) -> Result<()>;

    /// Install a SUB topic filter.
    async fn subscribe(&self, topic: &[u8]) -> Result<()>;

    async fn set_recv_timeout(&self, timeout: Duration) -> Result<()>;

    /// Block until a frame arrives. Errors once the socket is closed.
    async fn recv(&self) -> Result<Vec<u8>>;

    async fn send(&self, body: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// NATS core connection capability.
#[async_trait]
pub trait RawConnection: Send + Sync {
    async fn subscribe(&self, subject: &str) -> Result<Deliveries>;

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Invoked by a streaming connection when the server link is lost.
pub type DisconnectHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Where and how to open a durable streaming connection.
#[derive(Clone)]
pub struct StreamTarget {
    pub url: String,
    pub cluster: String,
    pub client_id: String,
    pub on_disconnect: DisconnectHandler,
}

impl std::fmt::Debug for StreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTarget")
            .field("url", &self.url)
            .field("cluster", &self.cluster)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Durable streaming capability with manual acknowledgement.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    async fn durable_subscribe(&self, subject: &str, durable_name: &str) -> Result<Deliveries>;

    /// Publish and wait for the server acknowledgement.
    async fn publish(&self, subject: &str, body: &[u8], ack_wait: Duration) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Redis pub/sub message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub pattern: Option<String>,
    pub payload: String,
}

/// Redis capability: pub/sub, scripting and the sorted-set write the job sink needs.
#[async_trait]
pub trait RawClient: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, PubSubMessage>>;

    /// Load a script, returning its SHA1.
    async fn script_load(&self, script: &str) -> Result<String>;

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Vec<String>>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Where to open a Redis client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisTarget {
    pub url: String,
}

impl RedisTarget {
    /// `endpoint` is `host:port`.
    pub fn new(endpoint: &str, password: &str, db: &str, tls: bool) -> Self {
        let scheme = if tls { "rediss" } else { "redis" };
        let auth = if password.is_empty() {
            String::new()
        } else {
            format!(":{}@", urlencoding::encode(password))
        };
        let db = if db.is_empty() {
            String::new()
        } else {
            format!("/{}", db)
        };
        Self {
            url: format!("{}://{}{}{}", scheme, auth, endpoint, db),
        }
    }
}

/// PubNub status categories surfaced by the subscribe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Connected,
    Reconnected,
    Disconnected,
    Timeout,
    Cancelled,
    AccessDenied,
    ReconnectionAttemptsExhausted,
    Unknown,
}

/// One PubNub message, live or from history.
#[derive(Debug, Clone, PartialEq)]
pub struct PubnubPayload {
    pub channel: String,
    pub body: Vec<u8>,
    pub time_token: i64,
}

/// Status/message multiplex of a PubNub subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum PubnubEvent {
    Status(StatusCategory),
    Message(PubnubPayload),
}

/// PubNub account keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubnubKeys {
    pub subscribe_key: String,
    pub publish_key: String,
    pub secret_key: String,
}

/// PubNub capability.
#[async_trait]
pub trait RawPubnubClient: Send + Sync {
    /// Start a subscription; the receiver closes when the client unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubnubEvent>>;

    /// Oldest-first history page starting after `start`.
    async fn history(&self, channel: &str, start: i64, count: usize) -> Result<Vec<PubnubPayload>>;

    /// Publish, returning the assigned time-token.
    async fn publish(&self, channel: &str, body: &[u8]) -> Result<i64>;

    async fn unsubscribe_all(&self) -> Result<()>;
}
