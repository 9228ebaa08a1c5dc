//! Adapter construction by kind.
//!
//! Kinds parse from `protocol[:method]` strings such as `amqp`,
//! `amqp:reply`, `nats-streaming` or `nano:req`. The method defaults to
//! `sub` for subscribers and `publish` for publishers.

use crate::client::{MessageHandler, Publisher, Subscriber};
use crate::dedup::DedupFilter;
use crate::envelope::Envelope;
use crate::error::{ConfigError, Result};
use crate::failover::{FailoverPublisher, FailoverSubscriber};
use crate::publisher::{RedisPublisher, SidekiqPublisher};
use crate::subscriber::RedisSubscriber;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberKind {
    #[cfg(feature = "amqp")]
    Amqp,
    #[cfg(feature = "amqp")]
    AmqpReply,
    #[cfg(feature = "nano")]
    Nano,
    #[cfg(feature = "nano")]
    NanoReply,
    #[cfg(feature = "nats")]
    Nats,
    #[cfg(feature = "nats")]
    NatsReply,
    #[cfg(feature = "nats")]
    NatsStreaming,
    Redis,
    #[cfg(feature = "pubnub")]
    Pubnub,
    Failover(Box<SubscriberKind>, Box<SubscriberKind>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherKind {
    Redis,
    Sidekiq,
    #[cfg(feature = "nats")]
    NatsStreaming,
    #[cfg(feature = "pubnub")]
    Pubnub,
    #[cfg(feature = "nano")]
    NanoRequest,
    Failover {
        primary: Box<PublisherKind>,
        backup: Option<Box<PublisherKind>>,
        stamp_ids: bool,
    },
}

fn split_kind(s: &str) -> (&str, Option<&str>) {
    match s.split_once(':') {
        Some((protocol, method)) => (protocol.trim(), Some(method.trim())),
        None => (s.trim(), None),
    }
}

fn invalid_method(method: &str) -> ConfigError {
    ConfigError::UnknownKind(format!("Invalid Parameters, method: {}", method))
}

fn invalid_protocol(protocol: &str) -> ConfigError {
    ConfigError::UnknownKind(format!("Invalid Protocol: {}", protocol))
}

impl SubscriberKind {
    /// Resolve a `(protocol, method)` pair; `method` is `sub` or `reply`.
    pub fn parse(protocol: &str, method: &str) -> Result<Self, ConfigError> {
        let kind = match (protocol, method) {
            #[cfg(feature = "amqp")]
            ("amqp", "sub") => Self::Amqp,
            #[cfg(feature = "amqp")]
            ("amqp", "reply") => Self::AmqpReply,
            #[cfg(feature = "nano")]
            ("nano", "sub") => Self::Nano,
            #[cfg(feature = "nano")]
            ("nano", "reply") => Self::NanoReply,
            #[cfg(feature = "nats")]
            ("nats", "sub") => Self::Nats,
            #[cfg(feature = "nats")]
            ("nats", "reply") => Self::NatsReply,
            #[cfg(feature = "nats")]
            ("nats-streaming", "sub") => Self::NatsStreaming,
            ("redis", "sub") => Self::Redis,
            #[cfg(feature = "pubnub")]
            ("pubnub", "sub") => Self::Pubnub,
            ("amqp" | "nano" | "nats" | "nats-streaming" | "redis" | "pubnub", _) => {
                return Err(invalid_method(method));
            }
            _ => return Err(invalid_protocol(protocol)),
        };
        Ok(kind)
    }

    pub fn failover(primary: SubscriberKind, backup: SubscriberKind) -> Self {
        Self::Failover(Box::new(primary), Box::new(backup))
    }
}

impl FromStr for SubscriberKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, method) = split_kind(s);
        Self::parse(protocol, method.unwrap_or("sub"))
    }
}

impl fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "amqp")]
            Self::Amqp => write!(f, "amqp:sub"),
            #[cfg(feature = "amqp")]
            Self::AmqpReply => write!(f, "amqp:reply"),
            #[cfg(feature = "nano")]
            Self::Nano => write!(f, "nano:sub"),
            #[cfg(feature = "nano")]
            Self::NanoReply => write!(f, "nano:reply"),
            #[cfg(feature = "nats")]
            Self::Nats => write!(f, "nats:sub"),
            #[cfg(feature = "nats")]
            Self::NatsReply => write!(f, "nats:reply"),
            #[cfg(feature = "nats")]
            Self::NatsStreaming => write!(f, "nats-streaming:sub"),
            Self::Redis => write!(f, "redis:sub"),
            #[cfg(feature = "pubnub")]
            Self::Pubnub => write!(f, "pubnub:sub"),
            Self::Failover(primary, backup) => write!(f, "failover({}, {})", primary, backup),
        }
    }
}

impl PublisherKind {
    pub fn parse(protocol: &str, method: &str) -> Result<Self, ConfigError> {
        let kind = match (protocol, method) {
            ("redis", "publish") => Self::Redis,
            ("sidekiq", "publish") => Self::Sidekiq,
            #[cfg(feature = "nats")]
            ("nats-streaming", "publish") => Self::NatsStreaming,
            #[cfg(feature = "pubnub")]
            ("pubnub", "publish") => Self::Pubnub,
            #[cfg(feature = "nano")]
            ("nano", "req") => Self::NanoRequest,
            ("redis" | "sidekiq" | "nats-streaming" | "pubnub" | "nano", _) => {
                return Err(invalid_method(method));
            }
            _ => return Err(invalid_protocol(protocol)),
        };
        Ok(kind)
    }

    /// Dual-writing composite with `uuid|` stamping.
    pub fn failover(primary: PublisherKind, backup: Option<PublisherKind>) -> Self {
        Self::Failover {
            primary: Box::new(primary),
            backup: backup.map(Box::new),
            stamp_ids: true,
        }
    }
}

impl FromStr for PublisherKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, method) = split_kind(s);
        let method = method.unwrap_or(if protocol == "nano" { "req" } else { "publish" });
        Self::parse(protocol, method)
    }
}

/// Default handler installed by [`new_subscriber`]; callers replace it
/// through `on_message`.
struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, envelope: &mut Envelope) {
        info!(
            body = %String::from_utf8_lossy(envelope.get_message()),
            "Received"
        );
    }
}

/// Build a subscriber or reply server. Reply servers ignore `dedup`.
pub fn new_subscriber(kind: &SubscriberKind, dedup: DedupFilter) -> Box<dyn Subscriber> {
    let mut subscriber: Box<dyn Subscriber> = match kind {
        #[cfg(feature = "amqp")]
        SubscriberKind::Amqp => Box::new(crate::subscriber::AmqpSubscriber::new(dedup)),
        #[cfg(feature = "amqp")]
        SubscriberKind::AmqpReply => Box::new(crate::reply::AmqpReply::new()),
        #[cfg(feature = "nano")]
        SubscriberKind::Nano => Box::new(crate::subscriber::NanoSubscriber::new(dedup)),
        #[cfg(feature = "nano")]
        SubscriberKind::NanoReply => Box::new(crate::reply::NanoReply::new()),
        #[cfg(feature = "nats")]
        SubscriberKind::Nats => Box::new(crate::subscriber::NatsSubscriber::new(dedup)),
        #[cfg(feature = "nats")]
        SubscriberKind::NatsReply => Box::new(crate::reply::NatsReply::new()),
        #[cfg(feature = "nats")]
        SubscriberKind::NatsStreaming => Box::new(crate::subscriber::StanSubscriber::new(dedup)),
        SubscriberKind::Redis => Box::new(RedisSubscriber::new(dedup)),
        #[cfg(feature = "pubnub")]
        SubscriberKind::Pubnub => Box::new(crate::subscriber::PubnubSubscriber::new(dedup)),
        SubscriberKind::Failover(primary, backup) => Box::new(FailoverSubscriber::new(
            new_subscriber(primary, dedup.clone()),
            new_subscriber(backup, dedup),
        )),
    };
    subscriber.on_message(Arc::new(LogHandler));
    subscriber
}

pub fn new_publisher(kind: &PublisherKind) -> Box<dyn Publisher> {
    match kind {
        PublisherKind::Redis => Box::new(RedisPublisher::new()),
        PublisherKind::Sidekiq => Box::new(SidekiqPublisher::new()),
        #[cfg(feature = "nats")]
        PublisherKind::NatsStreaming => Box::new(crate::publisher::StanPublisher::new()),
        #[cfg(feature = "pubnub")]
        PublisherKind::Pubnub => Box::new(crate::publisher::PubnubPublisher::new()),
        #[cfg(feature = "nano")]
        PublisherKind::NanoRequest => Box::new(crate::publisher::NanoRequest::new()),
        PublisherKind::Failover {
            primary,
            backup,
            stamp_ids,
        } => {
            let publisher = FailoverPublisher::new(
                new_publisher(primary),
                backup.as_deref().map(new_publisher),
            );
            if *stamp_ids {
                Box::new(publisher.with_stamped_ids())
            } else {
                Box::new(publisher)
            }
        }
    }
}
