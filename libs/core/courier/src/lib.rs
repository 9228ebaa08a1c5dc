//! One publish/subscribe contract over heterogeneous transports.
//!
//! Every transport is driven through the same client contract:
//! - **Subscribers**: `configure → on_message → start → (terminal) → close`
//! - **Reply servers**: the subscriber contract, answering through the envelope
//! - **Publishers**: `connect → publish → close`
//!
//! On top of the raw transports sit the resiliency pieces: a shared
//! [`DedupFilter`], a [`PersistenceCursor`] driving catch-up replay for Redis
//! and PubNub, and primary/backup [failover](failover) composites.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────────────────────────────────────────┐
//! │  Your Code   │    │                  courier                       │
//! │              │    │                                                │
//! │ MessageHandler◀───│── Envelope ◀── Delivery ◀── dedup ◀── adapter ─│─▶ lapin / async-nats
//! │              │    │                    ▲                 ▲         │   redis / reqwest / nng
//! │  Publisher ──│────│─▶ failover ──▶ adapter               │         │
//! │              │    │                          cursor + replay        │
//! └──────────────┘    └────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use courier::{new_subscriber, ChannelHandler, ConfigSet, DedupFilter, SubscriberKind};
//!
//! let kind: SubscriberKind = "nats".parse()?;
//! let mut subscriber = new_subscriber(&kind, DedupFilter::from_env().await);
//! subscriber.configure(&ConfigSet::from_json(json!({
//!     "name": "agent-1",
//!     "topic": "events.agent",
//!     "endpoint": "localhost:4222",
//! }))?).await?;
//!
//! let (handler, mut rx) = ChannelHandler::new(true);
//! subscriber.on_message(handler);
//! let mut terminal = subscriber.start().await?;
//!
//! tokio::select! {
//!     Some(body) = rx.recv() => println!("{}", String::from_utf8_lossy(&body)),
//!     Some(err) = terminal.recv() => subscriber.close().await,
//! }
//! ```

pub mod client;
pub mod config;
pub mod cursor;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod failover;
pub mod metrics;
pub mod publisher;
pub mod replay;
pub mod reply;
pub mod subscriber;
pub mod transport;
pub mod wire;

pub use client::{
    terminal_channel, ChannelHandler, MessageHandler, Publisher, Subscriber, TerminalSender,
    TerminalSignal,
};
pub use config::{ConfigMap, ConfigSet, ProtocolConfig};
pub use cursor::PersistenceCursor;
pub use dedup::{DedupFilter, DedupStore, MemoryDedupStore, RedisDedupStore};
pub use envelope::{Envelope, PlainMessage, RawMessage, Responder};
pub use error::{ConfigError, CourierError, ErrorCategory, Result};
pub use factory::{new_publisher, new_subscriber, PublisherKind, SubscriberKind};
pub use failover::{FailoverPublisher, FailoverSubscriber};
pub use metrics::{init_metrics, AdapterMetrics};
