//! Canonical message envelope.
//!
//! An [`Envelope`] is built fresh for every inbound message and dropped once
//! the handler returns. It pairs the transport's raw message with the handle
//! needed to answer it ([`Responder`]) and a string property bag.
//!
//! Acknowledgement differs per transport:
//!
//! | Responder    | `send_ack`                                              | `send_nack`          |
//! |--------------|---------------------------------------------------------|----------------------|
//! | `Channel`    | reply to `reply_to` when `protocol_type=reqrep`, ack    | nack, requeue        |
//! | `Socket`     | send `OK` (or the given bytes) on the socket            | send `ERR`           |
//! | `Connection` | publish `OK` to the reply subject                       | publish `NOK`        |
//! | `Stream`     | durable ack                                             | nothing (redelivery) |
//! | `Property`   | set property `ack=OK`                                   | set `ack=NOK`        |

use crate::error::Result;
use crate::transport::{RawChannel, RawConnection, RawSocket, ReplyProperties};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Property naming the delivery mode of AMQP messages.
pub const PROTOCOL_TYPE: &str = "protocol_type";
/// Property set by `send_ack`/`send_nack` on property-acked transports.
pub const ACK: &str = "ack";

pub const SUBSCRIBE_MODE: &str = "subscribe";
pub const REQREP_MODE: &str = "reqrep";

const OK: &[u8] = b"OK";

/// Transport-specific inbound message.
#[async_trait]
pub trait RawMessage: Send + Sync {
    fn body(&self) -> &[u8];

    fn set_body(&mut self, body: Vec<u8>);

    fn reply_to(&self) -> Option<&str> {
        None
    }

    fn correlation_id(&self) -> Option<&str> {
        None
    }

    /// Ordering token (PubNub time-token, Redis publish timestamp); zero when absent.
    fn time_token(&self) -> i64 {
        0
    }

    async fn ack(&self, _multiple: bool) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _multiple: bool, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// A raw message that is nothing but bytes and an optional ordering token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainMessage {
    pub body: Vec<u8>,
    pub reply_to: Option<String>,
    pub time_token: i64,
}

impl PlainMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_time_token(mut self, time_token: i64) -> Self {
        self.time_token = time_token;
        self
    }
}

#[async_trait]
impl RawMessage for PlainMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    fn time_token(&self) -> i64 {
        self.time_token
    }
}

/// Handle an envelope answers through.
#[derive(Clone)]
pub enum Responder {
    /// AMQP channel; replies go to the default exchange.
    Channel(Arc<dyn RawChannel>),
    /// nanomsg REP socket.
    Socket(Arc<dyn RawSocket>),
    /// NATS connection; replies go to the reply subject.
    Connection(Arc<dyn RawConnection>),
    /// Durable stream; acknowledgement lives on the raw message.
    Stream,
    /// No transport ack; recorded as the `ack` property.
    Property,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Responder::Channel(_) => "Channel",
            Responder::Socket(_) => "Socket",
            Responder::Connection(_) => "Connection",
            Responder::Stream => "Stream",
            Responder::Property => "Property",
        };
        f.write_str(name)
    }
}

pub struct Envelope {
    raw: Box<dyn RawMessage>,
    responder: Responder,
    properties: HashMap<String, String>,
}

impl Envelope {
    pub fn new(raw: Box<dyn RawMessage>, responder: Responder) -> Self {
        Self {
            raw,
            responder,
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get_message(&self) -> &[u8] {
        self.raw.body()
    }

    /// Replace the body, returning the updated envelope.
    pub fn set_message(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.raw.set_body(body.into());
        self
    }

    pub fn get_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn raw(&self) -> &dyn RawMessage {
        self.raw.as_ref()
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Whether the handler signalled successful handling through the `ack` property.
    pub fn is_acked(&self) -> bool {
        self.get_property(ACK) == Some("OK")
    }

    /// Acknowledge, optionally answering with `reply` instead of the default.
    pub async fn send_ack(&mut self, reply: Option<&[u8]>) -> Result<()> {
        match &self.responder {
            Responder::Channel(channel) => {
                if self.get_property(PROTOCOL_TYPE) == Some(REQREP_MODE) {
                    let properties = ReplyProperties {
                        correlation_id: self.raw.correlation_id().map(str::to_string),
                        content_type: "text/plain".to_string(),
                    };
                    let reply_to = self.raw.reply_to().unwrap_or_default();
                    channel
                        .publish("", reply_to, reply.unwrap_or(OK), &properties)
                        .await?;
                }
                self.raw.ack(false).await
            }
            Responder::Socket(socket) => socket.send(reply.unwrap_or(OK)).await,
            Responder::Connection(connection) => match self.raw.reply_to() {
                Some(subject) => connection.publish(subject, reply.unwrap_or(OK)).await,
                None => Ok(()),
            },
            Responder::Stream => self.raw.ack(false).await,
            Responder::Property => {
                self.set_property(ACK, "OK");
                Ok(())
            }
        }
    }

    /// Negative acknowledgement, optionally answering with `reply`.
    pub async fn send_nack(&mut self, reply: Option<&[u8]>) -> Result<()> {
        match &self.responder {
            Responder::Channel(_) => self.raw.nack(false, true).await,
            Responder::Socket(socket) => socket.send(reply.unwrap_or(b"ERR")).await,
            Responder::Connection(connection) => match self.raw.reply_to() {
                Some(subject) => connection.publish(subject, reply.unwrap_or(b"NOK")).await,
                None => Ok(()),
            },
            Responder::Stream => Ok(()),
            Responder::Property => {
                self.set_property(ACK, "NOK");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("body", &String::from_utf8_lossy(self.raw.body()))
            .field("responder", &self.responder)
            .field("properties", &self.properties)
            .finish()
    }
}
