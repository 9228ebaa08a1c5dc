//! Request/reply servers.
//!
//! Same contract as subscribers, without deduplication: every request is
//! handed to the handler, which answers through [`Envelope::send_ack`] or
//! [`Envelope::send_nack`].
//!
//! [`Envelope::send_ack`]: crate::envelope::Envelope::send_ack
//! [`Envelope::send_nack`]: crate::envelope::Envelope::send_nack

mod amqp;
mod nano;
#[cfg(feature = "nats")]
mod nats;

pub use amqp::{AmqpReply, AmqpReplyConfig};
pub use nano::{NanoReply, NanoReplyConfig};
#[cfg(feature = "nats")]
pub use nats::{NatsReply, NatsReplyConfig};
