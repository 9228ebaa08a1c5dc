//! The client contract shared by every adapter.
//!
//! ```text
//!  configure(config) ──▶ start() ──▶ TerminalSignal
//!        │                  │              │
//!   validate + dial    receive task    fires once when
//!                      invokes the     the adapter dies
//!                      MessageHandler
//! ```
//!
//! There is no automatic restart: once the terminal signal fires, the caller
//! closes the adapter and builds a new one.

use crate::config::ConfigSet;
use crate::envelope::Envelope;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

/// Callback invoked for every delivered message.
///
/// Handlers acknowledge through [`Envelope::send_ack`]; for transports
/// without a wire-level ack this is what advances the replay watermark.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &mut Envelope);
}

/// Receiving side of a subscriber or reply server.
#[async_trait]
pub trait Subscriber: Send {
    /// Validate configuration and perform protocol setup.
    async fn configure(&mut self, config: &ConfigSet) -> Result<()>;

    /// Register the message handler.
    fn on_message(&mut self, handler: Arc<dyn MessageHandler>) -> &mut dyn Subscriber;

    /// Begin consuming; returns the terminal-error signal.
    async fn start(&mut self) -> Result<TerminalSignal>;

    /// Release the transport. Safe on an adapter that never connected.
    async fn close(&mut self);
}

/// Sending side.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn connect(&mut self, config: &ConfigSet) -> Result<()>;

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Asynchronous failure channel of a started adapter.
#[derive(Debug)]
pub struct TerminalSignal {
    rx: mpsc::Receiver<CourierError>,
}

impl TerminalSignal {
    pub fn new(rx: mpsc::Receiver<CourierError>) -> Self {
        Self { rx }
    }

    /// Wait for the next terminal error. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<CourierError> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CourierError> {
        self.rx.try_recv().ok()
    }
}

/// Sending half of a [`TerminalSignal`]; fires at most once however many
/// tasks hold a clone.
#[derive(Clone, Debug)]
pub struct TerminalSender {
    tx: mpsc::Sender<CourierError>,
    fired: Arc<AtomicBool>,
}

impl TerminalSender {
    /// Report the terminal error. Later calls are ignored.
    pub fn fire(&self, err: CourierError) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        error!(error = %err, category = %err.category(), "Adapter terminated");
        crate::metrics::terminal_error(&err);
        // Capacity one and a single send, so this cannot be full.
        self.tx.try_send(err).is_ok()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// A fresh single-shot terminal channel.
pub fn terminal_channel() -> (TerminalSender, TerminalSignal) {
    let (tx, rx) = mpsc::channel(1);
    (
        TerminalSender {
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        },
        TerminalSignal::new(rx),
    )
}

/// Handler that forwards every envelope body into a channel and acks it.
/// Useful for tests and simple bridges.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    ack: bool,
}

impl ChannelHandler {
    pub fn new(ack: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, ack }), rx)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, envelope: &mut Envelope) {
        let _ = self.tx.send(envelope.get_message().to_vec());
        if self.ack {
            if let Err(e) = envelope.send_ack(None).await {
                error!(error = %e, "Failed to acknowledge message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminal_sender_fires_once() {
        let (tx, mut signal) = terminal_channel();
        let other = tx.clone();

        assert!(tx.fire(CourierError::Disconnected("first".into())));
        assert!(!other.fire(CourierError::Disconnected("second".into())));
        assert!(other.has_fired());

        let err = signal.recv().await.unwrap();
        assert_eq!(err.to_string(), "first");
        drop(tx);
        drop(other);
        assert!(signal.recv().await.is_none());
    }
}
