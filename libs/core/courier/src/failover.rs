//! Primary/backup composites.
//!
//! ```text
//!            ┌──────────────┐  signal  ┌───────┐
//!   config ─▶│ primary      │────────▶ │ relay │──┐
//!            └──────────────┘          └───────┘  │   mpsc(2)
//!            ┌──────────────┐  signal  ┌───────┐  ├──────────▶ TerminalSignal
//!   config ─▶│ backup       │────────▶ │ relay │──┘
//!            └──────────────┘          └───────┘
//! ```
//!
//! Both children share one handler and may deliver the same logical event,
//! so a failover subscriber should always run with deduplication enabled.

use crate::client::{MessageHandler, Publisher, Subscriber, TerminalSignal};
use crate::config::ConfigSet;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// One slot per child.
const COMPOSITE_SIGNAL_CAPACITY: usize = 2;

pub struct FailoverSubscriber {
    primary: Box<dyn Subscriber>,
    backup: Box<dyn Subscriber>,
    backup_configured: bool,
}

impl FailoverSubscriber {
    pub fn new(primary: Box<dyn Subscriber>, backup: Box<dyn Subscriber>) -> Self {
        Self {
            primary,
            backup,
            backup_configured: false,
        }
    }
}

/// Forward a child's first terminal error into the composite channel.
fn relay(
    role: &'static str,
    mut signal: TerminalSignal,
    tx: Arc<Mutex<mpsc::Sender<CourierError>>>,
) {
    tokio::spawn(async move {
        let Some(err) = signal.recv().await else {
            debug!(role, "Child signal closed without error");
            return;
        };
        warn!(role, error = %err, "Failover child terminated");
        let tx = tx.lock().await;
        let _ = tx.send(err).await;
    });
}

#[async_trait]
impl Subscriber for FailoverSubscriber {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        self.primary
            .configure(&ConfigSet::single(config.primary().clone()))
            .await?;
        if let Some(secondary) = config.secondary() {
            self.backup
                .configure(&ConfigSet::single(secondary.clone()))
                .await?;
            self.backup_configured = true;
        }
        Ok(())
    }

    fn on_message(&mut self, handler: Arc<dyn MessageHandler>) -> &mut dyn Subscriber {
        self.primary.on_message(handler.clone());
        self.backup.on_message(handler);
        self
    }

    async fn start(&mut self) -> Result<TerminalSignal> {
        let (tx, rx) = mpsc::channel(COMPOSITE_SIGNAL_CAPACITY);
        let tx = Arc::new(Mutex::new(tx));

        relay("primary", self.primary.start().await?, tx.clone());
        if self.backup_configured {
            match self.backup.start().await {
                Ok(signal) => relay("backup", signal, tx),
                Err(e) => {
                    warn!(error = %e, "Backup failed to start, closing primary");
                    self.primary.close().await;
                    return Err(e);
                }
            }
        }

        info!(backup = self.backup_configured, "Failover subscriber started");
        Ok(TerminalSignal::new(rx))
    }

    async fn close(&mut self) {
        self.primary.close().await;
        self.backup.close().await;
    }
}

pub struct FailoverPublisher {
    primary: Box<dyn Publisher>,
    backup: Option<Box<dyn Publisher>>,
    stamp_ids: bool,
}

impl FailoverPublisher {
    pub fn new(primary: Box<dyn Publisher>, backup: Option<Box<dyn Publisher>>) -> Self {
        Self {
            primary,
            backup,
            stamp_ids: false,
        }
    }

    /// Prefix every body with a fresh `uuid|` so subscribers can drop the
    /// second copy of a dual write.
    pub fn with_stamped_ids(mut self) -> Self {
        self.stamp_ids = true;
        self
    }

    fn stamp(&self, body: &[u8]) -> Vec<u8> {
        if !self.stamp_ids {
            return body.to_vec();
        }
        let mut stamped = format!("{}|", uuid::Uuid::new_v4()).into_bytes();
        stamped.extend_from_slice(body);
        stamped
    }
}

#[async_trait]
impl Publisher for FailoverPublisher {
    async fn connect(&mut self, config: &ConfigSet) -> Result<()> {
        self.primary
            .connect(&ConfigSet::single(config.primary().clone()))
            .await?;
        match (self.backup.as_mut(), config.secondary()) {
            (Some(backup), Some(secondary)) => {
                backup.connect(&ConfigSet::single(secondary.clone())).await?
            }
            (Some(_), None) => {
                warn!("No backup configuration, publishing to primary only");
                self.backup = None;
            }
            _ => {}
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()> {
        let body = self.stamp(body);
        self.primary.publish(subject, &body).await?;
        if let Some(backup) = &self.backup {
            backup.publish(subject, &body).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.primary.close().await?;
        if let Some(backup) = self.backup.as_mut() {
            backup.close().await?;
        }
        Ok(())
    }
}
