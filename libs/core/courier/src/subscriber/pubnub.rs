use super::{require_handler, Delivery, PROCESSING_QUEUE_CAPACITY};
use crate::client::{terminal_channel, MessageHandler, Subscriber, TerminalSender, TerminalSignal};
use crate::config::{de, ConfigSet, ProtocolConfig};
use crate::cursor::PersistenceCursor;
use crate::dedup::DedupFilter;
use crate::envelope::{Envelope, PlainMessage, Responder};
use crate::error::{ConfigError, CourierError, Result};
use crate::metrics::AdapterMetrics;
use crate::replay::{drain_history, HistorySource, HISTORY_PAGE_SIZE};
use crate::transport::{
    Connector, PubnubEvent, PubnubKeys, PubnubPayload, RawPubnubClient, StatusCategory,
};
use crate::wire::STANDARD_FIELDS;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Property naming the channel a PubNub message arrived on.
pub const CHANNEL_PROPERTY: &str = "channel";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PubnubSubConfig {
    pub name: String,
    pub topic: String,
    pub secret_key: String,
    pub subscribe_key: String,
    pub publish_key: String,
    #[serde(deserialize_with = "de::boolean")]
    pub persistence: bool,
}

impl ProtocolConfig for PubnubSubConfig {
    const KEYS: &'static [&'static str] = &[
        "name",
        "topic",
        "secret_key",
        "subscribe_key",
        "publish_key",
        "persistence",
    ];
    const MANDATORY: &'static [&'static str] = &[
        "name",
        "topic",
        "subscribe_key",
        "publish_key",
        "persistence",
    ];

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.subscribe_key.is_empty() {
            return Err(ConfigError::Invalid("subscribe_key must not be empty".into()));
        }
        if self.topic.is_empty() {
            return Err(ConfigError::Invalid("topic must not be empty".into()));
        }
        Ok(())
    }
}

impl PubnubSubConfig {
    pub fn keys(&self) -> PubnubKeys {
        PubnubKeys {
            subscribe_key: self.subscribe_key.clone(),
            publish_key: self.publish_key.clone(),
            secret_key: self.secret_key.clone(),
        }
    }
}

/// History of one channel, read forward by time-token.
struct ChannelHistory {
    client: Arc<dyn RawPubnubClient>,
    channel: String,
}

#[async_trait]
impl HistorySource for ChannelHistory {
    type Item = PubnubPayload;

    async fn fetch_page(&self, start: i64, count: usize) -> Result<Vec<PubnubPayload>> {
        self.client.history(&self.channel, start, count).await
    }

    fn position(&self, item: &PubnubPayload) -> i64 {
        item.time_token
    }
}

/// How one subscription round ended.
enum Round {
    /// `Unknown` status: resubscribe and replay again.
    Restart,
    /// Listener gone or a terminal status.
    Exit,
}

/// PubNub subscriber with time-token replay.
///
/// The receive task owns the PubNub subscription and feeds the processing
/// queue; the process task owns dedup, the callback and the watermark.
pub struct PubnubSubscriber {
    connector: Arc<dyn Connector<PubnubKeys, dyn RawPubnubClient>>,
    dedup: DedupFilter,
    state_dir: Option<PathBuf>,
    config: Option<PubnubSubConfig>,
    client: Option<Arc<dyn RawPubnubClient>>,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl PubnubSubscriber {
    pub fn new(dedup: DedupFilter) -> Self {
        Self::with_connector(Arc::new(crate::transport::pubnub::PubnubConnector::default()), dedup)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector<PubnubKeys, dyn RawPubnubClient>>,
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

/// Replay history after `watermark` into the queue. Returns `false` once the
/// process task is gone.
async fn replay(
    client: &Arc<dyn RawPubnubClient>,
    channel: &str,
    watermark: i64,
    queue: &mpsc::Sender<PubnubPayload>,
    metrics: &AdapterMetrics,
) -> bool {
    let history = ChannelHistory {
        client: client.clone(),
        channel: channel.to_string(),
    };
    let result = drain_history(&history, watermark, HISTORY_PAGE_SIZE, |payload| {
        let queue = queue.clone();
        async move { queue.send(payload).await.is_ok() }
    })
    .await;
    match result {
        Ok(count) => {
            info!(channel = %channel, watermark, count, "Replayed missed messages");
            metrics.replayed(count);
        }
        // Live delivery goes on without the backlog.
        Err(e) => warn!(channel = %channel, error = %e, "History replay failed"),
    }
    !queue.is_closed()
}

/// Forward messages of one subscription until it ends or asks for a restart.
async fn forward(
    events: &mut mpsc::Receiver<PubnubEvent>,
    queue: &mpsc::Sender<PubnubPayload>,
    channel: &str,
) -> Round {
    let mut connected = false;
    while let Some(event) = events.recv().await {
        match event {
            PubnubEvent::Status(StatusCategory::Connected) => {
                info!(channel = %channel, "PubNub connected");
                connected = true;
            }
            PubnubEvent::Status(StatusCategory::Reconnected) => {
                debug!(channel = %channel, "PubNub reconnected");
            }
            PubnubEvent::Status(StatusCategory::Unknown) => {
                warn!(channel = %channel, "Unknown PubNub status, resubscribing");
                return Round::Restart;
            }
            PubnubEvent::Status(category) => {
                warn!(channel = %channel, ?category, "PubNub listener stopped");
                return Round::Exit;
            }
            PubnubEvent::Message(payload) => {
                if !connected {
                    debug!(channel = %channel, "Message before connect, dropped");
                    continue;
                }
                if queue.send(payload).await.is_err() {
                    return Round::Exit;
                }
            }
        }
    }
    Round::Exit
}

async fn receive(
    client: Arc<dyn RawPubnubClient>,
    config: PubnubSubConfig,
    cursor: PersistenceCursor,
    queue: mpsc::Sender<PubnubPayload>,
    metrics: AdapterMetrics,
    terminal: TerminalSender,
) {
    loop {
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

        let mut events = match client.subscribe(&config.topic).await {
            Ok(events) => events,
            Err(e) => {
                terminal.fire(e);
                return;
            }
        };

        if let Some(watermark) = watermark {
            if !replay(&client, &config.topic, watermark, &queue, &metrics).await {
                break;
            }
        }

        match forward(&mut events, &queue, &config.topic).await {
            Round::Restart => {
                if let Err(e) = client.unsubscribe_all().await {
                    warn!(error = %e, "Unsubscribe before resubscribe failed");
                }
            }
            Round::Exit => break,
        }
    }
    terminal.fire(CourierError::Disconnected(
        "Subscriber listener closed. Exiting".to_string(),
    ));
}

#[async_trait]
impl Subscriber for PubnubSubscriber {
    async fn configure(&mut self, config: &ConfigSet) -> Result<()> {
        let config = PubnubSubConfig::from_map(config.primary())?;
        self.close().await;

        let client = self.connector.connect(&config.keys()).await?;
        info!(name = %config.name, topic = %config.topic, "PubNub subscriber configured");
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
            return Err(CourierError::NotConfigured("pubnub subscriber"));
        };
        let handler = require_handler(&self.handler)?;

        let metrics = AdapterMetrics::new("pubnub", &config.topic);
        let delivery = Delivery::new(self.dedup.clone(), metrics.clone(), handler);
        let (queue, mut pending) = mpsc::channel::<PubnubPayload>(PROCESSING_QUEUE_CAPACITY);
        let (terminal, signal) = terminal_channel();
        let persistence = config.persistence;
        let topic = config.topic.clone();

        tokio::spawn(receive(
            client,
            config,
            self.cursor(&topic),
            queue,
            metrics,
            terminal,
        ));

        let cursor = self.cursor(&topic);
        tokio::spawn(async move {
            while let Some(payload) = pending.recv().await {
                let watermark = payload.time_token;
                let raw = Box::new(PlainMessage::new(payload.body).with_time_token(watermark));
                let Some(raw) = delivery.admit(raw, STANDARD_FIELDS).await else {
                    continue;
                };
                let envelope = Envelope::new(raw, Responder::Property)
                    .with_property(CHANNEL_PROPERTY, payload.channel);
                let envelope = delivery.dispatch(envelope).await;
                if persistence && envelope.is_acked() {
                    if let Err(e) = cursor.store(watermark).await {
                        warn!(path = %cursor.path().display(), error = %e, "Failed to persist watermark");
                    }
                }
            }
            debug!("PubNub processing queue drained");
        });

        info!(topic = %topic, persistence, "PubNub subscriber started");
        Ok(signal)
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.unsubscribe_all().await {
                warn!(error = %e, "Failed to unsubscribe from PubNub");
            }
        }
    }
}
