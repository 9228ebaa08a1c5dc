//! In-memory transports for unit tests.
//!
//! Every fake keeps the sending half of its delivery channel behind a mutex;
//! `close` drops it, which ends the delivery stream exactly like a real
//! transport shutting down.

use super::*;
use crate::envelope::PlainMessage;
use crate::error::CourierError;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;

type DeliverySender = mpsc::UnboundedSender<Result<Box<dyn RawMessage>>>;

fn deliveries() -> (DeliverySender, Deliveries) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx).boxed())
}

/// Raw message recording its acknowledgements.
pub struct FakeDelivery {
    body: Vec<u8>,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    acks: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeDelivery {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            reply_to: None,
            correlation_id: None,
            acks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_acks(mut self, acks: Arc<Mutex<Vec<&'static str>>>) -> Self {
        self.acks = acks;
        self
    }

    pub fn acks(&self) -> Arc<Mutex<Vec<&'static str>>> {
        self.acks.clone()
    }
}

#[async_trait]
impl RawMessage for FakeDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    async fn ack(&self, _multiple: bool) -> Result<()> {
        self.acks.lock().unwrap().push("ack");
        Ok(())
    }

    async fn nack(&self, _multiple: bool, requeue: bool) -> Result<()> {
        self.acks
            .lock()
            .unwrap()
            .push(if requeue { "nack-requeue" } else { "nack" });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PublishedReply {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: ReplyProperties,
}

#[derive(Default)]
pub struct FakeChannel {
    calls: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedReply>>,
    sender: Mutex<Option<DeliverySender>>,
    fail_step: Mutex<Option<&'static str>>,
    acks: Arc<Mutex<Vec<&'static str>>>,
    args: Mutex<Vec<(String, FieldArgs)>>,
}

impl FakeChannel {
    /// Make the named setup step fail.
    pub fn failing_at(step: &'static str) -> Self {
        let channel = Self::default();
        *channel.fail_step.lock().unwrap() = Some(step);
        channel
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<PublishedReply> {
        self.published.lock().unwrap().clone()
    }

    /// Arguments passed to each declare/bind/consume step, in call order.
    pub fn args(&self) -> Vec<(String, FieldArgs)> {
        self.args.lock().unwrap().clone()
    }

    fn record_args(&self, step: &str, args: &FieldArgs) {
        self.args.lock().unwrap().push((step.to_string(), args.clone()));
    }

    /// Acknowledgements of every delivery pushed through this channel.
    pub fn acks(&self) -> Vec<&'static str> {
        self.acks.lock().unwrap().clone()
    }

    pub fn push(&self, delivery: FakeDelivery) {
        let delivery = delivery.with_acks(self.acks.clone());
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(Box::new(delivery)));
        }
    }

    fn record(&self, step: &'static str, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if *self.fail_step.lock().unwrap() == Some(step) {
            return Err(CourierError::setup(format!("{} failed", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl RawChannel for FakeChannel {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()> {
        self.record_args("exchange_declare", &spec.args);
        self.record(
            "exchange_declare",
            format!("exchange_declare:{}:{}", spec.name, spec.kind),
        )
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<String> {
        self.record_args("queue_declare", &spec.args);
        self.record("queue_declare", format!("queue_declare:{}", spec.name))?;
        Ok(spec.name.clone())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        _no_wait: bool,
        args: &FieldArgs,
    ) -> Result<()> {
        self.record_args("queue_bind", args);
        self.record(
            "queue_bind",
            format!("queue_bind:{}:{}:{}", queue, routing_key, exchange),
        )
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.record("qos", format!("qos:{}", prefetch_count))
    }

    async fn consume(&self, spec: &ConsumeSpec) -> Result<Deliveries> {
        self.record_args("consume", &spec.args);
        self.record("consume", format!("consume:{}:{}", spec.queue, spec.tag))?;
        let (tx, stream) = deliveries();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(stream)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &ReplyProperties,
    ) -> Result<()> {
        self.published.lock().unwrap().push(PublishedReply {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.sender.lock().unwrap().take();
        self.record("close", "close".to_string())
    }
}

#[derive(Default)]
pub struct FakeConnection {
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    sender: Mutex<Option<DeliverySender>>,
    fail_publish: AtomicBool,
    closed: AtomicBool,
}

impl FakeConnection {
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn fail_publish(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self, body: &str, reply_to: Option<&str>) {
        let mut message = PlainMessage::new(body);
        message.reply_to = reply_to.map(str::to_string);
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(Box::new(message)));
        }
    }
}

#[async_trait]
impl RawConnection for FakeConnection {
    async fn subscribe(&self, subject: &str) -> Result<Deliveries> {
        self.subscriptions.lock().unwrap().push(subject.to_string());
        let (tx, stream) = deliveries();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(stream)
    }

    async fn publish(&self, subject: &str, body: &[u8]) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(CourierError::publish("connection refused"));
        }
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStreamConnection {
    subscriptions: Mutex<Vec<(String, String)>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    sender: Mutex<Option<DeliverySender>>,
    acks: Arc<Mutex<Vec<&'static str>>>,
    closed: AtomicBool,
}

impl FakeStreamConnection {
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<&'static str> {
        self.acks.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self, body: &str) {
        let delivery = FakeDelivery::new(body).with_acks(self.acks.clone());
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(Box::new(delivery)));
        }
    }
}

#[async_trait]
impl StreamConnection for FakeStreamConnection {
    async fn durable_subscribe(&self, subject: &str, durable_name: &str) -> Result<Deliveries> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((subject.to_string(), durable_name.to_string()));
        let (tx, stream) = deliveries();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(stream)
    }

    async fn publish(&self, subject: &str, body: &[u8], _ack_wait: Duration) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRedisClient {
    scripts: Mutex<Vec<String>>,
    evals: Mutex<Vec<(String, Vec<String>, Vec<String>)>>,
    zadds: Mutex<Vec<(String, f64, String)>>,
    history: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<String>>,
    sender: Mutex<Option<mpsc::UnboundedSender<PubSubMessage>>>,
    fail_eval: AtomicBool,
    closed: AtomicBool,
}

impl FakeRedisClient {
    pub fn with_history(history: Vec<String>) -> Self {
        let client = Self::default();
        *client.history.lock().unwrap() = history;
        client
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn evals(&self) -> Vec<(String, Vec<String>, Vec<String>)> {
        self.evals.lock().unwrap().clone()
    }

    pub fn zadds(&self) -> Vec<(String, f64, String)> {
        self.zadds.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn fail_eval(&self) {
        self.fail_eval.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self, channel: &str, payload: &str) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(PubSubMessage {
                channel: channel.to_string(),
                pattern: None,
                payload: payload.to_string(),
            });
        }
    }
}

#[async_trait]
impl RawClient for FakeRedisClient {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, PubSubMessage>> {
        self.subscriptions.lock().unwrap().push(channel.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn script_load(&self, script: &str) -> Result<String> {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.push(script.to_string());
        Ok(format!("sha-{}", scripts.len()))
    }

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<Vec<String>> {
        if self.fail_eval.load(Ordering::SeqCst) {
            return Err(CourierError::publish("NOSCRIPT"));
        }
        self.evals
            .lock()
            .unwrap()
            .push((sha.to_string(), keys.to_vec(), args.to_vec()));
        Ok(self.history.lock().unwrap().clone())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.zadds
            .lock()
            .unwrap()
            .push((key.to_string(), score, member.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePubnubClient {
    sender: Mutex<Option<mpsc::Sender<PubnubEvent>>>,
    pages: Mutex<VecDeque<Vec<PubnubPayload>>>,
    history_starts: Mutex<Vec<i64>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscribe_count: AtomicUsize,
}

impl FakePubnubClient {
    pub fn with_pages(pages: Vec<Vec<PubnubPayload>>) -> Self {
        let client = Self::default();
        *client.pages.lock().unwrap() = pages.into();
        client
    }

    pub fn history_starts(&self) -> Vec<i64> {
        self.history_starts.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    pub async fn emit(&self, event: PubnubEvent) {
        let tx = self.sender.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl RawPubnubClient for FakePubnubClient {
    async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<PubnubEvent>> {
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn history(&self, _channel: &str, start: i64, _count: usize) -> Result<Vec<PubnubPayload>> {
        self.history_starts.lock().unwrap().push(start);
        Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn publish(&self, channel: &str, body: &[u8]) -> Result<i64> {
        let mut published = self.published.lock().unwrap();
        published.push((channel.to_string(), body.to_vec()));
        Ok(published.len() as i64)
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

/// Hands out one shared handle and records every target it was asked for.
pub struct FakeConnector<H: ?Sized> {
    handle: Arc<H>,
    targets: Mutex<Vec<String>>,
    fail: bool,
}

impl<H: ?Sized> FakeConnector<H> {
    pub fn new(handle: Arc<H>) -> Self {
        Self {
            handle,
            targets: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing(handle: Arc<H>) -> Self {
        Self {
            fail: true,
            ..Self::new(handle)
        }
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl<T, H> Connector<T, H> for FakeConnector<H>
where
    T: std::fmt::Debug + ?Sized + Sync,
    H: ?Sized + Send + Sync,
{
    async fn connect(&self, target: &T) -> Result<Arc<H>> {
        self.targets.lock().unwrap().push(format!("{:?}", target));
        if self.fail {
            return Err(CourierError::connect("Server not found"));
        }
        Ok(self.handle.clone())
    }
}

/// Streaming connector that keeps the disconnect handler so tests can fire it.
pub struct FakeStreamConnector {
    handle: Arc<FakeStreamConnection>,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
    targets: Mutex<Vec<StreamTarget>>,
}

impl FakeStreamConnector {
    pub fn new(handle: Arc<FakeStreamConnection>) -> Self {
        Self {
            handle,
            on_disconnect: Mutex::new(None),
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn targets(&self) -> Vec<StreamTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub fn disconnect(&self, reason: &str) {
        let handler = self.on_disconnect.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(reason.to_string());
        }
    }
}

#[async_trait]
impl Connector<StreamTarget, dyn StreamConnection> for FakeStreamConnector {
    async fn connect(&self, target: &StreamTarget) -> Result<Arc<dyn StreamConnection>> {
        *self.on_disconnect.lock().unwrap() = Some(target.on_disconnect.clone());
        self.targets.lock().unwrap().push(target.clone());
        Ok(self.handle.clone())
    }
}
