//! PubNub REST binding over `reqwest`.
//!
//! Subscriptions are long-polls against `/v2/subscribe`, one task per
//! channel. The first successful poll reports `Connected`; a failed poll
//! reports its status category and ends the subscription.

use super::{Connector, PubnubEvent, PubnubKeys, PubnubPayload, RawPubnubClient, StatusCategory};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_ORIGIN: &str = "https://ps.pndsn.com";

/// Server holds a subscribe poll for up to 280s.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(310);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
struct TimeCursor {
    t: String,
    #[serde(default)]
    r: i64,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    c: String,
    d: Value,
    p: Option<TimeCursor>,
}

#[derive(Debug, Deserialize)]
struct SubscribeResponse {
    t: TimeCursor,
    #[serde(default)]
    m: Vec<WireMessage>,
}

/// Payload bytes: strings travel as their content, anything else as JSON text.
fn body_bytes(value: Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

fn parse_time_token(raw: &str) -> i64 {
    raw.parse().unwrap_or_default()
}

fn parse_subscribe(body: &str) -> Result<(TimeCursor, Vec<PubnubPayload>)> {
    let response: SubscribeResponse = serde_json::from_str(body)?;
    let fallback = parse_time_token(&response.t.t);
    let payloads = response
        .m
        .into_iter()
        .map(|message| PubnubPayload {
            time_token: message
                .p
                .as_ref()
                .map(|p| parse_time_token(&p.t))
                .unwrap_or(fallback),
            channel: message.c,
            body: body_bytes(message.d),
        })
        .collect();
    Ok((response.t, payloads))
}

/// `[[{"message": .., "timetoken": ..}, ..], start, end]`
fn parse_history(body: &str, channel: &str) -> Result<Vec<PubnubPayload>> {
    let value: Value = serde_json::from_str(body)?;
    let Some(entries) = value.get(0).and_then(Value::as_array) else {
        return Err(CourierError::receive(format!(
            "unexpected history response: {}",
            body
        )));
    };
    Ok(entries
        .iter()
        .map(|entry| {
            let time_token = match entry.get("timetoken") {
                Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
                Some(Value::String(s)) => parse_time_token(s),
                _ => 0,
            };
            PubnubPayload {
                channel: channel.to_string(),
                body: body_bytes(entry.get("message").cloned().unwrap_or(Value::Null)),
                time_token,
            }
        })
        .collect())
}

/// `[1, "Sent", "<timetoken>"]`
fn parse_publish(body: &str) -> Result<i64> {
    let value: Value = serde_json::from_str(body)?;
    match value.get(0).and_then(Value::as_i64) {
        Some(1) => Ok(value
            .get(2)
            .and_then(Value::as_str)
            .map(parse_time_token)
            .unwrap_or_default()),
        _ => Err(CourierError::publish(
            value
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("publish rejected"),
        )),
    }
}

fn status_of(error: &reqwest::Error) -> Option<StatusCategory> {
    if error.is_timeout() {
        None
    } else if error.is_connect() {
        Some(StatusCategory::Disconnected)
    } else {
        Some(StatusCategory::Unknown)
    }
}

#[derive(Clone)]
struct Endpoint {
    http: Client,
    origin: String,
    keys: PubnubKeys,
    uuid: String,
}

impl Endpoint {
    async fn poll(&self, channel: &str, tt: &str, tr: i64) -> std::result::Result<String, PollError> {
        let url = format!(
            "{}/v2/subscribe/{}/{}/0",
            self.origin,
            self.keys.subscribe_key,
            urlencoding::encode(channel)
        );
        let mut request = self
            .http
            .get(&url)
            .query(&[("tt", tt), ("uuid", self.uuid.as_str())])
            .timeout(SUBSCRIBE_TIMEOUT);
        if tr != 0 {
            request = request.query(&[("tr", tr)]);
        }
        let response = request.send().await.map_err(PollError::Request)?;
        match response.status() {
            StatusCode::FORBIDDEN => Err(PollError::Status(StatusCategory::AccessDenied)),
            status if !status.is_success() => {
                warn!(%status, channel, "Subscribe poll rejected");
                Err(PollError::Status(StatusCategory::Unknown))
            }
            _ => response.text().await.map_err(PollError::Request),
        }
    }

    /// Long-poll until the receiver goes away or a poll fails.
    async fn subscribe_loop(self, channel: String, events: mpsc::Sender<PubnubEvent>) {
        let mut tt = "0".to_string();
        let mut tr = 0;
        let mut connected = false;

        loop {
            let body = match self.poll(&channel, &tt, tr).await {
                Ok(body) => body,
                Err(PollError::Request(e)) => match status_of(&e) {
                    None => {
                        debug!(channel = %channel, "Subscribe poll timed out, polling again");
                        continue;
                    }
                    Some(category) => {
                        warn!(channel = %channel, error = %e, "Subscribe poll failed");
                        let _ = events.send(PubnubEvent::Status(category)).await;
                        return;
                    }
                },
                Err(PollError::Status(category)) => {
                    let _ = events.send(PubnubEvent::Status(category)).await;
                    return;
                }
            };

            let (cursor, payloads) = match parse_subscribe(&body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Undecodable subscribe response");
                    let _ = events.send(PubnubEvent::Status(StatusCategory::Unknown)).await;
                    return;
                }
            };

            if !connected {
                connected = true;
                if events
                    .send(PubnubEvent::Status(StatusCategory::Connected))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            for payload in payloads {
                if events.send(PubnubEvent::Message(payload)).await.is_err() {
                    return;
                }
            }
            tt = cursor.t;
            tr = cursor.r;
        }
    }
}

enum PollError {
    Request(reqwest::Error),
    Status(StatusCategory),
}

/// PubNub client bound to one key set.
///
/// Requests are not signed, so `secret_key` is carried but unused.
pub struct PubnubHttpClient {
    endpoint: Endpoint,
    polls: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl RawPubnubClient for PubnubHttpClient {
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubnubEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let poll = tokio::spawn(self.endpoint.clone().subscribe_loop(channel.to_string(), tx));
        if let Ok(mut polls) = self.polls.lock() {
            polls.push(poll);
        }
        debug!(channel, "Subscribe poll started");
        Ok(rx)
    }

    async fn history(&self, channel: &str, start: i64, count: usize) -> Result<Vec<PubnubPayload>> {
        let endpoint = &self.endpoint;
        let url = format!(
            "{}/v2/history/sub-key/{}/channel/{}",
            endpoint.origin,
            endpoint.keys.subscribe_key,
            urlencoding::encode(channel)
        );
        let mut request = endpoint
            .http
            .get(&url)
            .query(&[
                ("count", count.to_string()),
                ("reverse", "true".to_string()),
                ("include_token", "true".to_string()),
            ])
            .timeout(REQUEST_TIMEOUT);
        if start > 0 {
            request = request.query(&[("start", start)]);
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(CourierError::receive)?;
        let body = response.text().await.map_err(CourierError::receive)?;
        parse_history(&body, channel)
    }

    async fn publish(&self, channel: &str, body: &[u8]) -> Result<i64> {
        let endpoint = &self.endpoint;
        let message = serde_json::to_string(&String::from_utf8_lossy(body))?;
        let url = format!(
            "{}/publish/{}/{}/0/{}/0/{}",
            endpoint.origin,
            endpoint.keys.publish_key,
            endpoint.keys.subscribe_key,
            urlencoding::encode(channel),
            urlencoding::encode(&message)
        );
        let response = endpoint
            .http
            .get(&url)
            .query(&[("uuid", endpoint.uuid.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(CourierError::publish)?;
        let body = response.text().await.map_err(CourierError::publish)?;
        parse_publish(&body)
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        if let Ok(mut polls) = self.polls.lock() {
            for poll in polls.drain(..) {
                poll.abort();
            }
        }
        Ok(())
    }
}

/// Builds [`PubnubHttpClient`]s against one origin.
pub struct PubnubConnector {
    http: Client,
    origin: String,
}

impl PubnubConnector {
    pub fn with_origin(origin: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            origin: origin.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for PubnubConnector {
    fn default() -> Self {
        Self::with_origin(DEFAULT_ORIGIN)
    }
}

#[async_trait]
impl Connector<PubnubKeys, dyn RawPubnubClient> for PubnubConnector {
    async fn connect(&self, keys: &PubnubKeys) -> Result<Arc<dyn RawPubnubClient>> {
        if keys.subscribe_key.is_empty() {
            return Err(CourierError::connect("subscribe key is empty"));
        }
        let uuid = Uuid::new_v4().to_string();
        info!(origin = %self.origin, uuid = %uuid, "PubNub client ready");
        Ok(Arc::new(PubnubHttpClient {
            endpoint: Endpoint {
                http: self.http.clone(),
                origin: self.origin.clone(),
                keys: keys.clone(),
                uuid,
            },
            polls: Mutex::new(Vec::new()),
        }))
    }
}
