//! Prometheus metrics for adapters.

use crate::error::CourierError;
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls return the existing handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, CourierError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| CourierError::setup(format!("metrics recorder: {}", e)))?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Counters of one subscriber.
#[derive(Clone, Debug)]
pub struct AdapterMetrics {
    transport: &'static str,
    topic: String,
}

impl AdapterMetrics {
    pub fn new(transport: &'static str, topic: &str) -> Self {
        Self {
            transport,
            topic: topic.to_string(),
        }
    }

    pub fn received(&self) {
        counter!(
            "courier_messages_received_total",
            "transport" => self.transport,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    pub fn delivered(&self) {
        counter!(
            "courier_messages_delivered_total",
            "transport" => self.transport,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    pub fn duplicate(&self) {
        counter!(
            "courier_duplicates_suppressed_total",
            "transport" => self.transport,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    pub fn replayed(&self, count: usize) {
        counter!(
            "courier_messages_replayed_total",
            "transport" => self.transport,
            "topic" => self.topic.clone()
        )
        .increment(count as u64);
    }
}

pub(crate) fn terminal_error(err: &CourierError) {
    counter!(
        "courier_terminal_errors_total",
        "category" => err.category().to_string()
    )
    .increment(1);
}

pub(crate) fn published(transport: &'static str) {
    counter!("courier_published_total", "transport" => transport).increment(1);
}

pub(crate) fn publish_failed(transport: &'static str, err: &CourierError) {
    counter!(
        "courier_publish_failures_total",
        "transport" => transport,
        "category" => err.category().to_string()
    )
    .increment(1);
}
