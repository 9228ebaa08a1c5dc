//! Publisher adapters.

mod nano_req;
#[cfg(feature = "pubnub")]
mod pubnub;
mod redis;
mod sidekiq;
#[cfg(feature = "nats")]
mod stan;

pub use nano_req::{NanoRequest, NanoRequestConfig};
#[cfg(feature = "pubnub")]
pub use pubnub::{PubnubPubConfig, PubnubPublisher};
pub use redis::{RedisPubConfig, RedisPublisher};
pub use sidekiq::{SidekiqConfig, SidekiqPublisher, SCHEDULE_KEY};
#[cfg(feature = "nats")]
pub use stan::{StanPubConfig, StanPublisher};

use crate::error::Result;
use crate::metrics;

/// Count the outcome of one publish and pass it through.
pub(crate) fn observe(transport: &'static str, result: Result<()>) -> Result<()> {
    match &result {
        Ok(()) => metrics::published(transport),
        Err(e) => metrics::publish_failed(transport, e),
    }
    result
}
