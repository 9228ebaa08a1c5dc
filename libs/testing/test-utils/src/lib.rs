//! Shared test utilities for the courier adapters
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestNats`: NATS container with JetStream enabled (feature: "nats")
//! - `TestDataBuilder`: deterministic event ids and wire bodies (always available)
//! - `assertions`: custom assertion helpers (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//! - `nats`: Enables NATS test infrastructure
//! - `all`: Enables both
//!
//! # Usage
//!
//! Add the features you need to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis", "nats"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let body = builder.wire_body(7, "payload");
//!     // publish `body` through an adapter connected to redis.connection_string()
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "nats")]
pub use nats::TestNats;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test messages with deterministic ids
///
/// This ensures tests are reproducible by deriving every id from a seed.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_dedup_across_restart");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic event id
    pub fn event_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Unique topic or channel name
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.topic("events"), "test.events.7");
    /// ```
    pub fn topic(&self, prefix: &str) -> String {
        format!("test.{}.{}", prefix, self.seed)
    }

    /// A body of exactly `fields` pipe-separated fields: the event id, filler
    /// fields, then `payload` last.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let body = TestDataBuilder::new(1).wire_body(4, "hello");
    /// assert_eq!(body.split('|').count(), 4);
    /// assert!(body.ends_with("|hello"));
    /// ```
    pub fn wire_body(&self, fields: usize, payload: &str) -> String {
        let mut parts = vec![self.event_id().to_string()];
        parts.extend((1..fields.saturating_sub(1)).map(|i| format!("f{}", i)));
        parts.push(payload.to_string());
        parts.join("|")
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that a body has the expected number of wire fields
    pub fn assert_field_count(body: &[u8], expected: usize, context: &str) {
        let actual = body.iter().filter(|b| **b == b'|').count() + 1;
        assert_eq!(
            actual, expected,
            "{}: expected {} fields, got {} in {:?}",
            context,
            expected,
            actual,
            String::from_utf8_lossy(body)
        );
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
