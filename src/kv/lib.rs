//! Revision-checked key/value storage.
//!
//! Status records and liveness entries both live in broker-hosted KV buckets.
//! The trait is the seam: production code binds [`nats::NatsKv`], tests bind
//! [`memory::MemoryKv`].

pub mod memory;
pub mod nats;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Result;

pub use memory::MemoryKv;
pub use nats::NatsKv;

/// Declarative bucket shape, applied at bind time.
#[derive(Debug, Clone)]
pub struct BucketSpec {
    pub bucket: String,
    pub description: String,
    /// Entries older than this expire. Zero means keep forever.
    pub ttl: Duration,
    pub replicas: usize,
}

impl BucketSpec {
    pub fn new(bucket: impl Into<String>) -> BucketSpec {
        BucketSpec {
            bucket: bucket.into(),
            description: String::new(),
            ttl: Duration::ZERO,
            replicas: 1,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> BucketSpec {
        self.description = description.into();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> BucketSpec {
        self.ttl = ttl;
        self
    }

    pub fn replicas(mut self, replicas: usize) -> BucketSpec {
        self.replicas = replicas;
        self
    }
}

/// A live value with the revision needed for a compare-and-swap update.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Bytes,
    pub revision: u64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Current live entry, or None when the key is absent or deleted.
    async fn entry(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Insert a new key. Errors with [`crate::errors::KvError::AlreadyExists`]
    /// when a live value is present.
    async fn create(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Replace the value only if the stored revision still matches.
    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<u64>;

    /// Soft-delete the key. Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;
}
