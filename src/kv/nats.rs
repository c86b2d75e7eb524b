//! JetStream-backed key/value store.

use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::{KvError, Result};

use super::{BucketSpec, KvEntry, KvStore};

/// One bound bucket. Cheap to clone.
#[derive(Clone)]
pub struct NatsKv {
    store: kv::Store,
}

impl NatsKv {
    /// Bind an existing bucket or create it with the given spec.
    pub async fn create_or_bind(context: &jetstream::Context, spec: &BucketSpec) -> Result<NatsKv> {
        if let Ok(store) = context.get_key_value(&spec.bucket).await {
            return Ok(NatsKv { store });
        }

        let store = context
            .create_key_value(kv::Config {
                bucket: spec.bucket.clone(),
                description: spec.description.clone(),
                max_age: spec.ttl,
                num_replicas: spec.replicas,
                ..Default::default()
            })
            .await
            .map_err(|e| KvError::Bucket(e.into()))?;

        Ok(NatsKv { store })
    }
}

#[async_trait]
impl KvStore for NatsKv {
    async fn entry(&self, key: &str) -> Result<Option<KvEntry>> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| KvError::Read(e.into()))?;

        // Delete/purge markers read back as entries with a tombstone
        // operation; callers only ever want live values.
        Ok(entry
            .filter(|e| e.operation == kv::Operation::Put)
            .map(|e| KvEntry {
                value: e.value,
                revision: e.revision,
            }))
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        match self.store.create(key, value).await {
            Ok(revision) => Ok(revision),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                Err(KvError::AlreadyExists(key.to_string()).into())
            }
            Err(e) => Err(KvError::Create(e.into()).into()),
        }
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<u64> {
        self.store
            .update(key, value, revision)
            .await
            .map_err(|e| KvError::Update(e.into()).into())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(key)
            .await
            .map_err(|e| KvError::Delete(e.into()).into())
    }
}
