//! In-process store for tests. Same revision semantics as the broker bucket:
//! one monotonic counter per bucket, deletes leave the key free for re-create.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::errors::{KvError, Result};

use super::{KvEntry, KvStore};

#[derive(Default)]
struct Inner {
    entries: HashMap<String, KvEntry>,
    revision: u64,
}

#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> MemoryKv {
        MemoryKv::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn entry(&self, key: &str) -> Result<Option<KvEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(key).cloned())
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(key) {
            return Err(KvError::AlreadyExists(key.to_string()).into());
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(key.to_string(), KvEntry { value, revision });
        Ok(revision)
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .entries
            .get(key)
            .map(|e| e.revision)
            .unwrap_or_default();
        if current != revision {
            return Err(KvError::WrongRevision {
                key: key.to_string(),
                expected: revision,
            }
            .into());
        }
        inner.revision += 1;
        let next = inner.revision;
        inner.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                revision: next,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_update() {
        let kv = MemoryKv::new();
        let rev = kv.create("a.b", Bytes::from_static(b"one")).await.unwrap();
        let next = kv
            .update("a.b", Bytes::from_static(b"two"), rev)
            .await
            .unwrap();
        assert!(next > rev);

        let entry = kv.entry("a.b").await.unwrap().unwrap();
        assert_eq!(entry.value.as_ref(), b"two");
        assert_eq!(entry.revision, next);
    }

    #[tokio::test]
    async fn test_create_collision() {
        let kv = MemoryKv::new();
        kv.create("a.b", Bytes::from_static(b"one")).await.unwrap();
        let err = kv
            .create("a.b", Bytes::from_static(b"two"))
            .await
            .unwrap_err();
        assert!(err.is_kv());
    }

    #[tokio::test]
    async fn test_stale_revision_rejected() {
        let kv = MemoryKv::new();
        let rev = kv.create("a.b", Bytes::from_static(b"one")).await.unwrap();
        kv.update("a.b", Bytes::from_static(b"two"), rev)
            .await
            .unwrap();
        let err = kv
            .update("a.b", Bytes::from_static(b"three"), rev)
            .await
            .unwrap_err();
        assert!(err.is_kv());
    }

    #[tokio::test]
    async fn test_delete_frees_key() {
        let kv = MemoryKv::new();
        kv.create("a.b", Bytes::from_static(b"one")).await.unwrap();
        kv.delete("a.b").await.unwrap();
        assert!(kv.entry("a.b").await.unwrap().is_none());
        kv.create("a.b", Bytes::from_static(b"two")).await.unwrap();
    }
}
