//! Worker liveness registry.
//!
//! Each worker registers under its identity in a TTL bucket and refreshes the
//! entry while it runs. Nothing ever reads the stored timestamp to decide
//! liveness; expiry-driven absence is the failure signal. A worker that stops
//! checking in simply vanishes from the bucket once the TTL lapses.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::trace;
use uuid::Uuid;

use crate::errors::{RegistryError, Result};
use crate::kv::{BucketSpec, KvStore};

pub const LIVENESS_BUCKET: &str = "active-controllers";

/// Entries expire three missed check-in windows after the last refresh.
pub const LIVENESS_TTL: Duration = Duration::from_secs(3 * 60);

/// Worker identity: application name plus a per-process uuid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerId {
    pub app: String,
    pub uuid: Uuid,
}

impl ControllerId {
    pub fn new(app: impl Into<String>) -> ControllerId {
        ControllerId {
            app: app.into(),
            uuid: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.uuid)
    }
}

impl FromStr for ControllerId {
    type Err = RegistryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (app, uuid) = s
            .rsplit_once('/')
            .ok_or_else(|| RegistryError::MalformedId(s.to_string()))?;
        if app.is_empty() {
            return Err(RegistryError::MalformedId(s.to_string()));
        }
        let uuid = Uuid::parse_str(uuid).map_err(|_| RegistryError::MalformedId(s.to_string()))?;
        Ok(ControllerId {
            app: app.to_string(),
            uuid,
        })
    }
}

/// Spec for the shared liveness bucket.
pub fn liveness_bucket_spec(replicas: usize) -> BucketSpec {
    BucketSpec::new(LIVENESS_BUCKET)
        .description("worker liveness records")
        .ttl(LIVENESS_TTL)
        .replicas(replicas)
}

/// Handle bound to one worker identity over the shared bucket.
pub struct LivenessRegistry {
    kv: Arc<dyn KvStore>,
    id: ControllerId,
    last_rev: u64,
}

impl LivenessRegistry {
    pub fn new(kv: Arc<dyn KvStore>, id: ControllerId) -> LivenessRegistry {
        LivenessRegistry {
            kv,
            id,
            last_rev: 0,
        }
    }

    pub fn id(&self) -> &ControllerId {
        &self.id
    }

    /// Create this worker's liveness entry. Fails if a live entry with the
    /// same identity already exists.
    pub async fn register(&mut self) -> Result<()> {
        let rev = self.kv.create(&self.id.to_string(), timestamp()).await?;
        self.last_rev = rev;
        trace!("registered {} at revision {rev}", self.id);
        Ok(())
    }

    /// Refresh the entry, restarting its TTL clock. Uses the revision from
    /// the previous write so a usurped identity fails loudly.
    pub async fn checkin(&mut self) -> Result<()> {
        let rev = self
            .kv
            .update(&self.id.to_string(), timestamp(), self.last_rev)
            .await?;
        self.last_rev = rev;
        Ok(())
    }

    /// Remove the entry ahead of TTL expiry on clean shutdown.
    pub async fn deregister(&mut self) -> Result<()> {
        self.kv.delete(&self.id.to_string()).await?;
        self.last_rev = 0;
        Ok(())
    }

    /// Last check-in time of any worker, or None when the worker is dead
    /// (entry absent or expired).
    pub async fn last_contact(&self, id: &ControllerId) -> Result<Option<DateTime<Utc>>> {
        let entry = match self.kv.entry(&id.to_string()).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let raw = std::str::from_utf8(&entry.value)
            .map_err(|_| RegistryError::MalformedRecord(id.to_string()))?;
        let at = DateTime::parse_from_rfc3339(raw)
            .map_err(|_| RegistryError::MalformedRecord(id.to_string()))?;
        Ok(Some(at.with_timezone(&Utc)))
    }
}

fn timestamp() -> Bytes {
    Bytes::from(Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn registry() -> LivenessRegistry {
        LivenessRegistry::new(Arc::new(MemoryKv::new()), ControllerId::new("test-app"))
    }

    #[test]
    fn test_controller_id_roundtrip() {
        let id = ControllerId::new("condition-worker");
        let parsed: ControllerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_controller_id_rejects_garbage() {
        assert!("no-separator".parse::<ControllerId>().is_err());
        assert!("/f2f3e0bc-43e9-4543-9abd-47db0a8d48a9"
            .parse::<ControllerId>()
            .is_err());
        assert!("app/not-a-uuid".parse::<ControllerId>().is_err());
    }

    #[tokio::test]
    async fn test_register_checkin_lifecycle() {
        let mut reg = registry();
        reg.register().await.unwrap();
        reg.checkin().await.unwrap();

        let id = reg.id().clone();
        assert!(reg.last_contact(&id).await.unwrap().is_some());

        reg.deregister().await.unwrap();
        assert!(reg.last_contact(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_register_fails() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let id = ControllerId::new("test-app");
        let mut a = LivenessRegistry::new(Arc::clone(&kv), id.clone());
        let mut b = LivenessRegistry::new(kv, id);

        a.register().await.unwrap();
        assert!(b.register().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_worker_has_no_contact() {
        let reg = registry();
        let other = ControllerId::new("other-app");
        assert!(reg.last_contact(&other).await.unwrap().is_none());
    }
}
