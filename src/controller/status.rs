//! Status publication and resolution over the shared KV buckets.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use log::{trace, warn};
use metrics::counter;

use crate::errors::Result;
use crate::kv::KvStore;
use crate::registry::ControllerId;
use crate::trace::TraceContext;

use super::{status_key, ConditionState, State, StatusValue};

const STATUS_ERROR_COUNTER: &str = "corral_status_errors_total";

/// Publishes status for the one condition this instance is bound to. Status
/// is advisory: writes that fail are logged and dropped, the work itself is
/// never interrupted.
#[async_trait]
pub trait ConditionStatusPublisher: Send + Sync {
    async fn publish(
        &mut self,
        trace: &TraceContext,
        target: &str,
        state: State,
        status: serde_json::Value,
    );
}

pub struct KvStatusPublisher {
    kv: Arc<dyn KvStore>,
    key: String,
    controller_id: ControllerId,
    last_rev: u64,
}

impl KvStatusPublisher {
    /// Bind a publisher to one condition. The starting revision comes from
    /// the store, so a restarted worker picks up where its predecessor
    /// stopped instead of colliding on create.
    pub async fn new(
        kv: Arc<dyn KvStore>,
        facility: &str,
        condition_id: &str,
        controller_id: ControllerId,
    ) -> Result<KvStatusPublisher> {
        let key = status_key(facility, condition_id);
        let last_rev = kv
            .entry(&key)
            .await?
            .map(|e| e.revision)
            .unwrap_or_default();

        Ok(KvStatusPublisher {
            kv,
            key,
            controller_id,
            last_rev,
        })
    }
}

#[async_trait]
impl ConditionStatusPublisher for KvStatusPublisher {
    async fn publish(
        &mut self,
        trace: &TraceContext,
        target: &str,
        state: State,
        status: serde_json::Value,
    ) {
        let value = StatusValue {
            worker_id: self.controller_id.to_string(),
            target: target.to_string(),
            trace_id: trace.trace_id.clone(),
            span_id: trace.span_id.clone(),
            state,
            status,
            updated_at: Utc::now(),
        };
        let payload = match serde_json::to_vec(&value) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                counter!(STATUS_ERROR_COUNTER, "op" => "encode").increment(1);
                warn!("status encode for {} failed: {e}", self.key);
                return;
            }
        };

        let written = if self.last_rev == 0 {
            self.kv.create(&self.key, payload).await
        } else {
            self.kv.update(&self.key, payload, self.last_rev).await
        };

        match written {
            Ok(rev) => {
                self.last_rev = rev;
                trace!("status {} for {} at revision {rev}", state, self.key);
            }
            Err(e) => {
                counter!(STATUS_ERROR_COUNTER, "op" => "write").increment(1);
                warn!("status write for {} failed: {e}", self.key);
            }
        }
    }
}

/// Resolves the state of conditions this worker does not own.
#[async_trait]
pub trait ConditionStatusQueryor: Send + Sync {
    async fn condition_state(&self, condition_id: &str) -> ConditionState;
}

pub struct KvStatusQueryor {
    status: Arc<dyn KvStore>,
    liveness: Arc<dyn KvStore>,
    facility: String,
}

impl KvStatusQueryor {
    pub fn new(
        status: Arc<dyn KvStore>,
        liveness: Arc<dyn KvStore>,
        facility: impl Into<String>,
    ) -> KvStatusQueryor {
        KvStatusQueryor {
            status,
            liveness,
            facility: facility.into(),
        }
    }
}

#[async_trait]
impl ConditionStatusQueryor for KvStatusQueryor {
    /// Read-only resolution, with one exception: a record whose owner is
    /// provably dead is deleted before reporting Orphaned, so the condition
    /// becomes claimable again. Anything that cannot be interpreted resolves
    /// to Indeterminate rather than a guess.
    async fn condition_state(&self, condition_id: &str) -> ConditionState {
        let key = status_key(&self.facility, condition_id);

        let entry = match self.status.entry(&key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return ConditionState::NotStarted,
            Err(e) => {
                warn!("status read for {key} failed: {e}");
                return ConditionState::Indeterminate;
            }
        };

        let value: StatusValue = match serde_json::from_slice(&entry.value) {
            Ok(value) => value,
            Err(e) => {
                warn!("status record for {key} is unreadable: {e}");
                return ConditionState::Indeterminate;
            }
        };

        if value.state.is_terminal() {
            return ConditionState::Complete;
        }

        let worker_id: ControllerId = match value.worker_id.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!("status record for {key} names an unparseable worker: {e}");
                return ConditionState::Indeterminate;
            }
        };

        match self.liveness.entry(&worker_id.to_string()).await {
            Ok(Some(_)) => ConditionState::InProgress,
            Ok(None) => {
                // Dead owner. Remove the stale record; if that fails the
                // record is still claimable-looking, so don't report it
                // orphaned yet.
                if let Err(e) = self.status.delete(&key).await {
                    warn!("removing orphaned status record {key} failed: {e}");
                    return ConditionState::Indeterminate;
                }
                ConditionState::Orphaned
            }
            Err(e) => {
                warn!("liveness lookup for {worker_id} failed: {e}");
                ConditionState::Indeterminate
            }
        }
    }
}
