//! Condition status protocol.
//!
//! Every condition has at most one live status record, keyed
//! `<facility>.<condition_id>` in a bucket named for the condition kind. The
//! worker that claims a condition owns the record through a bound publisher;
//! any other worker resolves the condition's state through a queryor without
//! talking to the owner.

pub mod ack;
pub mod status;

#[cfg(test)]
mod tests;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kv::BucketSpec;

pub use ack::Acknowledger;
pub use status::{
    ConditionStatusPublisher, ConditionStatusQueryor, KvStatusPublisher, KvStatusQueryor,
};

/// Status records outlive their stream messages by a wide margin so that a
/// condition's outcome stays queryable long after the work is done.
pub const STATUS_KV_TTL: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Lifecycle state a worker reports for a condition it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Pending,
    Active,
    Succeeded,
    Failed,
}

impl State {
    /// Terminal states never regress; liveness is irrelevant once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeeded | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Pending => write!(f, "pending"),
            State::Active => write!(f, "active"),
            State::Succeeded => write!(f, "succeeded"),
            State::Failed => write!(f, "failed"),
        }
    }
}

/// The persisted status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusValue {
    pub worker_id: String,
    pub target: String,
    pub trace_id: String,
    pub span_id: String,
    pub state: State,
    /// Opaque application detail; this crate never interprets it.
    pub status: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// What a non-owning worker can conclude about a condition. Derived on every
/// query, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    /// No status record exists.
    NotStarted,
    /// A live worker owns the condition.
    InProgress,
    /// The owner reported a terminal state.
    Complete,
    /// The owner died mid-work; the stale record was removed.
    Orphaned,
    /// The record or its owner could not be interpreted.
    Indeterminate,
}

impl fmt::Display for ConditionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionState::NotStarted => write!(f, "not-started"),
            ConditionState::InProgress => write!(f, "in-progress"),
            ConditionState::Complete => write!(f, "complete"),
            ConditionState::Orphaned => write!(f, "orphaned"),
            ConditionState::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Key of a condition's status record within its kind bucket.
pub fn status_key(facility: &str, condition_id: &str) -> String {
    format!("{facility}.{condition_id}")
}

/// Spec for a condition kind's status bucket.
pub fn status_bucket_spec(condition_kind: &str, replicas: usize) -> BucketSpec {
    BucketSpec::new(condition_kind)
        .description(format!("status records for {condition_kind} conditions"))
        .ttl(STATUS_KV_TTL)
        .replicas(replicas)
}
