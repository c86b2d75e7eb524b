use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use super::*;
use crate::broker::{MemoryStream, Stream};
use crate::kv::{KvStore, MemoryKv};
use crate::registry::{ControllerId, LivenessRegistry};
use crate::trace::TraceContext;

const FACILITY: &str = "fc13";
const CONDITION: &str = "e24078bb";

struct Fixture {
    status: Arc<dyn KvStore>,
    liveness: Arc<dyn KvStore>,
}

impl Fixture {
    fn new() -> Fixture {
        Fixture {
            status: Arc::new(MemoryKv::new()),
            liveness: Arc::new(MemoryKv::new()),
        }
    }

    async fn publisher(&self, id: ControllerId) -> KvStatusPublisher {
        KvStatusPublisher::new(Arc::clone(&self.status), FACILITY, CONDITION, id)
            .await
            .unwrap()
    }

    fn queryor(&self) -> KvStatusQueryor {
        KvStatusQueryor::new(Arc::clone(&self.status), Arc::clone(&self.liveness), FACILITY)
    }

    async fn record(&self) -> Option<StatusValue> {
        let entry = self.status.entry(&status_key(FACILITY, CONDITION)).await.unwrap()?;
        Some(serde_json::from_slice(&entry.value).unwrap())
    }
}

#[tokio::test]
async fn test_unwritten_condition_not_started() {
    let fx = Fixture::new();
    assert_eq!(
        fx.queryor().condition_state(CONDITION).await,
        ConditionState::NotStarted
    );
}

#[tokio::test]
async fn test_publish_creates_then_updates() {
    let fx = Fixture::new();
    let mut publisher = fx.publisher(ControllerId::new("worker")).await;
    let trace = TraceContext::new();

    publisher
        .publish(&trace, "server-42", State::Pending, json!({}))
        .await;
    publisher
        .publish(&trace, "server-42", State::Active, json!({"step": 2}))
        .await;

    let record = fx.record().await.unwrap();
    assert_eq!(record.state, State::Active);
    assert_eq!(record.target, "server-42");
    assert_eq!(record.trace_id, trace.trace_id);
}

#[tokio::test]
async fn test_competing_create_loses() {
    let fx = Fixture::new();
    let winner = ControllerId::new("worker");
    let mut first = fx.publisher(winner.clone()).await;
    let mut second = fx.publisher(ControllerId::new("worker")).await;
    let trace = TraceContext::new();

    first
        .publish(&trace, "server-42", State::Active, json!({}))
        .await;
    second
        .publish(&trace, "server-42", State::Pending, json!({}))
        .await;

    let record = fx.record().await.unwrap();
    assert_eq!(record.worker_id, winner.to_string());
    assert_eq!(record.state, State::Active);
}

#[tokio::test]
async fn test_terminal_state_is_complete_without_liveness() {
    let fx = Fixture::new();
    let mut publisher = fx.publisher(ControllerId::new("worker")).await;

    publisher
        .publish(&TraceContext::new(), "server-42", State::Failed, json!({}))
        .await;

    // The worker never registered and is gone, but the outcome stands.
    assert_eq!(
        fx.queryor().condition_state(CONDITION).await,
        ConditionState::Complete
    );
}

#[tokio::test]
async fn test_dead_worker_orphans_and_removes_record() {
    let fx = Fixture::new();
    let mut publisher = fx.publisher(ControllerId::new("worker")).await;

    publisher
        .publish(&TraceContext::new(), "server-42", State::Active, json!({}))
        .await;

    assert_eq!(
        fx.queryor().condition_state(CONDITION).await,
        ConditionState::Orphaned
    );
    assert!(fx.record().await.is_none());
    assert_eq!(
        fx.queryor().condition_state(CONDITION).await,
        ConditionState::NotStarted
    );
}

#[tokio::test]
async fn test_live_worker_in_progress() {
    let fx = Fixture::new();
    let id = ControllerId::new("worker");
    let mut registry = LivenessRegistry::new(Arc::clone(&fx.liveness), id.clone());
    registry.register().await.unwrap();

    let mut publisher = fx.publisher(id).await;
    publisher
        .publish(&TraceContext::new(), "server-42", State::Active, json!({}))
        .await;

    assert_eq!(
        fx.queryor().condition_state(CONDITION).await,
        ConditionState::InProgress
    );
    assert!(fx.record().await.is_some());
}

#[tokio::test]
async fn test_unreadable_record_is_indeterminate() {
    let fx = Fixture::new();
    fx.status
        .create(&status_key(FACILITY, CONDITION), Bytes::from_static(b"not json"))
        .await
        .unwrap();

    assert_eq!(
        fx.queryor().condition_state(CONDITION).await,
        ConditionState::Indeterminate
    );
}

#[tokio::test]
async fn test_malformed_worker_id_is_indeterminate() {
    let fx = Fixture::new();
    let record = json!({
        "worker_id": "no-separator",
        "target": "server-42",
        "trace_id": "4bf92f3577b34da6a3ce929d0e0e4736",
        "span_id": "00f067aa0ba902b7",
        "state": "active",
        "status": {},
        "updated_at": chrono::Utc::now(),
    });
    fx.status
        .create(
            &status_key(FACILITY, CONDITION),
            Bytes::from(serde_json::to_vec(&record).unwrap()),
        )
        .await
        .unwrap();

    assert_eq!(
        fx.queryor().condition_state(CONDITION).await,
        ConditionState::Indeterminate
    );
    // An uninterpretable record is left in place.
    assert!(fx
        .status
        .entry(&status_key(FACILITY, CONDITION))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_publisher_resumes_existing_record() {
    let fx = Fixture::new();
    let mut original = fx.publisher(ControllerId::new("worker")).await;
    original
        .publish(&TraceContext::new(), "server-42", State::Active, json!({}))
        .await;

    // Restarted worker binds to the same condition and continues updating.
    let mut restarted = fx.publisher(ControllerId::new("worker")).await;
    restarted
        .publish(&TraceContext::new(), "server-42", State::Succeeded, json!({}))
        .await;

    assert_eq!(
        fx.queryor().condition_state(CONDITION).await,
        ConditionState::Complete
    );
}

#[tokio::test]
async fn test_acknowledger_lifecycle() {
    let mut stream = MemoryStream::new("conditions");
    stream.open().await.unwrap();
    let trace = TraceContext::new();
    stream.publish(&trace, FACILITY, b"work").await.unwrap();

    let subject = format!("conditions.{FACILITY}");
    let msg = stream
        .pull_one(&subject, Duration::from_millis(50))
        .await
        .unwrap();
    let ack = Acknowledger::new(msg);
    ack.in_progress().await;
    ack.requeue().await;

    let msg = stream
        .pull_one(&subject, Duration::from_millis(50))
        .await
        .unwrap();
    Acknowledger::new(msg).complete().await;

    let err = stream
        .pull_one(&subject, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}
