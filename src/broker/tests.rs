use std::time::Duration;

use super::nats::{
    consumer_config_matches, desired_consumer_configs, lookup_says_missing, push_durable,
    NatsOptions,
};
use super::*;
use crate::trace::TraceContext;

fn pull_spec() -> ConsumerSpec {
    ConsumerSpec::pull(
        "workers",
        vec!["conditions.fc13".to_string(), "conditions.fc21".to_string()],
    )
}

#[test]
fn test_consumer_config_idempotent() {
    for desired in desired_consumer_configs(&pull_spec()) {
        assert!(consumer_config_matches(&desired, &desired));
    }
}

#[test]
fn test_consumer_config_detects_drift() {
    let spec = pull_spec().max_ack_pending(10);
    let current = desired_consumer_configs(&spec);
    let desired = desired_consumer_configs(&spec.clone().max_ack_pending(30));
    assert!(!consumer_config_matches(&current[0], &desired[0]));
    // Only the drifted field differs.
    assert_eq!(current[0].max_deliver, desired[0].max_deliver);
    assert_eq!(current[0].ack_policy, desired[0].ack_policy);
}

#[test]
fn test_consumer_config_subject_order_irrelevant() {
    let a = desired_consumer_configs(&ConsumerSpec::pull(
        "workers",
        vec!["s.one".to_string(), "s.two".to_string()],
    ));
    let b = desired_consumer_configs(&ConsumerSpec::pull(
        "workers",
        vec!["s.two".to_string(), "s.one".to_string()],
    ));
    assert!(consumer_config_matches(&a[0], &b[0]));
}

#[test]
fn test_single_subject_uses_filter_subject() {
    let configs = desired_consumer_configs(&ConsumerSpec::pull(
        "workers",
        vec!["conditions.fc13".to_string()],
    ));
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].filter_subject, "conditions.fc13");
    assert!(configs[0].filter_subjects.is_empty());
    assert_eq!(configs[0].max_deliver, CONSUMER_MAX_DELIVER);
}

#[test]
fn test_push_config_one_consumer_per_subject() {
    let spec = ConsumerSpec::push(
        "workers",
        vec!["conditions.fc13".to_string(), "conditions.fc21".to_string()],
    )
    .queue_group("workers");
    let configs = desired_consumer_configs(&spec);

    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].durable_name.as_deref(), Some("workers"));
    assert_eq!(configs[0].filter_subject, "conditions.fc13");
    assert_eq!(configs[0].deliver_subject.as_deref(), Some("_DELIVER.workers"));
    assert_eq!(configs[1].durable_name.as_deref(), Some("workers-1"));
    assert_eq!(configs[1].filter_subject, "conditions.fc21");
    assert_eq!(
        configs[1].deliver_subject.as_deref(),
        Some("_DELIVER.workers-1")
    );
    for config in &configs {
        assert_eq!(config.deliver_group.as_deref(), Some("workers"));
        assert_eq!(config.max_deliver, CONSUMER_MAX_DELIVER);
    }
}

#[test]
fn test_push_durable_names() {
    assert_eq!(push_durable("workers", 0), "workers");
    assert_eq!(push_durable("workers", 2), "workers-2");
}

#[test]
fn test_lookup_error_classification() {
    assert!(lookup_says_missing("consumer not found"));
    assert!(lookup_says_missing("nats: error: code 10014"));
    assert!(!lookup_says_missing("request timed out"));
}

#[tokio::test]
async fn test_options_validation() {
    let stream = StreamSpec::new("conditions", vec!["conditions.>".to_string()]);

    let bad = [
        NatsOptions::new("", "worker", stream.clone()),
        NatsOptions::new("nats://localhost:4222", "worker", stream.clone())
            .consumer(ConsumerSpec::pull("workers", vec![])),
        NatsOptions::new("nats://localhost:4222", "worker", stream)
            .consumer(ConsumerSpec::push("workers", vec![])),
    ];
    for options in bad {
        let mut broker = JetStreamBroker::new(options);
        let err = broker.open().await.unwrap_err();
        assert!(err.is_config());
    }
}

#[tokio::test]
async fn test_memory_publish_and_pull() {
    let mut stream = MemoryStream::new("conditions");
    stream.open().await.unwrap();

    let trace = TraceContext::new();
    stream.publish(&trace, "fc13", b"work").await.unwrap();

    let msg = stream
        .pull_one("conditions.fc13", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(msg.data(), b"work");
    assert_eq!(msg.subject(), "conditions.fc13");
    assert_eq!(msg.trace_context(), Some(trace));
    msg.ack().await.unwrap();
}

#[tokio::test]
async fn test_overwrite_keeps_latest_only() {
    let mut stream = MemoryStream::new("conditions");
    stream.open().await.unwrap();

    let trace = TraceContext::new();
    stream
        .publish_overwrite(&trace, "fc13", b"first")
        .await
        .unwrap();
    stream
        .publish_overwrite(&trace, "fc13", b"second")
        .await
        .unwrap();

    assert_eq!(stream.depth("conditions.fc13").await, 1);
    let msg = stream
        .pull_one("conditions.fc13", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(msg.data(), b"second");
}

#[tokio::test]
async fn test_pull_deadline_exceeded() {
    let mut stream = MemoryStream::new("conditions");
    stream.open().await.unwrap();

    let err = stream
        .pull_one("conditions.fc13", Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_pull_rejects_foreign_prefix() {
    let mut stream = MemoryStream::new("conditions");
    stream.open().await.unwrap();

    // A prefix match must stop at the subject-token boundary.
    let err = stream
        .pull_one("conditionsX.fc13", Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(err.is_subscription());
}

#[tokio::test]
async fn test_nak_redelivers() {
    let mut stream = MemoryStream::new("conditions");
    stream.open().await.unwrap();

    let trace = TraceContext::new();
    stream.publish(&trace, "fc13", b"work").await.unwrap();

    let msg = stream
        .pull_one("conditions.fc13", Duration::from_millis(50))
        .await
        .unwrap();
    msg.nak().await.unwrap();

    let again = stream
        .pull_one("conditions.fc13", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(again.data(), b"work");
}

#[tokio::test]
async fn test_push_bridges_subjects_into_shared_channel() {
    let mut stream = MemoryStream::push(
        "conditions",
        vec!["conditions.fc13".to_string(), "conditions.fc21".to_string()],
    );
    stream.open().await.unwrap();
    let mut rx = stream.subscribe().await.unwrap().unwrap();

    let trace = TraceContext::new();
    stream.publish(&trace, "fc13", b"one").await.unwrap();
    let msg = rx.recv().await.unwrap();
    assert_eq!(msg.data(), b"one");
    assert_eq!(msg.subject(), "conditions.fc13");
    assert_eq!(msg.trace_context(), Some(trace.clone()));

    stream.publish(&trace, "fc21", b"two").await.unwrap();
    let msg = rx.recv().await.unwrap();
    assert_eq!(msg.data(), b"two");
    assert_eq!(msg.subject(), "conditions.fc21");

    stream.close().await.unwrap();
}

#[tokio::test]
async fn test_stalled_handoff_naks_with_delay() {
    let mut stream = MemoryStream::push("conditions", vec!["conditions.fc13".to_string()])
        .handoff_timeout(Duration::from_millis(20));
    stream.open().await.unwrap();
    let mut rx = stream.subscribe().await.unwrap().unwrap();

    let trace = TraceContext::new();
    stream.publish(&trace, "fc13", b"one").await.unwrap();
    stream.publish(&trace, "fc13", b"two").await.unwrap();

    // Nobody drains the channel, so the second delivery cannot be handed
    // off and goes back to the queue with a delay.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let delays = stream.delayed_naks().await;
    assert!(!delays.is_empty());
    assert!(delays.iter().all(|d| *d == NAK_DELAY));

    // Draining resumes delivery; nothing was lost.
    assert_eq!(rx.recv().await.unwrap().data(), b"one");
    assert_eq!(rx.recv().await.unwrap().data(), b"two");
    stream.close().await.unwrap();
}
