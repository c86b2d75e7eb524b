//! Common imports for crate consumers.

pub use crate::broker::{
    ConsumerSpec, Credentials, DeliveryMode, JetStreamBroker, MemoryStream, Message, MsgCh,
    NatsOptions, Retention, Stream, StreamSpec, DEFAULT_PULL_TIMEOUT,
};
pub use crate::controller::{
    Acknowledger, ConditionState, ConditionStatusPublisher, ConditionStatusQueryor,
    KvStatusPublisher, KvStatusQueryor, State, StatusValue,
};
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::kv::{BucketSpec, KvEntry, KvStore, MemoryKv, NatsKv};
pub use crate::registry::{ControllerId, LivenessRegistry};
pub use crate::trace::TraceContext;
