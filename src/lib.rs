//! corral: condition coordination for distributed worker pools.
//!
//! Workers share a NATS JetStream broker for work delivery and two key/value
//! buckets for condition status and worker liveness. All components are
//! embedded as local modules under `src/`.

pub mod prelude;

#[path = "broker/lib.rs"]
pub mod broker;
#[path = "controller/lib.rs"]
pub mod controller;
#[path = "errors/lib.rs"]
pub mod errors;
#[path = "kv/lib.rs"]
pub mod kv;
#[path = "registry/lib.rs"]
pub mod registry;
#[path = "trace/lib.rs"]
pub mod trace;
