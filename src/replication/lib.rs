//! Replication and garbage collection of manifests and blocks onto the
//! replica gateways of a volume.
//!
//! Two engine instances run in a gateway: `replication` POSTs freshly
//! written artifacts to every replica gateway, `garbage_collector`
//! DELETEs obsolete ones, preempting any in-flight replication of the
//! same artifact version first. Each engine is driven by a single
//! background worker owning the active transfer set; submitters and
//! waiters only ever touch the pending, cancel and expire queues.

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::Error;

pub mod context;
pub mod engine;
pub mod entry;
pub mod handle;
pub mod metrics;
pub mod sets;
pub mod worker;

pub use context::{ReplicaContext, ReplicaSnapshot};
pub use engine::ReplicationManager;
pub use handle::FileHandle;
