//! Converge await engine.
//!
//! After a create, update or delete has been submitted, the engine decides
//! whether the change converged: it follows the object (and the objects that
//! depend on it) until the kind's readiness predicate holds, the time budget
//! runs out or the caller cancels. Failures carry the last observed object
//! and human-readable sub-errors.
//!
//! ```no_run
//! # async fn demo(obj: kube::core::DynamicObject) -> Result<(), converge_await::AwaitError> {
//! use std::sync::Arc;
//! use converge_await::{AwaitRequest, Engine, Registry};
//!
//! let clients = Arc::new(converge_kubehub::KubeClientSet::try_default().await?);
//! let engine = Engine::new(Registry::builtin(), clients);
//! let ready = engine.creation(AwaitRequest::new(obj)).await?;
//! # drop(ready);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod config;
pub mod core_kinds;
pub mod daemonset;
pub mod deployment;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod ingress;
pub mod job;
pub mod pod;
pub mod poll;
pub mod registry;
pub mod removed;
pub mod rollout;
pub mod service;
pub mod statefulset;
pub mod states;

pub use aggregator::{related_resource, PodAggregator};
pub use config::{CreateAwaitConfig, DeleteAwaitConfig, EngineSettings, UpdateAwaitConfig};
pub use dispatch::{preview_error, AwaitRequest, Engine};
pub use error::AwaitError;
pub use events::{EventSource, SettleTimer};
pub use poll::{ObjectPoller, RetryError};
pub use registry::{AwaitSpec, Registry};
