//! Work Harness Coordinator — runtime layer.
//!
//! Wires the pure orchestrator contract in `wh-ports` into a running
//! process: the scoped batching strategy, the in-process work channel,
//! name-keyed receptor/perspective dispatch, and the background worker
//! loops (`spec.md` §4.4, §4.5).

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod scope;
pub mod worker;

pub use channel::{channel, WorkChannel, WorkChannelConsumer};
pub use config::WorkerConfig;
pub use dispatch::{ApplierRegistry, ReceptorRegistry};
pub use error::RuntimeError;
pub use scope::{ScopeContext, WorkScope};
pub use worker::{AlwaysReady, ReadinessProbe, ResultSink, WorkerEvent, WorkerLoop};
