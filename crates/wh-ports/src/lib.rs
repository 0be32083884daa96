//! Port traits that `wh-store`/`wh-runtime` adapters implement.
//!
//! Per `spec.md` §1, the orchestrator, the transport, and the perspective
//! projection are separate concerns; this crate defines the boundary
//! between them as traits, the way `sr-ports` defines `EventStore`,
//! `MessageBus`, and `Clock` for its teacher codebase.

use std::future::Future;

use chrono::{DateTime, Utc};
use wh_core::{
    InstanceId, MessageCompletion, MessageFailure, MessageId, NewMessage,
    NewPerspectiveCheckpoint, OrchestratorFlags, WorkBatch,
};

/// The parameters of one `process_work_batch` call (`spec.md` §4.1).
/// All list fields default to empty; only instance identity is required.
#[derive(Debug, Clone, Default)]
pub struct WorkBatchRequest {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub host_name: String,
    pub process_id: u32,
    pub metadata: serde_json::Value,

    pub outbox_completions: Vec<MessageCompletion>,
    pub outbox_failures: Vec<MessageFailure>,
    pub inbox_completions: Vec<MessageCompletion>,
    pub inbox_failures: Vec<MessageFailure>,
    pub receptor_completions: Vec<MessageCompletion>,
    pub receptor_failures: Vec<MessageFailure>,
    pub perspective_checkpoint_completions: Vec<MessageCompletion>,
    pub perspective_checkpoint_failures: Vec<MessageFailure>,

    pub new_outbox_messages: Vec<NewMessage>,
    pub new_inbox_messages: Vec<NewMessage>,
    pub new_perspective_checkpoints: Vec<NewPerspectiveCheckpoint>,

    pub renew_outbox_lease_ids: Vec<MessageId>,
    pub renew_inbox_lease_ids: Vec<MessageId>,

    pub flags: OrchestratorFlags,
    pub partition_count: i32,
    pub max_partitions_per_instance: usize,
    pub lease_seconds: i64,
    pub stale_threshold_seconds: i64,
}

/// The orchestrator port: one DB transaction per call, combining
/// heartbeat, stale reap, completion/failure application, ingestion,
/// lease renewal, and claim (`spec.md` §4.1).
pub trait WorkStore: Send + Sync {
    fn process_work_batch(
        &self,
        request: WorkBatchRequest,
    ) -> impl Future<Output = Result<WorkBatch, WorkStoreError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkStoreError {
    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("schema missing: {detail}")]
    SchemaMissing { detail: String },
}

/// A read-model projection consuming events of one or more types
/// (`spec.md` §4.6 glossary "Perspective").
pub trait PerspectiveApplier: Send + Sync {
    /// Apply one event envelope (already decoded) to the perspective's
    /// current state for `stream_id`, returning the effect to apply.
    fn apply(
        &self,
        stream_id: &str,
        event_type: &str,
        event_data: &serde_json::Value,
    ) -> impl Future<Output = Result<PerspectiveEffect, PerspectiveError>> + Send;
}

/// The sum type a perspective runner dispatches on per `spec.md` §9's
/// design note: "the capability set `{Apply(current, event) -> result}`
/// where `result` is a sum type `{Update(model) | Delete | Purge | None}`".
#[derive(Debug, Clone)]
pub enum PerspectiveEffect {
    Update(serde_json::Value),
    Delete,
    Purge,
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum PerspectiveError {
    #[error("no applier registered for perspective {perspective_name}")]
    NoApplier { perspective_name: String },

    #[error("apply failed: {message}")]
    ApplyFailed { message: String },
}

/// An in-process handler reacting to one message type, possibly producing
/// a response (`spec.md` glossary "Receptor"). Each receptor returns a
/// result sum rather than using exceptions for control flow, per
/// `spec.md` §9's design note.
pub trait Receptor: Send + Sync {
    fn handle(
        &self,
        envelope_type: &str,
        envelope_data: &serde_json::Value,
    ) -> impl Future<Output = ReceptorOutcome> + Send;
}

#[derive(Debug, Clone)]
pub enum ReceptorOutcome {
    Ok(serde_json::Value),
    Failed { error_kind: String, message: String },
}

/// Generic message-transport port. Concrete transports (a Service Bus,
/// RabbitMQ, NATS, ...) are out of scope per `spec.md` §1; this trait is
/// the contract the background workers drive, with no bundled
/// implementation.
pub trait MessageTransport: Send + Sync {
    fn send(
        &self,
        destination: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("send error: {message}")]
    SendError { message: String },
}

/// Clock port for deterministic time handling in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let t1 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = clock.now();
        assert!(t2 >= t1);
    }

    #[test]
    fn work_batch_request_defaults_to_empty_lists() {
        let req = WorkBatchRequest::default();
        assert!(req.outbox_completions.is_empty());
        assert!(req.new_outbox_messages.is_empty());
        assert_eq!(req.flags, OrchestratorFlags::empty());
    }
}
