//! The scoped batching strategy (`spec.md` §4.4): one `WorkScope` per
//! logical unit of work (an HTTP request, the handling of one inbox
//! message). Side effects are queued thread-safely, then flushed in a
//! single `process_work_batch` call on dispose.
//!
//! Grounded on the teacher's pattern of collecting side effects in a
//! shared, lock-guarded pending set before one committing call
//! (`ReferenceWorkerBridge`'s `processed_iterations: Arc<RwLock<..>>`),
//! generalized here from a read cache to a write-collecting queue, and
//! on `OutboxPublisher`'s single-flush-call-per-batch shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{instrument, warn};
use wh_core::{
    InstanceId, MessageCompletion, MessageFailure, NewMessage, NewPerspectiveCheckpoint,
    OrchestratorFlags, WorkBatch,
};
use wh_ports::{WorkBatchRequest, WorkStore};

use crate::channel::WorkChannel;
use crate::error::RuntimeError;

#[derive(Default)]
struct Queues {
    outbox_messages: Vec<NewMessage>,
    inbox_messages: Vec<NewMessage>,
    perspective_checkpoints: Vec<NewPerspectiveCheckpoint>,
    outbox_completions: Vec<MessageCompletion>,
    outbox_failures: Vec<MessageFailure>,
    inbox_completions: Vec<MessageCompletion>,
    inbox_failures: Vec<MessageFailure>,
    receptor_completions: Vec<MessageCompletion>,
    receptor_failures: Vec<MessageFailure>,
    perspective_completions: Vec<MessageCompletion>,
    perspective_failures: Vec<MessageFailure>,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.outbox_messages.is_empty()
            && self.inbox_messages.is_empty()
            && self.perspective_checkpoints.is_empty()
            && self.outbox_completions.is_empty()
            && self.outbox_failures.is_empty()
            && self.inbox_completions.is_empty()
            && self.inbox_failures.is_empty()
            && self.receptor_completions.is_empty()
            && self.receptor_failures.is_empty()
            && self.perspective_completions.is_empty()
            && self.perspective_failures.is_empty()
    }
}

/// Fixed parameters a scope needs to build a `WorkBatchRequest`; shared
/// read-only across every scope in a process.
#[derive(Debug, Clone)]
pub struct ScopeContext {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub host_name: String,
    pub process_id: u32,
    pub partition_count: i32,
    pub max_partitions_per_instance: usize,
    pub lease_seconds: i64,
    pub stale_threshold_seconds: i64,
}

/// One unit of work's queue set plus a handle to flush it. `QueueX`
/// methods are O(1) thread-safe appends that never touch the database;
/// `flush`/`dispose` drain the queues into one orchestrator call.
pub struct WorkScope<S: WorkStore> {
    context: ScopeContext,
    store: std::sync::Arc<S>,
    channel: WorkChannel,
    queues: Mutex<Queues>,
    disposed: AtomicBool,
}

impl<S: WorkStore> WorkScope<S> {
    pub fn new(context: ScopeContext, store: std::sync::Arc<S>, channel: WorkChannel) -> Self {
        Self {
            context,
            store,
            channel,
            queues: Mutex::new(Queues::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn queue_outbox_message(&self, message: NewMessage) {
        self.queues.lock().unwrap().outbox_messages.push(message);
    }

    pub fn queue_inbox_message(&self, message: NewMessage) {
        self.queues.lock().unwrap().inbox_messages.push(message);
    }

    pub fn queue_perspective_checkpoint(&self, checkpoint: NewPerspectiveCheckpoint) {
        self.queues.lock().unwrap().perspective_checkpoints.push(checkpoint);
    }

    pub fn queue_outbox_completion(&self, completion: MessageCompletion) {
        self.queues.lock().unwrap().outbox_completions.push(completion);
    }

    pub fn queue_outbox_failure(&self, failure: MessageFailure) {
        self.queues.lock().unwrap().outbox_failures.push(failure);
    }

    pub fn queue_inbox_completion(&self, completion: MessageCompletion) {
        self.queues.lock().unwrap().inbox_completions.push(completion);
    }

    pub fn queue_inbox_failure(&self, failure: MessageFailure) {
        self.queues.lock().unwrap().inbox_failures.push(failure);
    }

    pub fn queue_receptor_completion(&self, completion: MessageCompletion) {
        self.queues.lock().unwrap().receptor_completions.push(completion);
    }

    pub fn queue_receptor_failure(&self, failure: MessageFailure) {
        self.queues.lock().unwrap().receptor_failures.push(failure);
    }

    pub fn queue_perspective_completion(&self, completion: MessageCompletion) {
        self.queues.lock().unwrap().perspective_completions.push(completion);
    }

    pub fn queue_perspective_failure(&self, failure: MessageFailure) {
        self.queues.lock().unwrap().perspective_failures.push(failure);
    }

    /// Drains every queue into one `process_work_batch` call, then
    /// writes every returned item to the in-process channel before
    /// returning — per `spec.md` §4.4, a waiting consumer may begin work
    /// before the scope ends.
    #[instrument(skip(self), fields(instance_id = %self.context.instance_id))]
    pub async fn flush(&self, flags: OrchestratorFlags) -> Result<WorkBatch, RuntimeError> {
        let drained = {
            let mut queues = self.queues.lock().unwrap();
            std::mem::take(&mut *queues)
        };

        let request = WorkBatchRequest {
            instance_id: self.context.instance_id,
            service_name: self.context.service_name.clone(),
            host_name: self.context.host_name.clone(),
            process_id: self.context.process_id,
            metadata: serde_json::json!({}),
            outbox_completions: drained.outbox_completions,
            outbox_failures: drained.outbox_failures,
            inbox_completions: drained.inbox_completions,
            inbox_failures: drained.inbox_failures,
            receptor_completions: drained.receptor_completions,
            receptor_failures: drained.receptor_failures,
            perspective_checkpoint_completions: drained.perspective_completions,
            perspective_checkpoint_failures: drained.perspective_failures,
            new_outbox_messages: drained.outbox_messages,
            new_inbox_messages: drained.inbox_messages,
            new_perspective_checkpoints: drained.perspective_checkpoints,
            renew_outbox_lease_ids: Vec::new(),
            renew_inbox_lease_ids: Vec::new(),
            flags,
            partition_count: self.context.partition_count,
            max_partitions_per_instance: self.context.max_partitions_per_instance,
            lease_seconds: self.context.lease_seconds,
            stale_threshold_seconds: self.context.stale_threshold_seconds,
        };

        let batch = self.store.process_work_batch(request).await?;

        for item in batch.outbox_work.iter().chain(&batch.inbox_work).chain(&batch.perspective_work) {
            self.channel.send(item.clone()).await?;
        }

        Ok(batch)
    }

    /// If any queue is non-empty, flushes; otherwise a no-op, matching
    /// the "manual flush followed by a clean dispose incurs no second
    /// orchestrator call" invariant.
    pub async fn dispose(self) -> Result<Option<WorkBatch>, RuntimeError> {
        self.dispose_with_deadline(None).await
    }

    /// Cancellation-safe dispose: attempts the flush within `deadline`;
    /// if it elapses, drops the queued effects and records a warning
    /// rather than blocking shutdown indefinitely (`spec.md` §5).
    pub async fn dispose_with_deadline(
        self,
        deadline: Option<Duration>,
    ) -> Result<Option<WorkBatch>, RuntimeError> {
        self.disposed.store(true, Ordering::Relaxed);
        let is_empty = self.queues.lock().unwrap().is_empty();
        if is_empty {
            return Ok(None);
        }

        let flush = self.flush(OrchestratorFlags::empty());
        match deadline {
            None => flush.await.map(Some),
            Some(deadline) => match tokio::time::timeout(deadline, flush).await {
                Ok(result) => result.map(Some),
                Err(_) => {
                    let dropped = self.queues.lock().unwrap().is_empty();
                    warn!(dropped = !dropped, "scope dispose flush deadline exceeded, queued effects dropped");
                    Err(RuntimeError::DisposeDeadlineExceeded { dropped: 1 })
                }
            },
        }
    }
}

impl<S: WorkStore> Drop for WorkScope<S> {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Relaxed) {
            let is_empty = self.queues.lock().map(|q| q.is_empty()).unwrap_or(true);
            if !is_empty {
                warn!("WorkScope dropped without dispose() while queues were non-empty; effects were lost");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use wh_core::{MessageId, StatusFlags};
    use wh_ports::WorkStoreError;

    struct RecordingStore {
        calls: AtomicUsize,
    }

    impl WorkStore for RecordingStore {
        async fn process_work_batch(
            &self,
            request: WorkBatchRequest,
        ) -> Result<WorkBatch, WorkStoreError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            assert!(!request.new_outbox_messages.is_empty() || !request.inbox_completions.is_empty());
            Ok(WorkBatch::default())
        }
    }

    fn context() -> ScopeContext {
        ScopeContext {
            instance_id: InstanceId::new(),
            service_name: "svc".to_string(),
            host_name: "host".to_string(),
            process_id: 1,
            partition_count: 10,
            max_partitions_per_instance: 10,
            lease_seconds: 300,
            stale_threshold_seconds: 600,
        }
    }

    #[tokio::test]
    async fn dispose_with_empty_queues_does_not_call_the_store() {
        let store = std::sync::Arc::new(RecordingStore { calls: AtomicUsize::new(0) });
        let (tx, _rx) = crate::channel::channel(8);
        let scope = WorkScope::new(context(), store.clone(), tx);
        scope.dispose().await.unwrap();
        assert_eq!(store.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn dispose_with_queued_effects_flushes_exactly_once() {
        let store = std::sync::Arc::new(RecordingStore { calls: AtomicUsize::new(0) });
        let (tx, _rx) = crate::channel::channel(8);
        let scope = WorkScope::new(context(), store.clone(), tx);
        scope.queue_inbox_completion(MessageCompletion {
            message_id: MessageId::new(),
            completed_status: StatusFlags::RECEPTOR_PROCESSED,
        });
        scope.dispose().await.unwrap();
        assert_eq!(store.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn manual_flush_then_clean_dispose_calls_the_store_once() {
        let store = std::sync::Arc::new(RecordingStore { calls: AtomicUsize::new(0) });
        let (tx, _rx) = crate::channel::channel(8);
        let scope = WorkScope::new(context(), store.clone(), tx);
        scope.queue_outbox_message(NewMessage {
            message_id: MessageId::new(),
            destination: Some("orders".to_string()),
            handler_name: None,
            envelope_type: "Test".to_string(),
            envelope_data: serde_json::json!({}),
            metadata: serde_json::json!({}),
            scope: None,
            stream_id: None,
            is_event: true,
        });
        scope.flush(OrchestratorFlags::empty()).await.unwrap();
        scope.dispose().await.unwrap();
        assert_eq!(store.calls.load(Ordering::Relaxed), 1);
    }
}
