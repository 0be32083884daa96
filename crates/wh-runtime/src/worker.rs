//! The background worker loop (`spec.md` §4.5): one `WorkerLoop` per
//! work class, wrapping the orchestrator with a poll/sleep cycle, local
//! completion/failure bags, and idle/active event emission.
//!
//! Grounded directly on `sr-governor/main.rs`'s `run_governor_loop`
//! (poll/sleep loop driven by an `AtomicBool`/cancellation signal plus a
//! health server) and `sr-adapters/worker.rs`'s
//! `ReferenceWorkerBridge::start` (consume-loop, per-item dispatch on a
//! separate task, continue after a processing error); cancellation uses
//! `tokio_util::sync::CancellationToken` the way
//! `alfredjeanlab-oddjobs`'s listener loop does, since the teacher itself
//! has no cooperative-cancellation primitive to imitate directly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wh_core::{
    InstanceId, MessageCompletion, MessageFailure, OrchestratorFlags, WorkClass, WorkItem,
};
use wh_ports::{WorkBatchRequest, WorkStore};

use crate::channel::WorkChannel;
use crate::config::WorkerConfig;

/// Emitted on the worker's `tokio::sync::broadcast` channel so
/// integration tests can deterministically wait for a backlog to drain
/// (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    ProcessingStarted,
    ProcessingIdle,
}

/// Local accumulation of outcomes reported by dispatch tasks between
/// orchestrator calls (`spec.md` §4.5 "local bags").
#[derive(Default)]
struct LocalBags {
    completions: Vec<MessageCompletion>,
    failures: Vec<MessageFailure>,
}

/// One handle dispatch tasks use to report a completion or failure back
/// into the worker's local bags for the next orchestrator call.
#[derive(Clone)]
pub struct ResultSink {
    bags: Arc<Mutex<LocalBags>>,
}

impl ResultSink {
    pub async fn complete(&self, completion: MessageCompletion) {
        self.bags.lock().await.completions.push(completion);
    }

    pub async fn fail(&self, failure: MessageFailure) {
        self.bags.lock().await.failures.push(failure);
    }
}

/// A readiness probe distinct from the orchestrator call itself, so a
/// worker can back off before even attempting a transaction against a
/// database that is known to be down.
pub trait ReadinessProbe: Send + Sync {
    fn is_ready(&self) -> impl std::future::Future<Output = bool> + Send;
}

/// Always-ready probe for stores that have no separate health check and
/// rely on `process_work_batch` itself failing when the database is
/// unreachable (`spec.md` §7 kind 4).
pub struct AlwaysReady;

impl ReadinessProbe for AlwaysReady {
    async fn is_ready(&self) -> bool {
        true
    }
}

/// Drives one work class's poll/sleep loop against `S`.
pub struct WorkerLoop<S: WorkStore, P: ReadinessProbe = AlwaysReady> {
    work_class: WorkClass,
    store: Arc<S>,
    probe: P,
    channel: WorkChannel,
    config: WorkerConfig,
    instance_id: InstanceId,
    service_name: String,
    host_name: String,
    process_id: u32,
    bags: Arc<Mutex<LocalBags>>,
    events: broadcast::Sender<WorkerEvent>,
}

impl<S: WorkStore, P: ReadinessProbe> WorkerLoop<S, P> {
    pub fn new(
        work_class: WorkClass,
        store: Arc<S>,
        probe: P,
        channel: WorkChannel,
        config: WorkerConfig,
        instance_id: InstanceId,
        service_name: impl Into<String>,
        host_name: impl Into<String>,
        process_id: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            work_class,
            store,
            probe,
            channel,
            config,
            instance_id,
            service_name: service_name.into(),
            host_name: host_name.into(),
            process_id,
            bags: Arc::new(Mutex::new(LocalBags::default())),
            events,
        }
    }

    /// Subscribe to idle/active transitions. Each call returns an
    /// independent receiver; transitions broadcast before this call was
    /// made are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// A handle dispatch tasks use to report outcomes for this worker's
    /// next orchestrator call.
    pub fn result_sink(&self) -> ResultSink {
        ResultSink { bags: self.bags.clone() }
    }

    /// Runs the poll/sleep loop until `cancellation` fires. The first
    /// orchestrator call happens immediately, before any sleep, so work
    /// already queued at startup is picked up without delay.
    #[instrument(skip(self, cancellation), fields(work_class = ?self.work_class))]
    pub async fn run(&self, cancellation: CancellationToken) {
        let mut consecutive_db_not_ready: u32 = 0;
        let consecutive_empty = AtomicU32::new(0);
        let mut was_active = false;

        loop {
            if cancellation.is_cancelled() {
                info!("worker loop cancelled");
                return;
            }

            if !self.probe.is_ready().await {
                consecutive_db_not_ready += 1;
                warn!(consecutive_db_not_ready, "store not ready, backing off");
                if self.sleep_or_cancel(&cancellation).await {
                    return;
                }
                continue;
            }
            consecutive_db_not_ready = 0;

            match self.poll_once().await {
                Ok(items) => {
                    let empty = items.is_empty();
                    for item in items {
                        self.dispatch(item);
                    }

                    if empty {
                        let count = consecutive_empty.fetch_add(1, Ordering::Relaxed) + 1;
                        if count >= self.config.idle_threshold_polls && was_active {
                            was_active = false;
                            let _ = self.events.send(WorkerEvent::ProcessingIdle);
                            debug!("emitted ProcessingIdle");
                        }
                    } else {
                        consecutive_empty.store(0, Ordering::Relaxed);
                        if !was_active {
                            was_active = true;
                            let _ = self.events.send(WorkerEvent::ProcessingStarted);
                            debug!("emitted ProcessingStarted");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "orchestrator call failed");
                }
            }

            if self.sleep_or_cancel(&cancellation).await {
                return;
            }
        }
    }

    async fn sleep_or_cancel(&self, cancellation: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.config.polling_interval_ms)) => false,
            _ = cancellation.cancelled() => true,
        }
    }

    async fn poll_once(&self) -> Result<Vec<WorkItem>, wh_ports::WorkStoreError> {
        let mut bags = self.bags.lock().await;
        let completions = std::mem::take(&mut bags.completions);
        let failures = std::mem::take(&mut bags.failures);
        drop(bags);

        let mut request = WorkBatchRequest {
            instance_id: self.instance_id,
            service_name: self.service_name.clone(),
            host_name: self.host_name.clone(),
            process_id: self.process_id,
            metadata: self.config.instance_metadata.clone(),
            partition_count: self.config.partition_count,
            max_partitions_per_instance: self.config.max_partitions_per_instance,
            lease_seconds: self.config.lease_seconds,
            stale_threshold_seconds: self.config.stale_threshold_seconds,
            flags: if self.config.debug_mode {
                OrchestratorFlags::DEBUG_MODE
            } else {
                OrchestratorFlags::empty()
            },
            ..Default::default()
        };

        match self.work_class {
            WorkClass::Outbox => {
                request.outbox_completions = completions;
                request.outbox_failures = failures;
            }
            WorkClass::Inbox => {
                request.inbox_completions = completions;
                request.inbox_failures = failures;
            }
            WorkClass::Perspective => {
                request.perspective_checkpoint_completions = completions;
                request.perspective_checkpoint_failures = failures;
            }
        }

        let batch = self.store.process_work_batch(request).await?;
        Ok(batch.items_for(self.work_class).to_vec())
    }

    /// Writes a claimed item to the in-process channel for a consumer
    /// task to pick up; the send is best-effort since a full or closed
    /// channel should not stall the poll loop.
    fn dispatch(&self, item: WorkItem) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.send(item).await {
                warn!(error = %e, "failed to hand claimed item to work channel");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use wh_core::WorkBatch;

    struct ScriptedStore {
        calls: AtomicUsize,
        responses: Mutex<Vec<WorkBatch>>,
    }

    impl WorkStore for ScriptedStore {
        async fn process_work_batch(
            &self,
            _request: WorkBatchRequest,
        ) -> Result<WorkBatch, wh_ports::WorkStoreError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut responses = self.responses.lock().await;
            Ok(if responses.is_empty() {
                WorkBatch::default()
            } else {
                responses.remove(0)
            })
        }
    }

    fn sample_item() -> WorkItem {
        WorkItem {
            work_class: WorkClass::Outbox,
            message_id: wh_core::MessageId::new(),
            stream_id: None,
            partition_number: None,
            destination: Some("orders".to_string()),
            handler_name: None,
            envelope_type: "Test".to_string(),
            envelope_data: serde_json::json!({}),
            metadata: serde_json::json!({}),
            status: wh_core::StatusFlags::STORED,
            attempts: 0,
            sequence_order: 1,
            lease_expiry: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn idle_event_fires_after_consecutive_empty_polls_reach_threshold() {
        let store = Arc::new(ScriptedStore {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(vec![WorkBatch {
                outbox_work: vec![sample_item()],
                ..Default::default()
            }]),
        });
        let (tx, _rx) = crate::channel::channel(8);
        let mut config = WorkerConfig::default();
        config.polling_interval_ms = 1;
        config.idle_threshold_polls = 2;

        let worker = WorkerLoop::new(
            WorkClass::Outbox,
            store,
            AlwaysReady,
            tx,
            config,
            InstanceId::new(),
            "svc",
            "host",
            1,
        );
        let mut events = worker.subscribe();
        let cancellation = CancellationToken::new();
        let cancel_clone = cancellation.clone();

        let run_handle = tokio::spawn(async move { worker.run(cancel_clone).await });

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, WorkerEvent::ProcessingStarted);

        let second = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, WorkerEvent::ProcessingIdle);

        cancellation.cancel();
        run_handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_without_panicking() {
        let store = Arc::new(ScriptedStore {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(Vec::new()),
        });
        let (tx, _rx) = crate::channel::channel(8);
        let mut config = WorkerConfig::default();
        config.polling_interval_ms = 5;

        let worker = WorkerLoop::new(
            WorkClass::Inbox,
            store,
            AlwaysReady,
            tx,
            config,
            InstanceId::new(),
            "svc",
            "host",
            1,
        );
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        worker.run(cancellation).await;
    }

    #[tokio::test]
    async fn result_sink_feeds_the_next_poll_request() {
        let store = Arc::new(ScriptedStore {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(Vec::new()),
        });
        let (tx, _rx) = crate::channel::channel(8);
        let worker = WorkerLoop::new(
            WorkClass::Perspective,
            store,
            AlwaysReady,
            tx,
            WorkerConfig::default(),
            InstanceId::new(),
            "svc",
            "host",
            1,
        );
        let sink = worker.result_sink();
        sink.complete(MessageCompletion {
            message_id: wh_core::MessageId::new(),
            completed_status: wh_core::StatusFlags::PERSPECTIVE_PROCESSED_ASYNC,
        })
        .await;
        let bags = worker.bags.lock().await;
        assert_eq!(bags.completions.len(), 1);
    }
}
