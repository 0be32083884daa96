//! The in-process work channel (`spec.md` §4.4, §5): claimed work items
//! are written here by a scope's flush and picked up by worker-spawned
//! consumer tasks. Multi-producer via cloning the sender half,
//! multi-consumer via sharing the receiver half behind a mutex — the
//! same "one channel, many producers, many consumers" shape the teacher
//! gets from NATS subjects, built here with `tokio::sync::mpsc` since
//! there is no broker in-process.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use wh_core::WorkItem;

use crate::error::RuntimeError;

/// The producer half. Cheaply cloned; every scope flush holds one.
#[derive(Clone)]
pub struct WorkChannel {
    sender: mpsc::Sender<WorkItem>,
}

impl WorkChannel {
    pub async fn send(&self, item: WorkItem) -> Result<(), RuntimeError> {
        self.sender
            .send(item)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}

/// The consumer half. Cheaply cloned; every worker's dispatch tasks hold
/// one, contending for `recv()` on the shared receiver.
#[derive(Clone)]
pub struct WorkChannelConsumer {
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
}

impl WorkChannelConsumer {
    pub async fn recv(&self) -> Option<WorkItem> {
        self.receiver.lock().await.recv().await
    }
}

/// Creates one channel. `capacity` bounds how much claimed work may sit
/// unconsumed before a scope's flush backs up.
pub fn channel(capacity: usize) -> (WorkChannel, WorkChannelConsumer) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        WorkChannel { sender },
        WorkChannelConsumer {
            receiver: Arc::new(Mutex::new(receiver)),
        },
    )
}
