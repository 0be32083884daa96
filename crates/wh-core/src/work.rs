//! The work-class model: outbox, inbox, and perspective rows share one
//! lease/claim shape (`spec.md` §3, §4.1), distinguished only by which
//! table holds them and what a claimed row is for. Modeling that
//! similarity as one `WorkClass` enum lets the orchestrator write the
//! claim/renew/fail queries once and parameterize by table, instead of
//! the three near-duplicate code paths the table-per-concept model would
//! otherwise force.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, MessageId, StreamId};
use crate::status::StatusFlags;

/// Which of the three work streams a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkClass {
    Outbox,
    Inbox,
    Perspective,
}

impl WorkClass {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkClass::Outbox => "outbox",
            WorkClass::Inbox => "inbox",
            WorkClass::Perspective => "perspective",
        }
    }
}

/// A message offered for admission to the outbox or inbox
/// (`spec.md` §4.2). `destination` is the outbox's routing key;
/// `handler_name` is the inbox's dispatch target — exactly one is set,
/// matching which table the caller is ingesting into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_name: Option<String>,
    pub envelope_type: String,
    pub envelope_data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default)]
    pub is_event: bool,
}

/// A request to ensure a perspective checkpoint row exists for a given
/// `(stream_id, perspective_name)` pair, so the projection runner will
/// eventually claim it. Idempotent: ingesting the same pair repeatedly
/// creates at most one row, matching the dedup-gated shape of
/// `NewMessage` admission. The claim is still leased and cycled through
/// like outbox/inbox work, but per the skeleton decision (`spec.md` §9
/// Open Question 2, recorded in `DESIGN.md`) claiming it only marks it
/// processed — it does not load or apply events, so `last_event_id` is
/// never advanced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPerspectiveCheckpoint {
    pub stream_id: StreamId,
    pub perspective_name: String,
}

/// Outcome of one admission attempt (`spec.md` §4.2 step 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResult {
    pub message_id: MessageId,
    pub stream_id: Option<StreamId>,
    pub was_newly_created: bool,
}

/// A reported completion: OR `completed_status` into the row and clear
/// its lease (`spec.md` §4.1 step 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCompletion {
    pub message_id: MessageId,
    pub completed_status: StatusFlags,
}

/// A reported failure: OR `completed_status` and `FAILED` into the row,
/// record `error`, increment `attempts`, clear the lease, and cascade the
/// release of later same-stream messages held by this instance
/// (`spec.md` §4.1 step 4, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFailure {
    pub message_id: MessageId,
    pub completed_status: StatusFlags,
    pub error: String,
}

/// One claimed row of work, returned to the caller by
/// `process_work_batch` (`spec.md` §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_class: WorkClass,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_number: Option<i32>,
    /// The outbox routing key, set only for `WorkClass::Outbox` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// The inbox dispatch target, set only for `WorkClass::Inbox` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_name: Option<String>,
    pub envelope_type: String,
    pub envelope_data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub status: StatusFlags,
    pub attempts: i32,
    pub sequence_order: i64,
    pub lease_expiry: DateTime<Utc>,
}

/// The result of one orchestrator call: the three work lists plus the
/// instances reaped as stale, for the caller to log (`spec.md` §4.1
/// step 2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkBatch {
    pub outbox_work: Vec<WorkItem>,
    pub inbox_work: Vec<WorkItem>,
    pub perspective_work: Vec<WorkItem>,
    pub reaped_instances: Vec<InstanceId>,
}

impl WorkBatch {
    pub fn is_empty(&self) -> bool {
        self.outbox_work.is_empty()
            && self.inbox_work.is_empty()
            && self.perspective_work.is_empty()
    }

    pub fn items_for(&self, class: WorkClass) -> &[WorkItem] {
        match class {
            WorkClass::Outbox => &self.outbox_work,
            WorkClass::Inbox => &self.inbox_work,
            WorkClass::Perspective => &self.perspective_work,
        }
    }

    pub fn total_items(&self) -> usize {
        self.outbox_work.len() + self.inbox_work.len() + self.perspective_work.len()
    }
}

bitflags::bitflags! {
    /// `spec.md` §4.1 `flags` bitmask controlling orchestrator behavior
    /// for one call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OrchestratorFlags: i32 {
        /// Keep completed rows instead of the caller's delete policy, and
        /// emit extra diagnostic notices.
        const DEBUG_MODE = 1 << 0;
        /// Skip step 7 (claim new work) entirely — used by callers that
        /// only want to flush completions/new messages this call.
        const SKIP_CLAIM = 1 << 1;
    }
}

impl Default for OrchestratorFlags {
    fn default() -> Self {
        OrchestratorFlags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_batch_is_empty_ignores_reaped_instances() {
        let batch = WorkBatch {
            reaped_instances: vec![InstanceId::new()],
            ..Default::default()
        };
        assert!(batch.is_empty());
    }

    #[test]
    fn items_for_selects_matching_class() {
        let item = WorkItem {
            work_class: WorkClass::Inbox,
            message_id: MessageId::new(),
            stream_id: None,
            partition_number: None,
            destination: None,
            handler_name: Some("orders.created".to_string()),
            envelope_type: "Test".to_string(),
            envelope_data: serde_json::json!({}),
            metadata: serde_json::json!({}),
            status: StatusFlags::STORED,
            attempts: 0,
            sequence_order: 1,
            lease_expiry: Utc::now(),
        };
        let batch = WorkBatch {
            inbox_work: vec![item],
            ..Default::default()
        };
        assert_eq!(batch.items_for(WorkClass::Inbox).len(), 1);
        assert_eq!(batch.items_for(WorkClass::Outbox).len(), 0);
        assert_eq!(batch.total_items(), 1);
    }

    #[test]
    fn work_class_as_str_matches_table_prefixes() {
        assert_eq!(WorkClass::Outbox.as_str(), "outbox");
        assert_eq!(WorkClass::Inbox.as_str(), "inbox");
        assert_eq!(WorkClass::Perspective.as_str(), "perspective");
    }
}
