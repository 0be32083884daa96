//! The message envelope and its hop chain (`spec.md` §3, §6).
//!
//! An envelope wraps one opaque payload with an ordered list of hops. Each
//! hop is an immutable stamp recording that one service instance touched
//! the envelope at one point in time, with whatever topic/stream/security
//! context applied there. Hops are appended, never edited: `hops()`
//! returns an immutable slice and the only way to grow the chain is
//! `append_hop`, which takes ownership of the new hop.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, MessageId};

/// Stamp identifying which service instance produced a hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStamp {
    pub service_name: String,
    pub instance_id: InstanceId,
    pub host_name: String,
    pub process_id: u32,
}

/// Security context carried by a hop, if the hop was stamped under an
/// authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

/// One entry in a hop's policy-decision trail (e.g. an authorization or
/// routing decision made while handling this hop).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub policy: String,
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Caller attribution for a hop (e.g. which code path produced it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub member_name: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
}

/// One stamp in the envelope's hop chain.
///
/// Field absence is significant per `spec.md` §6: an absent `topic`
/// means "no topic was set at this hop," not "the topic is empty." All
/// optional fields therefore use `skip_serializing_if`/`#[serde(default)]`
/// rather than defaulting to a sentinel value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hop {
    pub service_instance: ServiceInstanceStamp,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail: Option<Vec<PolicyDecision>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

impl Hop {
    pub fn new(service_instance: ServiceInstanceStamp, timestamp: DateTime<Utc>) -> Self {
        Self {
            service_instance,
            timestamp,
            topic: None,
            stream_key: None,
            partition_index: None,
            sequence_number: None,
            execution_strategy: None,
            security_context: None,
            metadata: HashMap::new(),
            trail: None,
            caller: None,
            duration_ms: None,
            correlation_id: None,
            causation_id: None,
        }
    }
}

/// The in-flight record, immutable once a hop is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub payload: serde_json::Value,
    hops: Vec<Hop>,
}

impl MessageEnvelope {
    pub fn new(message_id: MessageId, payload: serde_json::Value) -> Self {
        Self {
            message_id,
            payload,
            hops: Vec::new(),
        }
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Append a hop to the chain. Earlier hops are never mutated.
    pub fn append_hop(&mut self, hop: Hop) {
        self.hops.push(hop);
    }

    /// The authoritative correlation ID: the first hop's, per the
    /// glossary ("the first hop's correlation ID is authoritative").
    pub fn correlation_id(&self) -> Option<&str> {
        self.hops
            .first()
            .and_then(|h| h.correlation_id.as_deref())
    }

    /// The causation ID of the most recent hop that carries one — the
    /// message or event that caused the latest processing step.
    pub fn causation_id(&self) -> Option<&str> {
        self.hops
            .iter()
            .rev()
            .find_map(|h| h.causation_id.as_deref())
    }

    /// The user identity stamped at the most recent hop that carries a
    /// security context with one set.
    pub fn user_identity(&self) -> Option<&str> {
        self.hops.iter().rev().find_map(|h| {
            h.security_context
                .as_ref()
                .and_then(|s| s.user_id.as_deref())
        })
    }

    /// The tenant stamped at the most recent hop that carries one.
    pub fn tenant_id(&self) -> Option<&str> {
        self.hops.iter().rev().find_map(|h| {
            h.security_context
                .as_ref()
                .and_then(|s| s.tenant_id.as_deref())
        })
    }
}
