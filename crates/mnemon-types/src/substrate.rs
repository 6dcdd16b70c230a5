//! Wire-facing request and result types for the substrate's write path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::packet::{Confidence, PacketId, Provenance};

/// An incoming write request, before materialization into a [`crate::packet::Packet`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Classifies the record; required and non-empty.
    pub packet_type: String,
    /// The structured document to store. Required; may be empty but not absent.
    pub payload: Option<Map<String, Value>>,
    /// Originating-agent label.
    #[serde(default)]
    pub agent: Option<String>,
    /// Domain tag.
    #[serde(default)]
    pub domain: Option<String>,
    /// Grouping key for multi-turn conversations.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Caller-supplied tags, merged with auto-derived ones.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Absolute expiry instant.
    #[serde(default)]
    pub ttl: Option<DateTime<Utc>>,
    /// Confidence score and rationale.
    #[serde(default)]
    pub confidence: Option<Confidence>,
    /// Source attribution.
    #[serde(default)]
    pub provenance: Option<Provenance>,
    /// Ancestor packet ids to record in lineage.
    #[serde(default)]
    pub parent_ids: Vec<PacketId>,
}

/// Outcome status of an ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// All required stages succeeded.
    Ok,
    /// An optional stage failed but at least one table was written.
    Partial,
    /// Nothing was written.
    Error,
}

impl std::fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Partial => write!(f, "partial"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Result of an ingestion. Callers always receive one; there is no silent
/// data loss -- every non-`ok` status carries a non-empty error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    /// Id of the materialized packet (None when validation failed before
    /// materialization).
    pub packet_id: Option<PacketId>,
    /// Tables that were successfully written.
    pub written_tables: Vec<String>,
    /// Overall outcome.
    pub status: WriteStatus,
    /// Accumulated stage errors, joined; None for `ok`.
    pub error_message: Option<String>,
}

impl WriteResult {
    /// A result for a request rejected before any write happened.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            packet_id: None,
            written_tables: Vec::new(),
            status: WriteStatus::Error,
            error_message: Some(message.into()),
        }
    }
}

/// The agent-scoped event projection of a packet (secondary record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Owning agent, when the packet carried one.
    pub agent: Option<String>,
    /// The packet this event projects.
    pub packet_id: PacketId,
    /// Event classification (normally the packet type).
    pub event_type: String,
    /// Short human-readable summary extracted from the payload.
    pub summary: Option<String>,
    /// When the projection was written.
    pub created_at: DateTime<Utc>,
}

/// A subject-predicate-object fact referencing a packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeFact {
    /// Unique fact id.
    pub id: Uuid,
    /// The packet this fact was extracted from.
    pub packet_id: PacketId,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Confidence in the fact, `[0.0, 1.0]`.
    pub confidence: f64,
    /// When the fact was recorded.
    pub created_at: DateTime<Utc>,
}

/// A ranked hit from semantic search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// The packet whose text matched.
    pub packet_id: PacketId,
    /// The indexed text.
    pub content: String,
    /// Cosine similarity to the query (or 0.0 for text-match fallback).
    pub score: f32,
    /// Packet type of the hit.
    pub packet_type: String,
    /// Thread of the hit, if any.
    pub thread_id: Option<String>,
    /// Agent of the hit, if any.
    pub agent: Option<String>,
}

/// Aggregate health of the substrate and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// "ok" or "degraded".
    pub status: String,
    /// Per-component status strings.
    pub components: HashMap<String, String>,
}
