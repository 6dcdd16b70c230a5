//! Value types for the best-effort graph mirror side channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::packet::PacketId;

/// An entity node mirrored into the graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEntity {
    /// Stable entity id (e.g. `agent:researcher`, `thread:t-42`).
    pub id: String,
    /// Entity kind ("agent", "thread", ...).
    pub entity_type: String,
    /// Display name.
    pub name: String,
    /// Arbitrary properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// A relationship between two mirrored entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelationship {
    /// Source entity id.
    pub source: String,
    /// Relationship kind ("emitted_by", "in_thread", ...).
    pub relationship: String,
    /// Target entity id.
    pub target: String,
}

/// An event node mirroring an ingested packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEvent {
    /// The mirrored packet.
    pub packet_id: PacketId,
    /// The packet's type.
    pub packet_type: String,
    /// Originating agent, if any.
    pub agent: Option<String>,
    /// Thread, if any.
    pub thread_id: Option<String>,
    /// Packet creation instant.
    pub timestamp: DateTime<Utc>,
}

/// A unit of mirror work queued onto the side channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GraphOp {
    /// Upsert an entity node.
    Entity(GraphEntity),
    /// Create a relationship edge.
    Relationship(GraphRelationship),
    /// Create an event node.
    Event(GraphEvent),
}
