//! The ingestion pipeline: the substrate's single write path.
//!
//! `ingest` runs a fixed sequence of stages. Validation and the structured
//! persist are required -- their failure aborts the call with an `error`
//! result and no partial writes. Every later stage (projection, embedding,
//! artifacts, lineage check) is independently fallible: failures are caught,
//! logged, and accumulated into the result's error message while the status
//! degrades to `partial`. The graph mirror is pure best-effort; its failures
//! never appear in the result at all.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use mnemon_types::config::IngestPolicy;
use mnemon_types::error::MnemonResult;
use mnemon_types::graph::{GraphEntity, GraphEvent, GraphOp, GraphRelationship};
use mnemon_types::packet::{Lineage, Packet, PacketId, PacketOptions};
use mnemon_types::substrate::{IngestRequest, MemoryEvent, WriteResult, WriteStatus};

use crate::graph::GraphMirrorHandle;
use crate::repository::PacketRepository;
use crate::semantic::SemanticStore;

/// Payload keys probed for embeddable text, checked in this order.
pub const EMBEDDABLE_KEYS: [&str; 5] = ["text", "content", "description", "summary", "message"];

/// Maximum summary length in the memory-event projection.
const SUMMARY_MAX_LEN: usize = 240;

/// The multi-stage write path over the repository, semantic store, and
/// graph mirror.
pub struct IngestionPipeline {
    repo: Arc<dyn PacketRepository>,
    semantic: SemanticStore,
    graph: Option<GraphMirrorHandle>,
    policy: IngestPolicy,
}

impl IngestionPipeline {
    pub fn new(
        repo: Arc<dyn PacketRepository>,
        semantic: SemanticStore,
        graph: Option<GraphMirrorHandle>,
        policy: IngestPolicy,
    ) -> Self {
        Self {
            repo,
            semantic,
            graph,
            policy,
        }
    }

    /// Ingest one packet request. Always returns a [`WriteResult`]; every
    /// non-`ok` status carries a non-empty error message.
    pub async fn ingest(&self, request: IngestRequest) -> WriteResult {
        // Stage 1: validate. Any failure short-circuits with nothing written.
        if let Err(message) = self.validate(&request) {
            return WriteResult::rejected(message);
        }

        // Stages 2-3: materialize into a packet, merging auto-tags.
        let packet = match self.materialize(request) {
            Ok(packet) => packet,
            Err(e) => return WriteResult::rejected(format!("materialize: {e}")),
        };

        let mut written: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        // Stage 4: structured persist (required).
        if let Err(e) = self.repo.insert_packet(&packet).await {
            return WriteResult {
                packet_id: Some(packet.id()),
                written_tables: Vec::new(),
                status: WriteStatus::Error,
                error_message: Some(format!("packet_store: {e}")),
            };
        }
        written.push("packet_store".to_string());

        // Stage 5: memory-event projection.
        match self.project_memory_event(&packet).await {
            Ok(()) => written.push("agent_memory_events".to_string()),
            Err(e) => errors.push(format!("agent_memory_events: {e}")),
        }

        // Stage 6: embedding, when enabled and the payload carries enough text.
        if self.policy.embed {
            if let Some((key, text)) =
                embeddable_text(packet.payload(), self.policy.min_embed_text_len)
            {
                match self.semantic.embed_and_store(&packet, text).await {
                    Ok(_) => {
                        debug!(packet_id = %packet.id(), key, "Embedded payload text");
                        written.push("semantic_memory".to_string());
                    }
                    Err(e) => errors.push(format!("semantic_memory: {e}")),
                }
            }
        }

        // Stage 7: record payload artifacts.
        if let Err(e) = self.record_artifacts(&packet).await {
            errors.push(format!("artifacts: {e}"));
        }

        // Stage 8: lineage check. Dangling parents are logged, never failed.
        if let Err(e) = self.check_lineage(&packet).await {
            errors.push(format!("lineage: {e}"));
        }

        // Stage 9: graph mirror (best-effort, excluded from the error list).
        self.mirror_to_graph(&packet);

        let status = if errors.is_empty() {
            WriteStatus::Ok
        } else {
            WriteStatus::Partial
        };
        WriteResult {
            packet_id: Some(packet.id()),
            written_tables: written,
            status,
            error_message: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    /// Structural checks. Failures here abort the whole operation.
    fn validate(&self, request: &IngestRequest) -> Result<(), String> {
        if request.packet_type.trim().is_empty() {
            return Err("packet_type is required".to_string());
        }
        if request.packet_type.len() > self.policy.max_packet_type_len {
            return Err(format!(
                "packet_type exceeds {} characters",
                self.policy.max_packet_type_len
            ));
        }
        if request.payload.is_none() {
            return Err("payload is required (may be empty, not absent)".to_string());
        }
        if let Some(ttl) = request.ttl {
            if ttl <= Utc::now() {
                return Err("ttl must be in the future".to_string());
            }
        }
        if let Some(confidence) = &request.confidence {
            if !(0.0..=1.0).contains(&confidence.score) || confidence.score.is_nan() {
                return Err(format!(
                    "confidence score must be in [0.0, 1.0], got {}",
                    confidence.score
                ));
            }
        }
        Ok(())
    }

    /// Convert the request into a full packet: id, timestamp, defaults,
    /// merged tags, lineage from wire-level parent references, and the
    /// content hash.
    fn materialize(&self, request: IngestRequest) -> MnemonResult<Packet> {
        let payload = request.payload.unwrap_or_default();
        let tags = if self.policy.auto_tag {
            merge_auto_tags(
                &request.tags,
                &request.packet_type,
                request.agent.as_deref(),
                request.domain.as_deref(),
                &payload,
                self.policy.payload_tag_key_limit,
            )
        } else {
            request.tags
        };

        // Wire-level parent references produce a first-generation lineage
        // rooted at the earliest referenced parent; chained derivation goes
        // through Packet::derive instead.
        let lineage = if request.parent_ids.is_empty() {
            None
        } else {
            let parent_ids: BTreeSet<PacketId> = request.parent_ids.iter().copied().collect();
            let root = parent_ids
                .iter()
                .next()
                .copied()
                .unwrap_or_else(PacketId::new);
            Some(Lineage {
                parent_ids,
                generation: 1,
                derivation_type: "ingest".to_string(),
                root_packet_id: root,
            })
        };

        let packet = Packet::new(
            request.packet_type,
            payload,
            PacketOptions {
                agent: request.agent,
                domain: request.domain,
                provenance: request.provenance,
                confidence: request.confidence,
                thread_id: request.thread_id,
                lineage,
                tags,
                ttl: request.ttl,
            },
        )?;
        Ok(packet.with_content_hash())
    }

    async fn project_memory_event(&self, packet: &Packet) -> MnemonResult<()> {
        let summary = embeddable_text(packet.payload(), 1)
            .map(|(_, text)| truncate(text, SUMMARY_MAX_LEN));
        let event = MemoryEvent {
            id: Uuid::new_v4(),
            agent: packet.metadata().and_then(|m| m.agent.clone()),
            packet_id: packet.id(),
            event_type: packet.packet_type().to_string(),
            summary,
            created_at: Utc::now(),
        };
        self.repo.insert_memory_event(&event).await
    }

    /// Record each `payload.artifacts` entry as an artifact event.
    async fn record_artifacts(&self, packet: &Packet) -> MnemonResult<()> {
        let Some(Value::Array(artifacts)) = packet.payload().get("artifacts") else {
            return Ok(());
        };
        for artifact in artifacts {
            let summary = match artifact {
                Value::String(s) => truncate(s, SUMMARY_MAX_LEN),
                other => truncate(&other.to_string(), SUMMARY_MAX_LEN),
            };
            let event = MemoryEvent {
                id: Uuid::new_v4(),
                agent: packet.metadata().and_then(|m| m.agent.clone()),
                packet_id: packet.id(),
                event_type: "artifact".to_string(),
                summary: Some(summary),
                created_at: Utc::now(),
            };
            self.repo.insert_memory_event(&event).await?;
        }
        debug!(
            packet_id = %packet.id(),
            count = artifacts.len(),
            "Recorded payload artifacts"
        );
        Ok(())
    }

    /// Verify referenced parents exist. Dangling references are logged;
    /// repair belongs to housekeeping, and ingestion must never fail on them.
    async fn check_lineage(&self, packet: &Packet) -> MnemonResult<()> {
        let Some(lineage) = packet.lineage() else {
            return Ok(());
        };
        for parent in &lineage.parent_ids {
            if self.repo.get_packet(*parent).await?.is_none() {
                warn!(
                    packet_id = %packet.id(),
                    parent_id = %parent,
                    "Lineage references a nonexistent parent"
                );
            }
        }
        Ok(())
    }

    fn mirror_to_graph(&self, packet: &Packet) {
        let Some(graph) = &self.graph else {
            return;
        };
        let agent = packet.metadata().and_then(|m| m.agent.clone());
        let event_id = format!("packet:{}", packet.id());

        if let Some(agent) = &agent {
            graph.enqueue(GraphOp::Entity(GraphEntity {
                id: format!("agent:{agent}"),
                entity_type: "agent".to_string(),
                name: agent.clone(),
                properties: Map::new(),
            }));
            graph.enqueue(GraphOp::Relationship(GraphRelationship {
                source: event_id.clone(),
                relationship: "emitted_by".to_string(),
                target: format!("agent:{agent}"),
            }));
        }
        if let Some(thread) = packet.thread_id() {
            graph.enqueue(GraphOp::Entity(GraphEntity {
                id: format!("thread:{thread}"),
                entity_type: "thread".to_string(),
                name: thread.to_string(),
                properties: Map::new(),
            }));
            graph.enqueue(GraphOp::Relationship(GraphRelationship {
                source: event_id,
                relationship: "in_thread".to_string(),
                target: format!("thread:{thread}"),
            }));
        }
        graph.enqueue(GraphOp::Event(GraphEvent {
            packet_id: packet.id(),
            packet_type: packet.packet_type().to_string(),
            agent,
            thread_id: packet.thread_id().map(String::from),
            timestamp: packet.timestamp(),
        }));
    }
}

/// Find the first embeddable payload key carrying text of at least
/// `min_len` characters. Keys are probed in the fixed [`EMBEDDABLE_KEYS`]
/// order, not by reflection over the payload.
pub fn embeddable_text(
    payload: &Map<String, Value>,
    min_len: usize,
) -> Option<(&'static str, &str)> {
    for key in EMBEDDABLE_KEYS {
        if let Some(Value::String(text)) = payload.get(key) {
            if text.trim().len() >= min_len {
                return Some((key, text));
            }
        }
    }
    None
}

/// Merge caller tags with auto-derived ones, preserving first-seen order.
///
/// Payload `field:` tags cover the first `key_limit` keys in sorted order,
/// so the tag set is reproducible regardless of map insertion order.
fn merge_auto_tags(
    caller_tags: &[String],
    packet_type: &str,
    agent: Option<&str>,
    domain: Option<&str>,
    payload: &Map<String, Value>,
    key_limit: usize,
) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |tag: String, merged: &mut Vec<String>| {
        if seen.insert(tag.clone()) {
            merged.push(tag);
        }
    };

    for tag in caller_tags {
        push(tag.clone(), &mut merged);
    }
    push(format!("type:{packet_type}"), &mut merged);
    if let Some(agent) = agent {
        push(format!("agent:{agent}"), &mut merged);
    }
    if let Some(domain) = domain {
        push(format!("domain:{domain}"), &mut merged);
    }

    let mut keys: Vec<&String> = payload.keys().collect();
    keys.sort();
    for key in keys.into_iter().take(key_limit) {
        push(format!("field:{key}"), &mut merged);
    }
    merged
}

/// Truncate on a char boundary, for projection summaries.
fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        text.chars().take(max_len).collect()
    }
}
