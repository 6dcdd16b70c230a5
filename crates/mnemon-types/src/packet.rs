//! The packet model: the immutable atomic unit of the memory substrate.
//!
//! A [`Packet`] is never modified after construction. Any "change" is
//! expressed by deriving a brand-new packet via [`Packet::derive`], which
//! populates lineage (parent ids, generation, root) on the child. Fields are
//! private; the only entry points are the constructor, the derivation helper,
//! and serde (used by the schema registry when reading stored records).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{MnemonError, MnemonResult};

/// The schema version new packets are written under.
pub const CURRENT_SCHEMA_VERSION: &str = "2.0.0";

/// Unique identifier for a packet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PacketId(pub Uuid);

impl PacketId {
    /// Create a new random PacketId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PacketId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet metadata: schema version plus originating-agent and domain labels.
///
/// Unknown keys survive a round-trip through the `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketMetadata {
    /// Schema version this record was written under.
    pub schema_version: String,
    /// Label of the agent that produced the packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Domain tag (e.g. "research", "ops").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Unknown metadata fields, preserved through round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for PacketMetadata {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            agent: None,
            domain: None,
            extra: Map::new(),
        }
    }
}

/// Free-form source attribution for a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Where the packet came from (channel, subsystem, URL, ...).
    pub source: String,
    /// Single-parent shorthand used by the derivation helper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_packet: Option<PacketId>,
}

/// A confidence score in `[0.0, 1.0]` with free-text rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    /// The score. Construction of a packet rejects out-of-range values.
    pub score: f64,
    /// Why the score is what it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// DAG-shaped derivation history relating a packet to its ancestors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    /// Ids of the direct ancestors of this packet.
    pub parent_ids: BTreeSet<PacketId>,
    /// Distance in derivation steps from the lineage root.
    pub generation: u32,
    /// How the packet was derived ("mutation", "transform", ...).
    pub derivation_type: String,
    /// The ultimate ancestor, propagated unchanged through the chain.
    pub root_packet_id: PacketId,
}

/// Optional fields accepted by [`Packet::new`].
#[derive(Debug, Clone, Default)]
pub struct PacketOptions {
    /// Originating-agent label for the metadata block.
    pub agent: Option<String>,
    /// Domain tag for the metadata block.
    pub domain: Option<String>,
    /// Source attribution.
    pub provenance: Option<Provenance>,
    /// Confidence score and rationale.
    pub confidence: Option<Confidence>,
    /// Grouping key for multi-turn conversations.
    pub thread_id: Option<String>,
    /// Pre-built lineage (normally left to [`Packet::derive`]).
    pub lineage: Option<Lineage>,
    /// Free-text labels.
    pub tags: Vec<String>,
    /// Absolute expiry instant; must be in the future at creation time.
    pub ttl: Option<DateTime<Utc>>,
}

/// Field changes applied when deriving a new packet from an existing one.
///
/// Unset fields are carried over from the original unchanged.
#[derive(Debug, Clone, Default)]
pub struct Derivation {
    /// Replacement payload.
    pub payload: Option<Map<String, Value>>,
    /// Replacement tag list.
    pub tags: Option<Vec<String>>,
    /// Replacement confidence.
    pub confidence: Option<Confidence>,
    /// How the child was derived; defaults to "mutation".
    pub derivation_type: Option<String>,
    /// Additional ancestors beyond the original packet.
    pub extra_parents: Vec<PacketId>,
}

/// The immutable atomic unit of memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    id: PacketId,
    packet_type: String,
    payload: Map<String, Value>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<PacketMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lineage: Option<Lineage>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_hash: Option<String>,
    /// Unknown wire fields, preserved through round-trip.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Packet {
    /// Construct a new packet.
    ///
    /// Validates: non-empty `packet_type`, confidence score in `[0, 1]`, and
    /// `ttl` strictly in the future. The content hash is not populated here;
    /// call [`Packet::with_content_hash`] to seal the packet.
    pub fn new(
        packet_type: impl Into<String>,
        payload: Map<String, Value>,
        opts: PacketOptions,
    ) -> MnemonResult<Self> {
        let packet_type = packet_type.into();
        if packet_type.trim().is_empty() {
            return Err(MnemonError::Validation(
                "packet_type must be non-empty".to_string(),
            ));
        }
        validate_confidence(opts.confidence.as_ref())?;
        if let Some(ttl) = opts.ttl {
            if ttl <= Utc::now() {
                return Err(MnemonError::Validation(format!(
                    "ttl must be in the future, got {ttl}"
                )));
            }
        }

        Ok(Self {
            id: PacketId::new(),
            packet_type,
            payload,
            timestamp: Utc::now(),
            metadata: Some(PacketMetadata {
                schema_version: CURRENT_SCHEMA_VERSION.to_string(),
                agent: opts.agent,
                domain: opts.domain,
                extra: Map::new(),
            }),
            provenance: opts.provenance,
            confidence: opts.confidence,
            thread_id: opts.thread_id,
            lineage: opts.lineage,
            tags: opts.tags,
            ttl: opts.ttl,
            content_hash: None,
            extra: Map::new(),
        })
    }

    /// Derive a new packet from this one.
    ///
    /// The child gets a fresh id and timestamp, lineage whose `parent_ids`
    /// include this packet's id, `generation` one greater than this packet's
    /// (which counts as 0 when it has no lineage), and `root_packet_id`
    /// carried from this packet's lineage or set to this packet's own id on
    /// the first derivation. The thread is inherited: lineage chains never
    /// cross thread boundaries implicitly.
    pub fn derive(&self, changes: Derivation) -> MnemonResult<Self> {
        validate_confidence(changes.confidence.as_ref())?;

        let mut parent_ids: BTreeSet<PacketId> = changes.extra_parents.into_iter().collect();
        parent_ids.insert(self.id);

        let lineage = Lineage {
            parent_ids,
            generation: self.generation() + 1,
            derivation_type: changes
                .derivation_type
                .unwrap_or_else(|| "mutation".to_string()),
            root_packet_id: self
                .lineage
                .as_ref()
                .map(|l| l.root_packet_id)
                .unwrap_or(self.id),
        };

        let mut metadata = self.metadata.clone().unwrap_or_default();
        metadata.schema_version = CURRENT_SCHEMA_VERSION.to_string();

        let provenance = Provenance {
            source: self
                .provenance
                .as_ref()
                .map(|p| p.source.clone())
                .unwrap_or_else(|| "derivation".to_string()),
            parent_packet: Some(self.id),
        };

        let child = Self {
            id: PacketId::new(),
            packet_type: self.packet_type.clone(),
            payload: changes.payload.unwrap_or_else(|| self.payload.clone()),
            timestamp: Utc::now(),
            metadata: Some(metadata),
            provenance: Some(provenance),
            confidence: changes.confidence.or_else(|| self.confidence.clone()),
            thread_id: self.thread_id.clone(),
            lineage: Some(lineage),
            tags: changes.tags.unwrap_or_else(|| self.tags.clone()),
            ttl: None,
            content_hash: None,
            extra: Map::new(),
        };
        Ok(child.with_content_hash())
    }

    /// Compute the SHA-256 hex digest over the canonical serialization of
    /// `{payload, metadata, timestamp}`.
    pub fn compute_content_hash(&self) -> String {
        content_digest(
            &Value::Object(self.payload.clone()),
            &serde_json::to_value(&self.metadata).unwrap_or(Value::Null),
            &serde_json::to_value(self.timestamp).unwrap_or(Value::Null),
        )
    }

    /// Return a copy of this packet with the content hash populated.
    pub fn with_content_hash(mut self) -> Self {
        self.content_hash = Some(self.compute_content_hash());
        self
    }

    /// Check the stored content hash against a recomputation.
    ///
    /// Returns false when the hash is absent or does not match. This is a
    /// boolean tamper check, not a validation error.
    pub fn verify_integrity(&self) -> bool {
        match &self.content_hash {
            Some(hash) => *hash == self.compute_content_hash(),
            None => false,
        }
    }

    /// This packet's distance from its lineage root (0 when it has none).
    pub fn generation(&self) -> u32 {
        self.lineage.as_ref().map(|l| l.generation).unwrap_or(0)
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn packet_type(&self) -> &str {
        &self.packet_type
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> Option<&PacketMetadata> {
        self.metadata.as_ref()
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    pub fn confidence(&self) -> Option<&Confidence> {
        self.confidence.as_ref()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn lineage(&self) -> Option<&Lineage> {
        self.lineage.as_ref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn ttl(&self) -> Option<DateTime<Utc>> {
        self.ttl
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    /// The schema version recorded in the metadata block, if any.
    pub fn schema_version(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.schema_version.as_str())
    }
}

fn validate_confidence(confidence: Option<&Confidence>) -> MnemonResult<()> {
    if let Some(c) = confidence {
        if !(0.0..=1.0).contains(&c.score) || c.score.is_nan() {
            return Err(MnemonError::Validation(format!(
                "confidence score must be in [0.0, 1.0], got {}",
                c.score
            )));
        }
    }
    Ok(())
}

/// SHA-256 hex digest over the canonical JSON of `{payload, metadata,
/// timestamp}`.
///
/// Shared between [`Packet::compute_content_hash`] and the schema registry's
/// upcast to the current version, so both produce identical digests for the
/// same logical record.
pub fn content_digest(payload: &Value, metadata: &Value, timestamp: &Value) -> String {
    let body = serde_json::json!({
        "metadata": metadata,
        "payload": payload,
        "timestamp": timestamp,
    });
    let canonical = canonical_json(&body);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize a JSON value with object keys recursively sorted, so the digest
/// is independent of map insertion order. Null-valued object keys are
/// dropped: an absent field and an explicit null hash identically, which
/// keeps digests stable across upcasting and deserialization.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| !map[*k].is_null()).collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let key = serde_json::to_string(k).unwrap_or_else(|_| format!("\"{k}\""));
                    format!("{}:{}", key, canonical_json(&map[k]))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn payload_with(key: &str, value: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        map
    }

    #[test]
    fn test_new_packet_defaults() {
        let p = Packet::new(
            "event",
            payload_with("text", Value::String("hello".into())),
            PacketOptions::default(),
        )
        .unwrap();
        assert_eq!(p.packet_type(), "event");
        assert_eq!(p.schema_version(), Some(CURRENT_SCHEMA_VERSION));
        assert!(p.lineage().is_none());
        assert!(p.content_hash().is_none());
        assert_eq!(p.generation(), 0);
    }

    #[test]
    fn test_empty_packet_type_rejected() {
        let err = Packet::new("  ", Map::new(), PacketOptions::default()).unwrap_err();
        assert!(matches!(err, MnemonError::Validation(_)));
    }

    #[test]
    fn test_confidence_bounds() {
        for score in [0.0, 1.0, 0.5] {
            let opts = PacketOptions {
                confidence: Some(Confidence {
                    score,
                    rationale: None,
                }),
                ..Default::default()
            };
            assert!(Packet::new("event", Map::new(), opts).is_ok());
        }
        for score in [-0.1, 1.5] {
            let opts = PacketOptions {
                confidence: Some(Confidence {
                    score,
                    rationale: None,
                }),
                ..Default::default()
            };
            let err = Packet::new("event", Map::new(), opts).unwrap_err();
            assert!(matches!(err, MnemonError::Validation(_)));
        }
    }

    #[test]
    fn test_ttl_in_past_rejected() {
        let opts = PacketOptions {
            ttl: Some(Utc::now() - Duration::seconds(1)),
            ..Default::default()
        };
        let err = Packet::new("event", Map::new(), opts).unwrap_err();
        assert!(matches!(err, MnemonError::Validation(_)));

        let opts = PacketOptions {
            ttl: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        };
        assert!(Packet::new("event", Map::new(), opts).is_ok());
    }

    #[test]
    fn test_content_hash_verifies() {
        let p = Packet::new(
            "event",
            payload_with("text", Value::String("hello".into())),
            PacketOptions::default(),
        )
        .unwrap()
        .with_content_hash();
        assert!(p.verify_integrity());
    }

    #[test]
    fn test_missing_hash_fails_verification() {
        let p = Packet::new("event", Map::new(), PacketOptions::default()).unwrap();
        assert!(!p.verify_integrity());
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let mut p = Packet::new(
            "event",
            payload_with("text", Value::String("hello".into())),
            PacketOptions::default(),
        )
        .unwrap()
        .with_content_hash();
        p.payload
            .insert("text".to_string(), Value::String("tampered".into()));
        assert!(!p.verify_integrity());
    }

    #[test]
    fn test_tampered_metadata_fails_verification() {
        let mut p = Packet::new("event", Map::new(), PacketOptions::default())
            .unwrap()
            .with_content_hash();
        if let Some(meta) = p.metadata.as_mut() {
            meta.agent = Some("intruder".to_string());
        }
        assert!(!p.verify_integrity());
    }

    #[test]
    fn test_tampered_timestamp_fails_verification() {
        let mut p = Packet::new("event", Map::new(), PacketOptions::default())
            .unwrap()
            .with_content_hash();
        p.timestamp = p.timestamp + Duration::seconds(1);
        assert!(!p.verify_integrity());
    }

    #[test]
    fn test_derivation_chain_generation_and_root() {
        let p0 = Packet::new("event", Map::new(), PacketOptions::default()).unwrap();
        let p1 = p0.derive(Derivation::default()).unwrap();
        let p2 = p1.derive(Derivation::default()).unwrap();
        let p3 = p2.derive(Derivation::default()).unwrap();

        assert_eq!(p1.generation(), 1);
        assert_eq!(p2.generation(), 2);
        assert_eq!(p3.generation(), 3);
        for child in [&p1, &p2, &p3] {
            assert_eq!(child.lineage().unwrap().root_packet_id, p0.id());
        }
        assert!(p1.lineage().unwrap().parent_ids.contains(&p0.id()));
        assert!(p3.lineage().unwrap().parent_ids.contains(&p2.id()));
        assert_eq!(p1.lineage().unwrap().derivation_type, "mutation");
    }

    #[test]
    fn test_derivation_inherits_thread() {
        let opts = PacketOptions {
            thread_id: Some("thread-1".to_string()),
            ..Default::default()
        };
        let p0 = Packet::new("event", Map::new(), opts).unwrap();
        let p1 = p0.derive(Derivation::default()).unwrap();
        assert_eq!(p1.thread_id(), Some("thread-1"));
        assert_eq!(p1.provenance().unwrap().parent_packet, Some(p0.id()));
        assert!(p1.verify_integrity());
    }

    #[test]
    fn test_derivation_rejects_bad_confidence() {
        let p0 = Packet::new("event", Map::new(), PacketOptions::default()).unwrap();
        let changes = Derivation {
            confidence: Some(Confidence {
                score: 2.0,
                rationale: None,
            }),
            ..Default::default()
        };
        assert!(p0.derive(changes).is_err());
    }

    #[test]
    fn test_unknown_fields_preserved_through_round_trip() {
        let p = Packet::new("event", Map::new(), PacketOptions::default()).unwrap();
        let mut raw = serde_json::to_value(&p).unwrap();
        raw.as_object_mut()
            .unwrap()
            .insert("future_field".to_string(), Value::String("kept".into()));

        let reread: Packet = serde_json::from_value(raw).unwrap();
        assert_eq!(
            reread.extra.get("future_field"),
            Some(&Value::String("kept".into()))
        );
        let rewritten = serde_json::to_value(&reread).unwrap();
        assert_eq!(
            rewritten.get("future_field"),
            Some(&Value::String("kept".into()))
        );
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a: Value = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b: Value = serde_json::json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_drops_nulls() {
        let a: Value = serde_json::json!({"a": 1, "b": null});
        let b: Value = serde_json::json!({"a": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
