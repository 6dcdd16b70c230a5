//! Schema registry: version detection and chained upcasting of raw records.
//!
//! Records may arrive (from storage or the wire) under any historical schema
//! version. The registry detects the version and applies a deterministic,
//! ordered chain of single-step transformations until the record matches the
//! current packet model. Each step is pure: it consumes its input and
//! produces a new record, stamping `metadata.schema_version` with its own
//! target version.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::packet::{content_digest, Packet, CURRENT_SCHEMA_VERSION};

/// Every schema version the registry can read, oldest first.
pub const SUPPORTED_VERSIONS: [&str; 5] = ["1.0.0", "1.0.1", "1.1.0", "1.1.1", "2.0.0"];

type UpcastFn = fn(Map<String, Value>) -> Map<String, Value>;

/// A single-step transformation between adjacent schema versions.
struct Upcaster {
    from: &'static str,
    to: &'static str,
    apply: UpcastFn,
}

/// Detects record versions and upcasts them to the current packet model.
pub struct SchemaRegistry {
    chain: Vec<Upcaster>,
}

impl SchemaRegistry {
    /// Build the registry with the full upcast chain registered.
    pub fn new() -> Self {
        Self {
            chain: vec![
                Upcaster {
                    from: "1.0.0",
                    to: "1.0.1",
                    apply: upcast_1_0_0,
                },
                Upcaster {
                    from: "1.0.1",
                    to: "1.1.0",
                    apply: upcast_1_0_1,
                },
                Upcaster {
                    from: "1.1.0",
                    to: "1.1.1",
                    apply: upcast_1_1_0,
                },
                Upcaster {
                    from: "1.1.1",
                    to: "2.0.0",
                    apply: upcast_1_1_1,
                },
            ],
        }
    }

    /// Detect the schema version of a raw record.
    ///
    /// An explicit `metadata.schema_version` wins. Otherwise the version is
    /// inferred from field presence in fixed priority order: a non-null
    /// `content_hash` means the newest version, any of
    /// `thread_id`/`lineage`/`tags` means the intermediate family, and a bare
    /// record means the oldest. Corrupted (non-map) metadata falls back to
    /// the field inference rather than failing.
    pub fn detect_version(&self, raw: &Map<String, Value>) -> String {
        if let Some(Value::Object(meta)) = raw.get("metadata") {
            if let Some(Value::String(version)) = meta.get("schema_version") {
                return version.clone();
            }
        }

        if raw.get("content_hash").is_some_and(|v| !v.is_null()) {
            return "2.0.0".to_string();
        }
        if ["thread_id", "lineage", "tags"]
            .iter()
            .any(|field| raw.contains_key(*field))
        {
            return "1.1.0".to_string();
        }
        "1.0.0".to_string()
    }

    /// Upcast a raw record to `target` through the registered chain.
    ///
    /// A record already at `target` is returned unchanged (identity). A
    /// version with no registered transformation fails with
    /// [`MnemonError::UpcasterNotFound`]; for any version between the oldest
    /// supported and current that is a configuration bug.
    pub fn upcast(
        &self,
        raw: Map<String, Value>,
        target: &str,
    ) -> MnemonResult<Map<String, Value>> {
        let mut version = self.detect_version(&raw);
        if version == target {
            return Ok(raw);
        }

        let mut record = raw;
        while version != target {
            let step = self
                .chain
                .iter()
                .find(|u| u.from == version)
                .ok_or_else(|| MnemonError::UpcasterNotFound(version.clone()))?;
            record = (step.apply)(record);
            version = step.to.to_string();
        }
        Ok(record)
    }

    /// Upcast a raw record to the current version and deserialize it.
    pub fn read_packet(&self, raw: Map<String, Value>) -> MnemonResult<Packet> {
        let current = self.upcast(raw, CURRENT_SCHEMA_VERSION)?;
        serde_json::from_value(Value::Object(current))
            .map_err(|e| MnemonError::Serialization(e.to_string()))
    }

    /// Upcast and deserialize a batch of raw records.
    ///
    /// Single-record failures are logged and skipped; they never abort the
    /// batch. Cost is linear in the batch size.
    pub fn read_packets(&self, batch: Vec<Map<String, Value>>) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(batch.len());
        for raw in batch {
            match self.read_packet(raw) {
                Ok(packet) => packets.push(packet),
                Err(e) => warn!(error = %e, "Skipping unreadable record in batch"),
            }
        }
        packets
    }

    /// Serialize a packet to its wire record (ids/timestamps stringified).
    pub fn write_record(&self, packet: &Packet) -> MnemonResult<Map<String, Value>> {
        match serde_json::to_value(packet) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(MnemonError::Internal(
                "packet serialized to a non-object value".to_string(),
            )),
            Err(e) => Err(MnemonError::Serialization(e.to_string())),
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Ensure `metadata` is an object and stamp its `schema_version`.
fn stamp_version(record: &mut Map<String, Value>, version: &str) {
    let meta = record
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Some(obj) = meta.as_object_mut() {
        obj.insert(
            "schema_version".to_string(),
            Value::String(version.to_string()),
        );
    }
}

/// Insert `key: default` unless the record already carries the key.
fn ensure_field(record: &mut Map<String, Value>, key: &str, default: Value) {
    record.entry(key.to_string()).or_insert(default);
}

/// 1.0.0 -> 1.0.1: normalize metadata into a map.
fn upcast_1_0_0(mut record: Map<String, Value>) -> Map<String, Value> {
    stamp_version(&mut record, "1.0.1");
    record
}

/// 1.0.1 -> 1.1.0: add thread/provenance/confidence defaults.
fn upcast_1_0_1(mut record: Map<String, Value>) -> Map<String, Value> {
    ensure_field(&mut record, "thread_id", Value::Null);
    ensure_field(&mut record, "provenance", Value::Null);
    ensure_field(&mut record, "confidence", Value::Null);
    stamp_version(&mut record, "1.1.0");
    record
}

/// 1.1.0 -> 1.1.1: add lineage and tags defaults.
fn upcast_1_1_0(mut record: Map<String, Value>) -> Map<String, Value> {
    ensure_field(&mut record, "lineage", Value::Null);
    ensure_field(&mut record, "tags", Value::Array(Vec::new()));
    stamp_version(&mut record, "1.1.1");
    record
}

/// 1.1.1 -> 2.0.0: add ttl, stamp the target version, then seal the record
/// with a content hash over `{payload, metadata, timestamp}`.
fn upcast_1_1_1(mut record: Map<String, Value>) -> Map<String, Value> {
    ensure_field(&mut record, "ttl", Value::Null);
    stamp_version(&mut record, "2.0.0");

    let has_hash = record.get("content_hash").is_some_and(|v| !v.is_null());
    if !has_hash {
        let payload = record.get("payload").cloned().unwrap_or(Value::Null);
        let metadata = record.get("metadata").cloned().unwrap_or(Value::Null);
        let timestamp = normalize_timestamp(record.get("timestamp"));
        let digest = content_digest(&payload, &metadata, &timestamp);
        record.insert("content_hash".to_string(), Value::String(digest));
    }
    record
}

/// Normalize a raw timestamp through its parsed form so the digest matches
/// what [`Packet::compute_content_hash`] produces after deserialization,
/// regardless of the wire's RFC 3339 offset spelling.
fn normalize_timestamp(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .and_then(|dt| serde_json::to_value(dt.with_timezone(&Utc)).ok())
            .unwrap_or_else(|| Value::String(s.clone())),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}
