//! Persistence port and SQLite implementation for the packet store.
//!
//! The substrate treats persistence as an interface: the ingestion pipeline
//! and the GC engine only see [`PacketRepository`]. The bundled
//! implementation backs onto SQLite with the tables created by
//! [`crate::migration`]. Packet rows store the wire JSON in the `record`
//! column and are always read back through the schema registry, so rows
//! written under historical schema versions upcast transparently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::packet::{Packet, PacketId};
use mnemon_types::substrate::{KnowledgeFact, MemoryEvent};

use crate::migration::run_migrations;
use crate::schema::SchemaRegistry;

/// Counts of secondary records whose referenced packet no longer exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanArtifacts {
    pub embeddings: u64,
    pub memory_events: u64,
    pub knowledge_facts: u64,
}

impl OrphanArtifacts {
    /// Total orphaned rows across all secondary tables.
    pub fn total(&self) -> u64 {
        self.embeddings + self.memory_events + self.knowledge_facts
    }
}

/// The persistence port consumed by the pipeline and the GC engine.
#[async_trait]
pub trait PacketRepository: Send + Sync {
    /// Append a packet to the primary table.
    async fn insert_packet(&self, packet: &Packet) -> MnemonResult<()>;

    /// Fetch a packet by id, upcasting historical records.
    async fn get_packet(&self, id: PacketId) -> MnemonResult<Option<Packet>>;

    /// Packets in a thread, newest first, optionally filtered by type.
    async fn search_by_thread(
        &self,
        thread_id: &str,
        packet_type: Option<&str>,
        limit: usize,
    ) -> MnemonResult<Vec<Packet>>;

    /// Packets of a type, newest first, optionally filtered by agent.
    async fn search_by_type(
        &self,
        packet_type: &str,
        agent: Option<&str>,
        limit: usize,
    ) -> MnemonResult<Vec<Packet>>;

    /// Search-before-write primitive for caller-enforced deduplication:
    /// the id of a packet whose `payload.event_id` matches, if any.
    async fn find_by_event_id(&self, event_id: &str) -> MnemonResult<Option<PacketId>>;

    /// Write the agent-scoped event projection of a packet.
    async fn insert_memory_event(&self, event: &MemoryEvent) -> MnemonResult<()>;

    /// Record a subject-predicate-object fact referencing a packet.
    async fn insert_knowledge_fact(&self, fact: &KnowledgeFact) -> MnemonResult<()>;

    /// Cheap liveness probe of the backing store.
    async fn health_check(&self) -> MnemonResult<()>;

    // -- Housekeeping surface (row-scoped queries and deletes) --

    /// Ids of packets whose ttl is before `now`.
    async fn expired_packet_ids(&self, now: DateTime<Utc>) -> MnemonResult<Vec<PacketId>>;

    /// Delete the given packets. Returns the number of rows removed.
    async fn delete_packets(&self, ids: &[PacketId]) -> MnemonResult<u64>;

    /// Packets whose lineage references nonexistent parents, with the
    /// dangling ids.
    async fn dangling_parent_refs(&self) -> MnemonResult<Vec<(PacketId, Vec<PacketId>)>>;

    /// Remove dangling parent ids from one packet's lineage list. The packet
    /// itself is never deleted. Returns the number of ids pruned.
    async fn prune_parent_refs(&self, id: PacketId, dangling: &[PacketId]) -> MnemonResult<u64>;

    /// Packets with no parents and no thread, older than `cutoff`, whose
    /// type is not protected.
    async fn parentless_packet_ids(
        &self,
        cutoff: DateTime<Utc>,
        protected_types: &[String],
    ) -> MnemonResult<Vec<PacketId>>;

    /// Count orphaned secondary records without mutating anything.
    async fn count_orphan_artifacts(&self) -> MnemonResult<OrphanArtifacts>;

    /// Delete orphaned secondary records.
    async fn delete_orphan_artifacts(&self) -> MnemonResult<OrphanArtifacts>;

    /// Number of packets carrying each tag.
    async fn tag_usage(&self) -> MnemonResult<HashMap<String, u64>>;

    /// Strip the given tags from every packet carrying them. Returns the
    /// number of tag occurrences removed.
    async fn strip_tags(&self, tags: &[String]) -> MnemonResult<u64>;
}

/// SQLite-backed repository.
#[derive(Clone)]
pub struct SqlitePacketRepository {
    conn: Arc<Mutex<Connection>>,
    registry: Arc<SchemaRegistry>,
}

impl SqlitePacketRepository {
    /// Wrap an existing connection. Assumes migrations have been run.
    pub fn new(conn: Arc<Mutex<Connection>>, registry: Arc<SchemaRegistry>) -> Self {
        Self { conn, registry }
    }

    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>, registry: Arc<SchemaRegistry>) -> MnemonResult<Self> {
        let conn =
            Connection::open(path).map_err(|e| MnemonError::Repository(e.to_string()))?;
        run_migrations(&conn).map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(Self::new(Arc::new(Mutex::new(conn)), registry))
    }

    /// Open an in-memory database (tests, ephemeral substrates).
    pub fn open_in_memory(registry: Arc<SchemaRegistry>) -> MnemonResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| MnemonError::Repository(e.to_string()))?;
        run_migrations(&conn).map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(Self::new(Arc::new(Mutex::new(conn)), registry))
    }

    /// The shared connection (used by stores layered over the same file).
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> MnemonResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MnemonError::Internal(e.to_string()))
    }

    /// Run a record-returning query and upcast each row through the registry.
    fn query_packets(
        &self,
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> MnemonResult<Vec<Packet>> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| MnemonError::Repository(e.to_string()))?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))
            .map_err(|e| MnemonError::Repository(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let text = row.map_err(|e| MnemonError::Repository(e.to_string()))?;
            match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping malformed packet record"),
            }
        }
        Ok(self.registry.read_packets(records))
    }
}

#[async_trait]
impl PacketRepository for SqlitePacketRepository {
    async fn insert_packet(&self, packet: &Packet) -> MnemonResult<()> {
        let record = self.registry.write_record(packet)?;
        let record_text = serde_json::to_string(&record)
            .map_err(|e| MnemonError::Serialization(e.to_string()))?;
        let parent_ids: Vec<String> = packet
            .lineage()
            .map(|l| l.parent_ids.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default();
        let parent_ids_text = serde_json::to_string(&parent_ids)
            .map_err(|e| MnemonError::Serialization(e.to_string()))?;
        let tags_text = serde_json::to_string(packet.tags())
            .map_err(|e| MnemonError::Serialization(e.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO packet_store (id, packet_type, record, timestamp, thread_id, agent, ttl, parent_ids, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                packet.id().to_string(),
                packet.packet_type(),
                record_text,
                packet.timestamp().to_rfc3339(),
                packet.thread_id(),
                packet.metadata().and_then(|m| m.agent.as_deref()),
                packet.ttl().map(|t| t.to_rfc3339()),
                parent_ids_text,
                tags_text,
            ],
        )
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn get_packet(&self, id: PacketId) -> MnemonResult<Option<Packet>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT record FROM packet_store WHERE id = ?1",
            rusqlite::params![id.to_string()],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(text) => {
                let record: Map<String, Value> = serde_json::from_str(&text)
                    .map_err(|e| MnemonError::Serialization(e.to_string()))?;
                self.registry.read_packet(record).map(Some)
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MnemonError::Repository(e.to_string())),
        }
    }

    async fn search_by_thread(
        &self,
        thread_id: &str,
        packet_type: Option<&str>,
        limit: usize,
    ) -> MnemonResult<Vec<Packet>> {
        let conn = self.lock()?;
        match packet_type {
            Some(ptype) => self.query_packets(
                &conn,
                "SELECT record FROM packet_store WHERE thread_id = ?1 AND packet_type = ?2
                 ORDER BY timestamp DESC LIMIT ?3",
                &[&thread_id, &ptype, &(limit as i64)],
            ),
            None => self.query_packets(
                &conn,
                "SELECT record FROM packet_store WHERE thread_id = ?1
                 ORDER BY timestamp DESC LIMIT ?2",
                &[&thread_id, &(limit as i64)],
            ),
        }
    }

    async fn search_by_type(
        &self,
        packet_type: &str,
        agent: Option<&str>,
        limit: usize,
    ) -> MnemonResult<Vec<Packet>> {
        let conn = self.lock()?;
        match agent {
            Some(agent) => self.query_packets(
                &conn,
                "SELECT record FROM packet_store WHERE packet_type = ?1 AND agent = ?2
                 ORDER BY timestamp DESC LIMIT ?3",
                &[&packet_type, &agent, &(limit as i64)],
            ),
            None => self.query_packets(
                &conn,
                "SELECT record FROM packet_store WHERE packet_type = ?1
                 ORDER BY timestamp DESC LIMIT ?2",
                &[&packet_type, &(limit as i64)],
            ),
        }
    }

    async fn find_by_event_id(&self, event_id: &str) -> MnemonResult<Option<PacketId>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT id FROM packet_store
             WHERE json_extract(record, '$.payload.event_id') = ?1
             ORDER BY timestamp ASC LIMIT 1",
            rusqlite::params![event_id],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(id_text) => uuid::Uuid::parse_str(&id_text)
                .map(PacketId)
                .map(Some)
                .map_err(|e| MnemonError::Repository(e.to_string())),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MnemonError::Repository(e.to_string())),
        }
    }

    async fn insert_memory_event(&self, event: &MemoryEvent) -> MnemonResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_memory_events (id, agent, packet_id, event_type, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                event.id.to_string(),
                event.agent,
                event.packet_id.to_string(),
                event.event_type,
                event.summary,
                event.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn insert_knowledge_fact(&self, fact: &KnowledgeFact) -> MnemonResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO knowledge_facts (id, packet_id, subject, predicate, object, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                fact.id.to_string(),
                fact.packet_id.to_string(),
                fact.subject,
                fact.predicate,
                fact.object,
                fact.confidence,
                fact.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> MnemonResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| MnemonError::Repository(e.to_string()))
    }

    async fn expired_packet_ids(&self, now: DateTime<Utc>) -> MnemonResult<Vec<PacketId>> {
        let conn = self.lock()?;
        collect_ids(
            &conn,
            "SELECT id FROM packet_store WHERE ttl IS NOT NULL AND ttl < ?1",
            &[&now.to_rfc3339()],
        )
    }

    async fn delete_packets(&self, ids: &[PacketId]) -> MnemonResult<u64> {
        let conn = self.lock()?;
        let mut deleted = 0u64;
        for id in ids {
            let n = conn
                .execute(
                    "DELETE FROM packet_store WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                )
                .map_err(|e| MnemonError::Repository(e.to_string()))?;
            deleted += n as u64;
        }
        Ok(deleted)
    }

    async fn dangling_parent_refs(&self) -> MnemonResult<Vec<(PacketId, Vec<PacketId>)>> {
        let conn = self.lock()?;
        let existing = all_packet_ids(&conn)?;

        let mut stmt = conn
            .prepare("SELECT id, parent_ids FROM packet_store WHERE parent_ids != '[]'")
            .map_err(|e| MnemonError::Repository(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| MnemonError::Repository(e.to_string()))?;

        let mut dangling = Vec::new();
        for row in rows {
            let (id_text, parents_text) =
                row.map_err(|e| MnemonError::Repository(e.to_string()))?;
            let Ok(id) = uuid::Uuid::parse_str(&id_text).map(PacketId) else {
                warn!(id = %id_text, "Skipping packet with unparseable id");
                continue;
            };
            let parents: Vec<String> =
                serde_json::from_str(&parents_text).unwrap_or_default();
            let missing: Vec<PacketId> = parents
                .iter()
                .filter(|p| !existing.contains(p.as_str()))
                .filter_map(|p| uuid::Uuid::parse_str(p).ok().map(PacketId))
                .collect();
            if !missing.is_empty() {
                dangling.push((id, missing));
            }
        }
        Ok(dangling)
    }

    async fn prune_parent_refs(&self, id: PacketId, dangling: &[PacketId]) -> MnemonResult<u64> {
        let conn = self.lock()?;
        let record_text: String = conn
            .query_row(
                "SELECT record FROM packet_store WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| MnemonError::Repository(e.to_string()))?;

        let mut record: Map<String, Value> = serde_json::from_str(&record_text)
            .map_err(|e| MnemonError::Serialization(e.to_string()))?;
        let remove: HashSet<String> = dangling.iter().map(|d| d.to_string()).collect();

        let mut pruned = 0u64;
        let mut kept: Vec<String> = Vec::new();
        if let Some(Value::Object(lineage)) = record.get_mut("lineage") {
            if let Some(Value::Array(parents)) = lineage.get_mut("parent_ids") {
                let before = parents.len();
                parents.retain(|p| {
                    p.as_str()
                        .map(|s| !remove.contains(s))
                        .unwrap_or(true)
                });
                pruned = (before - parents.len()) as u64;
                kept = parents
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from))
                    .collect();
            }
        }
        if pruned == 0 {
            return Ok(0);
        }

        let record_text = serde_json::to_string(&record)
            .map_err(|e| MnemonError::Serialization(e.to_string()))?;
        let kept_text = serde_json::to_string(&kept)
            .map_err(|e| MnemonError::Serialization(e.to_string()))?;
        conn.execute(
            "UPDATE packet_store SET record = ?1, parent_ids = ?2 WHERE id = ?3",
            rusqlite::params![record_text, kept_text, id.to_string()],
        )
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(pruned)
    }

    async fn parentless_packet_ids(
        &self,
        cutoff: DateTime<Utc>,
        protected_types: &[String],
    ) -> MnemonResult<Vec<PacketId>> {
        let conn = self.lock()?;
        let placeholders: Vec<String> = (0..protected_types.len())
            .map(|i| format!("?{}", i + 2))
            .collect();
        let sql = format!(
            "SELECT id FROM packet_store
             WHERE parent_ids = '[]'
               AND (thread_id IS NULL OR thread_id = '')
               AND timestamp < ?1
               AND packet_type NOT IN ({})",
            placeholders.join(", ")
        );

        let cutoff_text = cutoff.to_rfc3339();
        let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&cutoff_text];
        for ptype in protected_types {
            params.push(ptype);
        }
        collect_ids(&conn, &sql, &params)
    }

    async fn count_orphan_artifacts(&self) -> MnemonResult<OrphanArtifacts> {
        let conn = self.lock()?;
        let count = |table: &str| -> MnemonResult<u64> {
            conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {table}
                     WHERE packet_id NOT IN (SELECT id FROM packet_store)"
                ),
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(|e| MnemonError::Repository(e.to_string()))
        };
        Ok(OrphanArtifacts {
            embeddings: count("semantic_memory")?,
            memory_events: count("agent_memory_events")?,
            knowledge_facts: count("knowledge_facts")?,
        })
    }

    async fn delete_orphan_artifacts(&self) -> MnemonResult<OrphanArtifacts> {
        let conn = self.lock()?;
        let purge = |table: &str| -> MnemonResult<u64> {
            conn.execute(
                &format!(
                    "DELETE FROM {table}
                     WHERE packet_id NOT IN (SELECT id FROM packet_store)"
                ),
                [],
            )
            .map(|n| n as u64)
            .map_err(|e| MnemonError::Repository(e.to_string()))
        };
        Ok(OrphanArtifacts {
            embeddings: purge("semantic_memory")?,
            memory_events: purge("agent_memory_events")?,
            knowledge_facts: purge("knowledge_facts")?,
        })
    }

    async fn tag_usage(&self) -> MnemonResult<HashMap<String, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT tags FROM packet_store WHERE tags != '[]'")
            .map_err(|e| MnemonError::Repository(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| MnemonError::Repository(e.to_string()))?;

        let mut usage: HashMap<String, u64> = HashMap::new();
        for row in rows {
            let tags_text = row.map_err(|e| MnemonError::Repository(e.to_string()))?;
            let tags: Vec<String> = serde_json::from_str(&tags_text).unwrap_or_default();
            // A tag repeated on one packet still counts as one use.
            let distinct: HashSet<String> = tags.into_iter().collect();
            for tag in distinct {
                *usage.entry(tag).or_insert(0) += 1;
            }
        }
        Ok(usage)
    }

    async fn strip_tags(&self, tags: &[String]) -> MnemonResult<u64> {
        if tags.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let remove: HashSet<&str> = tags.iter().map(String::as_str).collect();

        let mut stmt = conn
            .prepare("SELECT id, tags, record FROM packet_store WHERE tags != '[]'")
            .map_err(|e| MnemonError::Repository(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| MnemonError::Repository(e.to_string()))?;

        let mut updates = Vec::new();
        let mut removed = 0u64;
        for row in rows {
            let (id, tags_text, record_text) =
                row.map_err(|e| MnemonError::Repository(e.to_string()))?;
            let current: Vec<String> = serde_json::from_str(&tags_text).unwrap_or_default();
            let kept: Vec<String> = current
                .iter()
                .filter(|t| !remove.contains(t.as_str()))
                .cloned()
                .collect();
            if kept.len() == current.len() {
                continue;
            }
            removed += (current.len() - kept.len()) as u64;

            let mut record: Map<String, Value> = serde_json::from_str(&record_text)
                .map_err(|e| MnemonError::Serialization(e.to_string()))?;
            record.insert(
                "tags".to_string(),
                Value::Array(kept.iter().cloned().map(Value::String).collect()),
            );
            let record_text = serde_json::to_string(&record)
                .map_err(|e| MnemonError::Serialization(e.to_string()))?;
            let kept_text = serde_json::to_string(&kept)
                .map_err(|e| MnemonError::Serialization(e.to_string()))?;
            updates.push((id, kept_text, record_text));
        }
        drop(stmt);

        for (id, kept_text, record_text) in updates {
            conn.execute(
                "UPDATE packet_store SET tags = ?1, record = ?2 WHERE id = ?3",
                rusqlite::params![kept_text, record_text, id],
            )
            .map_err(|e| MnemonError::Repository(e.to_string()))?;
        }
        Ok(removed)
    }
}

/// All packet ids as strings (for orphan scans).
fn all_packet_ids(conn: &Connection) -> MnemonResult<HashSet<String>> {
    let mut stmt = conn
        .prepare("SELECT id FROM packet_store")
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
    let mut ids = HashSet::new();
    for row in rows {
        ids.insert(row.map_err(|e| MnemonError::Repository(e.to_string()))?);
    }
    Ok(ids)
}

/// Run an id-returning query and parse the rows into packet ids.
fn collect_ids(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> MnemonResult<Vec<PacketId>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(|e| MnemonError::Repository(e.to_string()))?;

    let mut ids = Vec::new();
    for row in rows {
        let text = row.map_err(|e| MnemonError::Repository(e.to_string()))?;
        match uuid::Uuid::parse_str(&text) {
            Ok(id) => ids.push(PacketId(id)),
            Err(e) => warn!(id = %text, error = %e, "Skipping unparseable packet id"),
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mnemon_types::packet::{Lineage, PacketOptions};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn setup() -> SqlitePacketRepository {
        SqlitePacketRepository::open_in_memory(Arc::new(SchemaRegistry::new())).unwrap()
    }

    fn packet(ptype: &str, opts: PacketOptions) -> Packet {
        let mut payload = Map::new();
        payload.insert("text".to_string(), json!("repository test payload"));
        Packet::new(ptype, payload, opts)
            .unwrap()
            .with_content_hash()
    }

    /// Insert a raw row directly, bypassing packet validation (for rows that
    /// could only exist historically, e.g. an already-expired ttl).
    fn insert_raw(
        repo: &SqlitePacketRepository,
        id: &str,
        ptype: &str,
        timestamp: DateTime<Utc>,
        thread_id: Option<&str>,
        ttl: Option<DateTime<Utc>>,
    ) {
        let record = json!({
            "id": id,
            "packet_type": ptype,
            "payload": {},
            "timestamp": timestamp.to_rfc3339(),
        });
        let conn = repo.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO packet_store (id, packet_type, record, timestamp, thread_id, agent, ttl, parent_ids, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, '[]', '[]')",
            rusqlite::params![
                id,
                ptype,
                record.to_string(),
                timestamp.to_rfc3339(),
                thread_id,
                ttl.map(|t| t.to_rfc3339()),
            ],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let repo = setup();
        let p = packet("event", PacketOptions::default());
        repo.insert_packet(&p).await.unwrap();

        let loaded = repo.get_packet(p.id()).await.unwrap().unwrap();
        assert_eq!(loaded, p);
        assert!(loaded.verify_integrity());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let repo = setup();
        assert!(repo.get_packet(PacketId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_by_thread_with_type_filter() {
        let repo = setup();
        let opts = |t: &str| PacketOptions {
            thread_id: Some(t.to_string()),
            ..Default::default()
        };
        repo.insert_packet(&packet("event", opts("t-1"))).await.unwrap();
        repo.insert_packet(&packet("note", opts("t-1"))).await.unwrap();
        repo.insert_packet(&packet("event", opts("t-2"))).await.unwrap();

        let hits = repo.search_by_thread("t-1", None, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = repo.search_by_thread("t-1", Some("note"), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].packet_type(), "note");
    }

    #[tokio::test]
    async fn test_search_by_type_with_agent_filter() {
        let repo = setup();
        let opts = |a: &str| PacketOptions {
            agent: Some(a.to_string()),
            ..Default::default()
        };
        repo.insert_packet(&packet("event", opts("alice"))).await.unwrap();
        repo.insert_packet(&packet("event", opts("bob"))).await.unwrap();

        let hits = repo.search_by_type("event", None, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = repo
            .search_by_type("event", Some("alice"), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_event_id() {
        let repo = setup();
        let mut payload = Map::new();
        payload.insert("event_id".to_string(), json!("evt-42"));
        let p = Packet::new("event", payload, PacketOptions::default()).unwrap();
        repo.insert_packet(&p).await.unwrap();

        let found = repo.find_by_event_id("evt-42").await.unwrap();
        assert_eq!(found, Some(p.id()));
        assert!(repo.find_by_event_id("evt-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_and_delete() {
        let repo = setup();
        let now = Utc::now();
        insert_raw(&repo, &PacketId::new().to_string(), "event", now, None, Some(now - Duration::seconds(1)));
        let keep = packet(
            "event",
            PacketOptions {
                ttl: Some(now + Duration::hours(1)),
                ..Default::default()
            },
        );
        repo.insert_packet(&keep).await.unwrap();

        let expired = repo.expired_packet_ids(now).await.unwrap();
        assert_eq!(expired.len(), 1);

        let deleted = repo.delete_packets(&expired).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.get_packet(keep.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dangling_refs_detected_and_pruned() {
        let repo = setup();
        let parent = packet("event", PacketOptions::default());
        repo.insert_packet(&parent).await.unwrap();

        let ghost = PacketId::new();
        let mut parent_ids = BTreeSet::new();
        parent_ids.insert(parent.id());
        parent_ids.insert(ghost);
        let child = packet(
            "event",
            PacketOptions {
                lineage: Some(Lineage {
                    parent_ids,
                    generation: 1,
                    derivation_type: "transform".to_string(),
                    root_packet_id: parent.id(),
                }),
                ..Default::default()
            },
        );
        repo.insert_packet(&child).await.unwrap();

        let dangling = repo.dangling_parent_refs().await.unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].0, child.id());
        assert_eq!(dangling[0].1, vec![ghost]);

        let pruned = repo.prune_parent_refs(child.id(), &dangling[0].1).await.unwrap();
        assert_eq!(pruned, 1);

        // The packet survives with the live parent intact.
        let reloaded = repo.get_packet(child.id()).await.unwrap().unwrap();
        let lineage = reloaded.lineage().unwrap();
        assert!(lineage.parent_ids.contains(&parent.id()));
        assert!(!lineage.parent_ids.contains(&ghost));
        assert!(repo.dangling_parent_refs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parentless_candidates_respect_protections() {
        let repo = setup();
        let old = Utc::now() - Duration::hours(100);
        let protected = vec!["root".to_string(), "session_start".to_string()];

        insert_raw(&repo, &PacketId::new().to_string(), "event", old, None, None);
        insert_raw(&repo, &PacketId::new().to_string(), "root", old, None, None);
        insert_raw(&repo, &PacketId::new().to_string(), "event", old, Some("t-1"), None);
        // Too young to reclaim.
        insert_raw(&repo, &PacketId::new().to_string(), "event", Utc::now(), None, None);

        let cutoff = Utc::now() - Duration::hours(72);
        let candidates = repo
            .parentless_packet_ids(cutoff, &protected)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_orphan_artifacts_count_and_delete() {
        let repo = setup();
        let live = packet("event", PacketOptions::default());
        repo.insert_packet(&live).await.unwrap();

        let event = MemoryEvent {
            id: uuid::Uuid::new_v4(),
            agent: None,
            packet_id: live.id(),
            event_type: "event".to_string(),
            summary: None,
            created_at: Utc::now(),
        };
        repo.insert_memory_event(&event).await.unwrap();

        let orphan_event = MemoryEvent {
            packet_id: PacketId::new(),
            id: uuid::Uuid::new_v4(),
            ..event.clone()
        };
        repo.insert_memory_event(&orphan_event).await.unwrap();

        let fact = KnowledgeFact {
            id: uuid::Uuid::new_v4(),
            packet_id: PacketId::new(),
            subject: "s".to_string(),
            predicate: "p".to_string(),
            object: "o".to_string(),
            confidence: 0.9,
            created_at: Utc::now(),
        };
        repo.insert_knowledge_fact(&fact).await.unwrap();

        let counts = repo.count_orphan_artifacts().await.unwrap();
        assert_eq!(counts.memory_events, 1);
        assert_eq!(counts.knowledge_facts, 1);
        assert_eq!(counts.total(), 2);

        let deleted = repo.delete_orphan_artifacts().await.unwrap();
        assert_eq!(deleted.total(), 2);
        assert_eq!(repo.count_orphan_artifacts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_tag_usage_and_strip() {
        let repo = setup();
        let with_tags = |tags: &[&str]| PacketOptions {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        repo.insert_packet(&packet("event", with_tags(&["common", "rare"])))
            .await
            .unwrap();
        repo.insert_packet(&packet("event", with_tags(&["common"])))
            .await
            .unwrap();

        let usage = repo.tag_usage().await.unwrap();
        assert_eq!(usage.get("common"), Some(&2));
        assert_eq!(usage.get("rare"), Some(&1));

        let removed = repo.strip_tags(&["rare".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        let usage = repo.tag_usage().await.unwrap();
        assert!(!usage.contains_key("rare"));
        assert_eq!(usage.get("common"), Some(&2));
    }

    #[tokio::test]
    async fn test_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("substrate.db");
        let registry = Arc::new(SchemaRegistry::new());

        let repo = SqlitePacketRepository::open(&path, Arc::clone(&registry)).unwrap();
        let p = packet("event", PacketOptions::default());
        repo.insert_packet(&p).await.unwrap();
        drop(repo);

        // Reopen and read back.
        let repo = SqlitePacketRepository::open(&path, registry).unwrap();
        assert!(repo.get_packet(p.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_health_check() {
        let repo = setup();
        assert!(repo.health_check().await.is_ok());
    }
}
