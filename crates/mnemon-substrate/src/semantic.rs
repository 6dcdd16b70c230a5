//! Semantic memory: embedding port and the vector index over packet text.
//!
//! Embeddings are stored as little-endian f32 BLOBs in the
//! `semantic_memory` table. When an embedding driver is configured, search
//! ranks candidates by cosine similarity to the query vector; without one,
//! search falls back to SQLite LIKE matching.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::packet::{Packet, PacketId};
use mnemon_types::substrate::SearchHit;

/// Trait for computing text embeddings.
#[async_trait]
pub trait EmbeddingDriver: Send + Sync {
    /// Compute embedding vectors for a batch of texts.
    async fn embed(&self, texts: &[&str]) -> MnemonResult<Vec<Vec<f32>>>;

    /// Compute embedding for a single text.
    async fn embed_one(&self, text: &str) -> MnemonResult<Vec<f32>> {
        let results = self.embed(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| MnemonError::Embedding("Empty embedding response".to_string()))
    }

    /// Dimensionality of the vectors produced by this driver.
    fn dimensions(&self) -> usize;
}

/// Deterministic hashed bag-of-tokens embedding.
///
/// Not a semantic model: tokens are hashed into a fixed number of buckets
/// and the counts L2-normalized. Useful for offline substrates and tests,
/// where related texts (shared tokens) must rank above unrelated ones
/// without a network embedding provider.
pub struct FixedEmbeddingDriver {
    dims: usize,
}

impl FixedEmbeddingDriver {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dims;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for FixedEmbeddingDriver {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingDriver for FixedEmbeddingDriver {
    async fn embed(&self, texts: &[&str]) -> MnemonResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// The vector index over embeddable packet text.
#[derive(Clone)]
pub struct SemanticStore {
    conn: Arc<Mutex<Connection>>,
    driver: Option<Arc<dyn EmbeddingDriver>>,
}

impl SemanticStore {
    /// Create a store over the shared connection, with an optional driver.
    pub fn new(conn: Arc<Mutex<Connection>>, driver: Option<Arc<dyn EmbeddingDriver>>) -> Self {
        Self { conn, driver }
    }

    fn lock(&self) -> MnemonResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MnemonError::Internal(e.to_string()))
    }

    /// Embed `text` and store it tagged with the packet's id, type, thread,
    /// and agent. Without a driver the row is stored un-embedded and remains
    /// reachable through the LIKE fallback.
    pub async fn embed_and_store(&self, packet: &Packet, text: &str) -> MnemonResult<String> {
        let embedding = match &self.driver {
            Some(driver) => Some(driver.embed_one(text).await?),
            None => None,
        };
        let embedding_bytes = embedding.as_deref().map(embedding_to_bytes);

        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO semantic_memory (id, packet_id, packet_type, thread_id, agent, content, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id,
                packet.id().to_string(),
                packet.packet_type(),
                packet.thread_id(),
                packet.metadata().and_then(|m| m.agent.as_deref()),
                text,
                embedding_bytes,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(id)
    }

    /// Rank stored text against `query`.
    ///
    /// With a driver: fetch a candidate pool and re-rank by cosine
    /// similarity. Without one: LIKE matching, newest first, score 0.0.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        agent: Option<&str>,
    ) -> MnemonResult<Vec<SearchHit>> {
        let query_embedding = match &self.driver {
            Some(driver) if !query.is_empty() => Some(driver.embed_one(query).await?),
            _ => None,
        };

        // Fetch more candidates than requested when re-ranking by vector.
        let fetch_limit = if query_embedding.is_some() {
            (top_k * 10).max(100)
        } else {
            top_k
        };

        let conn = self.lock()?;
        let mut sql = String::from(
            "SELECT packet_id, packet_type, thread_id, agent, content, embedding
             FROM semantic_memory WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut param_idx = 1;

        if query_embedding.is_none() && !query.is_empty() {
            sql.push_str(&format!(" AND content LIKE ?{param_idx}"));
            params.push(Box::new(format!("%{query}%")));
            param_idx += 1;
        }
        if let Some(agent) = agent {
            sql.push_str(&format!(" AND agent = ?{param_idx}"));
            params.push(Box::new(agent.to_string()));
            let _ = param_idx;
        }
        sql.push_str(" ORDER BY created_at DESC");
        sql.push_str(&format!(" LIMIT {fetch_limit}"));

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MnemonError::Repository(e.to_string()))?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<Vec<u8>>>(5)?,
                ))
            })
            .map_err(|e| MnemonError::Repository(e.to_string()))?;

        let mut hits = Vec::new();
        for row in rows {
            let (packet_id, packet_type, thread_id, agent, content, embedding_bytes) =
                row.map_err(|e| MnemonError::Repository(e.to_string()))?;
            let Ok(packet_id) = Uuid::parse_str(&packet_id).map(PacketId) else {
                continue;
            };
            let score = match (&query_embedding, &embedding_bytes) {
                (Some(qe), Some(bytes)) => cosine_similarity(qe, &embedding_from_bytes(bytes)),
                _ => 0.0,
            };
            hits.push(SearchHit {
                packet_id,
                content,
                score,
                packet_type,
                thread_id,
                agent,
            });
        }

        if query_embedding.is_some() {
            hits.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            debug!(
                candidates = hits.len(),
                top_k, "Vector search re-ranked candidates"
            );
        }
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Serialize embedding to bytes for SQLite BLOB storage.
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize embedding from bytes.
fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use mnemon_types::packet::PacketOptions;
    use serde_json::Map;

    fn setup(driver: Option<Arc<dyn EmbeddingDriver>>) -> SemanticStore {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        SemanticStore::new(Arc::new(Mutex::new(conn)), driver)
    }

    fn packet(agent: Option<&str>) -> Packet {
        Packet::new(
            "event",
            Map::new(),
            PacketOptions {
                agent: agent.map(String::from),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_fixed_driver_is_deterministic() {
        let driver = FixedEmbeddingDriver::new(64);
        let a = driver.embed_text("the quick brown fox");
        let b = driver.embed_text("the quick brown fox");
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_fixed_driver_related_texts_rank_higher() {
        let driver = FixedEmbeddingDriver::new(256);
        let query = driver.embed_text("rust memory substrate");
        let related = driver.embed_text("the memory substrate stores packets");
        let unrelated = driver.embed_text("quarterly sales numbers improved");
        assert!(
            cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated)
        );
    }

    #[tokio::test]
    async fn test_embed_store_and_vector_search() {
        let store = setup(Some(Arc::new(FixedEmbeddingDriver::default())));

        store
            .embed_and_store(&packet(None), "the memory substrate stores packets")
            .await
            .unwrap();
        store
            .embed_and_store(&packet(None), "quarterly sales numbers improved")
            .await
            .unwrap();

        let hits = store.search("memory substrate", 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].content.contains("substrate"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_like_fallback_without_driver() {
        let store = setup(None);
        store
            .embed_and_store(&packet(None), "an unembedded note about lineage")
            .await
            .unwrap();
        store
            .embed_and_store(&packet(None), "something else entirely")
            .await
            .unwrap();

        let hits = store.search("lineage", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 0.0);
    }

    #[tokio::test]
    async fn test_search_agent_filter() {
        let store = setup(Some(Arc::new(FixedEmbeddingDriver::default())));
        store
            .embed_and_store(&packet(Some("alice")), "notes from alice about packets")
            .await
            .unwrap();
        store
            .embed_and_store(&packet(Some("bob")), "notes from bob about packets")
            .await
            .unwrap();

        let hits = store.search("packets", 10, Some("alice")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].agent.as_deref(), Some("alice"));
    }

    #[test]
    fn test_embedding_bytes_round_trip() {
        let embedding = vec![0.1, -0.5, 1.25, 0.0];
        let bytes = embedding_to_bytes(&embedding);
        let recovered = embedding_from_bytes(&bytes);
        assert_eq!(embedding, recovered);
    }
}
