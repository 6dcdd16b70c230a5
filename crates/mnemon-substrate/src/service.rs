//! The substrate service: explicit composition of every component.
//!
//! Constructed once at process start and passed by handle; there are no
//! module-level singletons. The service is the produced interface callers
//! (adapters, orchestrators) consume: breaker-guarded ingestion, packet
//! reads, semantic search, health, and GC.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use mnemon_types::config::SubstrateConfig;
use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::gc::{GcReport, GcStats};
use mnemon_types::packet::{Packet, PacketId};
use mnemon_types::substrate::{
    HealthReport, IngestRequest, KnowledgeFact, SearchHit, WriteResult, WriteStatus,
};

use crate::breaker::{BreakerVerdict, CircuitBreaker};
use crate::graph::{spawn_mirror_worker, GraphMirrorHandle, SqliteGraphMirror};
use crate::housekeeping::HousekeepingEngine;
use crate::ingest::IngestionPipeline;
use crate::repository::{PacketRepository, SqlitePacketRepository};
use crate::schema::SchemaRegistry;
use crate::semantic::{EmbeddingDriver, SemanticStore};

/// Default capacity of the graph mirror queue.
const GRAPH_QUEUE_CAPACITY: usize = 256;

/// The composed memory substrate.
pub struct SubstrateService {
    repo: Arc<dyn PacketRepository>,
    pipeline: IngestionPipeline,
    breaker: Arc<CircuitBreaker>,
    semantic: SemanticStore,
    graph: Option<GraphMirrorHandle>,
    housekeeping: HousekeepingEngine,
}

impl SubstrateService {
    /// Compose a service from explicit dependencies.
    pub fn new(
        config: SubstrateConfig,
        repo: Arc<dyn PacketRepository>,
        semantic: SemanticStore,
        graph: Option<GraphMirrorHandle>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker));
        let pipeline = IngestionPipeline::new(
            Arc::clone(&repo),
            semantic.clone(),
            graph.clone(),
            config.ingest,
        );
        let housekeeping = HousekeepingEngine::new(Arc::clone(&repo), config.gc);
        Self {
            repo,
            pipeline,
            breaker,
            semantic,
            graph,
            housekeeping,
        }
    }

    /// Open a SQLite-backed substrate: repository, semantic store, and the
    /// local graph mirror worker over one database file.
    ///
    /// Must be called within a Tokio runtime (the mirror worker is spawned).
    pub fn open(
        path: impl AsRef<std::path::Path>,
        config: SubstrateConfig,
        driver: Option<Arc<dyn EmbeddingDriver>>,
    ) -> MnemonResult<Self> {
        let registry = Arc::new(SchemaRegistry::new());
        let repo = SqlitePacketRepository::open(path, registry)?;
        Self::from_sqlite(config, repo, driver)
    }

    /// Open an in-memory substrate (tests, ephemeral deployments).
    pub fn open_in_memory(
        config: SubstrateConfig,
        driver: Option<Arc<dyn EmbeddingDriver>>,
    ) -> MnemonResult<Self> {
        let registry = Arc::new(SchemaRegistry::new());
        let repo = SqlitePacketRepository::open_in_memory(registry)?;
        Self::from_sqlite(config, repo, driver)
    }

    fn from_sqlite(
        config: SubstrateConfig,
        repo: SqlitePacketRepository,
        driver: Option<Arc<dyn EmbeddingDriver>>,
    ) -> MnemonResult<Self> {
        let semantic = SemanticStore::new(repo.connection(), driver);
        let mirror = Arc::new(SqliteGraphMirror::new(repo.connection()));
        let graph = spawn_mirror_worker(mirror, GRAPH_QUEUE_CAPACITY);
        info!("Substrate service ready");
        Ok(Self::new(
            config,
            Arc::new(repo),
            semantic,
            Some(graph),
        ))
    }

    /// Breaker-guarded ingestion.
    ///
    /// With the breaker open the pipeline is not invoked at all; the caller
    /// receives an immediate `error` result naming the breaker. Every
    /// pipeline outcome is reported back to the breaker.
    pub async fn ingest(&self, request: IngestRequest) -> WriteResult {
        match self.breaker.check() {
            BreakerVerdict::Reject { reason, .. } => {
                return WriteResult::rejected(MnemonError::CircuitOpen(reason).to_string());
            }
            BreakerVerdict::Allow | BreakerVerdict::AllowProbe => {}
        }

        let result = self.pipeline.ingest(request).await;
        match result.status {
            WriteStatus::Error => {
                let reason = result
                    .error_message
                    .as_deref()
                    .unwrap_or("pipeline error");
                self.breaker.record_failure(reason);
            }
            WriteStatus::Ok | WriteStatus::Partial => self.breaker.record_success(),
        }
        result
    }

    /// Fetch a packet, distinguishing not-found from I/O failure.
    pub async fn get_packet(&self, id: PacketId) -> MnemonResult<Packet> {
        self.repo
            .get_packet(id)
            .await?
            .ok_or_else(|| MnemonError::NotFound(id.to_string()))
    }

    /// Packets in a thread, newest first.
    pub async fn search_by_thread(
        &self,
        thread_id: &str,
        packet_type: Option<&str>,
        limit: usize,
    ) -> MnemonResult<Vec<Packet>> {
        self.repo.search_by_thread(thread_id, packet_type, limit).await
    }

    /// Packets of a type, newest first.
    pub async fn search_by_type(
        &self,
        packet_type: &str,
        agent: Option<&str>,
        limit: usize,
    ) -> MnemonResult<Vec<Packet>> {
        self.repo.search_by_type(packet_type, agent, limit).await
    }

    /// Ranked semantic search over embedded packet text.
    pub async fn semantic_search(
        &self,
        query: &str,
        top_k: usize,
        agent: Option<&str>,
    ) -> MnemonResult<Vec<SearchHit>> {
        self.semantic.search(query, top_k, agent).await
    }

    /// Search-before-write primitive for caller-enforced deduplication.
    pub async fn find_by_event_id(&self, event_id: &str) -> MnemonResult<Option<PacketId>> {
        self.repo.find_by_event_id(event_id).await
    }

    /// Fetch a packet and check its stored content hash.
    ///
    /// A missing or mismatched hash is reported as `IntegrityMismatch`;
    /// the stored record is never corrected in place.
    pub async fn verify_packet(&self, id: PacketId) -> MnemonResult<Packet> {
        let packet = self.get_packet(id).await?;
        if !packet.verify_integrity() {
            return Err(MnemonError::IntegrityMismatch(id.to_string()));
        }
        Ok(packet)
    }

    /// Record a knowledge fact referencing a packet.
    pub async fn insert_knowledge_fact(&self, fact: &KnowledgeFact) -> MnemonResult<()> {
        self.repo.insert_knowledge_fact(fact).await
    }

    /// Aggregate component health.
    pub async fn health_check(&self) -> HealthReport {
        let mut components = HashMap::new();

        let repo_status = match self.repo.health_check().await {
            Ok(()) => "ok".to_string(),
            Err(e) => format!("error: {e}"),
        };
        let degraded = repo_status != "ok" || self.breaker.is_open();
        components.insert("repository".to_string(), repo_status);

        let breaker = self.breaker.snapshot();
        components.insert(
            "circuit_breaker".to_string(),
            format!("{:?}", breaker.state).to_lowercase(),
        );
        if let Some(graph) = &self.graph {
            components.insert(
                "graph_mirror".to_string(),
                format!(
                    "queued={} dropped={} failed={}",
                    graph.queue_depth(),
                    graph.dropped(),
                    graph.failed()
                ),
            );
        }

        HealthReport {
            status: if degraded { "degraded" } else { "ok" }.to_string(),
            components,
        }
    }

    /// Run one full GC pass.
    pub async fn run_gc(&self) -> GcReport {
        self.housekeeping.run_full_gc().await
    }

    /// Dry-run GC observability.
    pub async fn gc_stats(&self) -> MnemonResult<GcStats> {
        self.housekeeping.gc_stats().await
    }

    /// The write-path breaker (observability, tests).
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The housekeeping engine (scheduled jobs drive it directly).
    pub fn housekeeping(&self) -> &HousekeepingEngine {
        &self.housekeeping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::FixedEmbeddingDriver;
    use serde_json::json;

    fn service() -> SubstrateService {
        SubstrateService::open_in_memory(
            SubstrateConfig::default(),
            Some(Arc::new(FixedEmbeddingDriver::default())),
        )
        .unwrap()
    }

    fn request(ptype: &str, payload: serde_json::Value) -> IngestRequest {
        IngestRequest {
            packet_type: ptype.to_string(),
            payload: payload.as_object().cloned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_and_get() {
        let svc = service();
        let result = svc
            .ingest(request("event", json!({"text": "service level ingest test"})))
            .await;
        assert_eq!(result.status, WriteStatus::Ok);

        let packet = svc.get_packet(result.packet_id.unwrap()).await.unwrap();
        assert_eq!(packet.packet_type(), "event");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let svc = service();
        let err = svc.get_packet(PacketId::new()).await.unwrap_err();
        assert!(matches!(err, MnemonError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_health_report_components() {
        let svc = service();
        let health = svc.health_check().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.components.get("repository").map(String::as_str), Some("ok"));
        assert_eq!(
            health.components.get("circuit_breaker").map(String::as_str),
            Some("closed")
        );
        assert!(health.components.contains_key("graph_mirror"));
    }

    #[tokio::test]
    async fn test_validation_errors_count_toward_breaker() {
        let svc = service();
        // Repeated invalid requests trip the breaker per the reporting rule.
        for _ in 0..5 {
            let result = svc
                .ingest(IngestRequest {
                    packet_type: String::new(),
                    payload: None,
                    ..Default::default()
                })
                .await;
            assert_eq!(result.status, WriteStatus::Error);
        }
        assert!(svc.breaker().is_open());

        let result = svc
            .ingest(request("event", json!({"text": "rejected while open"})))
            .await;
        assert_eq!(result.status, WriteStatus::Error);
        assert!(result
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("Circuit breaker open")));
    }

    #[tokio::test]
    async fn test_verify_packet() {
        let svc = service();
        let result = svc
            .ingest(request("event", json!({"text": "integrity checked text"})))
            .await;
        let packet = svc
            .verify_packet(result.packet_id.unwrap())
            .await
            .unwrap();
        assert!(packet.verify_integrity());
    }
}
