//! Housekeeping: reclaims expired, orphaned, and low-value records.
//!
//! Operations run against the repository port with row-scoped deletes and
//! updates, so a long GC pass never blocks concurrent writers. A full pass
//! composes the operations in a fixed order, each error-isolated: one
//! failing operation is reported in the pass's `errors` list and the rest
//! still run. Nothing here ever deletes a packet that is still a lineage
//! root or thread anchor.

use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use mnemon_types::config::GcConfig;
use mnemon_types::error::MnemonResult;
use mnemon_types::gc::{GcLifetimeTotals, GcReport, GcStats};

use crate::repository::PacketRepository;

/// The GC engine over the repository port.
pub struct HousekeepingEngine {
    repo: Arc<dyn PacketRepository>,
    config: GcConfig,
    ttl_evicted: AtomicU64,
    orphan_refs_repaired: AtomicU64,
    parentless_deleted: AtomicU64,
    orphan_artifacts_deleted: AtomicU64,
    tags_removed: AtomicU64,
    passes: AtomicU64,
}

impl HousekeepingEngine {
    pub fn new(repo: Arc<dyn PacketRepository>, config: GcConfig) -> Self {
        Self {
            repo,
            config,
            ttl_evicted: AtomicU64::new(0),
            orphan_refs_repaired: AtomicU64::new(0),
            parentless_deleted: AtomicU64::new(0),
            orphan_artifacts_deleted: AtomicU64::new(0),
            tags_removed: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    /// Delete packets whose ttl is in the past.
    pub async fn evict_expired_ttl(&self) -> MnemonResult<u64> {
        let expired = self.repo.expired_packet_ids(Utc::now()).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        let deleted = self.repo.delete_packets(&expired).await?;
        self.ttl_evicted.fetch_add(deleted, Ordering::Relaxed);
        info!(count = deleted, "Evicted expired packets");
        Ok(deleted)
    }

    /// Prune dangling parent ids from lineage lists. The packets themselves
    /// are never deleted here.
    pub async fn repair_orphan_refs(&self) -> MnemonResult<u64> {
        let dangling = self.repo.dangling_parent_refs().await?;
        let mut repaired = 0u64;
        for (packet_id, missing) in dangling {
            repaired += self.repo.prune_parent_refs(packet_id, &missing).await?;
        }
        if repaired > 0 {
            self.orphan_refs_repaired
                .fetch_add(repaired, Ordering::Relaxed);
            info!(count = repaired, "Pruned dangling lineage references");
        }
        Ok(repaired)
    }

    /// Delete packets with no parents, no thread, older than the age
    /// threshold, whose type is not protected.
    pub async fn cleanup_parentless(&self) -> MnemonResult<u64> {
        let cutoff = Utc::now() - Duration::hours(self.config.parentless_max_age_hours as i64);
        let candidates = self
            .repo
            .parentless_packet_ids(cutoff, &self.config.protected_types)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }
        let deleted = self.repo.delete_packets(&candidates).await?;
        self.parentless_deleted.fetch_add(deleted, Ordering::Relaxed);
        info!(count = deleted, "Deleted old parentless packets");
        Ok(deleted)
    }

    /// Delete embeddings, memory events, and knowledge facts whose packet
    /// no longer exists.
    pub async fn cleanup_orphan_artifacts(&self) -> MnemonResult<u64> {
        let removed = self.repo.delete_orphan_artifacts().await?;
        let total = removed.total();
        if total > 0 {
            self.orphan_artifacts_deleted
                .fetch_add(total, Ordering::Relaxed);
            info!(
                embeddings = removed.embeddings,
                memory_events = removed.memory_events,
                knowledge_facts = removed.knowledge_facts,
                "Deleted orphaned artifacts"
            );
        }
        Ok(total)
    }

    /// Strip tags used by fewer than the configured minimum number of
    /// packets. Packets are never deleted by this step.
    pub async fn gc_tags(&self) -> MnemonResult<u64> {
        let usage = self.repo.tag_usage().await?;
        let underused: Vec<String> = usage
            .into_iter()
            .filter(|(_, count)| *count < self.config.min_tag_count)
            .map(|(tag, _)| tag)
            .collect();
        if underused.is_empty() {
            return Ok(0);
        }
        let removed = self.repo.strip_tags(&underused).await?;
        self.tags_removed.fetch_add(removed, Ordering::Relaxed);
        info!(tags = underused.len(), occurrences = removed, "Tag GC");
        Ok(removed)
    }

    /// Run every operation in order, error-isolated.
    pub async fn run_full_gc(&self) -> GcReport {
        let start = std::time::Instant::now();
        let mut report = GcReport::default();

        match self.evict_expired_ttl().await {
            Ok(n) => report.ttl_evicted = n,
            Err(e) => report.errors.push(format!("ttl_eviction: {e}")),
        }
        match self.repair_orphan_refs().await {
            Ok(n) => report.orphan_refs_repaired = n,
            Err(e) => report.errors.push(format!("orphan_refs: {e}")),
        }
        match self.cleanup_parentless().await {
            Ok(n) => report.parentless_deleted = n,
            Err(e) => report.errors.push(format!("parentless: {e}")),
        }
        match self.cleanup_orphan_artifacts().await {
            Ok(n) => report.orphan_artifacts_deleted = n,
            Err(e) => report.errors.push(format!("orphan_artifacts: {e}")),
        }
        match self.gc_tags().await {
            Ok(n) => report.tags_removed = n,
            Err(e) => report.errors.push(format!("tag_gc: {e}")),
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        self.passes.fetch_add(1, Ordering::Relaxed);
        debug!(?report, "Full GC pass complete");
        report
    }

    /// Pending-reclaimable counts plus lifetime totals, with no mutation.
    pub async fn gc_stats(&self) -> MnemonResult<GcStats> {
        let pending_expired = self.repo.expired_packet_ids(Utc::now()).await?.len() as u64;
        let pending_orphan_refs = self
            .repo
            .dangling_parent_refs()
            .await?
            .iter()
            .map(|(_, missing)| missing.len() as u64)
            .sum();
        let pending_orphan_artifacts = self.repo.count_orphan_artifacts().await?.total();

        Ok(GcStats {
            pending_expired,
            pending_orphan_refs,
            pending_orphan_artifacts,
            lifetime: GcLifetimeTotals {
                ttl_evicted: self.ttl_evicted.load(Ordering::Relaxed),
                orphan_refs_repaired: self.orphan_refs_repaired.load(Ordering::Relaxed),
                parentless_deleted: self.parentless_deleted.load(Ordering::Relaxed),
                orphan_artifacts_deleted: self.orphan_artifacts_deleted.load(Ordering::Relaxed),
                tags_removed: self.tags_removed.load(Ordering::Relaxed),
                passes: self.passes.load(Ordering::Relaxed),
            },
        })
    }
}
