//! Report and statistics types for the housekeeping / GC engine.

use serde::{Deserialize, Serialize};

/// Summary of one full GC pass. Operations are error-isolated: a failing
/// operation contributes to `errors` without stopping the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcReport {
    /// Packets deleted because their ttl had passed.
    pub ttl_evicted: u64,
    /// Dangling parent ids pruned from lineage lists.
    pub orphan_refs_repaired: u64,
    /// Old parentless, thread-less packets deleted.
    pub parentless_deleted: u64,
    /// Secondary records (embeddings, events, facts) whose packet is gone.
    pub orphan_artifacts_deleted: u64,
    /// Tag occurrences stripped from packets by tag GC.
    pub tags_removed: u64,
    /// Errors from operations that failed, in execution order.
    pub errors: Vec<String>,
    /// Wall-clock duration of the pass.
    pub duration_ms: u64,
}

/// Dry-run observability: pending reclaimable counts plus lifetime totals.
/// Produced without performing any mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcStats {
    /// Packets whose ttl is currently in the past.
    pub pending_expired: u64,
    /// Lineage references currently pointing at nonexistent packets.
    pub pending_orphan_refs: u64,
    /// Secondary records currently referencing nonexistent packets.
    pub pending_orphan_artifacts: u64,
    /// Lifetime totals across all GC passes of this engine instance.
    pub lifetime: GcLifetimeTotals,
}

/// Cumulative counters across the lifetime of a GC engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcLifetimeTotals {
    pub ttl_evicted: u64,
    pub orphan_refs_repaired: u64,
    pub parentless_deleted: u64,
    pub orphan_artifacts_deleted: u64,
    pub tags_removed: u64,
    /// Completed full GC passes.
    pub passes: u64,
}
