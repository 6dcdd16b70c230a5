//! Substrate configuration with defaults.
//!
//! The service is constructed once from a [`SubstrateConfig`] and passed by
//! handle; there are no global config getters.

use serde::{Deserialize, Serialize};

/// Policy knobs for the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPolicy {
    /// Derive and merge auto-tags (`type:`, `agent:`, `domain:`, `field:`).
    pub auto_tag: bool,
    /// Compute and store embeddings for embeddable payload text.
    pub embed: bool,
    /// Minimum length of payload text worth embedding.
    pub min_embed_text_len: usize,
    /// Upper bound on `packet_type` length.
    pub max_packet_type_len: usize,
    /// How many payload keys (sorted) receive `field:` tags.
    pub payload_tag_key_limit: usize,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            auto_tag: true,
            embed: true,
            min_embed_text_len: 10,
            max_packet_type_len: 128,
            payload_tag_key_limit: 5,
        }
    }
}

/// Configuration for the write-path circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// Sliding window for counting failures (seconds).
    pub window_seconds: u64,
    /// Cooldown before a half-open trial is allowed (seconds).
    pub reset_timeout_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_seconds: 60,
            reset_timeout_seconds: 30,
        }
    }
}

/// Configuration for the housekeeping / GC engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Minimum age before a parentless, thread-less packet is reclaimable.
    pub parentless_max_age_hours: u64,
    /// Packet types never deleted by parentless cleanup.
    pub protected_types: Vec<String>,
    /// Tags used by fewer packets than this are stripped by tag GC.
    pub min_tag_count: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            parentless_max_age_hours: 72,
            protected_types: vec![
                "root".to_string(),
                "session_start".to_string(),
                "thread_start".to_string(),
            ],
            min_tag_count: 1,
        }
    }
}

/// Top-level substrate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstrateConfig {
    /// Ingestion pipeline policy.
    #[serde(default)]
    pub ingest: IngestPolicy,
    /// Write-path circuit breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Housekeeping / GC engine.
    #[serde(default)]
    pub gc: GcConfig,
}
