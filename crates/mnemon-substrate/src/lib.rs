//! The Mnemon memory substrate: an append-mostly, schema-versioned,
//! lineage-tracked packet store.
//!
//! The substrate is the system of record for an AI-orchestration platform:
//! - **Schema registry**: version detection and chained upcasting of raw
//!   records into the current packet model.
//! - **Ingestion pipeline**: the single write path -- validate, tag, persist,
//!   embed, lineage-link, with partial-failure semantics.
//! - **Circuit breaker**: sheds write load after a failure burst.
//! - **Housekeeping / GC**: reclaims expired, orphaned, and low-value
//!   records without violating lineage invariants.
//! - **Graph mirror**: a bounded best-effort side channel to a graph store.
//!
//! Everything is wired together by [`SubstrateService`], constructed once at
//! process start and passed by handle.

pub mod breaker;
pub mod graph;
pub mod housekeeping;
pub mod ingest;
pub mod migration;
pub mod repository;
pub mod schema;
pub mod semantic;

mod service;
pub use service::SubstrateService;
