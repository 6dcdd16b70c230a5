//! Best-effort graph mirror side channel.
//!
//! Ingestion enqueues mirror work onto a bounded queue; a worker task drains
//! it against a [`GraphMirror`] implementation. Queue overflow and mirror
//! failures are logged and counted, never propagated to the caller -- the
//! mirror is a side channel, not a second system of record.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::graph::{GraphEntity, GraphEvent, GraphOp, GraphRelationship};

/// Port to a graph store (Neo4j, a local mirror, ...).
#[async_trait]
pub trait GraphMirror: Send + Sync {
    /// Upsert an entity node.
    async fn create_entity(&self, entity: &GraphEntity) -> MnemonResult<()>;

    /// Create a relationship edge between two entities.
    async fn create_relationship(&self, relationship: &GraphRelationship) -> MnemonResult<()>;

    /// Create an event node for an ingested packet.
    async fn create_event(&self, event: &GraphEvent) -> MnemonResult<()>;
}

/// Local graph mirror backed by the substrate's own SQLite file
/// (`entities` and `relations` tables).
#[derive(Clone)]
pub struct SqliteGraphMirror {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGraphMirror {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> MnemonResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MnemonError::Internal(e.to_string()))
    }
}

#[async_trait]
impl GraphMirror for SqliteGraphMirror {
    async fn create_entity(&self, entity: &GraphEntity) -> MnemonResult<()> {
        let props = serde_json::to_string(&entity.properties)
            .map_err(|e| MnemonError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO entities (id, entity_type, name, properties, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET name = ?3, properties = ?4, updated_at = ?5",
            rusqlite::params![entity.id, entity.entity_type, entity.name, props, now],
        )
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn create_relationship(&self, relationship: &GraphRelationship) -> MnemonResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO relations (id, source_entity, relation_type, target_entity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                relationship.source,
                relationship.relationship,
                relationship.target,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| MnemonError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn create_event(&self, event: &GraphEvent) -> MnemonResult<()> {
        let mut properties = serde_json::Map::new();
        properties.insert(
            "packet_type".to_string(),
            serde_json::Value::String(event.packet_type.clone()),
        );
        if let Some(agent) = &event.agent {
            properties.insert(
                "agent".to_string(),
                serde_json::Value::String(agent.clone()),
            );
        }
        if let Some(thread) = &event.thread_id {
            properties.insert(
                "thread_id".to_string(),
                serde_json::Value::String(thread.clone()),
            );
        }
        properties.insert(
            "timestamp".to_string(),
            serde_json::Value::String(event.timestamp.to_rfc3339()),
        );

        self.create_entity(&GraphEntity {
            id: format!("packet:{}", event.packet_id),
            entity_type: "event".to_string(),
            name: event.packet_type.clone(),
            properties,
        })
        .await
    }
}

/// Handle held by producers: enqueues mirror work without blocking.
#[derive(Clone)]
pub struct GraphMirrorHandle {
    tx: mpsc::Sender<GraphOp>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl GraphMirrorHandle {
    /// Enqueue one mirror operation. A full queue drops the op (counted and
    /// logged); the caller is never blocked or failed.
    pub fn enqueue(&self, op: GraphOp) {
        if let Err(e) = self.tx.try_send(op) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Graph mirror queue full, dropping op");
        }
    }

    /// Ops currently waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Ops dropped due to a full queue, lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ops that reached the mirror but failed there, lifetime.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Spawn the drain task for a mirror and return the producer handle.
///
/// The worker stops when every handle has been dropped.
pub fn spawn_mirror_worker(mirror: Arc<dyn GraphMirror>, capacity: usize) -> GraphMirrorHandle {
    let (tx, mut rx) = mpsc::channel::<GraphOp>(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let worker_failed = Arc::clone(&failed);
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let result = match &op {
                GraphOp::Entity(entity) => mirror.create_entity(entity).await,
                GraphOp::Relationship(rel) => mirror.create_relationship(rel).await,
                GraphOp::Event(event) => mirror.create_event(event).await,
            };
            if let Err(e) = result {
                worker_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Graph mirror op failed");
            }
        }
        debug!("Graph mirror worker stopped");
    });

    GraphMirrorHandle {
        tx,
        dropped,
        failed,
    }
}
