//! SQLite schema creation and migration.
//!
//! Creates all tables needed by the substrate on first boot. Applied
//! migrations are tracked both in the `user_version` pragma and in the
//! `schema_migrations` table.

use rusqlite::Connection;

/// Current database schema version.
const SCHEMA_VERSION: u32 = 3;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < 3 {
        migrate_v3(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: packet store, projections, and migration tracking.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Primary packet table. `record` holds the wire JSON; the other
        -- columns are extracted for indexing and housekeeping queries.
        -- Reads go through the schema registry, so rows written under any
        -- historical schema version upcast transparently.
        CREATE TABLE IF NOT EXISTS packet_store (
            id TEXT PRIMARY KEY,
            packet_type TEXT NOT NULL,
            record TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            thread_id TEXT,
            agent TEXT,
            ttl TEXT,
            parent_ids TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_packet_type ON packet_store(packet_type);
        CREATE INDEX IF NOT EXISTS idx_packet_thread ON packet_store(thread_id);
        CREATE INDEX IF NOT EXISTS idx_packet_timestamp ON packet_store(timestamp);
        CREATE INDEX IF NOT EXISTS idx_packet_ttl ON packet_store(ttl);

        -- Vector index over embeddable packet text.
        CREATE TABLE IF NOT EXISTS semantic_memory (
            id TEXT PRIMARY KEY,
            packet_id TEXT NOT NULL,
            packet_type TEXT NOT NULL,
            thread_id TEXT,
            agent TEXT,
            content TEXT NOT NULL,
            embedding BLOB,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_semantic_packet ON semantic_memory(packet_id);
        CREATE INDEX IF NOT EXISTS idx_semantic_agent ON semantic_memory(agent);

        -- Agent-scoped event projection of each packet.
        CREATE TABLE IF NOT EXISTS agent_memory_events (
            id TEXT PRIMARY KEY,
            agent TEXT,
            packet_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            summary TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_packet ON agent_memory_events(packet_id);
        CREATE INDEX IF NOT EXISTS idx_events_agent ON agent_memory_events(agent);

        -- Migration tracking
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );

        INSERT OR IGNORE INTO schema_migrations (version, applied_at, description)
        VALUES (1, datetime('now'), 'Initial schema');
        ",
    )?;
    Ok(())
}

/// Version 2: knowledge facts extracted from packets.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS knowledge_facts (
            id TEXT PRIMARY KEY,
            packet_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            predicate TEXT NOT NULL,
            object TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_facts_packet ON knowledge_facts(packet_id);
        CREATE INDEX IF NOT EXISTS idx_facts_subject ON knowledge_facts(subject);

        INSERT OR IGNORE INTO schema_migrations (version, applied_at, description)
        VALUES (2, datetime('now'), 'Add knowledge_facts table');
        ",
    )?;
    Ok(())
}

/// Version 3: local graph mirror tables (entities and relations).
fn migrate_v3(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            name TEXT NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS relations (
            id TEXT PRIMARY KEY,
            source_entity TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            target_entity TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_entity);
        CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_entity);

        INSERT OR IGNORE INTO schema_migrations (version, applied_at, description)
        VALUES (3, datetime('now'), 'Add local graph mirror tables');
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"packet_store".to_string()));
        assert!(tables.contains(&"semantic_memory".to_string()));
        assert!(tables.contains(&"agent_memory_events".to_string()));
        assert!(tables.contains(&"knowledge_facts".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
        assert!(tables.contains(&"entities".to_string()));
        assert!(tables.contains(&"relations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_migrations_recorded() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, SCHEMA_VERSION);
    }
}
