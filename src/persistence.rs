//! sqlite-backed persistence (spec §4.1): nodes, files, events, conflicts,
//! and network metrics. Grounded on `database.rs::TaoDatabase` in the
//! teacher -- pool + explicit `CREATE TABLE IF NOT EXISTS` + per-row
//! serde_json columns for the parts of the schema that aren't relational.

use crate::error::{AppError, AppResult};
use crate::models::{Conflict, Event, FileMetadata, NetworkMetrics, Node, NodeStatus};
use crate::vector_clock::VectorClock;
use lru::LruCache;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const DEFAULT_CACHE_CAPACITY: usize = 1000;

pub struct Persistence {
    pool: SqlitePool,
    node_cache: Mutex<LruCache<String, Node>>,
    file_cache: Mutex<LruCache<String, FileMetadata>>,
}

impl Persistence {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        Self::connect_with_cache_capacity(database_url, DEFAULT_CACHE_CAPACITY).await
    }

    pub async fn connect_with_cache_capacity(database_url: &str, cache_capacity: usize) -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| AppError::StorageUnavailable(format!("failed to connect to {}: {}", database_url, e)))?;
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap());
        let db = Self {
            pool,
            node_cache: Mutex::new(LruCache::new(capacity)),
            file_cache: Mutex::new(LruCache::new(capacity)),
        };
        db.init().await?;
        Ok(db)
    }

    /// Creates every table and index this coordinator needs, if absent.
    /// Idempotent -- safe to call on every startup (spec §4.1).
    async fn init(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                address TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_seen INTEGER NOT NULL,
                capabilities TEXT NOT NULL,
                watch_dirs TEXT NOT NULL,
                vector_clock TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_last_seen ON nodes(last_seen)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                file_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                logical_path TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                owner_node_id TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                vector_clock TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                content_type TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_owner ON files(owner_node_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_content_hash ON files(content_hash)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_modified_at ON files(modified_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                source_node_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                vector_clock TEXT NOT NULL,
                kind TEXT NOT NULL,
                file_id TEXT,
                payload TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_file_id ON events(file_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_source_node ON events(source_node_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_processed ON events(processed)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflicts (
                conflict_id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                node_a TEXT NOT NULL,
                node_b TEXT NOT NULL,
                version_a TEXT NOT NULL,
                version_b TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                resolved_at INTEGER,
                strategy TEXT,
                resolved_version_id TEXT,
                is_resolved INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conflicts_file_id ON conflicts(file_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conflicts_resolved ON conflicts(is_resolved)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_metrics (
                node_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                bytes_sent INTEGER NOT NULL,
                bytes_received INTEGER NOT NULL,
                active_syncs INTEGER NOT NULL,
                PRIMARY KEY (node_id, timestamp)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_network_metrics_node ON network_metrics(node_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // --- nodes -----------------------------------------------------------

    pub async fn upsert_node(&self, node: &Node) -> AppResult<()> {
        let clock_json = serde_json::to_string(&node.vector_clock)?;
        let caps_json = serde_json::to_string(&node.capabilities)?;
        let dirs_json = serde_json::to_string(&node.watch_dirs)?;
        sqlx::query(
            r#"
            INSERT INTO nodes (node_id, display_name, address, port, status, last_seen, capabilities, watch_dirs, vector_clock)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                display_name = excluded.display_name,
                address = excluded.address,
                port = excluded.port,
                status = excluded.status,
                last_seen = excluded.last_seen,
                capabilities = excluded.capabilities,
                watch_dirs = excluded.watch_dirs,
                vector_clock = excluded.vector_clock
            "#,
        )
        .bind(&node.node_id)
        .bind(&node.display_name)
        .bind(&node.address)
        .bind(node.port as i64)
        .bind(node.status.as_str())
        .bind(node.last_seen)
        .bind(caps_json)
        .bind(dirs_json)
        .bind(clock_json)
        .execute(&self.pool)
        .await?;
        self.node_cache.lock().unwrap().put(node.node_id.clone(), node.clone());
        Ok(())
    }

    pub async fn get_node(&self, node_id: &str) -> AppResult<Node> {
        if let Some(node) = self.node_cache.lock().unwrap().get(node_id) {
            return Ok(node.clone());
        }
        let row = sqlx::query("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("node {} not found", node_id)))?;
        let node = row_to_node(&row)?;
        self.node_cache.lock().unwrap().put(node_id.to_string(), node.clone());
        Ok(node)
    }

    pub async fn list_nodes(&self) -> AppResult<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY node_id").fetch_all(&self.pool).await?;
        rows.iter().map(row_to_node).collect()
    }

    /// Removing a node cascades to every row that references it (spec §3):
    /// its events, its network metrics, and any conflicts it is a party to.
    pub async fn remove_node(&self, node_id: &str) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM events WHERE source_node_id = ?").bind(node_id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM network_metrics WHERE node_id = ?").bind(node_id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM conflicts WHERE node_a = ? OR node_b = ?")
            .bind(node_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM nodes WHERE node_id = ?").bind(node_id).execute(&mut *tx).await?;
        tx.commit().await?;
        self.node_cache.lock().unwrap().pop(node_id);
        Ok(())
    }

    // --- files -------------------------------------------------------------

    pub async fn upsert_file(&self, file: &FileMetadata) -> AppResult<()> {
        let clock_json = serde_json::to_string(&file.vector_clock)?;
        sqlx::query(
            r#"
            INSERT INTO files (file_id, name, logical_path, size, content_hash, created_at, modified_at, owner_node_id, version_number, vector_clock, is_deleted, content_type)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                name = excluded.name,
                logical_path = excluded.logical_path,
                size = excluded.size,
                content_hash = excluded.content_hash,
                modified_at = excluded.modified_at,
                owner_node_id = excluded.owner_node_id,
                version_number = excluded.version_number,
                vector_clock = excluded.vector_clock,
                is_deleted = excluded.is_deleted,
                content_type = excluded.content_type
            "#,
        )
        .bind(&file.file_id)
        .bind(&file.name)
        .bind(&file.logical_path)
        .bind(file.size)
        .bind(&file.content_hash)
        .bind(file.created_at)
        .bind(file.modified_at)
        .bind(&file.owner_node_id)
        .bind(file.version_number)
        .bind(clock_json)
        .bind(file.is_deleted as i64)
        .bind(&file.content_type)
        .execute(&self.pool)
        .await?;
        self.file_cache.lock().unwrap().put(file.file_id.clone(), file.clone());
        Ok(())
    }

    pub async fn get_file(&self, file_id: &str) -> AppResult<FileMetadata> {
        if let Some(file) = self.file_cache.lock().unwrap().get(file_id) {
            return Ok(file.clone());
        }
        let row = sqlx::query("SELECT * FROM files WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("file {} not found", file_id)))?;
        let file = row_to_file(&row)?;
        self.file_cache.lock().unwrap().put(file_id.to_string(), file.clone());
        Ok(file)
    }

    pub async fn list_files(&self) -> AppResult<Vec<FileMetadata>> {
        let rows = sqlx::query("SELECT * FROM files ORDER BY logical_path").fetch_all(&self.pool).await?;
        rows.iter().map(row_to_file).collect()
    }

    /// Excludes soft-deleted files by default (spec §4.1).
    pub async fn list_files_by_node(&self, node_id: &str) -> AppResult<Vec<FileMetadata>> {
        let rows = sqlx::query("SELECT * FROM files WHERE owner_node_id = ? AND is_deleted = 0 ORDER BY logical_path")
            .bind(node_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_file).collect()
    }

    pub async fn delete_file(&self, file_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM files WHERE file_id = ?").bind(file_id).execute(&self.pool).await?;
        self.file_cache.lock().unwrap().pop(file_id);
        Ok(())
    }

    // Version chains are NOT one of the five relational tables (spec §4.1,
    // §6.3): they live entirely in `version_store::VersionStore`, which is
    // component D's own in-memory structure, not a persistence-layer table.

    // --- events --------------------------------------------------------------

    pub async fn append_event(&self, event: &Event) -> AppResult<()> {
        let clock_json = serde_json::to_string(&event.vector_clock)?;
        let payload_json = serde_json::to_string(&event.payload)?;
        sqlx::query(
            r#"
            INSERT INTO events (event_id, source_node_id, timestamp, vector_clock, kind, file_id, payload, processed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.source_node_id)
        .bind(event.timestamp)
        .bind(clock_json)
        .bind(event.payload.kind())
        .bind(event.payload.file_id())
        .bind(payload_json)
        .bind(event.processed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_events(&self, limit: i64) -> AppResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn list_events_for_file(&self, file_id: &str) -> AppResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE file_id = ? ORDER BY timestamp")
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Oldest-first, per §4.1's "list-unprocessed (oldest-first)" operation.
    pub async fn list_unprocessed_events(&self, limit: i64) -> AppResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE processed = 0 ORDER BY timestamp ASC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Flips `processed` false -> true for one event. One-way (spec §3).
    pub async fn mark_event_processed(&self, event_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE events SET processed = 1 WHERE event_id = ?")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes processed events older than `retention_days`. Unprocessed
    /// events are never purged (spec §4.5 "at-least-once delivery").
    pub async fn purge_processed_events(&self, retention_days: i64) -> AppResult<u64> {
        let cutoff = crate::models::current_time_millis() - retention_days * 24 * 60 * 60 * 1000;
        let result = sqlx::query("DELETE FROM events WHERE processed = 1 AND timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // --- conflicts -------------------------------------------------------------

    pub async fn insert_conflict(&self, conflict: &Conflict) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conflicts (conflict_id, file_id, node_a, node_b, version_a, version_b, detected_at, resolved_at, strategy, resolved_version_id, is_resolved)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conflict.conflict_id)
        .bind(&conflict.file_id)
        .bind(&conflict.node_a)
        .bind(&conflict.node_b)
        .bind(&conflict.version_a)
        .bind(&conflict.version_b)
        .bind(conflict.detected_at)
        .bind(conflict.resolved_at)
        .bind(&conflict.strategy)
        .bind(&conflict.resolved_version_id)
        .bind(conflict.is_resolved as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: &str,
        resolved_version_id: &str,
    ) -> AppResult<()> {
        let resolved_at = crate::models::current_time_millis();
        let result = sqlx::query(
            r#"
            UPDATE conflicts SET resolved_at = ?, strategy = ?, resolved_version_id = ?, is_resolved = 1
            WHERE conflict_id = ? AND is_resolved = 0
            "#,
        )
        .bind(resolved_at)
        .bind(strategy)
        .bind(resolved_version_id)
        .bind(conflict_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "conflict {} not found or already resolved",
                conflict_id
            )));
        }
        Ok(())
    }

    pub async fn list_conflicts(&self, file_id: Option<&str>) -> AppResult<Vec<Conflict>> {
        let rows = match file_id {
            Some(id) => {
                sqlx::query("SELECT * FROM conflicts WHERE file_id = ? ORDER BY detected_at DESC")
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM conflicts ORDER BY detected_at DESC").fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(row_to_conflict).collect()
    }

    // --- network metrics -------------------------------------------------------

    pub async fn record_network_metrics(&self, metrics: &NetworkMetrics) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO network_metrics (node_id, timestamp, bytes_sent, bytes_received, active_syncs)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(node_id, timestamp) DO NOTHING
            "#,
        )
        .bind(&metrics.node_id)
        .bind(metrics.timestamp)
        .bind(metrics.bytes_sent)
        .bind(metrics.bytes_received)
        .bind(metrics.active_syncs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_network_metrics(&self, node_id: &str) -> AppResult<Option<NetworkMetrics>> {
        let row = sqlx::query(
            "SELECT * FROM network_metrics WHERE node_id = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_network_metrics).transpose()
    }

    /// Latest snapshot per node, for `get_metrics()` (SPEC_FULL §B.4).
    pub async fn latest_network_metrics_all(&self) -> AppResult<Vec<NetworkMetrics>> {
        let rows = sqlx::query(
            r#"
            SELECT m.* FROM network_metrics m
            INNER JOIN (
                SELECT node_id, MAX(timestamp) AS timestamp FROM network_metrics GROUP BY node_id
            ) latest ON m.node_id = latest.node_id AND m.timestamp = latest.timestamp
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_network_metrics).collect()
    }
}

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> AppResult<Node> {
    let caps_json: String = row.try_get("capabilities")?;
    let dirs_json: String = row.try_get("watch_dirs")?;
    let clock_json: String = row.try_get("vector_clock")?;
    let status: String = row.try_get("status")?;
    Ok(Node {
        node_id: row.try_get("node_id")?,
        display_name: row.try_get("display_name")?,
        address: row.try_get("address")?,
        port: row.try_get::<i64, _>("port")? as u16,
        status: NodeStatus::parse(&status),
        last_seen: row.try_get("last_seen")?,
        capabilities: serde_json::from_str(&caps_json)?,
        watch_dirs: serde_json::from_str(&dirs_json)?,
        vector_clock: serde_json::from_str::<VectorClock>(&clock_json)?,
    })
}

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> AppResult<FileMetadata> {
    let clock_json: String = row.try_get("vector_clock")?;
    Ok(FileMetadata {
        file_id: row.try_get("file_id")?,
        name: row.try_get("name")?,
        logical_path: row.try_get("logical_path")?,
        size: row.try_get("size")?,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        owner_node_id: row.try_get("owner_node_id")?,
        version_number: row.try_get("version_number")?,
        vector_clock: serde_json::from_str::<VectorClock>(&clock_json)?,
        is_deleted: row.try_get::<i64, _>("is_deleted")? != 0,
        content_type: row.try_get("content_type")?,
    })
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> AppResult<Event> {
    let clock_json: String = row.try_get("vector_clock")?;
    let payload_json: String = row.try_get("payload")?;
    Ok(Event {
        event_id: row.try_get("event_id")?,
        source_node_id: row.try_get("source_node_id")?,
        timestamp: row.try_get("timestamp")?,
        vector_clock: serde_json::from_str::<VectorClock>(&clock_json)?,
        payload: serde_json::from_str(&payload_json)?,
        processed: row.try_get::<i64, _>("processed")? != 0,
    })
}

fn row_to_conflict(row: &sqlx::sqlite::SqliteRow) -> AppResult<Conflict> {
    Ok(Conflict {
        conflict_id: row.try_get("conflict_id")?,
        file_id: row.try_get("file_id")?,
        node_a: row.try_get("node_a")?,
        node_b: row.try_get("node_b")?,
        version_a: row.try_get("version_a")?,
        version_b: row.try_get("version_b")?,
        detected_at: row.try_get("detected_at")?,
        resolved_at: row.try_get("resolved_at")?,
        strategy: row.try_get("strategy")?,
        resolved_version_id: row.try_get("resolved_version_id")?,
        is_resolved: row.try_get::<i64, _>("is_resolved")? != 0,
    })
}

fn row_to_network_metrics(row: &sqlx::sqlite::SqliteRow) -> AppResult<NetworkMetrics> {
    Ok(NetworkMetrics {
        node_id: row.try_get("node_id")?,
        timestamp: row.try_get("timestamp")?,
        bytes_sent: row.try_get("bytes_sent")?,
        bytes_received: row.try_get("bytes_received")?,
        active_syncs: row.try_get("active_syncs")?,
    })
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::current_time_millis;

    async fn test_db() -> Persistence {
        Persistence::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn node_round_trips() {
        let db = test_db().await;
        let node = Node {
            node_id: "n1".to_string(),
            display_name: "laptop".to_string(),
            address: "127.0.0.1".to_string(),
            port: 9000,
            status: NodeStatus::Online,
            last_seen: current_time_millis(),
            capabilities: vec!["sync".to_string()],
            watch_dirs: vec!["/docs".to_string()],
            vector_clock: VectorClock::new(),
        };
        db.upsert_node(&node).await.unwrap();
        let fetched = db.get_node("n1").await.unwrap();
        assert_eq!(fetched.node_id, "n1");
        assert_eq!(fetched.display_name, "laptop");
    }

    #[tokio::test]
    async fn missing_node_is_not_found() {
        let db = test_db().await;
        let result = db.get_node("missing").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn survives_a_real_on_disk_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("syncd-test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let db = Persistence::connect(&url).await.unwrap();

        let node = Node {
            node_id: "n1".to_string(),
            display_name: "laptop".to_string(),
            address: "127.0.0.1".to_string(),
            port: 9000,
            status: NodeStatus::Online,
            last_seen: current_time_millis(),
            capabilities: vec![],
            watch_dirs: vec![],
            vector_clock: VectorClock::new(),
        };
        db.upsert_node(&node).await.unwrap();
        assert!(db_path.exists());
        assert_eq!(db.get_node("n1").await.unwrap().node_id, "n1");
    }

    #[tokio::test]
    async fn events_are_idempotent_on_duplicate_id() {
        let db = test_db().await;
        let event = Event {
            event_id: "e1".to_string(),
            source_node_id: "n1".to_string(),
            timestamp: current_time_millis(),
            vector_clock: VectorClock::new(),
            payload: crate::models::EventPayload::NodeRegistered { node_id: "n1".to_string() },
            processed: false,
        };
        db.append_event(&event).await.unwrap();
        db.append_event(&event).await.unwrap();
        let events = db.list_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn mark_event_processed_removes_it_from_the_unprocessed_list() {
        let db = test_db().await;
        let event = Event {
            event_id: "e1".to_string(),
            source_node_id: "n1".to_string(),
            timestamp: current_time_millis(),
            vector_clock: VectorClock::new(),
            payload: crate::models::EventPayload::NodeRegistered { node_id: "n1".to_string() },
            processed: false,
        };
        db.append_event(&event).await.unwrap();
        assert_eq!(db.list_unprocessed_events(10).await.unwrap().len(), 1);

        db.mark_event_processed("e1").await.unwrap();
        assert!(db.list_unprocessed_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_network_metrics_all_returns_one_row_per_node() {
        let db = test_db().await;
        for (node_id, timestamp) in [("n1", 100), ("n1", 200), ("n2", 150)] {
            db.record_network_metrics(&NetworkMetrics {
                node_id: node_id.to_string(),
                timestamp,
                bytes_sent: 10,
                bytes_received: 0,
                active_syncs: 1,
            })
            .await
            .unwrap();
        }

        let latest = db.latest_network_metrics_all().await.unwrap();
        assert_eq!(latest.len(), 2);
        let n1 = latest.iter().find(|m| m.node_id == "n1").unwrap();
        assert_eq!(n1.timestamp, 200);
    }
}
