//! Request-surface logic (spec §6 operations, component G). Every
//! state-changing call validates its inputs, performs its persistence
//! writes, and emits exactly one event describing what happened -- a
//! failure midway never leaves a write committed without its event, or an
//! event published without its write. Grounded on `tao_interface.rs` /
//! `app_state.rs` in the teacher for the "thin logic layer over a shared
//! state bundle" shape.

use crate::config::SyncConfig;
use crate::delta::{Delta, DeltaEngine, DeltaEngineStats};
use crate::error::{AppError, AppResult};
use crate::event_bus::{EventBus, SubscriberKind};
use crate::models::{
    current_time_millis, ChunkSignature, Conflict, Event, EventPayload, FileMetadata, FileVersion, Node,
    NodeStatus, UploadResult,
};
use crate::persistence::Persistence;
use crate::replication::{PeerSyncStatus, ReplicationOrchestrator};
use crate::vector_clock::{ClockComparison, VectorClockManager};
use crate::version_store::VersionStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct Coordinator {
    pub persistence: Arc<Persistence>,
    pub event_bus: Arc<EventBus>,
    pub clock_manager: Arc<VectorClockManager>,
    pub version_store: Arc<VersionStore>,
    pub delta_engine: Arc<DeltaEngine>,
    pub replication: Arc<ReplicationOrchestrator>,
    pub sync_config: SyncConfig,
}

impl Coordinator {
    pub async fn new(persistence: Arc<Persistence>, sync_config: SyncConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(Arc::clone(&persistence)));
        let clock_manager = Arc::new(VectorClockManager::new());
        let version_store = Arc::new(VersionStore::new());
        let delta_engine = Arc::new(DeltaEngine::new(sync_config.chunk_size));
        let replication = Arc::new(ReplicationOrchestrator::new(
            Arc::clone(&persistence),
            Arc::clone(&event_bus),
            Arc::clone(&clock_manager),
            Arc::clone(&version_store),
            Arc::clone(&delta_engine),
            sync_config.clone(),
        ));

        for node in persistence.list_nodes().await.unwrap_or_default() {
            clock_manager.register(&node.node_id);
        }

        Self { persistence, event_bus, clock_manager, version_store, delta_engine, replication, sync_config }
    }

    // --- nodes -------------------------------------------------------------

    pub async fn register_node(
        &self,
        node_id: &str,
        display_name: &str,
        address: &str,
        port: u16,
        capabilities: Vec<String>,
        watch_dirs: Vec<String>,
    ) -> AppResult<Node> {
        if node_id.trim().is_empty() {
            return Err(AppError::BadRequest("node_id must not be empty".to_string()));
        }

        let clock = self.clock_manager.register(node_id);
        let node = Node {
            node_id: node_id.to_string(),
            display_name: display_name.to_string(),
            address: address.to_string(),
            port,
            status: NodeStatus::Online,
            last_seen: current_time_millis(),
            capabilities,
            watch_dirs,
            vector_clock: clock,
        };
        self.persistence.upsert_node(&node).await?;
        self.emit(node_id, EventPayload::NodeRegistered { node_id: node_id.to_string() }).await?;
        Ok(node)
    }

    pub async fn list_nodes(&self) -> AppResult<Vec<Node>> {
        self.persistence.list_nodes().await
    }

    pub async fn get_node(&self, node_id: &str) -> AppResult<Node> {
        self.persistence.get_node(node_id).await
    }

    /// Marks a node's heartbeat as received, flipping it back online if it
    /// had been demoted. No-op event-wise unless the status actually
    /// changes.
    pub async fn heartbeat(&self, node_id: &str) -> AppResult<Node> {
        let mut node = self.persistence.get_node(node_id).await?;
        let previous_status = node.status;
        node.last_seen = current_time_millis();
        node.status = NodeStatus::Online;
        self.persistence.upsert_node(&node).await?;

        if previous_status != NodeStatus::Online {
            self.emit(node_id, EventPayload::NodeStatusChanged {
                node_id: node_id.to_string(),
                old_status: previous_status.as_str().to_string(),
                new_status: NodeStatus::Online.as_str().to_string(),
            })
            .await?;
        }
        Ok(node)
    }

    /// Demotes nodes whose heartbeat is older than two intervals. Intended
    /// to be driven by a periodic background task (spec SPEC_FULL B.1).
    pub async fn sweep_stale_nodes(&self) -> AppResult<usize> {
        let threshold = current_time_millis() - 2 * self.sync_config.heartbeat_interval_ms as i64;
        let mut demoted = 0;
        for mut node in self.persistence.list_nodes().await? {
            if node.status == NodeStatus::Online && node.last_seen < threshold {
                let previous = node.status;
                node.status = NodeStatus::Offline;
                self.persistence.upsert_node(&node).await?;
                self.emit(&node.node_id, EventPayload::NodeStatusChanged {
                    node_id: node.node_id.clone(),
                    old_status: previous.as_str().to_string(),
                    new_status: NodeStatus::Offline.as_str().to_string(),
                })
                .await?;
                demoted += 1;
            }
        }
        Ok(demoted)
    }

    /// Removes a node and its vector-clock entry. Files it owns keep their
    /// history; other nodes' clocks keep a stale entry for it, which vector
    /// clock comparison already tolerates.
    pub async fn remove_node(&self, node_id: &str) -> AppResult<()> {
        self.persistence.get_node(node_id).await?;
        self.persistence.remove_node(node_id).await?;
        self.clock_manager.remove_node(node_id);
        self.emit(node_id, EventPayload::NodeRemoved { node_id: node_id.to_string() }).await?;
        Ok(())
    }

    // --- files ---------------------------------------------------------------

    /// Stores a new version of `file_id`, replicating it to online peers
    /// afterward. `file_id` is caller-supplied (spec §3); the first upload
    /// for a given id creates the file, later uploads append a version.
    pub async fn upload_file(
        &self,
        node_id: &str,
        file_id: &str,
        name: &str,
        logical_path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> AppResult<UploadResult> {
        let started_at = current_time_millis();
        if file_id.trim().is_empty() {
            return Err(AppError::BadRequest("file_id must not be empty".to_string()));
        }

        let existing = self.persistence.get_file(file_id).await.ok();
        let content_hash = crate::delta::sha256_hex(&bytes);
        let clock = self.clock_manager.increment_local(node_id);

        if let Some(existing_file) = &existing {
            if self.clock_manager.compare(&existing_file.vector_clock, &clock) == ClockComparison::Concurrent {
                self.record_conflict(existing_file, node_id).await?;
            }
        }

        let version_number = existing.as_ref().map(|f| f.version_number + 1).unwrap_or(1);
        let version = self.version_store.create_version(file_id, bytes.clone(), content_hash.clone(), node_id, clock.clone());

        let now = current_time_millis();
        let file = FileMetadata {
            file_id: file_id.to_string(),
            name: name.to_string(),
            logical_path: logical_path.to_string(),
            size: bytes.len() as i64,
            content_hash,
            created_at: existing.as_ref().map(|f| f.created_at).unwrap_or(now),
            modified_at: now,
            owner_node_id: node_id.to_string(),
            version_number,
            vector_clock: clock,
            is_deleted: false,
            content_type: content_type.to_string(),
        };
        self.persistence.upsert_file(&file).await?;

        // Every upload -- including the first -- emits file_modified (spec
        // §8 S1); file_created stays in the closed event-kind set for
        // forward compatibility but nothing currently produces it.
        self.emit(node_id, EventPayload::FileModified {
            file_id: file_id.to_string(),
            version_id: version.version_id.clone(),
            action: None,
        })
        .await?;

        self.replication.replicate_file(node_id, file.clone()).await?;

        Ok(UploadResult {
            version_id: version.version_id,
            sync_latency: current_time_millis() - started_at,
            delta_metrics: self.delta_engine.stats(),
            vector_clock: file.vector_clock,
        })
    }

    async fn record_conflict(&self, existing_file: &FileMetadata, incoming_node_id: &str) -> AppResult<()> {
        let current_version = self.version_store.get_current(&existing_file.file_id)?;
        let conflict = Conflict {
            conflict_id: Uuid::new_v4().to_string(),
            file_id: existing_file.file_id.clone(),
            node_a: existing_file.owner_node_id.clone(),
            node_b: incoming_node_id.to_string(),
            version_a: current_version.version_id,
            version_b: String::new(),
            detected_at: current_time_millis(),
            resolved_at: None,
            strategy: None,
            resolved_version_id: None,
            is_resolved: false,
        };
        self.persistence.insert_conflict(&conflict).await?;
        self.emit(incoming_node_id, EventPayload::ConflictDetected {
            conflict_id: conflict.conflict_id,
            file_id: existing_file.file_id.clone(),
            node_a: conflict.node_a,
            node_b: conflict.node_b,
        })
        .await
    }

    pub async fn download_file(&self, file_id: &str) -> AppResult<(FileMetadata, Vec<u8>)> {
        let file = self.persistence.get_file(file_id).await?;
        if file.is_deleted {
            return Err(AppError::NotFound(format!("file {} has been deleted", file_id)));
        }
        let bytes = self.version_store.get_current_bytes(file_id)?;
        Ok((file, bytes))
    }

    /// Soft-deletes a file: content history is preserved so
    /// `restore_version` keeps working, only the current metadata flips
    /// `is_deleted`.
    pub async fn delete_file(&self, node_id: &str, file_id: &str) -> AppResult<()> {
        let mut file = self.persistence.get_file(file_id).await?;
        file.is_deleted = true;
        file.modified_at = current_time_millis();
        file.vector_clock = self.clock_manager.increment_local(node_id);
        self.persistence.upsert_file(&file).await?;
        self.emit(node_id, EventPayload::FileDeleted { file_id: file_id.to_string() }).await
    }

    pub async fn list_files(&self) -> AppResult<Vec<FileMetadata>> {
        self.persistence.list_files().await
    }

    pub async fn get_file(&self, file_id: &str) -> AppResult<FileMetadata> {
        self.persistence.get_file(file_id).await
    }

    pub async fn list_files_by_node(&self, node_id: &str) -> AppResult<Vec<FileMetadata>> {
        self.persistence.list_files_by_node(node_id).await
    }

    pub fn get_file_chunks(&self, file_id: &str) -> AppResult<Vec<ChunkSignature>> {
        let bytes = self.version_store.get_current_bytes(file_id)?;
        Ok(self.delta_engine.signature(&bytes))
    }

    pub fn get_file_content(&self, file_id: &str) -> AppResult<Vec<u8>> {
        self.version_store.get_current_bytes(file_id)
    }

    pub fn get_file_history(&self, file_id: &str) -> Vec<FileVersion> {
        self.version_store.list_versions(file_id)
    }

    /// Restores `version_id` as a new current version. `undelete` decides
    /// whether a soft-deleted file comes back alongside the restore -- by
    /// default `is_deleted` is left untouched (SPEC_FULL Open Questions).
    pub async fn restore_version(
        &self,
        node_id: &str,
        file_id: &str,
        version_id: &str,
        undelete: bool,
    ) -> AppResult<FileVersion> {
        let clock = self.clock_manager.increment_local(node_id);
        let restored = self.version_store.restore_version(file_id, version_id, node_id, clock.clone())?;

        let mut file = self.persistence.get_file(file_id).await?;
        file.content_hash = restored.content_hash.clone();
        file.size = restored.size;
        file.modified_at = current_time_millis();
        file.version_number = restored.version_number;
        file.vector_clock = clock;
        if undelete {
            file.is_deleted = false;
        }
        self.persistence.upsert_file(&file).await?;

        self.emit(node_id, EventPayload::FileModified {
            file_id: file_id.to_string(),
            version_id: restored.version_id.clone(),
            action: Some("restored".to_string()),
        })
        .await?;
        Ok(restored)
    }

    /// Applies a previously computed delta against the current version and
    /// stores the result as a new version.
    pub async fn apply_delta(&self, node_id: &str, file_id: &str, delta: &Delta) -> AppResult<FileMetadata> {
        let old_bytes = self.version_store.get_current_bytes(file_id)?;
        let new_bytes = self.delta_engine.apply_delta(&old_bytes, delta)?;

        let mut file = self.persistence.get_file(file_id).await?;
        let clock = self.clock_manager.increment_local(node_id);
        let version = self.version_store.create_version(
            file_id,
            new_bytes.clone(),
            delta.new_content_hash.clone(),
            node_id,
            clock.clone(),
        );
        file.content_hash = delta.new_content_hash.clone();
        file.size = new_bytes.len() as i64;
        file.modified_at = current_time_millis();
        file.version_number = version.version_number;
        file.vector_clock = clock;
        self.persistence.upsert_file(&file).await?;

        self.emit(node_id, EventPayload::FileModified {
            file_id: file_id.to_string(),
            version_id: version.version_id.clone(),
            action: Some("delta_sync".to_string()),
        })
        .await?;

        self.replication.replicate_file(node_id, file.clone()).await?;
        Ok(file)
    }

    // --- conflicts -------------------------------------------------------------

    pub async fn list_conflicts(&self, file_id: Option<&str>) -> AppResult<Vec<Conflict>> {
        self.persistence.list_conflicts(file_id).await
    }

    pub async fn resolve_conflict(
        &self,
        node_id: &str,
        conflict_id: &str,
        file_id: &str,
        strategy: &str,
        resolved_version_id: &str,
    ) -> AppResult<()> {
        self.persistence.resolve_conflict(conflict_id, strategy, resolved_version_id).await?;
        self.emit(node_id, EventPayload::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            file_id: file_id.to_string(),
            strategy: strategy.to_string(),
        })
        .await
    }

    /// Scans a file's event history for concurrent writes the upload path
    /// may not have caught (e.g. replayed events from an offline window).
    pub async fn detect_conflicts(&self, file_id: &str) -> AppResult<Vec<(Event, Event)>> {
        let events = self.event_bus.causal_events_for_file(&self.clock_manager, file_id).await?;
        let pairs = self.clock_manager.detect_conflicts(&events);
        Ok(pairs.into_iter().map(|(i, j)| (events[i].clone(), events[j].clone())).collect())
    }

    // --- events & metrics --------------------------------------------------------

    pub async fn list_events(&self, limit: i64) -> AppResult<Vec<Event>> {
        self.event_bus.list_recent(limit).await
    }

    pub async fn list_causal_events(&self, file_id: &str) -> AppResult<Vec<Event>> {
        self.event_bus.causal_events_for_file(&self.clock_manager, file_id).await
    }

    pub fn get_delta_metrics(&self) -> DeltaEngineStats {
        self.delta_engine.stats()
    }

    /// Latest per-node network metrics snapshot (spec §4.7/§6.7, SPEC_FULL
    /// §B.4) -- distinct from `get_delta_metrics`, which covers the delta
    /// engine rather than per-node transfer counters.
    pub async fn get_metrics(&self) -> AppResult<Vec<crate::models::NetworkMetrics>> {
        self.persistence.latest_network_metrics_all().await
    }

    pub async fn get_replication_status(&self) -> Vec<PeerSyncStatus> {
        self.replication.all_statuses().await
    }

    pub async fn get_topology(&self) -> AppResult<Vec<Node>> {
        self.persistence.list_nodes().await
    }

    pub async fn purge_old_events(&self) -> AppResult<u64> {
        self.event_bus.purge_old_events(self.sync_config.event_retention_days).await
    }

    // --- subscriptions ----------------------------------------------------------

    pub async fn subscribe_dashboard(&self, subscriber_id: &str) -> mpsc::Receiver<Event> {
        self.event_bus.subscribe(SubscriberKind::Dashboard, subscriber_id.to_string()).await
    }

    pub async fn subscribe_node(&self, node_id: &str) -> mpsc::Receiver<Event> {
        self.event_bus.subscribe(SubscriberKind::Node(node_id.to_string()), node_id.to_string()).await
    }

    async fn emit(&self, source_node_id: &str, payload: EventPayload) -> AppResult<()> {
        let clock = self.clock_manager.get_clock(source_node_id).unwrap_or_default();
        let event = Event {
            event_id: Uuid::new_v4().to_string(),
            source_node_id: source_node_id.to_string(),
            timestamp: current_time_millis(),
            vector_clock: clock,
            payload,
            processed: false,
        };
        self.event_bus.publish(event).await
    }
}
