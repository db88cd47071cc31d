//! Per-peer replication orchestrator (spec §4.6). Each online peer gets its
//! own independent task driving a state machine from `queued` through
//! `started`, `progressing(p)`, and finally `completed` or `error`; there is
//! no automatic retry. Grounded on `infrastructure/eventual_consistency.rs`'s
//! `EventualConsistencyManager`/`CompensationTask` background-worker shape.

use crate::config::SyncConfig;
use crate::delta::DeltaEngine;
use crate::error::AppResult;
use crate::event_bus::EventBus;
use crate::models::{current_time_millis, EventPayload, FileMetadata, NetworkMetrics};
use crate::persistence::Persistence;
use crate::vector_clock::VectorClockManager;
use crate::version_store::VersionStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSyncState {
    Queued,
    Started,
    Progressing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSyncStatus {
    pub peer_node_id: String,
    pub file_id: String,
    pub state: PeerSyncState,
    pub progress: u8,
    pub error: Option<String>,
    pub updated_at: i64,
}

pub struct ReplicationOrchestrator {
    persistence: Arc<Persistence>,
    event_bus: Arc<EventBus>,
    clock_manager: Arc<VectorClockManager>,
    version_store: Arc<VersionStore>,
    delta_engine: Arc<DeltaEngine>,
    sync_config: SyncConfig,
    statuses: RwLock<HashMap<(String, String), PeerSyncStatus>>,
}

impl ReplicationOrchestrator {
    pub fn new(
        persistence: Arc<Persistence>,
        event_bus: Arc<EventBus>,
        clock_manager: Arc<VectorClockManager>,
        version_store: Arc<VersionStore>,
        delta_engine: Arc<DeltaEngine>,
        sync_config: SyncConfig,
    ) -> Self {
        Self {
            persistence,
            event_bus,
            clock_manager,
            version_store,
            delta_engine,
            sync_config,
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Fans a single file out to every online node other than its owner, as
    /// independent concurrent tasks. Returns once all peer tasks have been
    /// spawned -- it does not wait for them to finish.
    pub async fn replicate_file(self: &Arc<Self>, source_node_id: &str, file: FileMetadata) -> AppResult<()> {
        let nodes = self.persistence.list_nodes().await?;
        let peers: Vec<String> = nodes
            .into_iter()
            .filter(|n| n.node_id != source_node_id && n.status == crate::models::NodeStatus::Online)
            .map(|n| n.node_id)
            .collect();

        for peer_id in peers {
            let orchestrator = Arc::clone(self);
            let file = file.clone();
            let source_node_id = source_node_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = orchestrator.replicate_to_peer(&source_node_id, &peer_id, &file).await {
                    tracing::warn!(peer = %peer_id, file_id = %file.file_id, error = %err, "replication to peer failed");
                }
            });
        }

        Ok(())
    }

    async fn replicate_to_peer(&self, source_node_id: &str, peer_id: &str, file: &FileMetadata) -> AppResult<()> {
        self.set_state(peer_id, &file.file_id, PeerSyncState::Queued, 0, None).await;

        self.set_state(peer_id, &file.file_id, PeerSyncState::Started, 0, None).await;
        self.emit(source_node_id, EventPayload::SyncStarted {
            peer_node_id: peer_id.to_string(),
            file_id: file.file_id.clone(),
        })
        .await?;

        let bytes = self.version_store.get_current_bytes(&file.file_id)?;

        for progress in [25u8, 50, 75] {
            if self.sync_config.replication_progress_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.sync_config.replication_progress_delay_ms))
                    .await;
            }
            self.set_state(peer_id, &file.file_id, PeerSyncState::Progressing, progress, None).await;
            self.emit(source_node_id, EventPayload::SyncProgress {
                peer_node_id: peer_id.to_string(),
                file_id: file.file_id.clone(),
                progress,
            })
            .await?;
        }

        let result = self.install_replica(peer_id, file, &bytes).await;

        match result {
            Ok(replica_id) => {
                self.set_state(peer_id, &file.file_id, PeerSyncState::Completed, 100, None).await;
                self.record_transfer_metrics(source_node_id, peer_id, bytes.len() as i64).await;
                self.emit(source_node_id, EventPayload::SyncCompleted {
                    peer_node_id: peer_id.to_string(),
                    file_id: file.file_id.clone(),
                    bytes_transferred: bytes.len() as i64,
                    replica_file_id: replica_id,
                })
                .await
            }
            Err(err) => {
                self.set_state(peer_id, &file.file_id, PeerSyncState::Error, 100, Some(err.to_string())).await;
                self.emit(source_node_id, EventPayload::SyncError {
                    peer_node_id: peer_id.to_string(),
                    file_id: file.file_id.clone(),
                    reason: err.to_string(),
                })
                .await
            }
        }
    }

    async fn install_replica(&self, peer_id: &str, file: &FileMetadata, bytes: &[u8]) -> AppResult<String> {
        let replica_id = FileMetadata::replica_id(&file.file_id, peer_id);
        let clock = self.clock_manager.merge_on_receive(peer_id, &file.vector_clock);

        let mut replica = file.clone();
        replica.file_id = replica_id.clone();
        replica.owner_node_id = peer_id.to_string();
        replica.logical_path = format!("/{}/replicas/{}", peer_id, file.name);
        replica.vector_clock = clock.clone();
        replica.modified_at = current_time_millis();
        self.persistence.upsert_file(&replica).await?;

        self.version_store.create_version(
            &replica_id,
            bytes.to_vec(),
            file.content_hash.clone(),
            peer_id,
            clock,
        );

        Ok(replica_id)
    }

    /// Records a completed transfer against both endpoints (SPEC_FULL §B.4).
    /// `active_syncs` is the count of this node's peer transfers still in
    /// flight at the moment the snapshot is taken.
    async fn record_transfer_metrics(&self, source_node_id: &str, peer_id: &str, bytes: i64) {
        let now = current_time_millis();
        let active_for_peer = self
            .statuses
            .read()
            .await
            .values()
            .filter(|s| s.peer_node_id == peer_id && !matches!(s.state, PeerSyncState::Completed | PeerSyncState::Error))
            .count() as i64;

        if let Err(err) = self
            .persistence
            .record_network_metrics(&NetworkMetrics {
                node_id: source_node_id.to_string(),
                timestamp: now,
                bytes_sent: bytes,
                bytes_received: 0,
                active_syncs: active_for_peer,
            })
            .await
        {
            tracing::warn!(node_id = %source_node_id, error = %err, "failed to record network metrics");
        }
        if let Err(err) = self
            .persistence
            .record_network_metrics(&NetworkMetrics {
                node_id: peer_id.to_string(),
                timestamp: now,
                bytes_sent: 0,
                bytes_received: bytes,
                active_syncs: active_for_peer,
            })
            .await
        {
            tracing::warn!(node_id = %peer_id, error = %err, "failed to record network metrics");
        }
    }

    async fn emit(&self, source_node_id: &str, payload: EventPayload) -> AppResult<()> {
        let clock = self.clock_manager.increment_local(source_node_id);
        let event = crate::models::Event {
            event_id: Uuid::new_v4().to_string(),
            source_node_id: source_node_id.to_string(),
            timestamp: current_time_millis(),
            vector_clock: clock,
            payload,
            processed: false,
        };
        self.event_bus.publish(event).await
    }

    async fn set_state(&self, peer_id: &str, file_id: &str, state: PeerSyncState, progress: u8, error: Option<String>) {
        let mut statuses = self.statuses.write().await;
        statuses.insert(
            (peer_id.to_string(), file_id.to_string()),
            PeerSyncStatus {
                peer_node_id: peer_id.to_string(),
                file_id: file_id.to_string(),
                state,
                progress,
                error,
                updated_at: current_time_millis(),
            },
        );
    }

    pub async fn status(&self, peer_id: &str, file_id: &str) -> Option<PeerSyncStatus> {
        self.statuses.read().await.get(&(peer_id.to_string(), file_id.to_string())).cloned()
    }

    pub async fn all_statuses(&self) -> Vec<PeerSyncStatus> {
        self.statuses.read().await.values().cloned().collect()
    }
}
