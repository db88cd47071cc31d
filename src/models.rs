//! Data model (spec §3). Grounded on `models/tao_core.rs` in the teacher for
//! field layout conventions (id + timestamps + owning node), generalized to
//! the file-sync entities this spec names.

use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Syncing,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Syncing => "syncing",
            NodeStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => NodeStatus::Online,
            "syncing" => NodeStatus::Syncing,
            "error" => NodeStatus::Error,
            _ => NodeStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub display_name: String,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_seen: i64,
    pub capabilities: Vec<String>,
    pub watch_dirs: Vec<String>,
    pub vector_clock: VectorClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub name: String,
    pub logical_path: String,
    pub size: i64,
    pub content_hash: String,
    pub created_at: i64,
    pub modified_at: i64,
    pub owner_node_id: String,
    pub version_number: i64,
    pub vector_clock: VectorClock,
    pub is_deleted: bool,
    pub content_type: String,
}

impl FileMetadata {
    /// Replica `file_id`s follow `<original_file_id>::replica::<peer_node_id>`
    /// (spec §3 Ownership).
    pub fn replica_id(original_file_id: &str, peer_node_id: &str) -> String {
        format!("{}::replica::{}", original_file_id, peer_node_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub version_id: String,
    pub file_id: String,
    pub version_number: i64,
    pub content_hash: String,
    pub size: i64,
    pub created_at: i64,
    pub created_by_node_id: String,
    pub vector_clock: VectorClock,
    pub is_current: bool,
    pub parent_version_id: Option<String>,
}

/// A contiguous byte range of a file, identified by its SHA-256 (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSignature {
    pub index: usize,
    pub offset: usize,
    pub size: usize,
    pub weak_hash: u32,
    pub strong_hash: String,
}

/// Closed set of event kinds (spec §4.5). Payloads are structured per kind,
/// not a dynamically-typed bag -- unknown kinds are rejected at the
/// boundary rather than accepted and guessed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    NodeRegistered { node_id: String },
    NodeStatusChanged { node_id: String, old_status: String, new_status: String },
    NodeRemoved { node_id: String },
    FileCreated { file_id: String, version_id: String },
    FileModified { file_id: String, version_id: String, action: Option<String> },
    FileDeleted { file_id: String },
    SyncStarted { peer_node_id: String, file_id: String },
    SyncProgress { peer_node_id: String, file_id: String, progress: u8 },
    SyncCompleted { peer_node_id: String, file_id: String, bytes_transferred: i64, replica_file_id: String },
    SyncError { peer_node_id: String, file_id: String, reason: String },
    ConflictDetected { conflict_id: String, file_id: String, node_a: String, node_b: String },
    ConflictResolved { conflict_id: String, file_id: String, strategy: String },
    VectorClockUpdate { node_id: String },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::NodeRegistered { .. } => "node_registered",
            EventPayload::NodeStatusChanged { .. } => "node_status_changed",
            EventPayload::NodeRemoved { .. } => "node_removed",
            EventPayload::FileCreated { .. } => "file_created",
            EventPayload::FileModified { .. } => "file_modified",
            EventPayload::FileDeleted { .. } => "file_deleted",
            EventPayload::SyncStarted { .. } => "sync_started",
            EventPayload::SyncProgress { .. } => "sync_progress",
            EventPayload::SyncCompleted { .. } => "sync_completed",
            EventPayload::SyncError { .. } => "sync_error",
            EventPayload::ConflictDetected { .. } => "conflict_detected",
            EventPayload::ConflictResolved { .. } => "conflict_resolved",
            EventPayload::VectorClockUpdate { .. } => "vector_clock_update",
        }
    }

    /// The file this event concerns, if any -- used for per-file causal
    /// queries and conflict detection.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            EventPayload::FileCreated { file_id, .. }
            | EventPayload::FileModified { file_id, .. }
            | EventPayload::FileDeleted { file_id }
            | EventPayload::SyncStarted { file_id, .. }
            | EventPayload::SyncProgress { file_id, .. }
            | EventPayload::SyncCompleted { file_id, .. }
            | EventPayload::SyncError { file_id, .. }
            | EventPayload::ConflictDetected { file_id, .. }
            | EventPayload::ConflictResolved { file_id, .. } => Some(file_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub source_node_id: String,
    pub timestamp: i64,
    pub vector_clock: VectorClock,
    pub payload: EventPayload,
    pub processed: bool,
}

impl crate::vector_clock::CausalEvent for Event {
    fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }
    fn timestamp_millis(&self) -> i64 {
        self.timestamp
    }
    fn event_id(&self) -> &str {
        &self.event_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub file_id: String,
    pub node_a: String,
    pub node_b: String,
    pub version_a: String,
    pub version_b: String,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
    pub strategy: Option<String>,
    pub resolved_version_id: Option<String>,
    pub is_resolved: bool,
}

/// Per-node periodic snapshot (§SPEC_FULL B.4), recorded alongside events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub node_id: String,
    pub timestamp: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub active_syncs: i64,
}

/// Result shape for `upload_file` (spec §4.7/§6.1): the stable identifiers a
/// client depends on, not the full `FileMetadata`.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub version_id: String,
    pub sync_latency: i64,
    pub delta_metrics: crate::delta::DeltaEngineStats,
    pub vector_clock: VectorClock,
}

pub fn current_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
