//! HTTP + WebSocket request surface (spec §6). Handlers are thin: decode
//! the request, call into `Coordinator`, wrap the result. Grounded on
//! `bin/tao_web_server.rs`'s handler shape (`AppState` + `ApiResponse<T>`)
//! and axum's `ws` feature for the push subscriptions.

use crate::coordinator::Coordinator;
use crate::delta::Delta;
use crate::error::{AppError, AppResult};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub type AppState = Arc<Coordinator>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/nodes", post(register_node).get(list_nodes))
        .route("/api/nodes/{node_id}", get(get_node).delete(remove_node))
        .route("/api/nodes/{node_id}/heartbeat", post(heartbeat))
        .route("/api/files", post(upload_file).get(list_files))
        .route("/api/files/{file_id}", get(get_file).delete(delete_file))
        .route("/api/files/{file_id}/content", get(download_file))
        .route("/api/files/{file_id}/chunks", get(get_file_chunks))
        .route("/api/files/{file_id}/history", get(get_file_history))
        .route("/api/files/{file_id}/restore", post(restore_version))
        .route("/api/files/{file_id}/delta", post(apply_delta))
        .route("/api/files/{file_id}/events", get(causal_events_for_file))
        .route("/api/conflicts", get(list_conflicts))
        .route("/api/conflicts/{conflict_id}/resolve", post(resolve_conflict))
        .route("/api/events", get(list_events))
        .route("/api/metrics", get(metrics))
        .route("/api/metrics/delta", get(delta_metrics))
        .route("/api/topology", get(topology))
        .route("/api/replication/status", get(replication_status))
        .route("/ws/dashboard", get(dashboard_ws))
        .route("/ws/nodes/{node_id}", get(node_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn ok(data: impl Serialize) -> Json<Value> {
    Json(json!({ "status": "ok", "data": data }))
}

fn decode_bytes(field: &BytesField) -> AppResult<Vec<u8>> {
    use base64::Engine;
    if let Some(b64) = &field.base64 {
        return base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| AppError::BadRequest(format!("invalid base64 content: {}", e)));
    }
    if let Some(hex_str) = &field.hex {
        return decode_hex(hex_str).map_err(|e| AppError::BadRequest(format!("invalid hex content: {}", e)));
    }
    Err(AppError::BadRequest("request must include either `base64` or `hex` content".to_string()))
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct BytesField {
    base64: Option<String>,
    hex: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterNodeRequest {
    node_id: String,
    display_name: String,
    address: String,
    port: u16,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    watch_dirs: Vec<String>,
}

async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> AppResult<impl IntoResponse> {
    let node = state
        .register_node(&req.node_id, &req.display_name, &req.address, req.port, req.capabilities, req.watch_dirs)
        .await?;
    Ok(ok(node))
}

async fn list_nodes(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.list_nodes().await?))
}

async fn get_node(State(state): State<AppState>, Path(node_id): Path<String>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.get_node(&node_id).await?))
}

async fn remove_node(State(state): State<AppState>, Path(node_id): Path<String>) -> AppResult<impl IntoResponse> {
    state.remove_node(&node_id).await?;
    Ok(ok(json!({ "removed": node_id })))
}

async fn heartbeat(State(state): State<AppState>, Path(node_id): Path<String>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.heartbeat(&node_id).await?))
}

#[derive(Debug, Deserialize)]
struct UploadFileRequest {
    node_id: String,
    file_id: String,
    name: String,
    logical_path: String,
    #[serde(default = "default_content_type")]
    content_type: String,
    #[serde(flatten)]
    bytes_field: BytesField,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

async fn upload_file(State(state): State<AppState>, Json(req): Json<UploadFileRequest>) -> AppResult<impl IntoResponse> {
    let bytes = decode_bytes(&req.bytes_field)?;
    let result = state
        .upload_file(&req.node_id, &req.file_id, &req.name, &req.logical_path, &req.content_type, bytes)
        .await?;
    Ok(ok(result))
}

#[derive(Debug, Deserialize)]
struct ListFilesQuery {
    node_id: Option<String>,
}

async fn list_files(State(state): State<AppState>, Query(q): Query<ListFilesQuery>) -> AppResult<impl IntoResponse> {
    let files = match q.node_id {
        Some(node_id) => state.list_files_by_node(&node_id).await?,
        None => state.list_files().await?,
    };
    Ok(ok(files))
}

async fn get_file(State(state): State<AppState>, Path(file_id): Path<String>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.get_file(&file_id).await?))
}

async fn delete_file(State(state): State<AppState>, Path(file_id): Path<String>, Query(q): Query<HashMap<String, String>>) -> AppResult<impl IntoResponse> {
    let node_id = q.get("node_id").cloned().unwrap_or_else(|| "unknown".to_string());
    state.delete_file(&node_id, &file_id).await?;
    Ok(ok(json!({ "deleted": file_id })))
}

async fn download_file(State(state): State<AppState>, Path(file_id): Path<String>) -> AppResult<impl IntoResponse> {
    let (meta, bytes) = state.download_file(&file_id).await?;
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(ok(json!({ "metadata": meta, "base64": encoded })))
}

async fn get_file_chunks(State(state): State<AppState>, Path(file_id): Path<String>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.get_file_chunks(&file_id)?))
}

async fn get_file_history(State(state): State<AppState>, Path(file_id): Path<String>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.get_file_history(&file_id)))
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    node_id: String,
    version_id: String,
    #[serde(default)]
    undelete: bool,
}

async fn restore_version(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    Json(req): Json<RestoreRequest>,
) -> AppResult<impl IntoResponse> {
    let version = state.restore_version(&req.node_id, &file_id, &req.version_id, req.undelete).await?;
    Ok(ok(version))
}

#[derive(Debug, Deserialize)]
struct ApplyDeltaRequest {
    node_id: String,
    delta: Delta,
}

async fn apply_delta(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    Json(req): Json<ApplyDeltaRequest>,
) -> AppResult<impl IntoResponse> {
    let file = state.apply_delta(&req.node_id, &file_id, &req.delta).await?;
    Ok(ok(file))
}

async fn causal_events_for_file(State(state): State<AppState>, Path(file_id): Path<String>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.list_causal_events(&file_id).await?))
}

async fn list_conflicts(State(state): State<AppState>, Query(q): Query<HashMap<String, String>>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.list_conflicts(q.get("file_id").map(|s| s.as_str())).await?))
}

#[derive(Debug, Deserialize)]
struct ResolveConflictRequest {
    node_id: String,
    file_id: String,
    strategy: String,
    resolved_version_id: String,
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(conflict_id): Path<String>,
    Json(req): Json<ResolveConflictRequest>,
) -> AppResult<impl IntoResponse> {
    state
        .resolve_conflict(&req.node_id, &conflict_id, &req.file_id, &req.strategy, &req.resolved_version_id)
        .await?;
    Ok(ok(json!({ "resolved": conflict_id })))
}

#[derive(Debug, Deserialize)]
struct ListEventsQuery {
    #[serde(default = "default_event_limit")]
    limit: i64,
}

fn default_event_limit() -> i64 {
    100
}

async fn list_events(State(state): State<AppState>, Query(q): Query<ListEventsQuery>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.list_events(q.limit).await?))
}

async fn metrics(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.get_metrics().await?))
}

async fn delta_metrics(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.get_delta_metrics()))
}

async fn topology(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.get_topology().await?))
}

async fn replication_status(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(ok(state.get_replication_status().await))
}

async fn dashboard_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_dashboard_socket(socket, state))
}

async fn handle_dashboard_socket(mut socket: WebSocket, state: AppState) {
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let mut rx = state.subscribe_dashboard(&subscriber_id).await;

    if let Ok(nodes) = state.list_nodes().await {
        let _ = socket.send(Message::Text(json!({ "frame": "initial_data", "nodes": nodes }).to_string().into())).await;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let frame = json!({ "frame": "event", "event": event });
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn node_ws(State(state): State<AppState>, Path(node_id): Path<String>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_node_socket(socket, state, node_id))
}

async fn handle_node_socket(mut socket: WebSocket, state: AppState, node_id: String) {
    let mut rx = state.subscribe_node(&node_id).await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let frame = json!({ "frame": "event", "event": event });
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.contains("\"heartbeat\"") {
                            let _ = state.heartbeat(&node_id).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
