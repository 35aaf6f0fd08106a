//! Master-only /api/master handlers
//!
//! Client registration, heartbeat ingestion, the per-node command
//! long-poll, the result sink, and scheduled command submission.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::cluster::{
    Command, CommandResult, CommandType, Heartbeat, ManagerError, ModelPlacement, NodeCandidate,
};
use crate::cluster::protocol::RegisterResponse;
use crate::node::types::{NodeInfo, MODEL_FILES_METADATA_KEY};

use super::envelope::{Envelope, ErrorCode};
use super::state::AppState;

/// Server-side cap on the long-poll wait
const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

fn manager_error<T>(e: ManagerError) -> Envelope<T> {
    match e {
        ManagerError::UnknownNode(_) => Envelope::err(ErrorCode::NodeNotFound, e.to_string()),
        ManagerError::NotAuthenticated(_) => {
            Envelope::err(ErrorCode::NotAuthenticated, e.to_string())
        }
    }
}

/// POST /api/master/clients/register
pub async fn register_client(
    State(state): State<AppState>,
    Json(info): Json<NodeInfo>,
) -> Envelope<RegisterResponse> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };

    let master_id = state.node.info().await.id;
    let outcome = manager.register(info);
    Envelope::ok(RegisterResponse {
        accepted: outcome.accepted,
        conflict: outcome.conflict,
        master_id: Some(master_id),
    })
}

/// DELETE /api/master/clients/{id}
pub async fn deregister_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Envelope<Value> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };

    match manager.deregister(&id) {
        Ok(_) => Envelope::ok(serde_json::json!({ "id": id })),
        Err(e) => manager_error(e),
    }
}

/// POST /api/master/heartbeat
pub async fn ingest_heartbeat(
    State(state): State<AppState>,
    Json(heartbeat): Json<Heartbeat>,
) -> Envelope<Value> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };

    match manager.heartbeat(&heartbeat) {
        Ok(()) => Envelope::ok(serde_json::json!({ "applied": true })),
        Err(e) => manager_error(e),
    }
}

/// GET /api/master/nodes
pub async fn list_nodes(State(state): State<AppState>) -> Envelope<Vec<NodeInfo>> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };
    Envelope::ok(manager.list())
}

/// GET /api/master/nodes/{id}
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Envelope<NodeInfo> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };
    match manager.get(&id) {
        Some(node) => Envelope::ok(node),
        None => Envelope::err(ErrorCode::NodeNotFound, format!("node '{}' not found", id)),
    }
}

/// Body for POST /api/master/command
#[derive(Debug, Deserialize)]
pub struct SubmitCommandRequest {
    #[serde(rename = "type")]
    pub command_type: CommandType,

    /// Explicit target; omitted for scheduled load_model commands
    #[serde(rename = "toNodeId")]
    #[serde(default)]
    pub to_node_id: Option<String>,

    #[serde(default)]
    pub payload: HashMap<String, Value>,

    #[serde(rename = "timeoutSecs")]
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// POST /api/master/command
///
/// A missing target on a load_model command invokes the scheduler.
pub async fn submit_command(
    State(state): State<AppState>,
    Json(mut request): Json<SubmitCommandRequest>,
) -> Envelope<Value> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };

    let target = match request.to_node_id.clone() {
        Some(target) => target,
        None if request.command_type == CommandType::LoadModel => {
            match schedule_target(&state, &request).await {
                Ok((target, portable_key)) => {
                    // Stable model IDs are path-derived and per-node; the
                    // file name is the handle the chosen node can resolve.
                    request
                        .payload
                        .insert("model_id".to_string(), Value::String(portable_key));
                    target
                }
                Err(envelope) => return envelope,
            }
        }
        None => {
            return Envelope::err(
                ErrorCode::InvalidRequest,
                "toNodeId is required for this command type",
            )
        }
    };

    let master_id = state.node.info().await.id;
    let mut command = Command::new(request.command_type, master_id, target.as_str());
    command.payload = request.payload;
    command.timeout_secs = request.timeout_secs;
    command.sign(&state.api_key());

    let command_id = command.id;
    match manager.enqueue_command(command).await {
        Ok(()) => {
            info!(command = %command_id, node = %target, "Command submitted");
            Envelope::ok(serde_json::json!({
                "commandId": command_id,
                "toNodeId": target,
            }))
        }
        Err(e) => manager_error(e),
    }
}

/// Pick a node for an untargeted load_model
///
/// Returns the chosen node ID plus the model's file name, which the
/// caller substitutes for `model_id` so the target node can resolve it.
async fn schedule_target(
    state: &AppState,
    request: &SubmitCommandRequest,
) -> Result<(String, String), Envelope<Value>> {
    let manager = state.node.manager().expect("checked by caller");
    let Some(scheduler) = state.node.scheduler() else {
        return Err(Envelope::err(ErrorCode::PermissionDenied, "not a master"));
    };

    let model_key = request
        .payload
        .get("model_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Envelope::err(ErrorCode::InvalidRequest, "payload field model_id required")
        })?;

    // The master's own registry resolves size and file name when the
    // model is known locally; remote-only models fall back to the key.
    let (model_id, file_name, size_bytes) = match state.node.registry().resolve(model_key).await {
        Some(model) => (
            model.id.clone(),
            model
                .path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or(model_key)
                .to_string(),
            model.size_bytes,
        ),
        None => (model_key.to_string(), model_key.to_string(), 0),
    };

    let mut candidates = Vec::new();
    for info in manager.list() {
        let pending = manager.pending_count(&info.id).await;
        let has_model_file = info
            .metadata
            .get(MODEL_FILES_METADATA_KEY)
            .map(|files| files.split(',').any(|f| f == file_name))
            .unwrap_or(false);
        let loaded_models = info.loaded_models as usize;
        candidates.push(NodeCandidate {
            info,
            active_commands: pending,
            loaded_models,
            has_model_file,
        });
    }

    let placement = ModelPlacement {
        model_id,
        file_name: file_name.clone(),
        size_bytes,
    };

    scheduler
        .schedule(&candidates, &placement)
        .map(|c| (c.info.id.clone(), file_name))
        .map_err(|e| match e {
            crate::cluster::ScheduleError::NoCapacity(_) => {
                Envelope::err(ErrorCode::ResourceExhausted, e.to_string())
            }
            crate::cluster::ScheduleError::NoCandidates => {
                Envelope::err(ErrorCode::ResourceExhausted, e.to_string())
            }
        })
}

/// Query for the command long-poll
#[derive(Debug, Deserialize)]
pub struct NextCommandQuery {
    #[serde(rename = "waitMillis")]
    #[serde(default)]
    pub wait_millis: Option<u64>,
}

/// GET /api/master/clients/{id}/commands/next
pub async fn next_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<NextCommandQuery>,
) -> Envelope<Option<Command>> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };

    let wait = Duration::from_millis(query.wait_millis.unwrap_or(2000)).min(MAX_POLL_WAIT);
    match manager.dequeue_command(&id, wait).await {
        Ok(command) => Envelope::ok(command),
        Err(e) => manager_error(e),
    }
}

/// POST /api/master/clients/{id}/results
///
/// Duplicate deliveries are acknowledged exactly like first deliveries;
/// the client must never be penalised for redelivering.
pub async fn ingest_result(
    State(state): State<AppState>,
    Path(_id): Path<String>,
    Json(result): Json<CommandResult>,
) -> Envelope<Value> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };

    let stored = manager.ingest_result(result).await;
    Envelope::ok(serde_json::json!({ "stored": stored }))
}

/// GET /api/master/results/{commandId}
pub async fn get_result(
    State(state): State<AppState>,
    Path(command_id): Path<Uuid>,
) -> Envelope<CommandResult> {
    let Some(manager) = state.node.manager() else {
        return Envelope::err(ErrorCode::PermissionDenied, "not a master");
    };
    match manager.get_result(&command_id) {
        Some(result) => Envelope::ok(result),
        None => Envelope::err(
            ErrorCode::NodeNotFound,
            format!("no result for command '{}'", command_id),
        ),
    }
}
