//! Core /api handlers, served by every role
//!
//! Model listing and load/unload act on the local supervisor and
//! registry; clustered placement goes through the master routes instead.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::ModelDto;
use crate::supervisor::{launch, LaunchSpec, SupervisorError};

use super::envelope::{Envelope, ErrorCode};
use super::state::AppState;

/// GET /api/info
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: &'static str,
    pub version: &'static str,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub role: String,
    pub state: String,
}

pub async fn get_info(State(state): State<AppState>) -> Envelope<ServerInfo> {
    let info = state.node.info().await;
    Envelope::ok(ServerInfo {
        name: "shepherd",
        version: env!("CARGO_PKG_VERSION"),
        node_id: info.id,
        role: info.role.to_string(),
        state: format!("{:?}", info.state).to_lowercase(),
    })
}

/// GET /api/models
pub async fn list_models(State(state): State<AppState>) -> Envelope<Vec<ModelDto>> {
    let started = Instant::now();
    let models = state.node.registry().list_models().await;

    let mut dtos = Vec::with_capacity(models.len());
    for model in models {
        let status = state.node.supervisor().status(&model.id).await;
        dtos.push(model.to_dto(status.as_ref()));
    }

    Envelope::ok(dtos).with_latency(started.elapsed().as_millis() as u64)
}

/// Body for POST /api/models/{id}/load
#[derive(Debug, Default, Deserialize)]
pub struct LoadRequest {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub params: Option<HashMap<String, Value>>,
    #[serde(rename = "binaryPath")]
    #[serde(default)]
    pub binary_path: Option<String>,
}

/// Result of a local load
#[derive(Debug, Serialize)]
pub struct LoadResponse {
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub port: u16,
    pub pid: u32,
}

/// POST /api/models/{id}/load - load on this node
pub async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<LoadRequest>>,
) -> Envelope<LoadResponse> {
    let started = Instant::now();
    let request = body.map(|Json(b)| b).unwrap_or_default();

    match load_model_locally(&state, &id, request).await {
        Ok(response) => {
            Envelope::ok(response).with_latency(started.elapsed().as_millis() as u64)
        }
        Err((code, message)) => Envelope::err(code, message),
    }
}

/// The local load path shared by standalone, master and hybrid roles
async fn load_model_locally(
    state: &AppState,
    model_key: &str,
    request: LoadRequest,
) -> Result<LoadResponse, (ErrorCode, String)> {
    let node = &state.node;
    let model = node
        .registry()
        .resolve(model_key)
        .await
        .ok_or_else(|| (ErrorCode::NodeNotFound, format!("model '{}' not found", model_key)))?;

    let binary = match request.binary_path {
        Some(path) => path,
        None => {
            let snapshot = node.monitor().latest().await.unwrap_or_default();
            let available: Vec<_> = snapshot
                .llama_binaries
                .iter()
                .filter(|b| b.available)
                .collect();
            available
                .iter()
                .find(|b| b.supports_gpu)
                .or_else(|| available.first())
                .map(|b| b.path.clone())
                .ok_or_else(|| {
                    (
                        ErrorCode::CommandFailed,
                        "no llama.cpp binary available".to_string(),
                    )
                })?
        }
    };

    let supervisor = node.supervisor();
    let port = supervisor
        .reserve_port(request.port)
        .await
        .map_err(supervisor_error)?;

    let params = request.params.unwrap_or_default();
    let args = launch::generate_args(&model.path.to_string_lossy(), "127.0.0.1", port, &params);
    let spec = LaunchSpec {
        model_id: model.id.clone(),
        binary_path: binary.into(),
        args,
        env: HashMap::new(),
        port: Some(port),
        ready_sentinel: Some(supervisor.default_sentinel().to_string()),
        load_params: params,
    };

    let process = match supervisor.start(spec).await {
        Ok(p) => p,
        Err(e) => {
            supervisor.release_port(port).await;
            return Err(supervisor_error(e));
        }
    };

    supervisor
        .await_ready(&model.id)
        .await
        .map_err(supervisor_error)?;

    Ok(LoadResponse {
        model_id: model.id,
        port: process.port,
        pid: process.pid,
    })
}

fn supervisor_error(e: SupervisorError) -> (ErrorCode, String) {
    let code = match &e {
        SupervisorError::Conflict(_) | SupervisorError::PortInUse(_) => ErrorCode::Conflict,
        SupervisorError::PortExhausted(_, _) => ErrorCode::ResourceExhausted,
        SupervisorError::NotFound(_) => ErrorCode::NodeNotFound,
        SupervisorError::ReadyFailed(_, _) => ErrorCode::CommandFailed,
        SupervisorError::SpawnFailed(_) | SupervisorError::IoError(_) => ErrorCode::CommandFailed,
    };
    (code, e.to_string())
}

/// Body for POST /api/models/{id}/unload
#[derive(Debug, Default, Deserialize)]
pub struct UnloadRequest {
    #[serde(default)]
    pub force: bool,
}

/// POST /api/models/{id}/unload
pub async fn unload_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<UnloadRequest>>,
) -> Envelope<Value> {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);

    let model_id = match state.node.registry().resolve(&id).await {
        Some(model) => model.id,
        None => id,
    };

    match state.node.supervisor().stop(&model_id, force).await {
        Ok(()) => Envelope::ok(serde_json::json!({ "modelId": model_id })),
        Err(e) => {
            let (code, message) = supervisor_error(e);
            Envelope::err(code, message)
        }
    }
}

/// POST /api/models/{id}/favourite
#[derive(Debug, Deserialize)]
pub struct FavouriteRequest {
    pub favourite: bool,
}

pub async fn set_favourite(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FavouriteRequest>,
) -> Envelope<Value> {
    match state
        .node
        .registry()
        .set_favourite(&id, body.favourite)
        .await
    {
        Ok(()) => Envelope::ok(serde_json::json!({ "id": id, "favourite": body.favourite })),
        Err(e) => Envelope::err(ErrorCode::NodeNotFound, e.to_string()),
    }
}

/// POST /api/scan
pub async fn scan_models(State(state): State<AppState>) -> Envelope<Value> {
    let started = Instant::now();
    state.node.monitor().invalidate_binaries();

    match state.node.registry().scan().await {
        Ok(summary) => Envelope::ok(serde_json::to_value(&summary).unwrap_or_default())
            .with_latency(started.elapsed().as_millis() as u64),
        Err(e) => Envelope::err(ErrorCode::InternalError, e.to_string()),
    }
}

/// GET /api/resources
pub async fn get_resources(State(state): State<AppState>) -> Envelope<Value> {
    match state.node.monitor().latest().await {
        Some(snapshot) => Envelope::ok(serde_json::to_value(&snapshot).unwrap_or_default()),
        None => Envelope::err(ErrorCode::InternalError, "no resource sample yet"),
    }
}

/// GET /api/processes
pub async fn list_processes(State(state): State<AppState>) -> Envelope<Value> {
    let list = state.node.supervisor().list().await;
    Envelope::ok(serde_json::to_value(&list).unwrap_or_default())
}
