use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use hv_infra::registry::{Aggregate, Target};
use hv_infra::types::{ConsoleInfo, VmConfig, VmCreated, VmInfo};

use crate::dto::{CloneVmRequest, MessageResponse, ProviderQuery, SnapshotRequest};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_vms(
    State(state): State<AppState>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<Aggregate<Vec<VmInfo>>>, ApiError> {
    Ok(Json(state.registry.list_vms(Target::from(q.name())).await?))
}

pub async fn create_vm(
    State(state): State<AppState>,
    Query(q): Query<ProviderQuery>,
    Json(config): Json<VmConfig>,
) -> Result<(StatusCode, Json<VmCreated>), ApiError> {
    let created = state.registry.create_vm(q.name(), config).await?;
    tracing::info!(vm = %created.name, provider = %created.provider, "vm created");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn clone_vm(
    State(state): State<AppState>,
    Query(q): Query<ProviderQuery>,
    Json(req): Json<CloneVmRequest>,
) -> Result<(StatusCode, Json<VmCreated>), ApiError> {
    let created = state
        .registry
        .clone_vm(q.name(), &req.source, req.config)
        .await?;
    tracing::info!(vm = %created.name, source = %req.source, "vm cloned");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<VmInfo>, ApiError> {
    state
        .registry
        .get_vm_info(q.name(), &name)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(format!("vm {name}")))
}

pub async fn delete_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.registry.delete_vm(q.name(), &name).await?;
    Ok(Json(MessageResponse::new(format!("VM '{name}' deleted"))))
}

pub async fn start_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.registry.start_vm(q.name(), &name).await?;
    Ok(Json(MessageResponse::new(format!("VM '{name}' started"))))
}

pub async fn stop_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.registry.stop_vm(q.name(), &name).await?;
    Ok(Json(MessageResponse::new(format!("VM '{name}' stopped"))))
}

pub async fn restart_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.registry.restart_vm(q.name(), &name).await?;
    Ok(Json(MessageResponse::new(format!("VM '{name}' restarted"))))
}

pub async fn create_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<ProviderQuery>,
    Json(req): Json<SnapshotRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    state
        .registry
        .create_snapshot(q.name(), &name, &req.name)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new(format!(
            "snapshot '{}' of VM '{name}' created",
            req.name
        ))),
    ))
}

pub async fn restore_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .registry
        .restore_snapshot(q.name(), &name, &snapshot)
        .await?;
    Ok(Json(MessageResponse::new(format!(
        "VM '{name}' restored to snapshot '{snapshot}'"
    ))))
}

pub async fn delete_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .registry
        .delete_snapshot(q.name(), &name, &snapshot)
        .await?;
    Ok(Json(MessageResponse::new(format!(
        "snapshot '{snapshot}' of VM '{name}' deleted"
    ))))
}

pub async fn open_console(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<ConsoleInfo>, ApiError> {
    Ok(Json(state.registry.open_console(q.name(), &name).await?))
}
