use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use hv_infra::ProviderName;
use hv_infra::config::ProviderEntry;
use hv_infra::registry::{Aggregate, ProviderStatus, Target};

use crate::dto::{DefaultProviderRequest, MessageResponse, ProviderQuery, ProvidersResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    let config = state.registry.config().await;
    Json(ProvidersResponse {
        default_provider: config.default_provider,
        providers: config.providers.into_keys().collect(),
    })
}

pub async fn provider_status(State(state): State<AppState>) -> Json<Vec<ProviderStatus>> {
    Json(state.registry.status().await)
}

/// Body is the provider block: `enabled` plus any backend fields to change.
pub async fn update_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(entry): Json<ProviderEntry>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.registry.update_config(&name, entry).await?;
    Ok(Json(MessageResponse::new(format!(
        "provider '{name}' updated"
    ))))
}

pub async fn set_default_provider(
    State(state): State<AppState>,
    Json(req): Json<DefaultProviderRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.registry.set_default_provider(&req.provider).await?;
    Ok(Json(MessageResponse::new(format!(
        "default provider set to '{}'",
        req.provider
    ))))
}

// ── Discovery ──────────────────────────────────────────────────────

pub async fn templates(
    State(state): State<AppState>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<Aggregate<Vec<String>>>, ApiError> {
    Ok(Json(state.registry.templates(Target::from(q.name())).await?))
}

pub async fn clusters(
    State(state): State<AppState>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<Aggregate<BTreeMap<ProviderName, Vec<String>>>>, ApiError> {
    Ok(Json(state.registry.clusters(Target::from(q.name())).await?))
}

pub async fn networks(
    State(state): State<AppState>,
    Query(q): Query<ProviderQuery>,
) -> Result<Json<Aggregate<BTreeMap<ProviderName, Vec<String>>>>, ApiError> {
    Ok(Json(state.registry.networks(Target::from(q.name())).await?))
}
