//! Admin-only role administration.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::{listing_response, principal::require_admin};
use crate::{
    api::ApiError,
    identity::{Orchestrator, Role},
};

#[derive(Deserialize, Debug)]
pub struct RoleName {
    #[serde(default)]
    name: String,
}

pub async fn list(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&headers, &orchestrator)?;
    Ok(listing_response(orchestrator.list_roles().await?))
}

pub async fn get(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Role>, ApiError> {
    require_admin(&headers, &orchestrator)?;
    Ok(Json(orchestrator.role_by_id(id).await?))
}

pub async fn search(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Vec<Role>>, ApiError> {
    require_admin(&headers, &orchestrator)?;
    Ok(Json(orchestrator.search_roles(&name).await?))
}

#[instrument(skip(orchestrator, headers))]
pub async fn create(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    payload: Option<Json<RoleName>>,
) -> Result<Response, ApiError> {
    require_admin(&headers, &orchestrator)?;
    let Some(Json(role)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    let created = orchestrator.create_role(&role.name).await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

#[instrument(skip(orchestrator, headers))]
pub async fn update(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    payload: Option<Json<RoleName>>,
) -> Result<Json<Role>, ApiError> {
    require_admin(&headers, &orchestrator)?;
    let Some(Json(role)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    Ok(Json(orchestrator.update_role(id, &role.name).await?))
}

#[instrument(skip(orchestrator, headers))]
pub async fn delete(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&headers, &orchestrator)?;
    orchestrator.delete_role(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
