//! Admin-only identity management.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::{listing_response, principal::require_admin};
use crate::{api::ApiError, identity::Orchestrator};

#[derive(Deserialize, Debug)]
pub struct LockoutToggle {
    enabled: bool,
}

#[derive(Deserialize, Debug)]
pub struct RoleAssignment {
    #[serde(default)]
    role: String,
}

pub async fn list(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&headers, &orchestrator)?;
    Ok(listing_response(orchestrator.list_identities().await?))
}

#[instrument(skip(orchestrator, headers))]
pub async fn unlock(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&headers, &orchestrator)?;
    orchestrator.unlock(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(orchestrator, headers))]
pub async fn set_lockout(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    payload: Option<Json<LockoutToggle>>,
) -> Result<StatusCode, ApiError> {
    require_admin(&headers, &orchestrator)?;
    let Some(Json(toggle)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    orchestrator.set_lockout_enabled(id, toggle.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(orchestrator, headers))]
pub async fn confirm_email(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&headers, &orchestrator)?;
    orchestrator.confirm_email(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(orchestrator, headers))]
pub async fn assign_role(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    payload: Option<Json<RoleAssignment>>,
) -> Result<StatusCode, ApiError> {
    require_admin(&headers, &orchestrator)?;
    let Some(Json(assignment)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    orchestrator.assign_role(id, &assignment.role).await?;
    Ok(StatusCode::NO_CONTENT)
}
