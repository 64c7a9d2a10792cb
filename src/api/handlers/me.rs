//! Self-service account endpoints for the bearer's own identity.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

use super::principal::require_auth;
use crate::{
    api::ApiError,
    identity::{Orchestrator, SessionClaims},
};

#[derive(Deserialize)]
pub struct PasswordChange {
    #[serde(default)]
    current_password: String,
    #[serde(default)]
    new_password: String,
}

#[derive(Deserialize, Debug)]
pub struct EmailChange {
    email: String,
}

#[derive(Deserialize, Debug)]
pub struct UsernameChange {
    username: String,
}

pub async fn me(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
) -> Result<Json<SessionClaims>, ApiError> {
    let claims = require_auth(&headers, &orchestrator)?;
    Ok(Json(claims))
}

#[instrument(skip(orchestrator, headers, payload))]
pub async fn change_password(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    payload: Option<Json<PasswordChange>>,
) -> Result<StatusCode, ApiError> {
    let claims = require_auth(&headers, &orchestrator)?;
    let Some(Json(change)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    orchestrator
        .change_password(claims.id, &change.current_password, &change.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(orchestrator, headers))]
pub async fn change_email(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    payload: Option<Json<EmailChange>>,
) -> Result<StatusCode, ApiError> {
    let claims = require_auth(&headers, &orchestrator)?;
    let Some(Json(change)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    orchestrator.change_email(claims.id, &change.email).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(orchestrator, headers))]
pub async fn change_username(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    payload: Option<Json<UsernameChange>>,
) -> Result<StatusCode, ApiError> {
    let claims = require_auth(&headers, &orchestrator)?;
    let Some(Json(change)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    orchestrator
        .change_username(claims.id, &change.username)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
