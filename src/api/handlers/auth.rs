use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{debug, instrument};

use super::principal::optional_auth;
use crate::{
    api::ApiError,
    identity::{NewRegistration, Orchestrator},
};

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default, alias = "rememberMe")]
    remember_me: bool,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("remember_me", &self.remember_me)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[instrument(skip(orchestrator, payload))]
pub async fn login(
    orchestrator: Extension<Arc<Orchestrator>>,
    payload: Option<Json<LoginRequest>>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    debug!("login: {:?}", request);

    let issued = orchestrator
        .login(&request.username, &request.password, request.remember_me)
        .await?;

    Ok(Json(LoginResponse {
        token: issued.token,
        expires_at: issued.expires_at,
    }))
}

// Tokens are stateless; the client drops its copy.
pub async fn logout() -> impl IntoResponse {
    StatusCode::OK
}

#[instrument(skip(orchestrator, headers, payload))]
pub async fn register(
    orchestrator: Extension<Arc<Orchestrator>>,
    headers: HeaderMap,
    payload: Option<Json<NewRegistration>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(Json(registration)) = payload else {
        return Err(ApiError::MissingPayload);
    };
    debug!("registration: {:?}", registration);

    let caller = optional_auth(&headers, &orchestrator)?;
    let created = orchestrator.register(registration, caller.as_ref()).await?;

    Ok((StatusCode::CREATED, Json(created)))
}
