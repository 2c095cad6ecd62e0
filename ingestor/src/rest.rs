use crate::accounts::{AccountService, Session};
use crate::errors::Error;
use crate::model::{Device, DeviceFilter, QueryResponse, Reading, ReadingFilter};
use crate::query::QueryGateway;
use crate::registry::DeviceRegistry;
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountService>,
    pub registry: Arc<DeviceRegistry>,
    pub query: QueryGateway,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    device_id: String,
    device_name: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/register", post(register_account))
        .route("/api/login", post(login))
        .route("/api/data", get(get_data))
        .route("/api/devices", get(get_devices))
        .route("/api/devices/mine", get(my_devices))
        .route("/api/devices/register", post(register_device))
        .route("/api/devices/:device_id/claim", post(claim_device))
        .route("/api/devices/:device_id/release", post(release_device))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn register_account(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<Session>, AppError> {
    Ok(Json(
        state
            .accounts
            .register(&body.username, &body.password)
            .await?,
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<Session>, AppError> {
    Ok(Json(state.accounts.login(&body.username, &body.password).await?))
}

async fn get_data(
    State(state): State<AppState>,
    Query(filter): Query<ReadingFilter>,
) -> Result<Json<QueryResponse<Reading>>, AppError> {
    Ok(Json(state.query.readings(filter).await?.into()))
}

async fn get_devices(
    State(state): State<AppState>,
    Query(filter): Query<DeviceFilter>,
) -> Result<Json<QueryResponse<Device>>, AppError> {
    Ok(Json(state.query.devices(filter).await?.into()))
}

async fn my_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueryResponse<Device>>, AppError> {
    let owner = bearer_subject(&state, &headers)?;
    Ok(Json(state.registry.list_for_owner(&owner).await?.into()))
}

async fn register_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    let owner = bearer_subject(&state, &headers)?;
    let device = state
        .registry
        .register(&body.device_id, &owner, body.device_name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn claim_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let owner = bearer_subject(&state, &headers)?;
    state.registry.claim(&device_id, &owner).await?;
    Ok(Json(json!({ "deviceId": device_id, "ownerId": owner })))
}

async fn release_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let subject = bearer_subject(&state, &headers)?;
    state.registry.release_by(&device_id, &subject).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn bearer_subject(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::InvalidToken("missing bearer token".to_string()))?;

    Ok(state.accounts.credentials().verify(token.trim())?)
}

pub struct AppError(Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Validation(_) | Error::BadRequest(_) | Error::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) | Error::Unregistered(_) => StatusCode::FORBIDDEN,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!("API error: {}", self.0);
            status
                .canonical_reason()
                .unwrap_or("Internal server error")
                .to_string()
        } else {
            self.0.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}
