use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, FromRequest, Path, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    deploy::DeploySink,
    domain::{App, Deployment, DomainError},
    repository::RepositoryResolver,
    state::StoreError,
    store::AppStore,
    upload::{AppLocks, IngestError, ingest_upload},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn AppStore>,
    pub sink: Arc<dyn DeploySink>,
    pub repository: Arc<RepositoryResolver>,
    pub locks: Arc<AppLocks>,
}

/// Error side of every handler. 404s carry no body; everything else is a
/// short plain-text message.
#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new("payload_too_large", StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        let message = value.to_string();
        match value.code() {
            "not_found" => ApiError::not_found(message),
            "conflict" => ApiError::conflict(message),
            _ => ApiError::invalid_request(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(domain) => domain.into(),
            StoreError::SchemaVersionMismatch { .. }
            | StoreError::Io(_)
            | StoreError::SerdeJson(_) => ApiError::internal(value.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(value: IngestError) -> Self {
        match value {
            IngestError::AppNotFound { .. } => ApiError::not_found(value.to_string()),
            IngestError::MalformedUpload(_) => ApiError::invalid_request(value.to_string()),
            IngestError::PayloadTooLarge => ApiError::payload_too_large(value.to_string()),
            IngestError::Store(store) => store.into(),
            IngestError::Sink(_) => ApiError::internal(value.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        }
        if self.status == StatusCode::NOT_FOUND {
            return self.status.into_response();
        }
        (self.status, self.message).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

pub fn build_router(
    config: Config,
    store: Arc<dyn AppStore>,
    sink: Arc<dyn DeploySink>,
) -> Router {
    let max_upload_bytes = config.max_upload_bytes();
    let app_state = AppState {
        repository: Arc::new(RepositoryResolver::new(config.git_host.clone())),
        config: Arc::new(config),
        store,
        sink,
        locks: Arc::new(AppLocks::new()),
    };

    Router::new()
        .route("/health", get(health))
        .route("/apps", post(create_app).get(list_apps))
        .route("/apps/", get(list_apps))
        .route("/apps/:name", get(get_app).delete(delete_app))
        .route(
            "/apps/:name/application",
            post(upload_application).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/apps/:name/deployment", get(get_deployment))
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

async fn health(Extension(state): Extension<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
        "git_host": state.repository.git_host(),
        "max_upload_mib": state.config.max_upload_mib,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateAppRequest {
    name: String,
    #[serde(default)]
    framework: String,
}

#[derive(Debug, Serialize)]
struct CreateAppResponse {
    status: &'static str,
    repository_url: String,
}

async fn create_app(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<CreateAppRequest>,
) -> Result<Json<CreateAppResponse>, ApiError> {
    let app = state.store.create(App::new(req.name, req.framework)).await?;
    let repository_url = state.repository.repository_url(&app);
    info!(app = %app.name, framework = %app.framework, %repository_url, "app created");
    Ok(Json(CreateAppResponse {
        status: "success",
        repository_url,
    }))
}

async fn list_apps(Extension(state): Extension<AppState>) -> Result<Json<Vec<App>>, ApiError> {
    Ok(Json(state.store.list().await?))
}

async fn get_app(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<App>, ApiError> {
    Ok(Json(state.store.find_by_name(name).await?))
}

async fn delete_app(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let _guard = state.locks.lock(&name).await;
    state.store.delete(name.clone()).await?;
    info!(app = %name, "app deleted");

    if let Err(e) = state.sink.discard(name.clone()).await {
        warn!(app = %name, error = %e, "failed to discard archive of deleted app");
    }
    Ok(StatusCode::OK)
}

async fn upload_application(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    req: Request,
) -> Result<&'static str, ApiError> {
    let ingested = ingest_upload(
        state.store.as_ref(),
        state.sink.as_ref(),
        &state.locks,
        name.clone(),
        req,
    )
    .await;
    match ingested {
        Ok(deployment) => {
            info!(
                app = %name,
                deployment_id = %deployment.deployment_id,
                filename = %deployment.filename,
                size_bytes = deployment.size_bytes,
                entries = deployment.entries,
                sha256 = %deployment.sha256,
                "archive received"
            );
            Ok("success")
        }
        Err(e) => {
            if matches!(
                e,
                IngestError::MalformedUpload(_) | IngestError::PayloadTooLarge
            ) {
                warn!(app = %name, error = %e, "upload rejected");
            }
            Err(e.into())
        }
    }
}

async fn get_deployment(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    state.store.find_by_name(name.clone()).await?;
    Ok(Json(state.store.find_deployment(name).await?))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
