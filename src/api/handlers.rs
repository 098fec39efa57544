use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::models::kinds::{self, KindSpec};
use crate::models::{registry_key, registry_prefix};
use crate::storage::StorageError;

use super::server::AppState;

/// Which API group a nested router serves; lets the shared handlers reject
/// a kind addressed through the wrong group prefix.
#[derive(Clone, Copy)]
pub struct Group(pub &'static str);

#[derive(Deserialize)]
pub struct ListParams {
    watch: Option<bool>,
}

pub struct ApiError {
    status: StatusCode,
    status_text: &'static str,
    error_text: Option<String>,
}

impl ApiError {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            status_text: "Resource not found",
            error_text: None,
        }
    }

    fn invalid(detail: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            status_text: "Invalid request",
            error_text: Some(detail.to_string()),
        }
    }

    fn storage(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => Self::not_found(),
            StorageError::Conflict => Self {
                status: StatusCode::CONFLICT,
                status_text: "Resource conflict",
                error_text: Some(err.to_string()),
            },
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                status_text: "Internal server error",
                error_text: Some(other.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut payload = json!({ "status": self.status_text });
        if let Some(detail) = self.error_text {
            payload["error"] = Value::String(detail);
        }
        (self.status, Json(payload)).into_response()
    }
}

fn resolve(group: &str, plural: &str) -> Result<&'static KindSpec, ApiError> {
    kinds::lookup(group, plural).ok_or_else(ApiError::not_found)
}

/// Fill in the defaulted parts of the envelope the registry does not own.
fn normalize(kind: &KindSpec, obj: &mut Value) {
    if !obj["metadata"].is_object() {
        obj["metadata"] = json!({});
    }
    let namespaced = kind.plural != "nodes";
    if namespaced
        && obj["metadata"]["namespace"]
            .as_str()
            .is_none_or(str::is_empty)
    {
        obj["metadata"]["namespace"] = json!("default");
    }
    if obj["metadata"]["creationTimestamp"].is_null() {
        obj["metadata"]["creationTimestamp"] = json!(Utc::now());
    }
    if obj["kind"].as_str().is_none_or(str::is_empty) {
        obj["kind"] = json!(kind.kind);
    }
    if obj["apiVersion"].as_str().is_none_or(str::is_empty) {
        obj["apiVersion"] = json!(kind.api_version);
    }
}

pub async fn list(
    State(state): State<AppState>,
    Extension(Group(group)): Extension<Group>,
    Path(plural): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let kind = resolve(group, &plural)?;

    if params.watch.unwrap_or(false) {
        return Ok(watch(state, kind).await);
    }

    let items = state.registry.list(&registry_prefix(kind.plural)).await;
    Ok(Json(json!({
        "kind": kind.list_kind,
        "apiVersion": kind.api_version,
        "items": items,
    }))
    .into_response())
}

/// One long-lived chunked response per watcher: each frame is a
/// newline-terminated JSON event, flushed as it is produced. Dropping the
/// response (client disconnect) drops the subscription receiver, and the
/// registry prunes the watcher on its next delivery attempt.
async fn watch(state: AppState, kind: &'static KindSpec) -> Response {
    let subscription = state.registry.watch(&registry_prefix(kind.plural)).await;
    let frames = ReceiverStream::new(subscription.events).map(|event| {
        let mut frame = serde_json::to_vec(&event).unwrap_or_default();
        frame.push(b'\n');
        Ok::<_, std::convert::Infallible>(Bytes::from(frame))
    });

    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

pub async fn create(
    State(state): State<AppState>,
    Extension(Group(group)): Extension<Group>,
    Path(plural): Path<String>,
    Json(mut obj): Json<Value>,
) -> Result<Response, ApiError> {
    let kind = resolve(group, &plural)?;
    kind.validate(&obj).map_err(ApiError::invalid)?;

    let name = obj["metadata"]["name"].as_str().unwrap_or("").to_string();
    if name.is_empty() {
        return Err(ApiError::invalid("metadata.name is required"));
    }

    normalize(kind, &mut obj);
    let stored = state
        .registry
        .create(&registry_key(kind.plural, &name), obj)
        .await
        .map_err(ApiError::storage)?;
    Ok((StatusCode::CREATED, Json(stored)).into_response())
}

pub async fn get(
    State(state): State<AppState>,
    Extension(Group(group)): Extension<Group>,
    Path((plural, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let kind = resolve(group, &plural)?;
    let obj = state
        .registry
        .get(&registry_key(kind.plural, &name))
        .await
        .map_err(ApiError::storage)?;
    Ok(Json(obj))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(Group(group)): Extension<Group>,
    Path((plural, name)): Path<(String, String)>,
    Json(mut obj): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let kind = resolve(group, &plural)?;
    kind.validate(&obj).map_err(ApiError::invalid)?;

    // The URL names the object; the body follows.
    obj["metadata"]["name"] = json!(name);
    normalize(kind, &mut obj);

    let stored = state
        .registry
        .update(&registry_key(kind.plural, &name), obj)
        .await
        .map_err(ApiError::storage)?;
    Ok(Json(stored))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(Group(group)): Extension<Group>,
    Path((plural, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let kind = resolve(group, &plural)?;
    state
        .registry
        .delete(&registry_key(kind.plural, &name))
        .await
        .map_err(ApiError::storage)?;
    Ok(Json(json!({ "status": "deleted" })))
}
