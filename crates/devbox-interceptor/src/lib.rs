//! Devbox interceptor.
//!
//! Runs inside the placeholder pod once its binary has been streamed in.
//! Serves `GET /health` for the readiness probe and `POST /mutate` for the
//! mutating admission webhook.

pub mod error;
pub mod mutate;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Container, Pod};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub use error::MutateError;
pub use mutate::{mutate_pod, MutationConfig};

const REVIEW_API_VERSION: &str = "admission.k8s.io/v1";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionReview {
    api_version: Option<String>,
    request: Option<AdmissionRequest>,
}

#[derive(Debug, Deserialize)]
struct AdmissionRequest {
    uid: String,
    kind: RequestKind,
    #[serde(default)]
    object: Value,
}

#[derive(Debug, Deserialize)]
struct RequestKind {
    kind: String,
}

/// JSON patch turning `original` into `mutated`.
///
/// Only the pieces the rewrite touches are addressed: appended volumes and
/// mounts, prepended init containers, redirected entrypoints and changed
/// annotations. Fields the typed pod does not model stay untouched on the
/// server side. An unchanged pod yields an empty patch.
pub fn pod_patch(original: &Pod, mutated: &Pod) -> Result<Vec<Value>, MutateError> {
    let mut ops = Vec::new();
    let (Some(before), Some(after)) = (original.spec.as_ref(), mutated.spec.as_ref()) else {
        return Ok(ops);
    };

    append_ops(
        &mut ops,
        "/spec/volumes",
        before.volumes.as_deref(),
        after.volumes.as_deref(),
    )?;

    let before_init = before.init_containers.as_deref().unwrap_or_default();
    let after_init = after.init_containers.as_deref().unwrap_or_default();
    let prepended = after_init.len().saturating_sub(before_init.len());
    if prepended > 0 {
        if before.init_containers.is_none() {
            ops.push(add("/spec/initContainers", to_value(&after_init[..prepended])?));
        } else {
            for (i, container) in after_init[..prepended].iter().enumerate() {
                ops.push(add(&format!("/spec/initContainers/{i}"), to_value(container)?));
            }
        }
    }
    for (i, (b, a)) in before_init.iter().zip(&after_init[prepended..]).enumerate() {
        container_ops(&mut ops, &format!("/spec/initContainers/{}", i + prepended), b, a)?;
    }
    for (i, (b, a)) in before.containers.iter().zip(&after.containers).enumerate() {
        container_ops(&mut ops, &format!("/spec/containers/{i}"), b, a)?;
    }

    if let (Some(b), Some(a)) = (
        original.metadata.annotations.as_ref(),
        mutated.metadata.annotations.as_ref(),
    ) {
        for (key, value) in a {
            let path = format!("/metadata/annotations/{}", escape_pointer(key));
            match b.get(key) {
                Some(old) if old == value => {}
                Some(_) => ops.push(json!({"op": "replace", "path": path, "value": value})),
                None => ops.push(add(&path, Value::String(value.clone()))),
            }
        }
    }
    Ok(ops)
}

fn add(path: &str, value: Value) -> Value {
    json!({"op": "add", "path": path, "value": value})
}

/// Ops appending the tail of `after` to the list at `path`.
fn append_ops<T: serde::Serialize>(
    ops: &mut Vec<Value>,
    path: &str,
    before: Option<&[T]>,
    after: Option<&[T]>,
) -> Result<(), MutateError> {
    let kept = before.map_or(0, <[T]>::len);
    let after = after.unwrap_or_default();
    if after.len() <= kept {
        return Ok(());
    }
    if before.is_none() {
        ops.push(add(path, to_value(&after)?));
    } else {
        for item in &after[kept..] {
            ops.push(add(&format!("{path}/-"), to_value(item)?));
        }
    }
    Ok(())
}

fn container_ops(
    ops: &mut Vec<Value>,
    prefix: &str,
    before: &Container,
    after: &Container,
) -> Result<(), MutateError> {
    append_ops(
        ops,
        &format!("{prefix}/volumeMounts"),
        before.volume_mounts.as_deref(),
        after.volume_mounts.as_deref(),
    )?;
    let old = before.command.as_ref().and_then(|c| c.first());
    let new = after.command.as_ref().and_then(|c| c.first());
    if let (Some(old), Some(new)) = (old, new) {
        if old != new {
            ops.push(json!({"op": "replace", "path": format!("{prefix}/command/0"), "value": new}));
        }
    }
    Ok(())
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn to_value<T: serde::Serialize + ?Sized>(value: &T) -> Result<Value, MutateError> {
    serde_json::to_value(value).map_err(|e| MutateError::Patch(e.to_string()))
}

/// Answer one admission review.
pub fn review(body: &[u8], config: &MutationConfig) -> Result<Value, MutateError> {
    if body.is_empty() {
        return Err(MutateError::EmptyBody);
    }
    let review: AdmissionReview =
        serde_json::from_slice(body).map_err(|e| MutateError::InvalidReview(e.to_string()))?;
    let request = review.request.ok_or(MutateError::MissingRequest)?;
    if request.kind.kind != "Pod" {
        return Err(MutateError::NotAPod(request.kind.kind));
    }
    let original: Pod = serde_json::from_value(request.object)
        .map_err(|e| MutateError::InvalidPod(e.to_string()))?;

    let mut pod = original.clone();
    let mutated = mutate_pod(&mut pod, config);
    let ops = pod_patch(&original, &pod)?;
    let patch = serde_json::to_vec(&ops).map_err(|e| MutateError::Patch(e.to_string()))?;
    debug!(uid = %request.uid, mutated = mutated, ops = ops.len(), "admission review");

    Ok(json!({
        "apiVersion": review.api_version.as_deref().unwrap_or(REVIEW_API_VERSION),
        "kind": "AdmissionReview",
        "response": {
            "uid": request.uid,
            "allowed": true,
            "patchType": "JSONPatch",
            "patch": STANDARD.encode(patch),
        },
    }))
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn mutate_handler(
    State(config): State<Arc<MutationConfig>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, MutateError> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return Err(MutateError::ContentType);
    }
    match review(&body, &config) {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!(error = %e, "rejected admission review");
            Err(e)
        }
    }
}

/// Routes of the interceptor server.
pub fn router(config: MutationConfig) -> Router {
    info!(
        init_image = %config.init_image,
        toolkit_image = %config.toolkit_image,
        storage_url = %config.storage_url,
        "interceptor configured"
    );
    Router::new()
        .route("/health", get(health_handler))
        .route("/mutate", post(mutate_handler))
        .with_state(Arc::new(config))
}
