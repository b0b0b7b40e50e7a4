//! Rescale HTTP gateway.
//!
//! Thin projection of `Scaler` onto the function-scaling endpoints. Handlers
//! do not inspect bounds or retry; they translate outcomes into status codes.

#![forbid(unsafe_code)]

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rescale_core::{OperationWindow, ReplicaCount, ScaleBounds, ScaleError};
use rescale_ops::Scaler;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Header names are lowercase; HTTP treats them case-insensitively.
pub const SEND_TIME_HEADER: &str = "x-scale-post-send-time";
pub const RESPONSE_TIME_HEADER: &str = "x-scale-post-response-time";
pub const BAD_REQUEST_TEXT: &str = "Cannot parse request. Please pass valid JSON.";

/// Body of `POST /system/scale-function/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleServiceRequest {
    #[serde(default)]
    pub service_name: String,
    pub replicas: ReplicaCount,
}

/// Body of `GET /system/scale-function/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub service_name: String,
    pub replicas: ReplicaCount,
    pub min_replicas: ReplicaCount,
    pub max_replicas: ReplicaCount,
}

impl ReplicaStatus {
    pub fn new(service_name: &str, b: ScaleBounds) -> Self {
        Self { service_name: service_name.to_string(), replicas: b.current, min_replicas: b.min, max_replicas: b.max }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub scaler: Scaler,
}

pub fn build_router(scaler: Scaler) -> Router {
    Router::new()
        .route("/system/scale-function/{name}", get(replicas).post(scale))
        .route("/healthz", get(healthz))
        .with_state(ApiState { scaler })
}

fn window_headers(w: &OperationWindow) -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(SEND_TIME_HEADER, HeaderValue::from(w.start_nanos()));
    h.insert(RESPONSE_TIME_HEADER, HeaderValue::from(w.end_nanos()));
    h
}

async fn scale(State(st): State<ApiState>, Path(name): Path<String>, body: Bytes) -> Response {
    let t0 = Instant::now();
    let req: ScaleServiceRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            debug!(service = %name, error = %e, "api: unparseable scale body");
            return (StatusCode::BAD_REQUEST, BAD_REQUEST_TEXT).into_response();
        }
    };
    if !req.service_name.is_empty() && req.service_name != name {
        debug!(path = %name, body = %req.service_name, "api: body serviceName ignored in favour of path");
    }
    info!(service = %name, replicas = req.replicas, "api: scale start");
    let outcome = st.scaler.scale(&name, req.replicas).await;
    let headers = window_headers(&outcome.window);
    match outcome.result {
        Ok(()) => {
            info!(service = %name, took_ms = %t0.elapsed().as_millis(), "api: scale accepted");
            (StatusCode::ACCEPTED, headers).into_response()
        }
        Err(e) => {
            warn!(service = %name, error = %e, took_ms = %t0.elapsed().as_millis(), "api: scale failed");
            (StatusCode::INTERNAL_SERVER_ERROR, headers, e.to_string()).into_response()
        }
    }
}

async fn replicas(State(st): State<ApiState>, Path(name): Path<String>) -> Response {
    match st.scaler.replicas(&name).await {
        Ok(b) => Json(ReplicaStatus::new(&name, b)).into_response(),
        Err(e @ ScaleError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn healthz() -> &'static str { "ok" }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_and_tolerates_missing_name() {
        let r: ScaleServiceRequest = serde_json::from_str(r#"{"serviceName":"echo","replicas":3}"#).unwrap();
        assert_eq!(r, ScaleServiceRequest { service_name: "echo".into(), replicas: 3 });
        let r: ScaleServiceRequest = serde_json::from_str(r#"{"replicas":0}"#).unwrap();
        assert_eq!(r.service_name, "");
        assert!(serde_json::from_str::<ScaleServiceRequest>(r#"{"serviceName":"echo","replicas":-1}"#).is_err());
    }

    #[test]
    fn zero_window_renders_as_zero_headers() {
        let h = window_headers(&OperationWindow::zero());
        assert_eq!(h.get(SEND_TIME_HEADER).unwrap(), "0");
        assert_eq!(h.get(RESPONSE_TIME_HEADER).unwrap(), "0");
    }
}
