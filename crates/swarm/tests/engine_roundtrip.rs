//! Drives `DockerEngine` against an in-process fake Engine API over TCP.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rescale_core::{BoundsResolver, ScaleError};
use rescale_ops::{scale_service, ServiceQuery};
use rescale_swarm::{DockerEngine, EngineEndpoint, SwarmServiceQuery};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Daemon {
    /// name -> (id, version index, spec)
    services: Arc<Mutex<HashMap<String, (String, u64, Value)>>>,
    seen_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn inspect(
    State(d): State<Daemon>,
    Path(name): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    d.seen_queries.lock().unwrap().push(q);
    match d.services.lock().unwrap().get(&name) {
        Some((id, version, spec)) => (StatusCode::OK, Json(json!({ "ID": id, "Version": { "Index": version }, "Spec": spec }))),
        None => (StatusCode::NOT_FOUND, Json(json!({ "message": format!("service {} not found", name) }))),
    }
}

async fn update(
    State(d): State<Daemon>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
    Json(spec): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let version: u64 = q.get("version").and_then(|v| v.parse().ok()).unwrap_or(0);
    d.seen_queries.lock().unwrap().push(q);
    let mut services = d.services.lock().unwrap();
    let Some(entry) = services.values_mut().find(|(sid, _, _)| *sid == id) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": format!("service {} not found", id) })));
    };
    if entry.1 != version {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": "rpc error: code = Unknown desc = update out of sequence" })),
        );
    }
    entry.1 += 1;
    entry.2 = spec;
    (StatusCode::OK, Json(json!({ "Warnings": ["image could not be accessed on a registry"] })))
}

async fn start_daemon(d: Daemon) -> String {
    let app = Router::new()
        .route("/v1.41/services/{name}", get(inspect))
        .route("/v1.41/services/{name}/update", post(update))
        .with_state(d);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn seed(d: &Daemon, name: &str, id: &str, version: u64, labels: Value, replicas: u64) {
    let spec = json!({
        "Name": name,
        "Labels": labels,
        "TaskTemplate": { "ContainerSpec": { "Image": "functions/alpine:latest" } },
        "Mode": { "Replicated": { "Replicas": replicas } }
    });
    d.services.lock().unwrap().insert(name.to_string(), (id.to_string(), version, spec));
}

#[tokio::test]
async fn scale_round_trip_through_engine_api() {
    let d = Daemon::default();
    seed(&d, "echo", "svc-echo", 41, json!({ "com.openfaas.scale.min": "2", "com.openfaas.scale.max": "12" }), 1);
    let addr = start_daemon(d.clone()).await;
    let q = SwarmServiceQuery::new(DockerEngine::new(EngineEndpoint::Tcp(addr), "v1.41"), BoundsResolver::default());

    let b = q.get_replicas("echo").await.unwrap();
    assert_eq!((b.current, b.min, b.max), (1, 2, 12));

    let out = scale_service(&q, "echo", 6).await;
    assert_eq!(out.result, Ok(()));
    assert!(out.window.end.unwrap() >= out.window.start.unwrap());

    let (id, version, spec) = d.services.lock().unwrap().get("echo").cloned().unwrap();
    assert_eq!(id, "svc-echo");
    assert_eq!(version, 42);
    assert_eq!(spec["Mode"]["Replicated"]["Replicas"], json!(6));
    assert_eq!(spec["TaskTemplate"]["ContainerSpec"]["Image"], json!("functions/alpine:latest"));

    let queries = d.seen_queries.lock().unwrap().clone();
    assert!(queries.iter().all(|q| q.contains_key("insertDefaults") || q.get("registryAuthFrom").map(String::as_str) == Some("spec")));
    assert!(queries.iter().any(|q| q.get("version").map(String::as_str) == Some("41")));
}

#[tokio::test]
async fn engine_not_found_maps_to_not_found() {
    let addr = start_daemon(Daemon::default()).await;
    let q = SwarmServiceQuery::new(DockerEngine::new(EngineEndpoint::Tcp(addr), "v1.41"), BoundsResolver::default());
    let out = q.set_replicas("missing", 1).await;
    assert!(out.result.unwrap_err().is_not_found());
    assert!(out.window.is_zero());
    assert!(q.get_replicas("missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn out_of_sequence_maps_to_conflict() {
    let d = Daemon::default();
    seed(&d, "echo", "svc-echo", 7, json!({}), 1);
    let addr = start_daemon(d.clone()).await;
    let engine = DockerEngine::new(EngineEndpoint::Tcp(addr), "v1.41");

    // Another writer moves the version on after our inspect.
    use rescale_swarm::SwarmApi;
    let snap = engine.inspect_service("echo").await.unwrap();
    d.services.lock().unwrap().get_mut("echo").unwrap().1 += 1;
    let next = snap.spec.with_replicas(3).unwrap();
    let err = engine.update_service(&snap.id, &snap.version, &next).await.unwrap_err();
    assert!(err.is_conflict(), "got {:?}", err);
}

#[tokio::test]
async fn unreachable_daemon_is_a_backend_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    let q = SwarmServiceQuery::new(DockerEngine::new(EngineEndpoint::Tcp(addr), "v1.41"), BoundsResolver::default());
    let out = q.set_replicas("echo", 1).await;
    assert!(matches!(out.result, Err(ScaleError::Backend(_))));
    assert!(out.window.is_zero());
}

#[tokio::test]
async fn names_outside_the_service_alphabet_are_not_found() {
    let addr = start_daemon(Daemon::default()).await;
    let q = SwarmServiceQuery::new(DockerEngine::new(EngineEndpoint::Tcp(addr), "v1.41"), BoundsResolver::default());
    for name in ["no such svc", "svc/../x", "a?b=c", ".."] {
        let err = q.get_replicas(name).await.unwrap_err();
        assert!(err.is_not_found(), "{:?} -> {:?}", name, err);
        let out = q.set_replicas(name, 1).await;
        assert!(out.result.unwrap_err().is_not_found(), "{:?}", name);
        assert!(out.window.is_zero());
    }
}
