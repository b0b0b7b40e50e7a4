//! Rescale Swarm backend.
//!
//! A Swarm service is `{ID, Version, Spec}`. Updates must carry the version
//! that was read, so every write is inspect → derive new spec → update.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::Utc;
use rescale_core::{
    BoundsResolver, OperationWindow, ReplicaCount, ScaleAnnotations, ScaleBounds, ScaleError, ScaleOutcome,
    ScaleResult, ServiceSnapshot, ServiceVersion,
};
use rescale_ops::ServiceQuery;
use serde::Deserialize;
use tracing::{debug, info};

pub mod engine;

pub use engine::{DockerEngine, EngineEndpoint};

/// The two orchestrator calls the adapter needs.
#[async_trait::async_trait]
pub trait SwarmApi: Send + Sync {
    /// Inspect a service by name or ID, with defaults filled in.
    async fn inspect_service(&self, name: &str) -> ScaleResult<ServiceSnapshot<SwarmSpec>>;

    /// Replace the spec of service `id`, presenting the `version` that was read.
    async fn update_service(&self, id: &str, version: &ServiceVersion, spec: &SwarmSpec) -> ScaleResult<()>;
}

/// A Swarm `ServiceSpec` document.
///
/// Kept as raw JSON so fields this crate does not model survive the
/// read/modify/write cycle untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmSpec(pub serde_json::Value);

impl SwarmSpec {
    pub fn name(&self) -> Option<&str> { self.0.get("Name").and_then(|v| v.as_str()) }

    /// Desired replicas, `None` unless the service runs in replicated mode.
    pub fn replicas(&self) -> Option<ReplicaCount> {
        self.0.pointer("/Mode/Replicated/Replicas").and_then(|v| v.as_u64())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.0
            .get("Labels")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }

    /// Copy of this spec with the desired replica count replaced.
    pub fn with_replicas(&self, count: ReplicaCount) -> ScaleResult<SwarmSpec> {
        let mut next = self.0.clone();
        let replicated = next
            .pointer_mut("/Mode/Replicated")
            .and_then(|v| v.as_object_mut())
            .ok_or_else(|| ScaleError::Validation(format!("service {} is not in replicated mode", self.name().unwrap_or("?"))))?;
        replicated.insert("Replicas".to_string(), serde_json::Value::from(count));
        Ok(SwarmSpec(next))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceDoc {
    #[serde(rename = "ID")]
    id: String,
    version: VersionDoc,
    spec: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionDoc {
    index: u64,
}

/// Decode a `GET /services/{id}` response body.
pub fn parse_service(body: &[u8]) -> ScaleResult<ServiceSnapshot<SwarmSpec>> {
    let doc: ServiceDoc = serde_json::from_slice(body).map_err(|e| ScaleError::Backend(format!("decoding service: {}", e)))?;
    Ok(ServiceSnapshot { id: doc.id, version: ServiceVersion::from(doc.version.index), spec: SwarmSpec(doc.spec) })
}

/// `ServiceQuery` over a Swarm manager.
pub struct SwarmServiceQuery<A = DockerEngine> {
    api: A,
    bounds: BoundsResolver,
}

impl<A: SwarmApi> SwarmServiceQuery<A> {
    pub fn new(api: A, bounds: BoundsResolver) -> Self { Self { api, bounds } }

    pub fn api(&self) -> &A { &self.api }
}

#[async_trait::async_trait]
impl<A: SwarmApi> ServiceQuery for SwarmServiceQuery<A> {
    async fn get_replicas(&self, service: &str) -> ScaleResult<ScaleBounds> {
        let snapshot = self.api.inspect_service(service).await?;
        let current = snapshot
            .spec
            .replicas()
            .ok_or_else(|| ScaleError::Validation(format!("service {} is not in replicated mode", service)))?;
        let resolved = self.bounds.resolve(&ScaleAnnotations::from_labels(snapshot.spec.labels()));
        debug!(service = %service, id = %snapshot.id, version = %snapshot.version, current, min = resolved.min, max = resolved.max, "swarm: replicas");
        Ok(ScaleBounds::new(current, &resolved))
    }

    async fn set_replicas(&self, service: &str, count: ReplicaCount) -> ScaleOutcome {
        let snapshot = match self.api.inspect_service(service).await {
            Ok(s) => s,
            Err(e) => return ScaleOutcome::not_attempted(e),
        };
        let spec = match snapshot.spec.with_replicas(count) {
            Ok(s) => s,
            Err(e) => return ScaleOutcome::not_attempted(e),
        };
        info!(service = %service, id = %snapshot.id, version = %snapshot.version, from = ?snapshot.spec.replicas(), to = count, "swarm: updating service");
        let start = Utc::now();
        let result = self.api.update_service(&snapshot.id, &snapshot.version, &spec).await;
        let end = Utc::now();
        ScaleOutcome { window: OperationWindow::bracket(start, end), result }
    }
}
