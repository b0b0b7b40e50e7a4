//! Rescale kubehub – Deployment replicas through the Kubernetes API.
//!
//! Same read/modify/write protocol as the Swarm backend, with
//! `metadata.resourceVersion` as the version token and `replace` as the write.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, PostParams},
    Client,
};
use rescale_core::{
    BoundsResolver, OperationWindow, ReplicaCount, ScaleAnnotations, ScaleBounds, ScaleError, ScaleOutcome,
    ScaleResult, ServiceSnapshot, ServiceVersion,
};
use rescale_ops::ServiceQuery;
use tracing::{debug, info};

/// Replicas the API server assumes when `spec.replicas` is unset.
const K8S_DEFAULT_REPLICAS: i32 = 1;

/// Map kube client errors onto the replica error taxonomy.
pub fn map_kube_error(name: &str, err: kube::Error) -> ScaleError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ScaleError::NotFound(format!("{}: {}", name, ae.message)),
        kube::Error::Api(ae) if ae.code == 409 => ScaleError::Conflict(format!("{}: {}", name, ae.message)),
        other => ScaleError::Backend(format!("{}: {}", name, other)),
    }
}

/// Versioned snapshot of a Deployment. Falls back to the name when the uid is missing.
pub fn snapshot(name: &str, d: Deployment) -> ScaleResult<ServiceSnapshot<Deployment>> {
    let version = d
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| ScaleError::Backend(format!("{}: deployment has no resourceVersion", name)))?;
    let id = d.metadata.uid.clone().unwrap_or_else(|| name.to_string());
    Ok(ServiceSnapshot { id, version: ServiceVersion(version), spec: d })
}

pub fn current_replicas(d: &Deployment) -> ReplicaCount {
    let n = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(K8S_DEFAULT_REPLICAS);
    ReplicaCount::try_from(n).unwrap_or(0)
}

pub fn bounds_of(d: &Deployment, resolver: &BoundsResolver) -> ScaleBounds {
    let annotations = d.metadata.labels.as_ref().map(ScaleAnnotations::from_labels).unwrap_or_default();
    ScaleBounds::new(current_replicas(d), &resolver.resolve(&annotations))
}

/// Copy of `snap.spec` carrying the new replica count and the read resourceVersion.
pub fn with_replicas(snap: &ServiceSnapshot<Deployment>, count: ReplicaCount) -> ScaleResult<Deployment> {
    let replicas = i32::try_from(count).map_err(|_| ScaleError::Validation(format!("replica count {} exceeds {}", count, i32::MAX)))?;
    let mut next = snap.spec.clone();
    let spec = next
        .spec
        .as_mut()
        .ok_or_else(|| ScaleError::Validation(format!("deployment {} has no spec", snap.id)))?;
    spec.replicas = Some(replicas);
    next.metadata.resource_version = Some(snap.version.0.clone());
    Ok(next)
}

/// `ServiceQuery` over Deployments in a single namespace.
pub struct KubeServiceQuery {
    api: Api<Deployment>,
    bounds: BoundsResolver,
}

impl KubeServiceQuery {
    pub fn new(client: Client, namespace: &str, bounds: BoundsResolver) -> Self {
        Self { api: Api::namespaced(client, namespace), bounds }
    }

    /// Connect using the ambient kubeconfig / in-cluster config.
    pub async fn try_default(namespace: &str, bounds: BoundsResolver) -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        info!(ns = %namespace, "kube backend ready");
        Ok(Self::new(client, namespace, bounds))
    }

    async fn inspect(&self, name: &str) -> ScaleResult<ServiceSnapshot<Deployment>> {
        let d = self.api.get(name).await.map_err(|e| map_kube_error(name, e))?;
        snapshot(name, d)
    }
}

#[async_trait::async_trait]
impl ServiceQuery for KubeServiceQuery {
    async fn get_replicas(&self, service: &str) -> ScaleResult<ScaleBounds> {
        let snap = self.inspect(service).await?;
        let b = bounds_of(&snap.spec, &self.bounds);
        debug!(service = %service, rv = %snap.version, current = b.current, min = b.min, max = b.max, "kube: replicas");
        Ok(b)
    }

    async fn set_replicas(&self, service: &str, count: ReplicaCount) -> ScaleOutcome {
        let snap = match self.inspect(service).await {
            Ok(s) => s,
            Err(e) => return ScaleOutcome::not_attempted(e),
        };
        let next = match with_replicas(&snap, count) {
            Ok(d) => d,
            Err(e) => return ScaleOutcome::not_attempted(e),
        };
        info!(service = %service, rv = %snap.version, from = current_replicas(&snap.spec), to = count, "kube: replacing deployment");
        let start = Utc::now();
        let res = self.api.replace(service, &PostParams::default(), &next).await;
        let end = Utc::now();
        ScaleOutcome {
            window: OperationWindow::bracket(start, end),
            result: res.map(|_| ()).map_err(|e| map_kube_error(service, e)),
        }
    }
}
