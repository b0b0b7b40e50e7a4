//! Minimal Docker Engine API client: service inspect and update over HTTP/1.
//!
//! One connection per call, over a unix socket or TCP. No timeouts are applied
//! here; dropping the future cancels the call.

use std::borrow::Cow;
use std::path::PathBuf;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rescale_core::{ScaleError, ScaleResult, ServiceSnapshot, ServiceVersion};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{parse_service, SwarmApi, SwarmSpec};

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_API_VERSION: &str = "v1.41";

/// Where the Engine API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEndpoint {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl EngineEndpoint {
    /// Parse a `DOCKER_HOST` style address (`unix:///path` or `tcp://host:port`).
    pub fn parse(host: &str) -> ScaleResult<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ScaleError::Validation(format!("docker host has no socket path: {}", host)));
            }
            return Ok(EngineEndpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = host.strip_prefix("tcp://").or_else(|| host.strip_prefix("http://")) {
            let addr = addr.trim_end_matches('/');
            if addr.is_empty() {
                return Err(ScaleError::Validation(format!("docker host has no address: {}", host)));
            }
            return Ok(EngineEndpoint::Tcp(addr.to_string()));
        }
        Err(ScaleError::Validation(format!("unsupported docker host: {} (expect unix:// or tcp://)", host)))
    }

    fn host_header(&self) -> &str {
        match self {
            EngineEndpoint::Unix(_) => "docker",
            EngineEndpoint::Tcp(addr) => addr.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerEngine {
    endpoint: EngineEndpoint,
    api_version: String,
}

impl DockerEngine {
    pub fn new(endpoint: EngineEndpoint, api_version: impl Into<String>) -> Self {
        Self { endpoint, api_version: api_version.into() }
    }

    /// Build from `DOCKER_HOST` and `RESCALE_DOCKER_API_VERSION`.
    pub fn from_env() -> ScaleResult<Self> {
        let host = std::env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_DOCKER_HOST.to_string());
        let version = std::env::var("RESCALE_DOCKER_API_VERSION").unwrap_or_else(|_| DEFAULT_API_VERSION.to_string());
        Ok(Self::new(EngineEndpoint::parse(&host)?, version))
    }

    pub fn endpoint(&self) -> &EngineEndpoint { &self.endpoint }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> ScaleResult<(StatusCode, Bytes)> {
        let uri = format!("/{}{}", self.api_version, path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(HOST, self.endpoint.host_header())
            .header(USER_AGENT, "rescale/0.0");
        let body = match body {
            Some(b) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(b))
            }
            None => Full::new(Bytes::new()),
        };
        let req = builder.body(body).map_err(|e| ScaleError::Backend(format!("building request: {}", e)))?;
        debug!(%method, %uri, endpoint = ?self.endpoint, "engine: request");
        match &self.endpoint {
            #[cfg(unix)]
            EngineEndpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| ScaleError::Backend(format!("connecting to {}: {}", path.display(), e)))?;
                exchange(stream, req).await
            }
            #[cfg(not(unix))]
            EngineEndpoint::Unix(path) => Err(ScaleError::Backend(format!("unix sockets are not supported here: {}", path.display()))),
            EngineEndpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| ScaleError::Backend(format!("connecting to {}: {}", addr, e)))?;
                exchange(stream, req).await
            }
        }
    }
}

async fn exchange<S>(io: S, req: Request<Full<Bytes>>) -> ScaleResult<(StatusCode, Bytes)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| ScaleError::Backend(format!("engine handshake: {}", e)))?;
    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "engine connection ended with error");
        }
    });
    let resp = sender.send_request(req).await.map_err(|e| ScaleError::Backend(format!("engine request: {}", e)))?;
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ScaleError::Backend(format!("reading engine response: {}", e)))?
        .to_bytes();
    Ok((status, body))
}

/// Percent-encode a service name or ID for use as one path segment.
///
/// `.` and `..` would be folded away by path normalisation, and no service
/// can carry those names, so they are reported as missing.
fn path_segment(name: &str) -> ScaleResult<Cow<'_, str>> {
    match name {
        "" => Err(ScaleError::Validation("service name must not be empty".into())),
        "." | ".." => Err(ScaleError::NotFound(format!("service {} not found", name))),
        _ => Ok(urlencoding::encode(name)),
    }
}

fn daemon_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorDoc {
        message: String,
    }
    match serde_json::from_slice::<ErrorDoc>(body) {
        Ok(doc) => doc.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

/// Map a non-2xx Engine response to the error taxonomy.
///
/// Swarm reports a stale version as `update out of sequence`, usually with a
/// 500 status.
pub fn classify_failure(op: &str, target: &str, status: StatusCode, body: &[u8]) -> ScaleError {
    let msg = daemon_message(body);
    if status == StatusCode::NOT_FOUND {
        ScaleError::NotFound(format!("{}: {}", target, msg))
    } else if status == StatusCode::CONFLICT || msg.contains("update out of sequence") {
        ScaleError::Conflict(format!("{}: {}", target, msg))
    } else {
        ScaleError::Backend(format!("{} {}: {}: {}", op, target, status, msg))
    }
}

#[async_trait::async_trait]
impl SwarmApi for DockerEngine {
    async fn inspect_service(&self, name: &str) -> ScaleResult<ServiceSnapshot<SwarmSpec>> {
        let segment = path_segment(name)?;
        let (status, body) = self.send(Method::GET, &format!("/services/{}?insertDefaults=true", segment), None).await?;
        if !status.is_success() {
            return Err(classify_failure("inspect", name, status, &body));
        }
        parse_service(&body)
    }

    async fn update_service(&self, id: &str, version: &ServiceVersion, spec: &SwarmSpec) -> ScaleResult<()> {
        let segment = path_segment(id)?;
        let payload = serde_json::to_vec(&spec.0).map_err(|e| ScaleError::Backend(format!("encoding spec: {}", e)))?;
        let path = format!("/services/{}/update?version={}&registryAuthFrom=spec", segment, version);
        let (status, body) = self.send(Method::POST, &path, Some(payload)).await?;
        if !status.is_success() {
            return Err(classify_failure("update", id, status, &body));
        }
        #[derive(Deserialize)]
        struct UpdateDoc {
            #[serde(rename = "Warnings", default)]
            warnings: Option<Vec<String>>,
        }
        if let Ok(doc) = serde_json::from_slice::<UpdateDoc>(&body) {
            for w in doc.warnings.unwrap_or_default() {
                warn!(service = %id, warning = %w, "engine: update warning");
            }
        }
        Ok(())
    }
}
