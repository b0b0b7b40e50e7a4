//! Rescale core types: replica bounds, operation windows, versioned snapshots and errors.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod bounds;

pub use bounds::{BoundsResolver, MalformedAnnotation, ResolvedBounds, ScaleAnnotations};

/// Desired or observed number of replicas. Zero means fully scaled down.
pub type ReplicaCount = u64;

/// Label naming the minimum scale of a service.
pub const MIN_SCALE_LABEL: &str = "com.openfaas.scale.min";
/// Label naming the maximum scale of a service.
pub const MAX_SCALE_LABEL: &str = "com.openfaas.scale.max";

/// Upper bound reported when a service carries no usable max label.
pub const DEFAULT_MAX_REPLICAS: ReplicaCount = 20;
/// Lower bound reported when a service carries no usable min label.
pub const DEFAULT_MIN_REPLICAS: ReplicaCount = 1;

/// Current replica count plus the advisory min/max bounds for a service.
///
/// Bounds are informational: nothing in this workspace rejects a request
/// outside `min..=max`, that policy belongs to the autoscaler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleBounds {
    pub current: ReplicaCount,
    pub min: ReplicaCount,
    pub max: ReplicaCount,
}

impl ScaleBounds {
    pub fn new(current: ReplicaCount, resolved: &ResolvedBounds) -> Self {
        Self { current, min: resolved.min, max: resolved.max }
    }
}

/// Wall-clock window bracketing a single mutating orchestrator call.
///
/// Both ends are `None` when the call was never attempted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl OperationWindow {
    pub fn zero() -> Self { Self::default() }

    pub fn bracket(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start: Some(start), end: Some(end) }
    }

    pub fn is_zero(&self) -> bool { self.start.is_none() && self.end.is_none() }

    /// Start as nanoseconds since the Unix epoch, `0` when unset.
    pub fn start_nanos(&self) -> i64 { nanos(self.start) }

    /// End as nanoseconds since the Unix epoch, `0` when unset.
    pub fn end_nanos(&self) -> i64 { nanos(self.end) }

    /// Duration of the bracketed call in milliseconds, if both ends were recorded.
    pub fn elapsed_ms(&self) -> Option<f64> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some((e - s).num_microseconds().unwrap_or(0) as f64 / 1000.0),
            _ => None,
        }
    }
}

fn nanos(ts: Option<DateTime<Utc>>) -> i64 {
    ts.and_then(|t| t.timestamp_nanos_opt()).unwrap_or(0)
}

/// Opaque optimistic-concurrency token returned by an inspect call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceVersion(pub String);

impl std::fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl From<u64> for ServiceVersion {
    fn from(v: u64) -> Self { Self(v.to_string()) }
}

/// Immutable view of a service as read from the orchestrator.
///
/// Writes must present `version` back; the backend rejects them once the
/// stored version has moved on.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot<S> {
    pub id: String,
    pub version: ServiceVersion,
    pub spec: S,
}

/// Errors surfaced by replica operations.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScaleError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl ScaleError {
    pub fn is_not_found(&self) -> bool { matches!(self, ScaleError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ScaleError::Conflict(_)) }
}

pub type ScaleResult<T> = Result<T, ScaleError>;

/// Result of a `set replicas` attempt: the timing window plus the backend verdict.
///
/// The window is populated whenever the mutating call was attempted, even if
/// it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleOutcome {
    pub window: OperationWindow,
    pub result: ScaleResult<()>,
}

impl ScaleOutcome {
    /// Nothing was sent to the orchestrator and nothing went wrong.
    pub fn noop() -> Self { Self { window: OperationWindow::zero(), result: Ok(()) } }

    /// Failed before the mutating call.
    pub fn not_attempted(err: ScaleError) -> Self { Self { window: OperationWindow::zero(), result: Err(err) } }

    pub fn is_ok(&self) -> bool { self.result.is_ok() }

    pub fn into_result(self) -> ScaleResult<OperationWindow> { self.result.map(|_| self.window) }
}

pub mod prelude {
    pub use super::{
        BoundsResolver, OperationWindow, ReplicaCount, ResolvedBounds, ScaleAnnotations, ScaleBounds,
        ScaleError, ScaleOutcome, ScaleResult, ServiceSnapshot, ServiceVersion,
    };
}
