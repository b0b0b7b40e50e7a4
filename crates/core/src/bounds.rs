//! Scale bounds resolution from service labels.
//!
//! Two optional labels carry decimal min/max replica counts. Anything absent,
//! empty or unparsable falls back to the resolver defaults; unparsable values
//! are logged and reported, never raised as errors.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ReplicaCount, DEFAULT_MAX_REPLICAS, DEFAULT_MIN_REPLICAS, MAX_SCALE_LABEL, MIN_SCALE_LABEL};

/// Raw min/max scale labels as found on a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleAnnotations {
    pub min: Option<String>,
    pub max: Option<String>,
}

impl ScaleAnnotations {
    /// Pick the scale labels out of an arbitrary label map.
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut out = Self::default();
        for (k, v) in labels {
            match k.as_ref() {
                MIN_SCALE_LABEL => out.min = Some(v.as_ref().to_string()),
                MAX_SCALE_LABEL => out.max = Some(v.as_ref().to_string()),
                _ => {}
            }
        }
        out
    }
}

/// A label that was present but did not hold a non-negative integer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MalformedAnnotation {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedBounds {
    pub min: ReplicaCount,
    pub max: ReplicaCount,
    /// Labels that were ignored because they did not parse.
    pub malformed: Vec<MalformedAnnotation>,
}

/// Turns scale labels into numeric bounds with configurable defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundsResolver {
    pub default_min: ReplicaCount,
    pub default_max: ReplicaCount,
}

impl Default for BoundsResolver {
    fn default() -> Self {
        Self { default_min: DEFAULT_MIN_REPLICAS, default_max: DEFAULT_MAX_REPLICAS }
    }
}

impl BoundsResolver {
    pub fn new(default_min: ReplicaCount, default_max: ReplicaCount) -> Self {
        Self { default_min, default_max }
    }

    /// Defaults from `RESCALE_DEFAULT_MIN_REPLICAS` / `RESCALE_DEFAULT_MAX_REPLICAS`.
    pub fn from_env() -> Self {
        let default_min = std::env::var("RESCALE_DEFAULT_MIN_REPLICAS").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_MIN_REPLICAS);
        let default_max = std::env::var("RESCALE_DEFAULT_MAX_REPLICAS").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_MAX_REPLICAS);
        Self { default_min, default_max }
    }

    /// Resolve min and max independently. No min <= max check is made.
    pub fn resolve(&self, annotations: &ScaleAnnotations) -> ResolvedBounds {
        let mut malformed = Vec::new();
        let max = parse_label(MAX_SCALE_LABEL, annotations.max.as_deref(), &mut malformed).unwrap_or(self.default_max);
        let min = parse_label(MIN_SCALE_LABEL, annotations.min.as_deref(), &mut malformed).unwrap_or(self.default_min);
        ResolvedBounds { min, max, malformed }
    }
}

fn parse_label(key: &str, value: Option<&str>, malformed: &mut Vec<MalformedAnnotation>) -> Option<ReplicaCount> {
    let value = value.filter(|v| !v.is_empty())?;
    match value.parse::<ReplicaCount>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(label = %key, value = %value, "bad replica count, should be uint");
            metrics::counter!("malformed_scale_annotations_total", 1u64);
            malformed.push(MalformedAnnotation { key: key.to_string(), value: value.to_string() });
            None
        }
    }
}
