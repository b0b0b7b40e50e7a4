//! Rescale ops: the replica scaling protocol and the orchestrator seam it runs against.
//!
//! `ServiceQuery` is implemented once per orchestrator backend. `scale_service`
//! is a single-attempt dispatcher on top of it: no retries, no bound checks,
//! no idempotence shortcut.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use rescale_core::{OperationWindow, ReplicaCount, ScaleBounds, ScaleError, ScaleOutcome, ScaleResult};
use tracing::{debug, info, warn};

/// Read/write access to the replica count of named services.
#[async_trait::async_trait]
pub trait ServiceQuery: Send + Sync {
    /// Current replicas plus resolved min/max bounds.
    async fn get_replicas(&self, service: &str) -> ScaleResult<ScaleBounds>;

    /// Inspect the service, then issue exactly one versioned update.
    async fn set_replicas(&self, service: &str, count: ReplicaCount) -> ScaleOutcome;
}

/// Scale `service` to `replicas`. An empty name is a successful no-op that
/// never reaches the orchestrator.
pub async fn scale_service(query: &dyn ServiceQuery, service: &str, replicas: ReplicaCount) -> ScaleOutcome {
    if service.is_empty() {
        debug!(replicas, "empty service name; nothing to scale");
        return ScaleOutcome::noop();
    }
    query.set_replicas(service, replicas).await
}

/// Entry point used by frontends (gateway, CLI). Adds logging and metrics
/// around the protocol without altering results.
#[derive(Clone)]
pub struct Scaler {
    query: Arc<dyn ServiceQuery>,
}

impl Scaler {
    pub fn new(query: Arc<dyn ServiceQuery>) -> Self { Self { query } }

    pub async fn scale(&self, service: &str, replicas: ReplicaCount) -> ScaleOutcome {
        let t0 = Instant::now();
        info!(service = %service, replicas, "scale start");
        let outcome = scale_service(self.query.as_ref(), service, replicas).await;
        if let Some(ms) = outcome.window.elapsed_ms() {
            histogram!("scale_update_ms", ms);
        }
        match &outcome.result {
            Ok(()) => {
                counter!("scale_requests_total", 1u64, "outcome" => "ok");
                info!(service = %service, replicas, send_ns = outcome.window.start_nanos(), response_ns = outcome.window.end_nanos(), took_ms = %t0.elapsed().as_millis(), "scale ok");
            }
            Err(e) => {
                counter!("scale_requests_total", 1u64, "outcome" => error_kind(e));
                warn!(service = %service, replicas, error = %e, took_ms = %t0.elapsed().as_millis(), "scale failed");
            }
        }
        outcome
    }

    pub async fn replicas(&self, service: &str) -> ScaleResult<ScaleBounds> {
        let t0 = Instant::now();
        if service.is_empty() {
            return Err(ScaleError::Validation("service name must not be empty".into()));
        }
        let res = self.query.get_replicas(service).await;
        match &res {
            Ok(b) => {
                counter!("replicas_reads_total", 1u64, "outcome" => "ok");
                debug!(service = %service, current = b.current, min = b.min, max = b.max, took_ms = %t0.elapsed().as_millis(), "replicas read");
            }
            Err(e) => {
                counter!("replicas_reads_total", 1u64, "outcome" => error_kind(e));
                warn!(service = %service, error = %e, "replicas read failed");
            }
        }
        res
    }
}

fn error_kind(e: &ScaleError) -> &'static str {
    match e {
        ScaleError::NotFound(_) => "not_found",
        ScaleError::Conflict(_) => "conflict",
        ScaleError::Validation(_) => "validation",
        ScaleError::Backend(_) => "backend",
    }
}

// ----------------- Mock implementation -----------------

/// In-memory `ServiceQuery` for tests and demos.
///
/// Every call is appended to `calls()` so callers can check whether the
/// orchestrator was reached at all.
#[derive(Default)]
pub struct MockQuery {
    services: Mutex<HashMap<String, ScaleBounds>>,
    calls: Mutex<Vec<String>>,
    update_error: Mutex<Option<ScaleError>>,
}

impl MockQuery {
    pub fn new() -> Self { Self::default() }

    pub fn with_service(self, name: &str, bounds: ScaleBounds) -> Self {
        self.services.lock().unwrap_or_else(|p| p.into_inner()).insert(name.to_string(), bounds);
        self
    }

    /// Make every subsequent update fail with `err` after the timed call.
    pub fn fail_updates_with(&self, err: ScaleError) {
        *self.update_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
    }

    pub fn calls(&self) -> Vec<String> { self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone() }

    pub fn current(&self, name: &str) -> Option<ReplicaCount> {
        self.services.lock().unwrap_or_else(|p| p.into_inner()).get(name).map(|b| b.current)
    }

    fn record(&self, call: String) { self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call); }
}

#[async_trait::async_trait]
impl ServiceQuery for MockQuery {
    async fn get_replicas(&self, service: &str) -> ScaleResult<ScaleBounds> {
        self.record(format!("get {}", service));
        self.services
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(service)
            .copied()
            .ok_or_else(|| ScaleError::NotFound(format!("service {} not found", service)))
    }

    async fn set_replicas(&self, service: &str, count: ReplicaCount) -> ScaleOutcome {
        self.record(format!("set {} {}", service, count));
        if !self.services.lock().unwrap_or_else(|p| p.into_inner()).contains_key(service) {
            return ScaleOutcome::not_attempted(ScaleError::NotFound(format!("service {} not found", service)));
        }
        let start = Utc::now();
        let injected = self.update_error.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let result = match injected {
            Some(e) => Err(e),
            None => {
                if let Some(b) = self.services.lock().unwrap_or_else(|p| p.into_inner()).get_mut(service) {
                    b.current = count;
                }
                Ok(())
            }
        };
        let end = Utc::now();
        ScaleOutcome { window: OperationWindow::bracket(start, end), result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn bounds(current: ReplicaCount) -> ScaleBounds { ScaleBounds { current, min: 1, max: 20 } }

    #[tokio::test]
    async fn empty_name_is_a_noop_for_any_count() {
        let mock = MockQuery::new().with_service("web", bounds(1));
        for n in [0u64, 1, 7, u64::MAX] {
            let out = scale_service(&mock, "", n).await;
            assert!(out.is_ok());
            assert!(out.window.is_zero());
        }
        assert!(mock.calls().is_empty(), "no orchestrator call expected");
    }

    #[tokio::test]
    async fn delegates_and_passes_result_through() {
        let mock = MockQuery::new().with_service("web", bounds(1));
        let out = scale_service(&mock, "web", 4).await;
        assert!(out.is_ok());
        let w = out.window;
        assert!(w.end.unwrap() >= w.start.unwrap());
        assert_eq!(mock.current("web"), Some(4));
        assert_eq!(mock.calls(), vec!["set web 4".to_string()]);
    }

    #[tokio::test]
    async fn not_found_is_returned_with_zero_window() {
        let mock = MockQuery::new();
        let out = scale_service(&mock, "ghost", 2).await;
        assert!(out.result.as_ref().unwrap_err().is_not_found());
        assert!(out.window.is_zero());
    }

    #[tokio::test]
    async fn conflict_keeps_window_and_is_not_retried() {
        let mock = MockQuery::new().with_service("web", bounds(3));
        mock.fail_updates_with(ScaleError::Conflict("update out of sequence".into()));
        let out = scale_service(&mock, "web", 5).await;
        assert!(out.result.as_ref().unwrap_err().is_conflict());
        assert!(!out.window.is_zero());
        assert_eq!(mock.calls().len(), 1);
        assert_eq!(mock.current("web"), Some(3));
    }

    #[tokio::test]
    async fn zero_replicas_is_a_valid_target() {
        let mock = MockQuery::new().with_service("web", bounds(3));
        assert!(scale_service(&mock, "web", 0).await.is_ok());
        assert_eq!(mock.current("web"), Some(0));
    }

    #[tokio::test]
    async fn scaler_reads_bounds_and_rejects_empty_name() {
        let mock = Arc::new(MockQuery::new().with_service("web", ScaleBounds { current: 2, min: 1, max: 15 }));
        let scaler = Scaler::new(mock.clone());
        assert_eq!(scaler.replicas("web").await.unwrap(), ScaleBounds { current: 2, min: 1, max: 15 });
        assert!(scaler.replicas("nope").await.unwrap_err().is_not_found());
        assert!(matches!(scaler.replicas("").await, Err(ScaleError::Validation(_))));
        assert_eq!(mock.calls().len(), 2);
    }

    /// Records entry/exit and parks every update on a shared barrier: if two
    /// scales could not overlap the barrier would never release.
    struct Interleaving {
        barrier: Barrier,
        events: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ServiceQuery for Interleaving {
        async fn get_replicas(&self, _service: &str) -> ScaleResult<ScaleBounds> { Ok(bounds(1)) }

        async fn set_replicas(&self, service: &str, _count: ReplicaCount) -> ScaleOutcome {
            self.events.lock().unwrap().push(format!("enter {}", service));
            let start = Utc::now();
            self.barrier.wait().await;
            let end = Utc::now();
            self.events.lock().unwrap().push(format!("exit {}", service));
            ScaleOutcome { window: OperationWindow::bracket(start, end), result: Ok(()) }
        }
    }

    #[tokio::test]
    async fn scales_of_distinct_services_interleave() {
        let q = Interleaving { barrier: Barrier::new(2), events: Mutex::new(Vec::new()) };
        let both = futures::future::join(scale_service(&q, "a", 1), scale_service(&q, "b", 2));
        let (a, b) = tokio::time::timeout(Duration::from_secs(5), both).await.expect("scales blocked each other");
        assert!(a.is_ok() && b.is_ok());
        let events = q.events.lock().unwrap().clone();
        let first_exit = events.iter().position(|e| e.starts_with("exit")).unwrap();
        assert_eq!(events[..first_exit].len(), 2, "both scales entered before either finished: {:?}", events);
    }
}
