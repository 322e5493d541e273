//! Request, error and latency instrumentation for the prediction service.
//!
//! All instruments live in an explicitly constructed [`prometheus::Registry`]
//! owned by [`ServiceMetrics`], which is shared (`Arc`) by the RPC handlers and
//! the exposition listener. Updates are atomic per instrument; rendering takes
//! a point-in-time snapshot without blocking writers.

use crate::error::{ErrorKind, PredictionError};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Request latency buckets in seconds
const REQUEST_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Model-only latency buckets in seconds
const INFERENCE_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5,
];

/// RPC methods served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    Health,
    Predict,
}

impl RpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::Health => "Health",
            RpcMethod::Predict => "Predict",
        }
    }
}

/// Outcome label of a completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

/// Metrics collector for the prediction service
pub struct ServiceMetrics {
    registry: Registry,
    /// Completed calls by method and outcome
    requests_total: IntCounterVec,
    /// Failed calls by method and error kind
    errors_total: IntCounterVec,
    /// Call latency from handler entry to exit
    request_duration: HistogramVec,
    /// Time spent inside the model only
    inference_duration: Histogram,
    /// Constant 1, labelled with the served model identity
    model_info: IntGaugeVec,
}

impl ServiceMetrics {
    /// Create a collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "prediction_requests_total",
                "Completed RPC calls by method and outcome",
            ),
            &["method", "outcome"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new(
                "prediction_errors_total",
                "Failed RPC calls by method and error kind",
            ),
            &["method", "error_kind"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "prediction_request_duration_seconds",
                "RPC call latency including validation and marshalling",
            )
            .buckets(REQUEST_BUCKETS.to_vec()),
            &["method"],
        )?;
        let inference_duration = Histogram::with_opts(
            HistogramOpts::new(
                "prediction_inference_duration_seconds",
                "Model classify and class-probability time",
            )
            .buckets(INFERENCE_BUCKETS.to_vec()),
        )?;
        let model_info = IntGaugeVec::new(
            Opts::new("prediction_model_info", "Model version and artifact path being served"),
            &["version", "path"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(inference_duration.clone()))?;
        registry.register(Box::new(model_info.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            request_duration,
            inference_duration,
            model_info,
        })
    }

    /// Tag the served model. Called once at startup before serving.
    pub fn set_model_info(&self, version: &str, path: &str) {
        self.model_info.with_label_values(&[version, path]).set(1);
    }

    /// Fold one completed call into the registry
    pub fn record_call(&self, method: RpcMethod, error: Option<ErrorKind>, latency: Duration) {
        let outcome = if error.is_some() {
            Outcome::Error
        } else {
            Outcome::Success
        };

        self.requests_total
            .with_label_values(&[method.as_str(), outcome.as_str()])
            .inc();
        if let Some(kind) = error {
            self.errors_total
                .with_label_values(&[method.as_str(), kind.as_str()])
                .inc();
        }
        self.request_duration
            .with_label_values(&[method.as_str()])
            .observe(latency.as_secs_f64());
    }

    /// Record the duration of the model step alone
    pub fn observe_inference(&self, duration: Duration) {
        self.inference_duration.observe(duration.as_secs_f64());
    }

    /// Render all instruments in the Prometheus text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn request_count(&self, method: RpcMethod, outcome: Outcome) -> u64 {
        self.requests_total
            .with_label_values(&[method.as_str(), outcome.as_str()])
            .get()
    }

    pub fn error_count(&self, method: RpcMethod, kind: ErrorKind) -> u64 {
        self.errors_total
            .with_label_values(&[method.as_str(), kind.as_str()])
            .get()
    }

    pub fn latency_count(&self, method: RpcMethod) -> u64 {
        self.request_duration
            .with_label_values(&[method.as_str()])
            .get_sample_count()
    }

    pub fn inference_count(&self) -> u64 {
        self.inference_duration.get_sample_count()
    }
}

/// Set once the caller has stopped waiting for a call, e.g. when the
/// transport drops the handler on a deadline.
#[derive(Debug, Clone, Default)]
pub struct CallAbandoned(Arc<AtomicBool>);

impl CallAbandoned {
    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_marked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Marks the call abandoned when dropped before [`AbandonOnDrop::disarm`]
pub struct AbandonOnDrop {
    flag: CallAbandoned,
    armed: bool,
}

impl AbandonOnDrop {
    pub fn new(flag: CallAbandoned) -> Self {
        Self { flag, armed: true }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.mark();
        }
    }
}

/// Scope guard that records exactly one call outcome when dropped.
///
/// A recorder dropped without [`CallRecorder::complete`] counts as a failure:
/// `WorkerPanic` while unwinding, `Aborted` otherwise. A successful call whose
/// caller has gone away is also recorded as `Aborted`.
pub struct CallRecorder<'a> {
    metrics: &'a ServiceMetrics,
    method: RpcMethod,
    started: Instant,
    abandoned: Option<&'a CallAbandoned>,
    outcome: Option<Option<ErrorKind>>,
}

impl<'a> CallRecorder<'a> {
    pub fn start(metrics: &'a ServiceMetrics, method: RpcMethod) -> Self {
        Self {
            metrics,
            method,
            started: Instant::now(),
            abandoned: None,
            outcome: None,
        }
    }

    /// Watch `abandoned` and record the call as aborted if it is marked
    /// by the time the recorder is dropped
    pub fn watching(mut self, abandoned: &'a CallAbandoned) -> Self {
        self.abandoned = Some(abandoned);
        self
    }

    /// Note the call's result; the metrics are written on drop.
    pub fn complete<T>(&mut self, result: &Result<T, PredictionError>) {
        self.outcome = Some(result.as_ref().err().map(PredictionError::kind));
    }
}

impl Drop for CallRecorder<'_> {
    fn drop(&mut self) {
        let abandoned = self.abandoned.map(CallAbandoned::is_marked).unwrap_or(false);
        let error = match self.outcome {
            Some(None) if abandoned => Some(ErrorKind::Aborted),
            Some(error) => error,
            None if std::thread::panicking() => Some(ErrorKind::WorkerPanic),
            None => Some(ErrorKind::Aborted),
        };
        self.metrics
            .record_call(self.method, error, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = ServiceMetrics::new().unwrap();

        metrics.record_call(RpcMethod::Predict, None, Duration::from_micros(100));
        metrics.record_call(RpcMethod::Predict, None, Duration::from_micros(200));
        metrics.record_call(
            RpcMethod::Predict,
            Some(ErrorKind::EmptyFeatures),
            Duration::from_micros(50),
        );

        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Success), 2);
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Error), 1);
        assert_eq!(
            metrics.error_count(RpcMethod::Predict, ErrorKind::EmptyFeatures),
            1
        );
        assert_eq!(metrics.latency_count(RpcMethod::Predict), 3);
        assert_eq!(metrics.latency_count(RpcMethod::Health), 0);
    }

    #[test]
    fn test_recorder_success() {
        let metrics = ServiceMetrics::new().unwrap();
        {
            let mut call = CallRecorder::start(&metrics, RpcMethod::Health);
            call.complete(&Ok::<(), PredictionError>(()));
        }

        assert_eq!(metrics.request_count(RpcMethod::Health, Outcome::Success), 1);
        assert_eq!(metrics.request_count(RpcMethod::Health, Outcome::Error), 0);
        assert_eq!(metrics.latency_count(RpcMethod::Health), 1);
    }

    #[test]
    fn test_recorder_without_outcome_counts_aborted() {
        let metrics = ServiceMetrics::new().unwrap();
        drop(CallRecorder::start(&metrics, RpcMethod::Predict));

        assert_eq!(metrics.error_count(RpcMethod::Predict, ErrorKind::Aborted), 1);
        assert_eq!(metrics.latency_count(RpcMethod::Predict), 1);
    }

    #[test]
    fn test_recorder_for_abandoned_call() {
        let metrics = ServiceMetrics::new().unwrap();
        let abandoned = CallAbandoned::default();
        {
            let mut call = CallRecorder::start(&metrics, RpcMethod::Predict).watching(&abandoned);
            drop(AbandonOnDrop::new(abandoned.clone()));
            call.complete(&Ok::<(), PredictionError>(()));
        }

        assert!(abandoned.is_marked());
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Success), 0);
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Error), 1);
        assert_eq!(metrics.error_count(RpcMethod::Predict, ErrorKind::Aborted), 1);
    }

    #[test]
    fn test_disarmed_guard_keeps_success() {
        let metrics = ServiceMetrics::new().unwrap();
        let abandoned = CallAbandoned::default();
        {
            let mut call = CallRecorder::start(&metrics, RpcMethod::Health).watching(&abandoned);
            AbandonOnDrop::new(abandoned.clone()).disarm();
            call.complete(&Ok::<(), PredictionError>(()));
        }

        assert!(!abandoned.is_marked());
        assert_eq!(metrics.request_count(RpcMethod::Health, Outcome::Success), 1);
    }

    #[test]
    fn test_recorder_during_panic() {
        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        let shared = metrics.clone();

        let result = std::thread::spawn(move || {
            let _call = CallRecorder::start(&shared, RpcMethod::Predict);
            panic!("model exploded");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(
            metrics.error_count(RpcMethod::Predict, ErrorKind::WorkerPanic),
            1
        );
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Error), 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let metrics = Arc::new(ServiceMetrics::new().unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_call(RpcMethod::Predict, None, Duration::from_micros(10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            metrics.request_count(RpcMethod::Predict, Outcome::Success),
            8000
        );
        assert_eq!(metrics.latency_count(RpcMethod::Predict), 8000);
    }

    #[test]
    fn test_render_contains_instruments() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.set_model_info("v1.0.0", "models/model.json");
        metrics.record_call(RpcMethod::Health, None, Duration::from_millis(1));
        metrics.observe_inference(Duration::from_micros(40));

        let text = metrics.render().unwrap();

        assert!(text.contains(
            "prediction_requests_total{method=\"Health\",outcome=\"success\"} 1"
        ));
        assert!(text.contains(
            "prediction_model_info{path=\"models/model.json\",version=\"v1.0.0\"} 1"
        ));
        assert!(text.contains("prediction_request_duration_seconds_bucket"));
        assert!(text.contains("prediction_inference_duration_seconds_count 1"));
    }
}
