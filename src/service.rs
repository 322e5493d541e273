//! Health and Predict operations against the loaded model.
//!
//! Each operation runs inside a [`CallRecorder`] so that the outcome counter,
//! the error counter and the latency histogram are written exactly once on
//! every exit path.

use crate::error::PredictionError;
use crate::metrics::{CallAbandoned, CallRecorder, RpcMethod, ServiceMetrics};
use crate::models::ModelHandle;
use crate::types::{HealthResponse, HealthStatus, PredictRequest, PredictResponse};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Prediction service shared by all request workers
pub struct PredictionService {
    model: Arc<ModelHandle>,
    metrics: Arc<ServiceMetrics>,
}

impl PredictionService {
    pub fn new(model: Arc<ModelHandle>, metrics: Arc<ServiceMetrics>) -> Self {
        Self { model, metrics }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Liveness probe reporting the served model version
    pub fn health(&self) -> Result<HealthResponse, PredictionError> {
        self.health_for(&CallAbandoned::default())
    }

    /// [`Self::health`] for a caller that may go away before it completes
    pub fn health_for(&self, abandoned: &CallAbandoned) -> Result<HealthResponse, PredictionError> {
        let mut call = CallRecorder::start(&self.metrics, RpcMethod::Health).watching(abandoned);
        let result = self.build_health();
        call.complete(&result);
        log_outcome(RpcMethod::Health, &result);
        result
    }

    /// Classify one feature vector
    pub fn predict(&self, request: &PredictRequest) -> Result<PredictResponse, PredictionError> {
        self.predict_for(request, &CallAbandoned::default())
    }

    /// [`Self::predict`] for a caller that may go away before it completes
    pub fn predict_for(
        &self,
        request: &PredictRequest,
        abandoned: &CallAbandoned,
    ) -> Result<PredictResponse, PredictionError> {
        let mut call = CallRecorder::start(&self.metrics, RpcMethod::Predict).watching(abandoned);
        let result = self.run_predict(request);
        call.complete(&result);
        log_outcome(RpcMethod::Predict, &result);
        result
    }

    fn build_health(&self) -> Result<HealthResponse, PredictionError> {
        let version = self.model.version();
        if version.is_empty() {
            return Err(PredictionError::ResponseBuild(
                "model version is not set".to_string(),
            ));
        }

        Ok(HealthResponse {
            status: HealthStatus::Ok.as_str().to_string(),
            model_version: version.to_string(),
        })
    }

    fn run_predict(&self, request: &PredictRequest) -> Result<PredictResponse, PredictionError> {
        let features = self.prepare_features(&request.features)?;
        debug!(features = features.len(), "Received prediction request");

        let inference_start = Instant::now();
        let scored = self.model.artifact().predict(features);
        self.metrics.observe_inference(inference_start.elapsed());
        let (label, probabilities) = scored?;

        let confidence = confidence(&probabilities)?;

        Ok(PredictResponse {
            prediction: label,
            confidence: confidence as f32,
            model_version: self.model.version().to_string(),
        })
    }

    /// Validate the vector against the model's input shape
    fn prepare_features<'f>(&self, features: &'f [f32]) -> Result<&'f [f32], PredictionError> {
        if features.is_empty() {
            return Err(PredictionError::EmptyFeatures);
        }

        if let Some(expected) = self.model.artifact().input_dim() {
            if features.len() != expected {
                return Err(PredictionError::InvalidFeatureVector(format!(
                    "expected {} features, got {}",
                    expected,
                    features.len()
                )));
            }
        }

        if let Some(pos) = features.iter().position(|v| !v.is_finite()) {
            return Err(PredictionError::InvalidFeatureVector(format!(
                "feature {} is not a finite number",
                pos
            )));
        }

        Ok(features)
    }
}

/// Highest class probability; must lie in `[0, 1]`
fn confidence(probabilities: &[f64]) -> Result<f64, PredictionError> {
    let max = probabilities
        .iter()
        .copied()
        .fold(None, |acc: Option<f64>, p| match acc {
            Some(m) if m >= p => Some(m),
            _ => Some(p),
        })
        .ok_or_else(|| {
            PredictionError::InferenceFailed("model returned no class probabilities".to_string())
        })?;

    if !(0.0..=1.0).contains(&max) {
        return Err(PredictionError::ConfidenceOutOfRange(max));
    }
    Ok(max)
}

fn log_outcome<T>(method: RpcMethod, result: &Result<T, PredictionError>) {
    match result {
        Ok(_) => debug!(method = method.as_str(), "Call succeeded"),
        Err(e) if e.kind().is_caller_error() => warn!(
            method = method.as_str(),
            error_kind = e.kind().as_str(),
            error = %e,
            "Rejected invalid request"
        ),
        Err(e) => error!(
            method = method.as_str(),
            error_kind = e.kind().as_str(),
            error = %e,
            "Call failed"
        ),
    }
}
