//! ONNX Runtime backed classifier (`onnx` feature)

use crate::error::InferenceError;
use crate::models::classifier::Classifier;
use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session, SessionOutputs};
use ort::value::{Tensor, ValueType};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Classifier exported to ONNX with a probability tensor output
/// (e.g. skl2onnx with `zipmap=False`) and an optional `label` output.
pub struct OnnxClassifier {
    /// `Session::run` needs `&mut self`
    session: Mutex<Session>,
    input_name: String,
    label_output: Option<String>,
    prob_output: String,
    input_dim: Option<usize>,
}

impl OnnxClassifier {
    pub fn load(path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(path)
            .context(format!("Failed to load model from {:?}", path))?;

        let input = session
            .inputs
            .first()
            .context("model declares no inputs")?;
        let input_name = input.name.clone();
        let input_dim = match &input.input_type {
            ValueType::Tensor { shape, .. } => shape
                .last()
                .copied()
                .filter(|&d| d > 0)
                .map(|d| d as usize),
            _ => None,
        };

        let label_output = session
            .outputs
            .iter()
            .find(|o| o.name.contains("label"))
            .map(|o| o.name.clone());
        let prob_output = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob"))
            .or_else(|| session.outputs.last())
            .map(|o| o.name.clone())
            .context("model declares no outputs")?;

        info!(
            input = %input_name,
            output = %prob_output,
            input_dim = ?input_dim,
            "ONNX model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            label_output,
            prob_output,
            input_dim,
        })
    }

    fn run<T>(
        &self,
        features: &[f32],
        extract: impl FnOnce(&SessionOutputs<'_>) -> Result<T, InferenceError>,
    ) -> Result<T, InferenceError> {
        if let Some(expected) = self.input_dim {
            if features.len() != expected {
                return Err(InferenceError::Dimension {
                    expected,
                    actual: features.len(),
                });
            }
        }

        let shape = vec![1_i64, features.len() as i64];
        let input = Tensor::from_array((shape, features.to_vec()))
            .map_err(|e| InferenceError::Runtime(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| InferenceError::Runtime("session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| InferenceError::Runtime(e.to_string()))?;

        extract(&outputs)
    }

    fn extract_probabilities(
        &self,
        outputs: &SessionOutputs<'_>,
    ) -> Result<Vec<f64>, InferenceError> {
        let value = outputs.get(&self.prob_output).ok_or_else(|| {
            InferenceError::Runtime(format!("missing output {}", self.prob_output))
        })?;
        let (_, data) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Runtime(e.to_string()))?;
        Ok(data.iter().map(|&p| p as f64).collect())
    }

    /// Label output if present, else the index of the most probable class
    fn extract_label(
        &self,
        outputs: &SessionOutputs<'_>,
        probs: &[f64],
    ) -> Result<String, InferenceError> {
        if let Some(label) = self.label_output.as_ref().and_then(|name| outputs.get(name)) {
            if let Ok((_, data)) = label.try_extract_tensor::<i64>() {
                if let Some(v) = data.first() {
                    return Ok(v.to_string());
                }
            }
        }

        probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i.to_string())
            .ok_or_else(|| InferenceError::Runtime("empty probability output".to_string()))
    }
}

impl Classifier for OnnxClassifier {
    fn kind(&self) -> &'static str {
        "onnx"
    }

    fn input_dim(&self) -> Option<usize> {
        self.input_dim
    }

    fn classify(&self, features: &[f32]) -> Result<String, InferenceError> {
        self.predict(features).map(|(label, _)| label)
    }

    fn class_probabilities(&self, features: &[f32]) -> Result<Vec<f64>, InferenceError> {
        self.run(features, |outputs| self.extract_probabilities(outputs))
    }

    /// One session run yields both outputs
    fn predict(&self, features: &[f32]) -> Result<(String, Vec<f64>), InferenceError> {
        self.run(features, |outputs| {
            let probs = self.extract_probabilities(outputs)?;
            let label = self.extract_label(outputs, &probs)?;
            Ok((label, probs))
        })
    }
}
