//! Classifier capability and the built-in linear model

use crate::error::InferenceError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability every loaded artifact provides.
///
/// Implementations are immutable after construction and shared across
/// request workers without locking.
pub trait Classifier: Send + Sync {
    /// Short name of the artifact format, used in logs
    fn kind(&self) -> &'static str;

    /// Expected feature vector length, if the artifact declares one
    fn input_dim(&self) -> Option<usize>;

    /// Predicted class label for a single feature vector
    fn classify(&self, features: &[f32]) -> Result<String, InferenceError>;

    /// Per-class probabilities, in class order, summing to ~1.0
    fn class_probabilities(&self, features: &[f32]) -> Result<Vec<f64>, InferenceError>;

    /// Label and probabilities together. Backends that produce both from a
    /// single evaluation should override this.
    fn predict(&self, features: &[f32]) -> Result<(String, Vec<f64>), InferenceError> {
        let label = self.classify(features)?;
        Ok((label, self.class_probabilities(features)?))
    }
}

/// Class label as stored in the artifact; integers and strings are both accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassLabel {
    Int(i64),
    Text(String),
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassLabel::Int(v) => write!(f, "{}", v),
            ClassLabel::Text(s) => f.write_str(s),
        }
    }
}

/// Serialized form of a (multinomial) logistic regression model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModelArtifact {
    pub model_type: String,
    pub classes: Vec<ClassLabel>,
    /// One row per class, or a single row for a binary model
    pub coefficients: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
}

pub const LOGISTIC_REGRESSION: &str = "logistic_regression";

/// Logistic regression scored in pure Rust.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    classes: Vec<String>,
    coefficients: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
    n_features: usize,
}

impl LinearClassifier {
    /// Build a classifier, checking that the artifact's shapes agree.
    pub fn from_artifact(artifact: LinearModelArtifact) -> Result<Self, String> {
        if artifact.model_type != LOGISTIC_REGRESSION {
            return Err(format!("unsupported model_type '{}'", artifact.model_type));
        }
        if artifact.classes.len() < 2 {
            return Err(format!(
                "need at least 2 classes, found {}",
                artifact.classes.len()
            ));
        }

        let rows = artifact.coefficients.len();
        let binary = rows == 1 && artifact.classes.len() == 2;
        if !binary && rows != artifact.classes.len() {
            return Err(format!(
                "{} coefficient rows for {} classes",
                rows,
                artifact.classes.len()
            ));
        }
        if artifact.intercepts.len() != rows {
            return Err(format!(
                "{} intercepts for {} coefficient rows",
                artifact.intercepts.len(),
                rows
            ));
        }

        let n_features = artifact.coefficients[0].len();
        if n_features == 0 {
            return Err("coefficient rows are empty".to_string());
        }
        if artifact.coefficients.iter().any(|row| row.len() != n_features) {
            return Err("coefficient rows have different lengths".to_string());
        }
        let all_finite = artifact
            .coefficients
            .iter()
            .flatten()
            .chain(artifact.intercepts.iter())
            .all(|v| v.is_finite());
        if !all_finite {
            return Err("non-finite weight".to_string());
        }

        Ok(Self {
            classes: artifact.classes.iter().map(|c| c.to_string()).collect(),
            coefficients: artifact.coefficients,
            intercepts: artifact.intercepts,
            n_features,
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    fn check_dim(&self, features: &[f32]) -> Result<(), InferenceError> {
        if features.len() != self.n_features {
            return Err(InferenceError::Dimension {
                expected: self.n_features,
                actual: features.len(),
            });
        }
        Ok(())
    }

    /// Raw decision values, one per coefficient row
    fn decision(&self, features: &[f32]) -> Vec<f64> {
        self.coefficients
            .iter()
            .zip(&self.intercepts)
            .map(|(row, b)| {
                row.iter()
                    .zip(features)
                    .map(|(w, &x)| w * x as f64)
                    .sum::<f64>()
                    + b
            })
            .collect()
    }

    fn probabilities(&self, features: &[f32]) -> Vec<f64> {
        let z = self.decision(features);

        if z.len() == 1 {
            let p = 1.0 / (1.0 + (-z[0]).exp());
            return vec![1.0 - p, p];
        }

        // Softmax, shifted by the max for numerical stability
        let max = z.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = z.iter().map(|v| (v - max).exp()).collect();
        let sum: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / sum).collect()
    }
}

impl Classifier for LinearClassifier {
    fn kind(&self) -> &'static str {
        LOGISTIC_REGRESSION
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.n_features)
    }

    fn classify(&self, features: &[f32]) -> Result<String, InferenceError> {
        self.check_dim(features)?;
        let probs = self.probabilities(features);

        let best = probs
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, &p)| {
                if p > acc.1 {
                    (i, p)
                } else {
                    acc
                }
            })
            .0;

        Ok(self.classes[best].clone())
    }

    fn class_probabilities(&self, features: &[f32]) -> Result<Vec<f64>, InferenceError> {
        self.check_dim(features)?;
        Ok(self.probabilities(features))
    }
}
