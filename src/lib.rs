//! Prediction Service Library
//!
//! Serves a trained classification model over gRPC (`Health`, `Predict`) on a
//! bounded worker pool, with Prometheus metrics exposed on a separate,
//! independently running HTTP listener.

pub mod app;
pub mod config;
pub mod error;
pub mod exposition;
pub mod metrics;
pub mod models;
pub mod server;
pub mod service;
pub mod types;

pub use app::Application;
pub use config::AppConfig;
pub use error::{ArtifactError, ErrorKind, PredictionError};
pub use metrics::ServiceMetrics;
pub use models::ModelHandle;
pub use service::PredictionService;
