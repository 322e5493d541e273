//! Model artifact loading and inference

pub mod classifier;
pub mod loader;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use classifier::{Classifier, LinearClassifier};
pub use loader::ModelHandle;
