//! Model artifact loading

use crate::error::ArtifactError;
use crate::models::classifier::{Classifier, LinearClassifier, LinearModelArtifact};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Loaded, immutable model plus the version string it is served under.
#[derive(Clone)]
pub struct ModelHandle {
    artifact: Arc<dyn Classifier>,
    version: String,
    path: PathBuf,
}

impl ModelHandle {
    /// Wrap an already constructed classifier
    pub fn new(
        artifact: Arc<dyn Classifier>,
        version: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            artifact,
            version: version.into(),
            path: path.into(),
        }
    }

    /// Load the artifact at `path`.
    ///
    /// The version is taken from configuration, not from the artifact.
    /// Files ending in `.onnx` are loaded through ONNX Runtime (requires the
    /// `onnx` feature); anything else is read as a JSON linear model.
    pub fn load<P: AsRef<Path>>(path: P, version: &str) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        info!(path = %path.display(), version = %version, "Loading model artifact");

        if !path.exists() {
            return Err(ArtifactError::NotFound(path.to_path_buf()));
        }

        let artifact = if is_onnx(path) {
            load_onnx(path)?
        } else {
            load_linear(path)?
        };

        info!(
            path = %path.display(),
            kind = artifact.kind(),
            input_dim = ?artifact.input_dim(),
            "Model loaded successfully"
        );

        Ok(Self::new(artifact, version, path))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn artifact(&self) -> &dyn Classifier {
        self.artifact.as_ref()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("kind", &self.artifact.kind())
            .field("version", &self.version)
            .field("path", &self.path)
            .finish()
    }
}

fn is_onnx(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("onnx"))
        .unwrap_or(false)
}

fn load_linear(path: &Path) -> Result<Arc<dyn Classifier>, ArtifactError> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ArtifactError::NotFound(path.to_path_buf()),
        _ => ArtifactError::corrupt(path, e),
    })?;

    let artifact: LinearModelArtifact =
        serde_json::from_slice(&bytes).map_err(|e| ArtifactError::corrupt(path, e))?;
    let classifier =
        LinearClassifier::from_artifact(artifact).map_err(|e| ArtifactError::corrupt(path, e))?;

    Ok(Arc::new(classifier))
}

#[cfg(feature = "onnx")]
fn load_onnx(path: &Path) -> Result<Arc<dyn Classifier>, ArtifactError> {
    let classifier = crate::models::onnx::OnnxClassifier::load(path)
        .map_err(|e| ArtifactError::corrupt(path, format!("{:#}", e)))?;
    Ok(Arc::new(classifier))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(path: &Path) -> Result<Arc<dyn Classifier>, ArtifactError> {
    Err(ArtifactError::corrupt(
        path,
        "ONNX artifacts require the `onnx` feature",
    ))
}
