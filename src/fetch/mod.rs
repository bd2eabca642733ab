//! Artifact resolution seam.
//!
//! Providers never touch the network themselves; they hand the set of
//! artifacts a request names to a [`ModelFetcher`] and get back local
//! paths. The crate ships only [`FsFetcher`], which resolves paths
//! that already exist on disk; a hub downloader is an injected
//! replacement in the full system.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Role an artifact plays for the backend being constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Model,
    Tokenizer,
    Config,
    Lora,
}

/// A named set of artifacts to materialize under `target_dir`.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Model name used for directory layout and hub lookup.
    pub model_name: String,
    /// Artifact role and its requested location (local path or
    /// hub-relative file path).
    pub files: Vec<(ArtifactKind, String)>,
    /// Directory fetched files are placed in.
    pub target_dir: PathBuf,
}

/// Resolves requested artifacts to local filesystem paths. Expected to
/// be slow; implementations may download.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<HashMap<ArtifactKind, PathBuf>>;
}

/// Filesystem-only fetcher: resolves artifacts that are already
/// present locally (absolute, or relative to the base directory) and
/// refuses anything that would need a download.
pub struct FsFetcher {
    base_dir: PathBuf,
}

impl FsFetcher {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, requested: &str) -> PathBuf {
        let path = Path::new(requested);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[async_trait]
impl ModelFetcher for FsFetcher {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<HashMap<ArtifactKind, PathBuf>> {
        let mut resolved = HashMap::with_capacity(request.files.len());
        for (kind, requested) in &request.files {
            let path = self.resolve(requested);
            if !path.exists() {
                anyhow::bail!(
                    "artifact '{requested}' for model '{}' not found locally and no remote fetcher is configured",
                    request.model_name
                );
            }
            debug!(model = %request.model_name, ?kind, path = %path.display(), "artifact resolved");
            resolved.insert(*kind, path);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_existing_files_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.onnx"), b"weights").unwrap();

        let fetcher = FsFetcher::new(dir.path());
        let resolved = fetcher
            .fetch(FetchRequest {
                model_name: "m".into(),
                files: vec![(ArtifactKind::Model, "model.onnx".into())],
                target_dir: dir.path().to_path_buf(),
            })
            .await
            .unwrap();
        assert_eq!(resolved[&ArtifactKind::Model], dir.path().join("model.onnx"));
    }

    #[tokio::test]
    async fn missing_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FsFetcher::new(dir.path());
        let err = fetcher
            .fetch(FetchRequest {
                model_name: "m".into(),
                files: vec![(ArtifactKind::Tokenizer, "tokenizer.json".into())],
                target_dir: dir.path().to_path_buf(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tokenizer.json"));
    }
}
