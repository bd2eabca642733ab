//! Provider for local ONNX BERT backends (embedding and
//! classification).

use crate::api::{self, InferenceRequest, InferenceType, Payload};
use crate::backend::{ClassifierMode, LocalConfig, LocalModelFactory, LocalTask, PoolingMode};
use crate::error::{InferenceError, Result};
use crate::fetch::{ArtifactKind, FetchRequest, ModelFetcher};
use crate::handler::LocalInferenceHandler;
use crate::provider::{Provider, Provision};
use crate::repository::{Fingerprint, HandlerRepository};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_MAX_SEQUENCE_LENGTH: u32 = 512;

pub struct LocalProvider {
    fetcher: Arc<dyn ModelFetcher>,
    factory: Arc<dyn LocalModelFactory>,
    model_dir: PathBuf,
}

impl LocalProvider {
    pub fn new(
        fetcher: Arc<dyn ModelFetcher>,
        factory: Arc<dyn LocalModelFactory>,
        model_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            factory,
            model_dir: model_dir.into(),
        }
    }

    async fn resolve_artifacts(&self, payload: Payload<'_>) -> Result<ResolvedArtifacts> {
        let model_name = payload
            .str(api::MODEL_NAME)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut files = vec![(
            ArtifactKind::Model,
            payload.required_str(api::MODEL_PATH)?.to_string(),
        )];
        files.push((
            ArtifactKind::Tokenizer,
            payload.required_str(api::TOKENIZER_PATH)?.to_string(),
        ));
        if let Some(config_json) = payload.str(api::CONFIG_JSON_PATH) {
            files.push((ArtifactKind::Config, config_json.to_string()));
        }

        let mut resolved = self
            .fetcher
            .fetch(FetchRequest {
                model_name: model_name.clone(),
                files,
                target_dir: self.model_dir.join(&model_name),
            })
            .await?;

        Ok(ResolvedArtifacts {
            model_path: resolved
                .remove(&ArtifactKind::Model)
                .ok_or_else(|| artifact_missing("model"))?,
            tokenizer_path: resolved
                .remove(&ArtifactKind::Tokenizer)
                .ok_or_else(|| artifact_missing("tokenizer"))?,
            config_json_path: resolved.remove(&ArtifactKind::Config),
        })
    }
}

struct ResolvedArtifacts {
    model_path: PathBuf,
    tokenizer_path: PathBuf,
    config_json_path: Option<PathBuf>,
}

fn artifact_missing(kind: &str) -> InferenceError {
    InferenceError::BadRequest(format!("fetcher did not resolve the {kind} artifact"))
}

#[async_trait]
impl Provider for LocalProvider {
    async fn provide(
        &self,
        request: &InferenceRequest,
        repository: &HandlerRepository,
    ) -> Result<Provision> {
        let payload = request.payload();
        let ty = match payload.str(api::INFERENCE_TYPE) {
            Some(value) => InferenceType::parse(value)?,
            None => InferenceType::Classifier,
        };
        let task = match ty {
            InferenceType::Embedding => LocalTask::Embedding {
                pooling_mode: parse_pooling_mode(payload.str(api::POOLING_MODE))?,
                max_sequence_length: payload
                    .u32_or(api::MAX_SEQUENCE_LENGTH, DEFAULT_MAX_SEQUENCE_LENGTH),
            },
            InferenceType::Classifier => LocalTask::Classifier {
                mode: parse_classifier_mode(payload.required_str(api::CLASSIFIER_MODE)?)?,
                labels: payload.str_list(api::CLASSIFIER_LABELS).unwrap_or_default(),
            },
            InferenceType::TextGeneration => {
                return Err(InferenceError::UnsupportedType {
                    ty: ty.to_string(),
                    format: "ONNX_BERT".to_string(),
                })
            }
        };

        let artifacts = self.resolve_artifacts(payload).await?;
        let config = LocalConfig {
            model_path: artifacts.model_path,
            tokenizer_path: artifacts.tokenizer_path,
            config_json_path: artifacts.config_json_path,
            task,
        };
        let fingerprint = Fingerprint::of(&config)?;
        debug!(?fingerprint, model = %config.model_path.display(), "providing local model");

        let factory = Arc::clone(&self.factory);
        let handler = repository
            .get_or_create(fingerprint, move || {
                Ok(Arc::new(LocalInferenceHandler::new(config, factory)))
            })
            .await?;
        Ok(Provision {
            fingerprint,
            handler,
        })
    }
}

fn parse_pooling_mode(value: Option<&str>) -> Result<PoolingMode> {
    match value {
        None => Ok(PoolingMode::Mean),
        Some("MEAN") => Ok(PoolingMode::Mean),
        Some("CLS") => Ok(PoolingMode::Cls),
        Some("MAX") => Ok(PoolingMode::Max),
        Some(other) => Err(InferenceError::BadRequest(format!(
            "Unknown pooling mode: {other}"
        ))),
    }
}

fn parse_classifier_mode(value: &str) -> Result<ClassifierMode> {
    match value {
        "SEQUENCE" => Ok(ClassifierMode::Sequence),
        "TOKEN" => Ok(ClassifierMode::Token),
        other => Err(InferenceError::BadRequest(format!(
            "Unknown classifier mode: {other}"
        ))),
    }
}
