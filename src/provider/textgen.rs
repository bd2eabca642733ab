//! Provider for the batched local text-generation backend.

use crate::api::{self, InferenceRequest, InferenceType, Payload};
use crate::backend::{BatchEngineFactory, EngineConfig, SplitMode};
use crate::bus::EventBus;
use crate::config::EngineDefaults;
use crate::error::{InferenceError, Result};
use crate::fetch::{ArtifactKind, FetchRequest, ModelFetcher};
use crate::handler::TextGenHandler;
use crate::provider::{Provider, Provision};
use crate::repository::{Fingerprint, HandlerRepository};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use uuid::Uuid;

pub struct TextGenProvider {
    fetcher: Arc<dyn ModelFetcher>,
    factory: Arc<dyn BatchEngineFactory>,
    bus: EventBus,
    model_dir: PathBuf,
    defaults: EngineDefaults,
}

impl TextGenProvider {
    pub fn new(
        fetcher: Arc<dyn ModelFetcher>,
        factory: Arc<dyn BatchEngineFactory>,
        bus: EventBus,
        model_dir: impl Into<PathBuf>,
        defaults: EngineDefaults,
    ) -> Self {
        Self {
            fetcher,
            factory,
            bus,
            model_dir: model_dir.into(),
            defaults,
        }
    }

    /// Use the model file where it already exists; otherwise hand the
    /// hub-relative path to the fetcher.
    async fn resolve_model_path(&self, payload: Payload<'_>) -> Result<PathBuf> {
        let requested = payload.required_str(api::MODEL_PATH)?;
        let direct = self.local_candidate(requested);
        if direct.exists() {
            return Ok(direct);
        }

        let model_name = model_name(payload);
        let mut resolved = self
            .fetcher
            .fetch(FetchRequest {
                model_name: model_name.clone(),
                files: vec![(ArtifactKind::Model, requested.to_string())],
                target_dir: self.model_dir.join(&model_name),
            })
            .await?;
        resolved.remove(&ArtifactKind::Model).ok_or_else(|| {
            InferenceError::BadRequest("fetcher did not resolve the model artifact".to_string())
        })
    }

    fn local_candidate(&self, requested: &str) -> PathBuf {
        let path = Path::new(requested);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.model_dir.join(path)
        }
    }

    /// Resolve the optional LoRA adapter. Incomplete or unparseable
    /// specs resolve to none rather than failing the start.
    async fn resolve_lora_path(&self, payload: Payload<'_>) -> Result<Option<PathBuf>> {
        let params = payload.map(api::MODEL_PARAMS);
        let repo_raw = params
            .and_then(|m| m.get(api::MODEL_LORA_REPO))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let Some(repo_raw) = repo_raw else {
            return Ok(None);
        };

        let (repo, file) = if repo_raw.starts_with("http://") || repo_raw.starts_with("https://") {
            match parse_hf_resolve_url(repo_raw) {
                Some(spec) => spec,
                None => return Ok(None),
            }
        } else {
            let file = params
                .and_then(|m| m.get(api::MODEL_LORA_REPO_PATH))
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty());
            match file {
                Some(file) => (repo_raw.to_string(), file.to_string()),
                None => return Ok(None),
            }
        };

        let model_name = model_name(payload);
        let mut resolved = self
            .fetcher
            .fetch(FetchRequest {
                model_name: repo,
                files: vec![(ArtifactKind::Lora, file)],
                target_dir: self.model_dir.join(&model_name),
            })
            .await?;
        Ok(resolved.remove(&ArtifactKind::Lora))
    }

    fn build_engine_config(
        &self,
        payload: Payload<'_>,
        model_path: PathBuf,
        lora_path: Option<PathBuf>,
    ) -> EngineConfig {
        let context = nested(payload, api::CONTEXT);
        let model_params = nested(payload, api::MODEL_PARAMS);
        let threads = num_cpus::get().max(1) as u32;

        EngineConfig {
            model_path,
            n_ctx: context.u32_or(api::CONTEXT_N_CTX, self.defaults.n_ctx),
            n_batch: context.u32_or(api::CONTEXT_N_BATCH, self.defaults.n_batch),
            n_ubatch: context.u32_or(api::CONTEXT_N_UBATCH, self.defaults.n_ubatch),
            n_seq_max: context.u32_or(api::CONTEXT_N_SEQ_MAX, self.defaults.n_seq_max),
            n_threads: threads,
            n_threads_batch: threads,
            n_gpu_layers: model_params.u32_or(api::MODEL_N_GPU_LAYERS, self.defaults.n_gpu_layers),
            use_mlock: model_params.bool_or(api::MODEL_USE_MLOCK, true),
            use_mmap: model_params.bool_or(api::MODEL_USE_MMAP, true),
            split_mode: parse_split_mode(model_params.str(api::MODEL_SPLIT_MODE)),
            main_gpu: model_params.u32_or(api::MODEL_MAIN_GPU, 0),
            offload_kqv: context.bool_or(api::CONTEXT_OFFLOAD_KQV, false),
            no_perf: context.bool_or(api::CONTEXT_NO_PERF, false),
            lora_path,
        }
    }
}

fn model_name(payload: Payload<'_>) -> String {
    payload
        .str(api::MODEL_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Borrow a nested payload map, or an empty one.
fn nested<'a>(payload: Payload<'a>, key: &str) -> Payload<'a> {
    static EMPTY: OnceLock<Map<String, Value>> = OnceLock::new();
    Payload(payload.map(key).unwrap_or_else(|| EMPTY.get_or_init(Map::new)))
}

fn parse_split_mode(value: Option<&str>) -> SplitMode {
    match value {
        Some("LAYER") => SplitMode::Layer,
        Some("ROW") => SplitMode::Row,
        _ => SplitMode::None,
    }
}

/// Extract `(repo, file)` from a `https://huggingface.co/<repo>/resolve/<rev>/<file>` URL.
fn parse_hf_resolve_url(url: &str) -> Option<(String, String)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let mut parts = rest.split('/');
    let host = parts.next()?;
    if !host.ends_with("huggingface.co") && !host.ends_with("hf.co") {
        return None;
    }
    let parts: Vec<&str> = parts.collect();
    let resolve_index = parts.iter().position(|p| *p == "resolve")?;
    if resolve_index == 0 || resolve_index + 2 > parts.len() - 1 {
        return None;
    }
    let repo = parts[..resolve_index].join("/");
    let file = parts[resolve_index + 2..].join("/");
    if repo.is_empty() || file.is_empty() {
        return None;
    }
    Some((repo, file))
}

#[async_trait]
impl Provider for TextGenProvider {
    async fn provide(
        &self,
        request: &InferenceRequest,
        repository: &HandlerRepository,
    ) -> Result<Provision> {
        let payload = request.payload();
        let ty = InferenceType::parse(payload.required_str(api::INFERENCE_TYPE)?)?;
        if ty != InferenceType::TextGeneration {
            return Err(InferenceError::UnsupportedType {
                ty: ty.to_string(),
                format: "LLAMA_CPP".to_string(),
            });
        }

        let model_path = self.resolve_model_path(payload).await?;
        let lora_path = self.resolve_lora_path(payload).await?;
        let config = self.build_engine_config(payload, model_path, lora_path);
        let fingerprint = Fingerprint::of(&config)?;
        debug!(?fingerprint, model = %config.model_path.display(), "providing generation engine");

        let factory = Arc::clone(&self.factory);
        let bus = self.bus.clone();
        let handler = repository
            .get_or_create(fingerprint, move || {
                Ok(Arc::new(TextGenHandler::new(config, factory, bus)))
            })
            .await?;
        Ok(Provision {
            fingerprint,
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hf_resolve_url_extracts_repo_and_file() {
        let (repo, file) = parse_hf_resolve_url(
            "https://huggingface.co/Qwen/Qwen2-0.5B-GGUF/resolve/main/qwen2-0_5b-q4_k_m.gguf",
        )
        .unwrap();
        assert_eq!(repo, "Qwen/Qwen2-0.5B-GGUF");
        assert_eq!(file, "qwen2-0_5b-q4_k_m.gguf");
    }

    #[test]
    fn hf_resolve_url_supports_nested_files_and_hf_co() {
        let (repo, file) =
            parse_hf_resolve_url("https://hf.co/org/model/resolve/main/sub/dir/adapter.gguf")
                .unwrap();
        assert_eq!(repo, "org/model");
        assert_eq!(file, "sub/dir/adapter.gguf");
    }

    #[test]
    fn non_hub_urls_are_rejected() {
        assert!(parse_hf_resolve_url("https://example.com/a/resolve/main/f").is_none());
        assert!(parse_hf_resolve_url("https://huggingface.co/resolve/main/f").is_none());
        assert!(parse_hf_resolve_url("not a url").is_none());
    }

    #[test]
    fn split_mode_defaults_to_none() {
        assert_eq!(parse_split_mode(None), SplitMode::None);
        assert_eq!(parse_split_mode(Some("LAYER")), SplitMode::Layer);
        assert_eq!(parse_split_mode(Some("bogus")), SplitMode::None);
    }
}
