//! Injected backend capabilities.
//!
//! The control plane never computes embeddings, scores or tokens
//! itself. Each backend family is an opaque capability behind one of
//! the traits here, constructed by an injected factory from the
//! canonical configuration its provider normalized. The canonical
//! config structs double as fingerprint input: two requests producing
//! equal configs address the same backend instance.

use crate::api::InferenceType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Embedding pooling strategy for local BERT-style models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolingMode {
    Mean,
    Cls,
    Max,
}

/// Whether a classifier scores the whole sequence or individual tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassifierMode {
    Sequence,
    Token,
}

/// Task-specific part of a local model configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "task")]
pub enum LocalTask {
    #[serde(rename_all = "camelCase")]
    Embedding {
        pooling_mode: PoolingMode,
        max_sequence_length: u32,
    },
    #[serde(rename_all = "camelCase")]
    Classifier {
        mode: ClassifierMode,
        labels: Vec<String>,
    },
}

impl LocalTask {
    pub fn inference_type(&self) -> InferenceType {
        match self {
            LocalTask::Embedding { .. } => InferenceType::Embedding,
            LocalTask::Classifier { .. } => InferenceType::Classifier,
        }
    }
}

/// Canonical configuration for a local (ONNX BERT) backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_json_path: Option<PathBuf>,
    pub task: LocalTask,
}

/// Blocking local inference capability (embedding or classification).
pub trait LocalModel: Send + Sync {
    /// Run inference on one input. Blocking; callers offload to the
    /// worker pool.
    fn infer(&self, input: &str) -> anyhow::Result<Value>;

    /// Release native resources. Called at most once by the owner.
    fn close(&self) {}
}

pub trait LocalModelFactory: Send + Sync {
    /// Construct and initialize the model. Blocking and potentially
    /// slow (native session init); callers offload to the worker pool.
    fn build(&self, config: &LocalConfig) -> anyhow::Result<Arc<dyn LocalModel>>;
}

/// Canonical configuration for a remote embedding backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RemoteConfig {
    Http(HttpEmbeddingConfig),
    Openai(OpenaiEmbeddingConfig),
}

/// Generic HTTP embedding endpoint description.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEmbeddingConfig {
    pub uri: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub request_body_template: String,
    pub input_location: String,
    pub output_embedding_location: String,
}

/// OpenAI-compatible embedding endpoint description.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenaiEmbeddingConfig {
    pub uri: String,
    pub api_key: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
}

/// Non-blocking remote inference capability.
#[async_trait]
pub trait RemoteModel: Send + Sync {
    async fn infer(&self, input: &str) -> anyhow::Result<Value>;

    fn close(&self) {}
}

pub trait RemoteModelFactory: Send + Sync {
    fn build(&self, config: &RemoteConfig) -> anyhow::Result<Arc<dyn RemoteModel>>;
}

/// How model weights are split across devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitMode {
    None,
    Layer,
    Row,
}

/// Canonical configuration for the batched text-generation engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_seq_max: u32,
    pub n_threads: u32,
    pub n_threads_batch: u32,
    pub n_gpu_layers: u32,
    pub use_mlock: bool,
    pub use_mmap: bool,
    pub split_mode: SplitMode,
    pub main_gpu: u32,
    pub offload_kqv: bool,
    pub no_perf: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_path: Option<PathBuf>,
}

/// One chat turn in a generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Open/close tag pair delimiting reasoning or tool-call spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagPair {
    pub open_tag: String,
    pub end_tag: String,
}

/// One generation sequence handed to the batched engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub seed: u32,
    pub reasoning_tags: Option<TagPair>,
    pub tool_tags: Option<TagPair>,
}

/// Engine timing counters forwarded verbatim with final tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub start_time_ms: u64,
    pub load_time_ms: u64,
    pub prompt_eval_time_ms: u64,
    pub eval_time_ms: u64,
    pub prompt_tokens_evaluated: u32,
    pub tokens_generated: u32,
    pub tokens_reused: u32,
    pub sampling_time_ms: u64,
    pub sample_count: u32,
    pub prompt_tokens_per_second: f64,
    pub generation_tokens_per_second: f64,
    pub total_processing_time_ms: u64,
    pub average_sampling_time_ms: f64,
}

/// One generated token. A sequence's lifecycle ends at the first token
/// with `is_final` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceToken {
    pub seq_id: u32,
    pub token: String,
    pub index: u32,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
}

/// Callback the engine invokes for every produced token, potentially
/// from an engine-owned thread.
pub type TokenCallback = Arc<dyn Fn(InferenceToken) + Send + Sync>;

/// Batched text-generation engine capability.
pub trait BatchEngine: Send + Sync {
    /// Enqueue a sequence; tokens arrive through the engine's callback.
    fn add_sequence(&self, seq_id: u32, request: GenerationRequest) -> anyhow::Result<()>;

    /// Cancel a sequence. May return a synthesized final token so
    /// listeners still observe a terminal token; unknown ids return
    /// `None`.
    fn cancel_sequence(&self, seq_id: u32) -> Option<InferenceToken>;

    /// Tear the engine down. Safe with in-flight sequences.
    fn close(&self) {}
}

pub trait BatchEngineFactory: Send + Sync {
    /// Construct and initialize the engine with its token callback.
    /// Blocking and potentially slow; callers offload to the worker
    /// pool.
    fn build(
        &self,
        config: &EngineConfig,
        on_token: TokenCallback,
    ) -> anyhow::Result<Arc<dyn BatchEngine>>;
}
