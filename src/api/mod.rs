//! Wire types shared by the control plane and per-model handlers.
//!
//! Requests are JSON envelopes `{action, payload}`. The payload is an
//! order-irrelevant string→value map whose shape depends on the
//! backend family; [`Payload`] provides the tolerant typed accessors
//! the wire protocol allows (numbers may arrive as JSON numbers or
//! numeric strings).

use crate::error::InferenceError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Well-known control address the dispatcher listens on.
pub const SERVICE_INFERENCE_MODELS: &str = "service:inference:models";

/// Allocate a fresh, never-reused per-model endpoint address.
pub fn model_address() -> String {
    format!("service:inference:model:{}", Uuid::new_v4())
}

// Payload keys, kept verbatim from the wire protocol.
pub const INFERENCE_FORMAT: &str = "format";
pub const INFERENCE_TYPE: &str = "type";
pub const INPUT: &str = "input";
pub const MODEL_NAME: &str = "modelName";
pub const MODEL_PATH: &str = "modelPath";
pub const TOKENIZER_PATH: &str = "tokenizerPath";
pub const CONFIG_JSON_PATH: &str = "configJsonPath";
pub const POOLING_MODE: &str = "poolingMode";
pub const MAX_SEQUENCE_LENGTH: &str = "maxSequenceLength";
pub const CLASSIFIER_MODE: &str = "classifierMode";
pub const CLASSIFIER_LABELS: &str = "classifierLabels";
pub const MODEL_ADDRESS: &str = "modelAddress";

// Text generation.
pub const SEQ_ID: &str = "seqId";
pub const PROMPT: &str = "prompt";
pub const MESSAGES: &str = "messages";
pub const MAX_TOKENS: &str = "maxTokens";
pub const TEMPERATURE: &str = "temperature";
pub const TOP_P: &str = "topP";
pub const PRESENCE_PENALTY: &str = "presencePenalty";
pub const FREQUENCY_PENALTY: &str = "frequencyPenalty";
pub const STOP: &str = "stop";
pub const SEED: &str = "seed";
pub const REASONING_TAGS: &str = "reasoningTags";
pub const TOOL_TAGS: &str = "toolTags";
pub const CONTEXT: &str = "context";
pub const MODEL_PARAMS: &str = "modelParams";
pub const CONTEXT_N_CTX: &str = "nCtx";
pub const CONTEXT_N_BATCH: &str = "nBatch";
pub const CONTEXT_N_UBATCH: &str = "nUbatch";
pub const CONTEXT_N_SEQ_MAX: &str = "nSeqMax";
pub const CONTEXT_OFFLOAD_KQV: &str = "offloadKqv";
pub const CONTEXT_NO_PERF: &str = "noPerf";
pub const MODEL_SPLIT_MODE: &str = "splitMode";
pub const MODEL_MAIN_GPU: &str = "mainGpu";
pub const MODEL_N_GPU_LAYERS: &str = "nGpuLayers";
pub const MODEL_USE_MLOCK: &str = "useMlock";
pub const MODEL_USE_MMAP: &str = "useMmap";
pub const MODEL_LORA_REPO: &str = "loraRepo";
pub const MODEL_LORA_REPO_PATH: &str = "loraRepoPath";

// Remote embedding backends.
pub const URI: &str = "uri";
pub const API_KEY: &str = "apiKey";
pub const MODEL: &str = "model";
pub const ORGANIZATION_ID: &str = "organizationId";
pub const PROJECT_ID: &str = "projectId";
pub const DIMENSIONS: &str = "dimensions";
pub const ENCODING_FORMAT: &str = "encodingFormat";
pub const METHOD: &str = "method";
pub const HEADERS: &str = "headers";
pub const REQUEST_BODY_TEMPLATE: &str = "requestBodyTemplate";
pub const INPUT_LOCATION: &str = "inputLocation";
pub const OUTPUT_EMBEDDING_LOCATION: &str = "outputEmbeddingLocation";

/// Control and per-model actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceAction {
    Start,
    Stop,
    Infer,
    Create,
}

impl InferenceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceAction::Start => "START",
            InferenceAction::Stop => "STOP",
            InferenceAction::Infer => "INFER",
            InferenceAction::Create => "CREATE",
        }
    }
}

/// Backend families a provider can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceFormat {
    OnnxBert,
    Http,
    Openai,
    LlamaCpp,
}

impl InferenceFormat {
    pub fn parse(value: &str) -> Result<Self, InferenceError> {
        match value {
            "ONNX_BERT" => Ok(InferenceFormat::OnnxBert),
            "HTTP" => Ok(InferenceFormat::Http),
            "OPENAI" => Ok(InferenceFormat::Openai),
            "LLAMA_CPP" => Ok(InferenceFormat::LlamaCpp),
            other => Err(InferenceError::BadRequest(format!(
                "Unknown inference format: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceFormat::OnnxBert => "ONNX_BERT",
            InferenceFormat::Http => "HTTP",
            InferenceFormat::Openai => "OPENAI",
            InferenceFormat::LlamaCpp => "LLAMA_CPP",
        }
    }
}

impl std::fmt::Display for InferenceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of inference a backend performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceType {
    Classifier,
    Embedding,
    TextGeneration,
}

impl InferenceType {
    pub fn parse(value: &str) -> Result<Self, InferenceError> {
        match value {
            "CLASSIFIER" => Ok(InferenceType::Classifier),
            "EMBEDDING" => Ok(InferenceType::Embedding),
            "TEXT_GENERATION" => Ok(InferenceType::TextGeneration),
            other => Err(InferenceError::BadRequest(format!(
                "Unknown inference type: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceType::Classifier => "CLASSIFIER",
            InferenceType::Embedding => "EMBEDDING",
            InferenceType::TextGeneration => "TEXT_GENERATION",
        }
    }
}

impl std::fmt::Display for InferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound request envelope. The action is kept as the raw wire string
/// so unknown values can be rejected with a message naming them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl InferenceRequest {
    pub fn new(action: InferenceAction, payload: Map<String, Value>) -> Self {
        Self {
            action: Some(action.as_str().to_string()),
            payload,
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, InferenceError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn encode(&self) -> bytes::Bytes {
        // The envelope is plain JSON-native data; encoding cannot fail.
        bytes::Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Resolve the action, rejecting `null` and unknown values with an
    /// error that names the offending literal.
    pub fn action(&self) -> Result<InferenceAction, InferenceError> {
        match self.action.as_deref() {
            Some("START") => Ok(InferenceAction::Start),
            Some("STOP") => Ok(InferenceAction::Stop),
            Some("INFER") => Ok(InferenceAction::Infer),
            Some("CREATE") => Ok(InferenceAction::Create),
            Some(other) => Err(InferenceError::UnsupportedAction(other.to_string())),
            None => Err(InferenceError::UnsupportedAction("null".to_string())),
        }
    }

    pub fn payload(&self) -> Payload<'_> {
        Payload(&self.payload)
    }
}

/// Borrowing view over a request payload with tolerant typed getters.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a>(pub &'a Map<String, Value>);

impl<'a> Payload<'a> {
    pub fn value(&self, key: &str) -> Option<&'a Value> {
        self.0.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn required_str(&self, key: &str) -> Result<&'a str, InferenceError> {
        self.str(key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| InferenceError::BadRequest(format!("{key} is required")))
    }

    pub fn u32(&self, key: &str) -> Option<u32> {
        coerce_u32(self.0.get(key)?)
    }

    pub fn u32_or(&self, key: &str, default: u32) -> u32 {
        self.u32(key).unwrap_or(default)
    }

    pub fn f32(&self, key: &str) -> Option<f32> {
        coerce_f32(self.0.get(key)?)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => default,
        }
    }

    pub fn map(&self, key: &str) -> Option<&'a Map<String, Value>> {
        self.0.get(key).and_then(Value::as_object)
    }

    /// A single string or an array of strings; anything else is `None`.
    pub fn str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.0.get(key)? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => {
                let list: Vec<String> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                (!list.is_empty()).then_some(list)
            }
            _ => None,
        }
    }

    pub fn string_map(&self, key: &str) -> std::collections::BTreeMap<String, String> {
        self.map(key)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn coerce_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_f32(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> InferenceRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn action_parses_known_values() {
        let req = request(json!({"action": "START", "payload": {}}));
        assert_eq!(req.action().unwrap(), InferenceAction::Start);
    }

    #[test]
    fn missing_action_reports_null() {
        let req = request(json!({"payload": {}}));
        let err = req.action().unwrap_err();
        assert_eq!(err.code(), 405);
        assert!(err.to_string().contains("null"));
    }

    #[test]
    fn unknown_action_names_the_literal() {
        let req = request(json!({"action": "RESTART", "payload": {}}));
        let err = req.action().unwrap_err();
        assert_eq!(err.code(), 405);
        assert!(err.to_string().contains("RESTART"));
    }

    #[test]
    fn payload_coerces_numbers_from_strings() {
        let req = request(json!({"payload": {"seqId": "7", "temperature": "0.5"}}));
        let payload = req.payload();
        assert_eq!(payload.u32(SEQ_ID), Some(7));
        assert_eq!(payload.f32(TEMPERATURE), Some(0.5));
    }

    #[test]
    fn required_str_rejects_blank() {
        let req = request(json!({"payload": {"modelAddress": "  "}}));
        let err = req.payload().required_str(MODEL_ADDRESS).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn stop_accepts_string_or_list() {
        let req = request(json!({"payload": {"stop": "</s>"}}));
        assert_eq!(req.payload().str_list(STOP), Some(vec!["</s>".to_string()]));
        let req = request(json!({"payload": {"stop": ["a", "b"]}}));
        assert_eq!(
            req.payload().str_list(STOP),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn format_round_trips_wire_names() {
        assert_eq!(
            InferenceFormat::parse("LLAMA_CPP").unwrap(),
            InferenceFormat::LlamaCpp
        );
        assert_eq!(InferenceFormat::OnnxBert.as_str(), "ONNX_BERT");
        assert!(InferenceFormat::parse("GGUF").is_err());
    }

    #[test]
    fn model_addresses_are_unique() {
        assert_ne!(model_address(), model_address());
    }
}
