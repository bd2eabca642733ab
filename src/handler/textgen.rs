//! Streaming sequence multiplexer for the batched text-generation
//! backend.
//!
//! `INFER` starts a generation sequence and replies immediately;
//! tokens flow asynchronously from the engine, through the token
//! callback, to the per-request stream address. `STOP` cancels one
//! sequence (distinct from the control-plane stop that tears the
//! model down). The seqId→stream-address table is the only state the
//! engine callback thread shares with the event loop.

use crate::api::{self, InferenceAction, InferenceRequest, Payload};
use crate::backend::{
    BatchEngine, BatchEngineFactory, ChatMessage, EngineConfig, GenerationRequest,
    InferenceToken, Role, TagPair, TokenCallback,
};
use crate::bus::{EventBus, Message};
use crate::error::{InferenceError, Result};
use crate::handler::InferenceHandler;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

const DEFAULT_SEED: u32 = 42;

/// seqId→stream-address table shared with the engine callback thread.
struct StreamTable {
    bus: EventBus,
    streams: Mutex<HashMap<u32, String>>,
}

impl StreamTable {
    /// Republish one token to its sequence's stream address. Unknown
    /// sequences are dropped silently: the callback racing a
    /// cancellation or teardown is expected. The first final token is
    /// the sequence's terminal transition.
    fn publish(&self, token: InferenceToken) {
        let address = self.streams.lock().get(&token.seq_id).cloned();
        let Some(address) = address else {
            trace!(seq_id = token.seq_id, "token for unknown sequence, dropped");
            return;
        };
        let is_final = token.is_final;
        let seq_id = token.seq_id;
        match serde_json::to_vec(&token) {
            Ok(body) => self.bus.publish(&address, Bytes::from(body)),
            Err(err) => warn!(seq_id, %err, "failed to encode token, dropped"),
        }
        if is_final {
            self.streams.lock().remove(&seq_id);
            debug!(seq_id, "sequence completed");
        }
    }
}

pub struct TextGenHandler {
    config: EngineConfig,
    factory: Arc<dyn BatchEngineFactory>,
    engine: OnceLock<Arc<dyn BatchEngine>>,
    table: Arc<StreamTable>,
    seq_counter: AtomicU32,
    closed: AtomicBool,
}

impl TextGenHandler {
    pub fn new(config: EngineConfig, factory: Arc<dyn BatchEngineFactory>, bus: EventBus) -> Self {
        Self {
            config,
            factory,
            engine: OnceLock::new(),
            table: Arc::new(StreamTable {
                bus,
                streams: Mutex::new(HashMap::new()),
            }),
            seq_counter: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate the next caller-less sequence id: monotonic, never
    /// reused, never zero.
    fn next_seq_id(&self) -> u32 {
        self.seq_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn engine(&self) -> Result<&Arc<dyn BatchEngine>> {
        self.engine.get().ok_or(InferenceError::NotReady)
    }

    async fn dispatch(&self, body: &Bytes) -> Result<Bytes> {
        let request = InferenceRequest::decode(body)?;
        match request.action()? {
            InferenceAction::Infer => self.handle_infer(request.payload()),
            InferenceAction::Stop => self.handle_stop(request.payload()),
            other => Err(InferenceError::UnsupportedAction(other.as_str().to_string())),
        }
    }

    /// Start one generation sequence; the reply never waits for
    /// generation.
    fn handle_infer(&self, payload: Payload<'_>) -> Result<Bytes> {
        let stream_address = payload.required_str(api::MODEL_ADDRESS)?.to_string();
        let engine = self.engine()?;
        let seq_id = match payload.u32(api::SEQ_ID) {
            Some(id) => id,
            None => self.next_seq_id(),
        };
        let generation = parse_generation_request(payload)?;

        self.table
            .streams
            .lock()
            .insert(seq_id, stream_address.clone());
        if let Err(err) = engine.add_sequence(seq_id, generation) {
            self.table.streams.lock().remove(&seq_id);
            return Err(InferenceError::Backend(err));
        }
        debug!(seq_id, stream = %stream_address, "sequence started");
        Ok(reply_status("started", seq_id))
    }

    /// Cancel one sequence. Unknown or already-finished ids still
    /// reply success: the observable end state is already satisfied.
    fn handle_stop(&self, payload: Payload<'_>) -> Result<Bytes> {
        let seq_id = payload
            .u32(api::SEQ_ID)
            .ok_or_else(|| InferenceError::BadRequest("seqId is required".to_string()))?;
        let engine = self.engine()?;
        if let Some(token) = engine.cancel_sequence(seq_id) {
            // Listeners always observe a terminal token, even on cancel.
            self.table.publish(token);
        }
        self.table.streams.lock().remove(&seq_id);
        debug!(seq_id, "sequence cancelled");
        Ok(reply_status("cancelled", seq_id))
    }
}

fn reply_status(status: &str, seq_id: u32) -> Bytes {
    let body = json!({ "status": status, "seqId": seq_id });
    Bytes::from(body.to_string())
}

#[async_trait]
impl InferenceHandler for TextGenHandler {
    async fn load(&self) -> Result<()> {
        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let table = Arc::clone(&self.table);
        let on_token: TokenCallback = Arc::new(move |token| table.publish(token));
        // Native engine init is slow; keep it off the event loop.
        let engine = tokio::task::spawn_blocking(move || factory.build(&config, on_token))
            .await
            .map_err(|e| InferenceError::Backend(e.into()))??;
        if self.engine.set(engine).is_err() {
            debug!("engine already attached, ignoring duplicate load");
        }
        Ok(())
    }

    async fn handle(&self, message: Message) {
        match self.dispatch(message.body()).await {
            Ok(body) => message.reply(body),
            Err(err) => message.fail(err.code(), err.to_string()),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(engine) = self.engine.get() {
                debug!("closing generation engine");
                engine.close();
            }
            // In-flight callbacks racing this clear fall into the
            // unknown-sequence drop path.
            self.table.streams.lock().clear();
        }
    }
}

fn parse_generation_request(payload: Payload<'_>) -> Result<GenerationRequest> {
    Ok(GenerationRequest {
        prompt: payload.str(api::PROMPT).map(str::to_string),
        messages: parse_messages(payload.value(api::MESSAGES)),
        max_tokens: payload.u32(api::MAX_TOKENS),
        temperature: payload.f32(api::TEMPERATURE),
        top_p: payload.f32(api::TOP_P),
        presence_penalty: payload.f32(api::PRESENCE_PENALTY),
        frequency_penalty: payload.f32(api::FREQUENCY_PENALTY),
        stop: payload.str_list(api::STOP),
        seed: payload.u32_or(api::SEED, DEFAULT_SEED),
        reasoning_tags: parse_tags(payload.map(api::REASONING_TAGS)),
        tool_tags: parse_tags(payload.map(api::TOOL_TAGS)),
    })
}

fn parse_messages(value: Option<&Value>) -> Option<Vec<ChatMessage>> {
    let items = value?.as_array()?;
    let messages: Vec<ChatMessage> = items
        .iter()
        .filter_map(|item| {
            let map = item.as_object()?;
            let role = map.get("role")?.as_str()?;
            let content = map.get("content")?.as_str()?;
            Some(ChatMessage {
                role: parse_role(role),
                content: content.to_string(),
            })
        })
        .collect();
    (!messages.is_empty()).then_some(messages)
}

fn parse_role(role: &str) -> Role {
    match role {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        _ => Role::User,
    }
}

fn parse_tags(map: Option<&serde_json::Map<String, Value>>) -> Option<TagPair> {
    let map = map?;
    Some(TagPair {
        open_tag: map.get("openTag")?.as_str()?.to_string(),
        end_tag: map.get("endTag")?.as_str()?.to_string(),
    })
}
