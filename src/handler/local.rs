//! Handler for blocking local backends (ONNX embedding/classifier).

use crate::api::{self, InferenceAction, InferenceRequest};
use crate::backend::{LocalConfig, LocalModel, LocalModelFactory};
use crate::bus::Message;
use crate::error::{InferenceError, Result};
use crate::handler::InferenceHandler;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

pub struct LocalInferenceHandler {
    config: LocalConfig,
    factory: Arc<dyn LocalModelFactory>,
    model: OnceLock<Arc<dyn LocalModel>>,
    closed: AtomicBool,
}

impl LocalInferenceHandler {
    pub fn new(config: LocalConfig, factory: Arc<dyn LocalModelFactory>) -> Self {
        Self {
            config,
            factory,
            model: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    async fn dispatch(&self, body: &Bytes) -> Result<Bytes> {
        let request = InferenceRequest::decode(body)?;
        match request.action()? {
            InferenceAction::Infer => {
                let input = request.payload().required_str(api::INPUT)?.to_string();
                let model = self.model.get().ok_or(InferenceError::NotReady)?;
                let model = Arc::clone(model);
                // Local inference is CPU-bound; keep it off the event loop.
                let output = tokio::task::spawn_blocking(move || model.infer(&input))
                    .await
                    .map_err(|e| InferenceError::Backend(e.into()))??;
                Ok(Bytes::from(serde_json::to_vec(&output)?))
            }
            other => Err(InferenceError::UnsupportedAction(other.as_str().to_string())),
        }
    }
}

#[async_trait]
impl InferenceHandler for LocalInferenceHandler {
    async fn load(&self) -> Result<()> {
        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let model = tokio::task::spawn_blocking(move || factory.build(&config))
            .await
            .map_err(|e| InferenceError::Backend(e.into()))??;
        if self.model.set(model).is_err() {
            debug!("local model already attached, ignoring duplicate load");
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
            if let Some(model) = self.model.get() {
                debug!("closing local model");
                model.close();
            }
        }
    }
}
