//! Handler for async remote backends (HTTP and OpenAI-compatible
//! embedding endpoints).

use crate::api::{self, InferenceAction, InferenceRequest};
use crate::backend::{RemoteConfig, RemoteModel, RemoteModelFactory};
use crate::bus::Message;
use crate::error::{InferenceError, Result};
use crate::handler::InferenceHandler;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

pub struct RemoteInferenceHandler {
    config: RemoteConfig,
    factory: Arc<dyn RemoteModelFactory>,
    model: OnceLock<Arc<dyn RemoteModel>>,
    closed: AtomicBool,
}

impl RemoteInferenceHandler {
    pub fn new(config: RemoteConfig, factory: Arc<dyn RemoteModelFactory>) -> Self {
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
                let input = request.payload().required_str(api::INPUT)?;
                let model = self.model.get().ok_or(InferenceError::NotReady)?;
                // Remote rejections surface as not-found at the boundary.
                let output = model
                    .infer(input)
                    .await
                    .map_err(|e| InferenceError::Remote(e.to_string()))?;
                Ok(Bytes::from(serde_json::to_vec(&output)?))
            }
            other => Err(InferenceError::UnsupportedAction(other.as_str().to_string())),
        }
    }
}

#[async_trait]
impl InferenceHandler for RemoteInferenceHandler {
    async fn load(&self) -> Result<()> {
        let model = self.factory.build(&self.config)?;
        if self.model.set(model).is_err() {
            debug!("remote model already attached, ignoring duplicate load");
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
                debug!("closing remote model");
                model.close();
            }
        }
    }
}
