//! Control dispatcher.
//!
//! The service listens on the well-known control address. `START`
//! resolves a provider for the requested format, gets-or-creates the
//! handler through the ref-counted repository, binds it to a freshly
//! allocated per-model address and replies with that address. `STOP`
//! reverses the binding and releases the repository reference; the
//! backend is torn down only when its last address is stopped. Each
//! control message is dispatched on its own task so a slow model load
//! never blocks the control plane.

use crate::api::{self, InferenceAction, InferenceFormat, InferenceRequest, Payload};
use crate::backend::{BatchEngineFactory, LocalModelFactory, RemoteModelFactory};
use crate::bus::{EventBus, Message};
use crate::config::ServiceConfig;
use crate::error::{InferenceError, Result};
use crate::fetch::ModelFetcher;
use crate::handler::spawn_consumer;
use crate::provider::{
    HttpProvider, LocalProvider, OpenaiProvider, ProviderRegistry, TextGenProvider,
};
use crate::repository::{Fingerprint, HandlerRepository};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Injected backend capabilities. The service itself never runs a
/// kernel.
pub struct Backends {
    pub local: Arc<dyn LocalModelFactory>,
    pub remote: Arc<dyn RemoteModelFactory>,
    pub engine: Arc<dyn BatchEngineFactory>,
    pub fetcher: Arc<dyn ModelFetcher>,
}

struct Inner {
    bus: EventBus,
    registry: ProviderRegistry,
    repository: HandlerRepository,
    /// Live per-model address → repository fingerprint bindings.
    routes: Mutex<HashMap<String, Fingerprint>>,
}

pub struct InferenceService {
    inner: Arc<Inner>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl InferenceService {
    pub fn new(config: ServiceConfig, bus: EventBus, backends: Backends) -> Self {
        let mut registry = ProviderRegistry::new();
        registry.register(
            InferenceFormat::OnnxBert,
            Arc::new(LocalProvider::new(
                Arc::clone(&backends.fetcher),
                backends.local,
                config.model_dir.clone(),
            )),
        );
        registry.register(
            InferenceFormat::Http,
            Arc::new(HttpProvider::new(Arc::clone(&backends.remote))),
        );
        registry.register(
            InferenceFormat::Openai,
            Arc::new(OpenaiProvider::new(backends.remote)),
        );
        registry.register(
            InferenceFormat::LlamaCpp,
            Arc::new(TextGenProvider::new(
                backends.fetcher,
                backends.engine,
                bus.clone(),
                config.model_dir,
                config.engine,
            )),
        );

        Self {
            inner: Arc::new(Inner {
                bus,
                registry,
                repository: HandlerRepository::new(),
                routes: Mutex::new(HashMap::new()),
            }),
            control: Mutex::new(None),
        }
    }

    /// Bind the control dispatcher to its well-known address.
    pub fn start(&self) {
        let mut consumer = self.inner.bus.consumer(api::SERVICE_INFERENCE_MODELS);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            info!(address = api::SERVICE_INFERENCE_MODELS, "control dispatcher started");
            while let Some(message) = consumer.recv().await {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    inner.dispatch(message).await;
                });
            }
            info!("control dispatcher stopped");
        });
        if let Some(previous) = self.control.lock().replace(handle) {
            error!("control dispatcher was already started");
            previous.abort();
        }
    }

    /// Unbind the control address and tear down every live model.
    pub async fn stop(&self) {
        self.inner.bus.unregister(api::SERVICE_INFERENCE_MODELS);
        let handle = self.control.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                error!("control dispatcher task panicked");
            }
        }

        let routes: Vec<String> = self.inner.routes.lock().drain().map(|(a, _)| a).collect();
        for address in routes {
            self.inner.bus.unregister(&address);
        }
        self.inner.repository.drain().await;
    }

    /// Number of distinct live backends.
    pub async fn live_models(&self) -> usize {
        self.inner.repository.len().await
    }
}

impl Inner {
    async fn dispatch(&self, message: Message) {
        match self.handle(message.body()).await {
            Ok(body) => message.reply(body),
            Err(err) => {
                debug!(code = err.code(), %err, "control request failed");
                message.fail(err.code(), err.to_string());
            }
        }
    }

    async fn handle(&self, body: &Bytes) -> Result<Bytes> {
        let request = InferenceRequest::decode(body)?;
        match request.action()? {
            InferenceAction::Start => self.handle_start(&request).await,
            InferenceAction::Stop => self.handle_stop(request.payload()).await,
            other => Err(InferenceError::UnsupportedAction(other.as_str().to_string())),
        }
    }

    /// Provide the handler, then bind it to a fresh address. Nothing is
    /// registered until the provider has succeeded, so a failed start
    /// leaves no partial state behind.
    async fn handle_start(&self, request: &InferenceRequest) -> Result<Bytes> {
        let format = InferenceFormat::parse(request.payload().required_str(api::INFERENCE_FORMAT)?)?;
        let provider = self.registry.resolve(format)?;
        let provision = provider.provide(request, &self.repository).await?;

        let address = api::model_address();
        spawn_consumer(&self.bus, &address, Arc::clone(&provision.handler));
        self.routes
            .lock()
            .insert(address.clone(), provision.fingerprint);
        info!(%address, %format, fingerprint = ?provision.fingerprint, "model started");
        Ok(Bytes::from(address))
    }

    /// Unbind one per-model address and drop its repository reference.
    async fn handle_stop(&self, payload: Payload<'_>) -> Result<Bytes> {
        let address = payload.required_str(api::MODEL_ADDRESS)?;
        let fingerprint = self.routes.lock().remove(address).ok_or_else(|| {
            InferenceError::NotFound(format!("Could not find model for address: {address}"))
        })?;

        self.bus.unregister(address);
        self.repository.release(fingerprint).await;
        info!(%address, "model stopped");
        Ok(Bytes::from(address.to_string()))
    }
}
