//! Provider for OpenAI-compatible remote embedding endpoints.

use crate::api::{self, InferenceRequest};
use crate::backend::{OpenaiEmbeddingConfig, RemoteConfig, RemoteModelFactory};
use crate::error::Result;
use crate::handler::RemoteInferenceHandler;
use crate::provider::{Provider, Provision};
use crate::repository::{Fingerprint, HandlerRepository};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct OpenaiProvider {
    factory: Arc<dyn RemoteModelFactory>,
}

impl OpenaiProvider {
    pub fn new(factory: Arc<dyn RemoteModelFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl Provider for OpenaiProvider {
    async fn provide(
        &self,
        request: &InferenceRequest,
        repository: &HandlerRepository,
    ) -> Result<Provision> {
        let payload = request.payload();
        let config = RemoteConfig::Openai(OpenaiEmbeddingConfig {
            uri: payload.required_str(api::URI)?.to_string(),
            api_key: payload.required_str(api::API_KEY)?.to_string(),
            model: payload.required_str(api::MODEL)?.to_string(),
            organization_id: payload.str(api::ORGANIZATION_ID).map(str::to_string),
            project_id: payload.str(api::PROJECT_ID).map(str::to_string),
            dimensions: payload.u32(api::DIMENSIONS),
            encoding_format: payload.str(api::ENCODING_FORMAT).map(str::to_string),
        });
        let fingerprint = Fingerprint::of(&config)?;
        debug!(?fingerprint, "providing OpenAI embedding model");

        let factory = Arc::clone(&self.factory);
        let handler = repository
            .get_or_create(fingerprint, move || {
                Ok(Arc::new(RemoteInferenceHandler::new(config, factory)))
            })
            .await?;
        Ok(Provision {
            fingerprint,
            handler,
        })
    }
}
