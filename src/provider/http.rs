//! Provider for generic remote HTTP embedding endpoints.

use crate::api::{self, InferenceRequest};
use crate::backend::{HttpEmbeddingConfig, RemoteConfig, RemoteModelFactory};
use crate::error::Result;
use crate::handler::RemoteInferenceHandler;
use crate::provider::{Provider, Provision};
use crate::repository::{Fingerprint, HandlerRepository};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct HttpProvider {
    factory: Arc<dyn RemoteModelFactory>,
}

impl HttpProvider {
    pub fn new(factory: Arc<dyn RemoteModelFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn provide(
        &self,
        request: &InferenceRequest,
        repository: &HandlerRepository,
    ) -> Result<Provision> {
        let payload = request.payload();
        let config = RemoteConfig::Http(HttpEmbeddingConfig {
            uri: payload.required_str(api::URI)?.to_string(),
            method: payload
                .str(api::METHOD)
                .unwrap_or("POST")
                .to_ascii_uppercase(),
            headers: payload.string_map(api::HEADERS),
            request_body_template: payload
                .required_str(api::REQUEST_BODY_TEMPLATE)?
                .to_string(),
            input_location: payload.required_str(api::INPUT_LOCATION)?.to_string(),
            output_embedding_location: payload
                .required_str(api::OUTPUT_EMBEDDING_LOCATION)?
                .to_string(),
        });
        let fingerprint = Fingerprint::of(&config)?;
        debug!(?fingerprint, "providing HTTP embedding model");

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
