//! Providers resolve a `START` request into a running handler.
//!
//! A provider owns the backend-specific payload shape: it validates
//! the request, performs any blocking artifact resolution through the
//! injected fetcher, normalizes everything into the canonical
//! configuration used for fingerprinting, and asks the repository to
//! get-or-create the handler. Normalization is deterministic and
//! total: every accepted payload maps to exactly one fingerprint.

pub mod http;
pub mod local;
pub mod openai;
pub mod textgen;

pub use http::HttpProvider;
pub use local::LocalProvider;
pub use openai::OpenaiProvider;
pub use textgen::TextGenProvider;

use crate::api::{InferenceFormat, InferenceRequest};
use crate::error::{InferenceError, Result};
use crate::handler::InferenceHandler;
use crate::repository::{Fingerprint, HandlerRepository};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a successful provide: the running handler and the
/// fingerprint the repository knows it by.
pub struct Provision {
    pub fingerprint: Fingerprint,
    pub handler: Arc<dyn InferenceHandler>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn provide(
        &self,
        request: &InferenceRequest,
        repository: &HandlerRepository,
    ) -> Result<Provision>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Provider")
    }
}

/// Maps a requested inference format to its provider. Populated once
/// at startup; adding a format is registering a variant, not editing a
/// switch.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<InferenceFormat, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, format: InferenceFormat, provider: Arc<dyn Provider>) {
        self.providers.insert(format, provider);
    }

    pub fn resolve(&self, format: InferenceFormat) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(&format)
            .cloned()
            .ok_or_else(|| InferenceError::UnsupportedFormat(format.to_string()))
    }
}
