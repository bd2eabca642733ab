//! Per-model request handlers.
//!
//! One handler instance exists per distinct backend configuration; the
//! dispatcher binds it to a freshly allocated bus address. Each
//! handler interprets `INFER`/`STOP` for its one backend and shares
//! the error vocabulary of the control dispatcher: 405 for anything
//! outside its action set, 503 while the backend capability has not
//! been attached yet, 400 for everything that goes wrong while
//! handling.

pub mod local;
pub mod remote;
pub mod textgen;

pub use local::LocalInferenceHandler;
pub use remote::RemoteInferenceHandler;
pub use textgen::TextGenHandler;

use crate::bus::{EventBus, Message};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A live backend instance behind a bus address.
#[async_trait]
pub trait InferenceHandler: Send + Sync {
    /// One-time backend initialization. May be slow; runs at most once
    /// per repository entry.
    async fn load(&self) -> Result<()>;

    /// Handle one inbound message. Must answer request-path messages
    /// exactly once and never propagate an error to the caller's task.
    async fn handle(&self, message: Message);

    /// Tear the backend down. Idempotent; safe even if `load` never
    /// completed.
    fn close(&self);
}

impl std::fmt::Debug for dyn InferenceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InferenceHandler")
    }
}

/// Bind `handler` to `address` and process its messages in arrival
/// order. The task ends when the address is unregistered and the
/// backlog drains.
pub fn spawn_consumer(
    bus: &EventBus,
    address: &str,
    handler: Arc<dyn InferenceHandler>,
) -> JoinHandle<()> {
    let mut consumer = bus.consumer(address);
    let address = address.to_string();
    tokio::spawn(async move {
        debug!(address, "inference handler consuming");
        while let Some(message) = consumer.recv().await {
            handler.handle(message).await;
        }
        debug!(address, "inference handler stopped");
    })
}
