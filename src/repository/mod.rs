//! Ref-counted repository of live backend handlers, keyed by
//! configuration fingerprint.
//!
//! The map and the per-entry counter are guarded by a single async
//! mutex, so "check fingerprint / construct + load / insert" is one
//! atomic step: concurrent requests for the same fingerprint can never
//! both run `load()`. The lock is an async mutex precisely because the
//! one-time load is slow; holders of other fingerprints queue behind a
//! load only for the duration of that first construction.

mod fingerprint;

pub use fingerprint::Fingerprint;

use crate::error::{InferenceError, Result};
use crate::handler::InferenceHandler;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Entry {
    handler: Arc<dyn InferenceHandler>,
    refs: usize,
}

/// Owns every live handler. Entries are created with one reference,
/// retained on deduplicated starts and torn down exactly once when the
/// last reference is released.
#[derive(Default)]
pub struct HandlerRepository {
    entries: Mutex<HashMap<Fingerprint, Entry>>,
}

impl HandlerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic compute-if-absent-or-retain. On a miss the handler is
    /// constructed and its one-time `load()` runs before the entry
    /// becomes visible; a load failure rolls back to no entry and
    /// propagates.
    pub async fn get_or_create<F>(
        &self,
        fingerprint: Fingerprint,
        factory: F,
    ) -> Result<Arc<dyn InferenceHandler>>
    where
        F: FnOnce() -> Result<Arc<dyn InferenceHandler>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&fingerprint) {
            entry.refs += 1;
            debug!(?fingerprint, refs = entry.refs, "model already loaded, retaining");
            return Ok(Arc::clone(&entry.handler));
        }

        debug!(?fingerprint, "model not loaded yet, constructing");
        let handler = factory()?;
        handler.load().await?;
        entries.insert(
            fingerprint,
            Entry {
                handler: Arc::clone(&handler),
                refs: 1,
            },
        );
        debug!(?fingerprint, "model loaded");
        Ok(handler)
    }

    /// Drop one reference. The handler's `close()` runs exactly on the
    /// release that brings the count to zero. Unknown fingerprints are
    /// a logged no-op: a caller racing a completed stop is expected.
    pub async fn release(&self, fingerprint: Fingerprint) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&fingerprint) {
            None => warn!(?fingerprint, "release for unknown fingerprint, ignoring"),
            Some(entry) if entry.refs > 1 => {
                entry.refs -= 1;
                debug!(?fingerprint, refs = entry.refs, "model still in use");
            }
            Some(_) => {
                if let Some(entry) = entries.remove(&fingerprint) {
                    debug!(?fingerprint, "model not in use anymore, tearing down");
                    entry.handler.close();
                }
            }
        }
    }

    /// Number of distinct live backends.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Current reference count for a fingerprint (0 when absent).
    pub async fn usage(&self, fingerprint: Fingerprint) -> usize {
        self.entries
            .lock()
            .await
            .get(&fingerprint)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    /// Tear down every entry regardless of reference count. Service
    /// shutdown only.
    pub async fn drain(&self) {
        let mut entries = self.entries.lock().await;
        for (fingerprint, entry) in entries.drain() {
            debug!(?fingerprint, "draining model on shutdown");
            entry.handler.close();
        }
    }
}
