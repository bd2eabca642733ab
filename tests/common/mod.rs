//! Fake backend capabilities and a wired-up service harness shared by
//! the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use modelmux::api;
use modelmux::backend::{
    BatchEngine, BatchEngineFactory, EngineConfig, GenerationRequest, InferenceToken, LocalConfig,
    LocalModel, LocalModelFactory, RemoteConfig, RemoteModel, RemoteModelFactory, TokenCallback,
};
use modelmux::bus::{BusFailure, EventBus, Message};
use modelmux::config::ServiceConfig;
use modelmux::error::{InferenceError, Result};
use modelmux::fetch::FsFetcher;
use modelmux::handler::InferenceHandler;
use modelmux::service::{Backends, InferenceService};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Route library logs through the test writer; enable with
/// `RUST_LOG=modelmux=debug cargo test`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Handler that only counts lifecycle calls; used for repository tests.
#[derive(Default)]
pub struct CountingHandler {
    pub loads: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub load_delay: Option<Duration>,
    pub fail_load: bool,
}

#[async_trait::async_trait]
impl InferenceHandler for CountingHandler {
    async fn load(&self) -> Result<()> {
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(InferenceError::BadRequest("load failed".to_string()));
        }
        Ok(())
    }

    async fn handle(&self, message: Message) {
        message.reply(Bytes::from_static(b"ok"));
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeLocalModel {
    pub infers: AtomicUsize,
    pub closes: AtomicUsize,
}

impl LocalModel for FakeLocalModel {
    fn infer(&self, input: &str) -> anyhow::Result<Value> {
        self.infers.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "embedding": [0.1, 0.2, 0.3], "input": input }))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeLocalModelFactory {
    pub builds: AtomicUsize,
    pub fail_build: AtomicBool,
    pub last: Mutex<Option<Arc<FakeLocalModel>>>,
}

impl LocalModelFactory for FakeLocalModelFactory {
    fn build(&self, _config: &LocalConfig) -> anyhow::Result<Arc<dyn LocalModel>> {
        if self.fail_build.load(Ordering::SeqCst) {
            anyhow::bail!("native session init failed");
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        let model = Arc::new(FakeLocalModel::default());
        *self.last.lock() = Some(Arc::clone(&model));
        Ok(model)
    }
}

#[derive(Default)]
pub struct FakeRemoteModel {
    pub infers: AtomicUsize,
}

#[async_trait::async_trait]
impl RemoteModel for FakeRemoteModel {
    async fn infer(&self, input: &str) -> anyhow::Result<Value> {
        self.infers.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "embedding": [1.0], "input": input }))
    }
}

#[derive(Default)]
pub struct FakeRemoteModelFactory {
    pub builds: AtomicUsize,
}

impl RemoteModelFactory for FakeRemoteModelFactory {
    fn build(&self, _config: &RemoteConfig) -> anyhow::Result<Arc<dyn RemoteModel>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeRemoteModel::default()))
    }
}

/// Scripted generation engine: sequences are recorded, tokens flow
/// only when a test calls [`FakeEngine::emit`].
pub struct FakeEngine {
    callback: TokenCallback,
    pub started: Mutex<Vec<(u32, GenerationRequest)>>,
    pub cancelled: Mutex<Vec<u32>>,
    active: Mutex<HashSet<u32>>,
    pub closed: AtomicBool,
}

impl FakeEngine {
    /// Push one token through the captured engine callback, as the
    /// native callback thread would.
    pub fn emit(&self, token: InferenceToken) {
        (self.callback)(token);
    }
}

impl BatchEngine for FakeEngine {
    fn add_sequence(&self, seq_id: u32, request: GenerationRequest) -> anyhow::Result<()> {
        self.active.lock().insert(seq_id);
        self.started.lock().push((seq_id, request));
        Ok(())
    }

    fn cancel_sequence(&self, seq_id: u32) -> Option<InferenceToken> {
        self.cancelled.lock().push(seq_id);
        if self.active.lock().remove(&seq_id) {
            let mut terminal = token(seq_id, 0, "", true);
            terminal.finish_reason = Some("cancelled".to_string());
            Some(terminal)
        } else {
            None
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeEngineFactory {
    pub builds: AtomicUsize,
    pub last: Mutex<Option<Arc<FakeEngine>>>,
}

impl FakeEngineFactory {
    pub fn engine(&self) -> Arc<FakeEngine> {
        self.last.lock().clone().expect("no engine built yet")
    }
}

impl BatchEngineFactory for FakeEngineFactory {
    fn build(
        &self,
        _config: &EngineConfig,
        on_token: TokenCallback,
    ) -> anyhow::Result<Arc<dyn BatchEngine>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let engine = Arc::new(FakeEngine {
            callback: on_token,
            started: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            active: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        *self.last.lock() = Some(Arc::clone(&engine));
        Ok(engine)
    }
}

pub fn token(seq_id: u32, index: u32, text: &str, is_final: bool) -> InferenceToken {
    InferenceToken {
        seq_id,
        token: text.to_string(),
        index,
        is_final,
        finish_reason: is_final.then(|| "stop".to_string()),
        prompt_tokens: 3,
        completion_tokens: index + 1,
        performance: None,
    }
}

/// A started service over fake backends, with model artifacts resolved
/// against a temp directory.
pub struct Harness {
    pub bus: EventBus,
    pub service: InferenceService,
    pub local: Arc<FakeLocalModelFactory>,
    pub remote: Arc<FakeRemoteModelFactory>,
    pub engine: Arc<FakeEngineFactory>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn start() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let bus = EventBus::new();
        let local = Arc::new(FakeLocalModelFactory::default());
        let remote = Arc::new(FakeRemoteModelFactory::default());
        let engine = Arc::new(FakeEngineFactory::default());

        let config = ServiceConfig {
            model_dir: dir.path().to_path_buf(),
            ..ServiceConfig::default()
        };
        let backends = Backends {
            local: Arc::clone(&local) as _,
            remote: Arc::clone(&remote) as _,
            engine: Arc::clone(&engine) as _,
            fetcher: Arc::new(FsFetcher::new(dir.path())),
        };
        let service = InferenceService::new(config, bus.clone(), backends);
        service.start();

        Self {
            bus,
            service,
            local,
            remote,
            engine,
            dir,
        }
    }

    /// Create an artifact file under the harness model directory.
    pub fn artifact(&self, name: &str) {
        std::fs::write(self.dir.path().join(name), b"bytes").expect("write artifact");
    }

    pub async fn control(&self, action: &str, payload: Value) -> Result<Bytes, BusFailure> {
        self.send(api::SERVICE_INFERENCE_MODELS, action, payload).await
    }

    pub async fn send(
        &self,
        address: &str,
        action: &str,
        payload: Value,
    ) -> Result<Bytes, BusFailure> {
        let body = json!({ "action": action, "payload": payload }).to_string();
        self.bus.request(address, Bytes::from(body)).await
    }
}

pub fn as_string(body: Bytes) -> String {
    String::from_utf8(body.to_vec()).expect("utf8 reply")
}

pub fn as_json(body: Bytes) -> Value {
    serde_json::from_slice(&body).expect("json reply")
}
