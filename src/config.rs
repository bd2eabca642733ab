//! Service configuration.
//!
//! Settings layer in the usual order: built-in defaults, then an
//! optional TOML file, then `MODELMUX_*` environment variables
//! (`MODELMUX_ENGINE__N_CTX=8192` overrides `engine.n_ctx`).

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Fallback engine parameters used when a `START` payload leaves them
/// out.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineDefaults {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_seq_max: u32,
    pub n_gpu_layers: u32,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_ubatch: 512,
            n_seq_max: 8,
            n_gpu_layers: 99,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory model artifacts are resolved under.
    pub model_dir: PathBuf,
    pub engine: EngineDefaults,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            engine: EngineDefaults::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration, optionally from a TOML file.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .set_default("model_dir", "models")?
            .set_default("engine.n_ctx", 4096)?
            .set_default("engine.n_batch", 512)?
            .set_default("engine.n_ubatch", 512)?
            .set_default("engine.n_seq_max", 8)?
            .set_default("engine.n_gpu_layers", 99)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("MODELMUX").separator("__"));

        Ok(builder.build()?.try_deserialize()?)
    }
}
