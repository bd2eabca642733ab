//! Model-serving control plane.
//!
//! `modelmux` multiplexes many concurrent inference backends behind
//! dynamically-assigned bus addresses. A caller sends `START` to the
//! well-known control address and receives a fresh per-model address;
//! `INFER`/`STOP` requests then go directly to that address. Identical
//! model configurations are deduplicated through a ref-counted handler
//! repository, and the batched text-generation backend streams tokens
//! to per-request stream addresses with cancellation support.
//!
//! The numeric kernels themselves (ONNX execution, remote embedding
//! endpoints, the native batched generation engine) are injected
//! capabilities behind the traits in [`backend`]; artifact resolution
//! is injected behind [`fetch::ModelFetcher`].

pub mod api;
pub mod backend;
pub mod bus;
pub mod config;
pub mod error;
pub mod fetch;
pub mod handler;
pub mod provider;
pub mod repository;
pub mod service;

pub use bus::EventBus;
pub use config::ServiceConfig;
pub use error::{InferenceError, Result};
pub use service::{Backends, InferenceService};
