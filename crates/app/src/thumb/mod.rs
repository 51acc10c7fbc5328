//! Thumbs-up hold detection pipeline with a live MJPEG preview.
//!
//! - `config`: CLI/env parsing and validation.
//! - `telemetry`: tracing subscriber and Prometheus recorder.
//! - `estimator`: hand-landmark estimation boundary.
//! - `annotation` / `encoding`: preview overlay and JPEG output.
//! - `frame_cache`: latest-frame broadcast to stream viewers.
//! - `server`: Actix Web multipart stream.
//! - `publisher`: MQTT state publishing.
//! - `pipeline`: the per-frame orchestrator and its lifecycle.

mod annotation;
mod config;
mod encoding;
mod estimator;
mod frame_cache;
mod pipeline;
mod publisher;
mod server;
mod telemetry;

pub use config::{ThumbCliArgs, ThumbConfig};
pub use pipeline::run;
pub(crate) use telemetry::init_tracing;
