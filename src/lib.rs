//! Crime Watch
//!
//! Live camera monitoring with clip-level crime classification.
//!
//! # Architecture
//!
//! Every active camera gets one pipeline with two dedicated workers:
//!
//! 1. **Capture**: opens the source once, keeps the latest frame and a bounded clip
//!    buffer, paces reads and gives up after too many consecutive failures.
//! 2. **Inference**: classifies the newest clip on a fixed period, publishes a display
//!    detection and feeds the raw verdict to the alert debouncer.
//!
//! Viewers pull an MJPEG stream that overlays the current detection on the latest
//! frame. Fired alerts are stored with a snapshot and forwarded to notifiers.
//!
//! # Module Structure
//!
//! - `frame`, `codec`, `overlay`: the RGB24 frame type, JPEG and text overlays
//! - `ingest`: frame sources (synthetic, MJPEG over HTTP, RTSP, V4L2)
//! - `classify`: clip classifier trait and backends
//! - `pipeline`: capture/inference workers, debouncer, viewer fan-out
//! - `registry`: one pipeline per camera for the whole process
//! - `alert`, `storage`, `snapshot`, `notify`: what happens when an alert fires
//! - `config`, `service`, `api`: configuration, wiring and the HTTP surface

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod alert;
pub mod api;
pub mod classify;
pub mod codec;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod overlay;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use alert::{AlertContext, AlertOutcome};
pub use classify::{ClipClassifier, Prediction, SharedClassifier, NORMAL_LABEL};
pub use config::{CameraConfig, WatchConfig};
pub use frame::{ClipBuffer, Frame, SharedFrame};
pub use ingest::{FrameSource, SourceDescriptor, SourceFactory};
pub use pipeline::{Pipeline, PipelineConfig, PipelineStatus};
pub use registry::StreamRegistry;
pub use service::WatchService;
pub use storage::{AlertRecord, AlertStore, NewAlert};

/// Numeric camera identity, as used in the catalog and in every endpoint.
pub type CameraId = u32;

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
