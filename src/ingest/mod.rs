//! Frame ingestion sources.
//!
//! This module provides different sources for live frames:
//! - Synthetic `stub://` sources (demos and tests)
//! - HTTP MJPEG/JPEG cameras (feature: http)
//! - RTSP streams via GStreamer (feature: rtsp-gstreamer)
//! - Local camera indices via V4L2 (feature: ingest-v4l2)
//!
//! All sources produce RGB24 `Frame`s. A source is opened once by the capture worker
//! through a `SourceFactory`; failure to open is fatal for that pipeline. Individual
//! read failures are reported as errors and counted by the caller.

use anyhow::{anyhow, Result};
use std::fmt;

use crate::frame::Frame;

#[cfg(feature = "http")]
pub mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

#[cfg(feature = "http")]
pub use mjpeg::MjpegSource;
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Where a camera's frames come from: a local device index or a URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    Index(u32),
    Uri(String),
}

impl SourceDescriptor {
    /// Integer strings are device indices; everything else is a URI.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("camera source must not be empty"));
        }
        match trimmed.parse::<u32>() {
            Ok(index) => Ok(Self::Index(index)),
            Err(_) => Ok(Self::Uri(trimmed.to_string())),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "device:{}", index),
            Self::Uri(uri) => f.write_str(uri),
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub read_errors: u64,
    pub source: String,
}

/// An open video source.
///
/// `read_frame` may block on I/O; it is only ever called from the capture worker.
pub trait FrameSource: Send {
    /// Read the next frame.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release the underlying device or connection. Must tolerate repeated calls.
    fn release(&mut self);

    /// Polled by the capture worker after every read; transitions are logged.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Running totals, logged when the source is released.
    fn stats(&self) -> SourceStats;
}

/// Opens sources for the capture worker.
pub trait SourceFactory: Send + Sync {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>>;
}

/// Capture parameters shared by every source the default factory opens.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Target frame rate (frames per second) requested from devices.
    pub target_fps: u32,
    /// Frame width for synthetic sources and device format negotiation.
    pub width: u32,
    /// Frame height for synthetic sources and device format negotiation.
    pub height: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// Factory that picks a backend from the descriptor's shape and URI scheme.
#[derive(Clone, Debug, Default)]
pub struct DefaultSourceFactory {
    settings: SourceSettings,
}

impl DefaultSourceFactory {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }
}

impl SourceFactory for DefaultSourceFactory {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>> {
        match descriptor {
            SourceDescriptor::Uri(uri) if uri.starts_with("stub://") => {
                let mut source = SyntheticSource::new(uri, &self.settings)?;
                source.connect()?;
                Ok(Box::new(source))
            }
            SourceDescriptor::Uri(uri) if is_http(uri) => open_http(uri, &self.settings),
            SourceDescriptor::Uri(uri) if uri.starts_with("rtsp://") => {
                open_rtsp(uri, &self.settings)
            }
            SourceDescriptor::Uri(uri) => Err(anyhow!("unsupported camera source '{}'", uri)),
            SourceDescriptor::Index(index) => open_device(*index, &self.settings),
        }
    }
}

fn is_http(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

#[cfg(feature = "http")]
fn open_http(uri: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let mut source = MjpegSource::new(uri, settings.target_fps)?;
    source.connect()?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "http"))]
fn open_http(_uri: &str, _settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!("HTTP camera sources require the http feature"))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(uri: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let mut source = RtspSource::new(uri, settings.target_fps)?;
    source.connect()?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(_uri: &str, _settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(index: u32, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let mut source = V4l2Source::new(index, settings)?;
    source.connect()?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(index: u32, _settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "camera index {} requires the ingest-v4l2 feature",
        index
    ))
}

/// Minimum spacing between delivered frames for a target rate.
pub(crate) fn frame_interval(target_fps: u32) -> std::time::Duration {
    if target_fps == 0 {
        std::time::Duration::from_millis(0)
    } else {
        std::time::Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}
