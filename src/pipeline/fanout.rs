//! Per-viewer MJPEG stream.
//!
//! Every viewer gets its own `FrameStream`. Streams only read pipeline state; each one
//! draws its overlay on a private copy of the latest frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::PipelineCore;
use crate::codec::encode_jpeg;
use crate::overlay::{detection_text, draw_label, PREDICTING_TEXT, TEXT_RED};

pub const MULTIPART_BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// One multipart unit wrapping a JPEG.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", MULTIPART_BOUNDARY);
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Endless sequence of multipart JPEG units. Ends once the pipeline stops.
pub struct FrameStream {
    core: Arc<PipelineCore>,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl FrameStream {
    pub(crate) fn new(core: Arc<PipelineCore>) -> Self {
        let fps = core.config.stream_fps.max(1);
        Self {
            interval: Duration::from_millis((1000 / fps as u64).max(1)),
            core,
            last_emit: None,
        }
    }

    pub fn camera_id(&self) -> crate::CameraId {
        self.core.camera_id
    }

    /// Next overlaid JPEG without multipart framing.
    pub fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        if let Some(last) = self.last_emit {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                self.core.sleep_while_running(self.interval - elapsed);
            }
        }

        loop {
            if !self.core.is_running() {
                return None;
            }
            let (latest, display) = {
                let state = self.core.lock_state();
                (state.latest.clone(), state.display.clone())
            };
            let Some(latest) = latest else {
                self.core.sleep_while_running(self.core.config.stream_poll);
                continue;
            };

            let mut frame = latest.as_ref().clone();
            let text = match display {
                Some(detection) => detection_text(&detection.label, detection.confidence),
                None => PREDICTING_TEXT.to_string(),
            };
            draw_label(&mut frame, &text, TEXT_RED);

            match encode_jpeg(&frame, self.core.config.jpeg_quality) {
                Ok(jpeg) => {
                    self.last_emit = Some(Instant::now());
                    return Some(jpeg);
                }
                Err(err) => {
                    log::warn!("camera={} viewer frame encode failed: {:#}", self.core.camera_id, err);
                    self.core.sleep_while_running(self.core.config.stream_poll);
                }
            }
        }
    }
}

impl Iterator for FrameStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.next_jpeg().map(|jpeg| multipart_part(&jpeg))
    }
}
