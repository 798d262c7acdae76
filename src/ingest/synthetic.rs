//! Synthetic `stub://` source.
//!
//! Produces a deterministic test pattern. The scene shifts every `SCENE_PERIOD`
//! frames, which the stub classifier reports as motion.

use anyhow::{anyhow, Result};
use std::time::Instant;

use super::{FrameSource, SourceSettings, SourceStats};
use crate::frame::Frame;

const SCENE_PERIOD: u64 = 50;

pub struct SyntheticSource {
    uri: String,
    width: u32,
    height: u32,
    frame_count: u64,
    /// Simulated "scene" state; bumps every SCENE_PERIOD frames.
    scene_state: u8,
    connected_at: Option<Instant>,
    released: bool,
}

impl SyntheticSource {
    pub fn new(uri: &str, settings: &SourceSettings) -> Result<Self> {
        if !uri.starts_with("stub://") {
            return Err(anyhow!("synthetic sources must use the stub:// scheme"));
        }
        Ok(Self {
            uri: uri.to_string(),
            width: settings.width,
            height: settings.height,
            frame_count: 0,
            scene_state: 0,
            connected_at: None,
            released: false,
        })
    }

    /// Synthetic sources are always "connected".
    pub fn connect(&mut self) -> Result<()> {
        self.connected_at = Some(Instant::now());
        log::info!("SyntheticSource: connected to {}", self.uri);
        Ok(())
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % SCENE_PERIOD == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + self.scene_state as u64 * 37) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame> {
        if self.released {
            return Err(anyhow!("synthetic source {} was released", self.uri));
        }
        if self.connected_at.is_none() {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(pixels, self.width, self.height)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            log::debug!("SyntheticSource: released {}", self.uri);
        }
    }

    fn is_healthy(&self) -> bool {
        !self.released && self.connected_at.is_some()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_errors: 0,
            source: self.uri.clone(),
        }
    }
}
