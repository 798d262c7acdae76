//! Frame value type and the bounded clip buffer.
//!
//! - `Frame`: packed RGB24 pixels with explicit dimensions. Immutable once captured.
//! - `SharedFrame`: reference-counted frame shared by the latest-frame slot, the clip
//!   buffer and viewers. Anything that draws on a frame works on an owned copy.
//! - `ClipBuffer`: bounded FIFO of recent frames feeding the clip classifier.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Bytes per pixel for the fixed RGB24 layout.
pub const CHANNELS: usize = 3;

/// A captured frame: packed RGB24, row-major, no padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    captured_at: Instant,
}

pub type SharedFrame = Arc<Frame>;

impl Frame {
    /// Build a frame from packed RGB24 pixels. Rejects buffers whose length does not
    /// match `width * height * 3`.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Solid-color frame. Used by synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let len = rgb_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len / CHANNELS {
            data.extend_from_slice(&rgb);
        }
        Self::from_rgb(data, width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn into_shared(self) -> SharedFrame {
        Arc::new(self)
    }

    /// Pixel at (x, y), or `None` when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        let offset = self.offset(x, y)?;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }

    /// Overwrite one pixel; out-of-bounds writes are clipped.
    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if let Some(offset) = self.offset(x, y) {
            self.data[offset..offset + CHANNELS].copy_from_slice(&rgb);
        }
    }

    /// Fill an axis-aligned rectangle, clipped to the frame.
    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, rgb: [u8; 3]) {
        let x_end = x.saturating_add(w).min(self.width);
        let y_end = y.saturating_add(h).min(self.height);
        for py in y..y_end {
            for px in x..x_end {
                self.put_pixel(px, py, rgb);
            }
        }
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * CHANNELS)
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame dimensions must be non-zero"));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// ClipBuffer: bounded FIFO feeding the classifier
// ----------------------------------------------------------------------------

/// Bounded, insertion-ordered buffer of recent frames.
///
/// Capacity is twice the classifier window so inference always has a full window
/// plus some history. Oldest frames are evicted first.
#[derive(Debug)]
pub struct ClipBuffer {
    frames: VecDeque<SharedFrame>,
    capacity: usize,
}

impl ClipBuffer {
    /// Buffer sized for a classifier that needs `window_size` frames per call.
    pub fn for_window(window_size: usize) -> Self {
        Self::with_capacity(window_size.saturating_mul(2).max(1))
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame, evicting from the front while over capacity.
    pub fn push(&mut self, frame: SharedFrame) {
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// The most recent `window_size` frames in capture order, or `None` when fewer
    /// are buffered.
    pub fn latest_window(&self, window_size: usize) -> Option<Vec<SharedFrame>> {
        if window_size == 0 || self.frames.len() < window_size {
            return None;
        }
        let skip = self.frames.len() - window_size;
        Some(self.frames.iter().skip(skip).cloned().collect())
    }

    pub fn latest(&self) -> Option<&SharedFrame> {
        self.frames.back()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
