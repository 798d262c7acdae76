use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

use crate::classify::backend::ClipClassifier;
use crate::classify::result::{Prediction, NORMAL_LABEL};
use crate::frame::SharedFrame;

const STATIC_CONFIDENCE: f32 = 0.97;
const MOTION_CONFIDENCE: f32 = 0.85;

/// Stub classifier for demos and tests.
///
/// Compares the first and last frame of the clip by pixel hash. A static clip is
/// classified as normal; a changing clip yields the configured motion label.
pub struct StubClassifier {
    window_size: usize,
    motion_label: String,
}

impl StubClassifier {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            motion_label: NORMAL_LABEL.to_string(),
        }
    }

    /// Label reported when the clip changes between its first and last frame.
    pub fn with_motion_label(mut self, label: impl Into<String>) -> Self {
        self.motion_label = label.into();
        self
    }
}

impl ClipClassifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn window_size(&self) -> usize {
        self.window_size
    }

    fn predict(&mut self, clip: &[SharedFrame]) -> Result<Prediction> {
        let (first, last) = match (clip.first(), clip.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(anyhow!("stub classifier received an empty clip")),
        };

        let first_hash: [u8; 32] = Sha256::digest(first.pixels()).into();
        let last_hash: [u8; 32] = Sha256::digest(last.pixels()).into();

        if first_hash == last_hash {
            Ok(Prediction::new(NORMAL_LABEL, STATIC_CONFIDENCE))
        } else {
            Ok(Prediction::new(self.motion_label.clone(), MOTION_CONFIDENCE))
        }
    }
}
