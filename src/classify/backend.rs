use anyhow::Result;

use crate::classify::result::Prediction;
use crate::frame::SharedFrame;

/// Clip classifier trait.
///
/// A classifier consumes an ordered window of frames (oldest first) and returns the
/// top label with its confidence. Implementations may be slow; callers run them on a
/// dedicated worker and treat any error as "no update this tick".
pub trait ClipClassifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Number of frames required per call.
    fn window_size(&self) -> usize;

    /// Classify a clip. `clip.len()` equals `window_size()`.
    fn predict(&mut self, clip: &[SharedFrame]) -> Result<Prediction>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
