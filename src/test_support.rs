//! Scripted sources and classifiers shared by unit tests.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::classify::{ClipClassifier, Prediction, SharedClassifier};
use crate::frame::{Frame, SharedFrame};
use crate::ingest::{FrameSource, SourceDescriptor, SourceFactory, SourceStats};

pub(crate) struct ScriptedSource {
    frame: Option<(u32, u32)>,
    reads: u64,
    errors: u64,
    last_failed: bool,
    releases: Arc<AtomicUsize>,
}

impl ScriptedSource {
    /// Yields a new frame on every read.
    pub(crate) fn healthy(width: u32, height: u32) -> Self {
        Self {
            frame: Some((width, height)),
            reads: 0,
            errors: 0,
            last_failed: false,
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every read fails.
    pub(crate) fn failing() -> Self {
        Self {
            frame: None,
            reads: 0,
            errors: 0,
            last_failed: false,
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn release_counter(&self) -> Arc<AtomicUsize> {
        self.releases.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame> {
        self.reads += 1;
        match self.frame {
            Some((width, height)) => {
                self.last_failed = false;
                Frame::filled(width, height, [(self.reads % 251) as u8, 40, 80])
            }
            None => {
                self.errors += 1;
                self.last_failed = true;
                Err(anyhow!("scripted read failure"))
            }
        }
    }

    fn is_healthy(&self) -> bool {
        !self.last_failed
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.reads - self.errors,
            read_errors: self.errors,
            source: "scripted".to_string(),
        }
    }
}

enum FactoryMode {
    Single(Mutex<Option<ScriptedSource>>),
    Healthy { width: u32, height: u32 },
    Unavailable,
}

pub(crate) struct ScriptedFactory {
    mode: FactoryMode,
}

impl ScriptedFactory {
    /// Hands out `source` once; later opens fail.
    pub(crate) fn single(source: ScriptedSource) -> Self {
        Self {
            mode: FactoryMode::Single(Mutex::new(Some(source))),
        }
    }

    pub(crate) fn healthy(width: u32, height: u32) -> Self {
        Self {
            mode: FactoryMode::Healthy { width, height },
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self {
            mode: FactoryMode::Unavailable,
        }
    }
}

impl SourceFactory for ScriptedFactory {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>> {
        match &self.mode {
            FactoryMode::Single(slot) => {
                let source = slot
                    .lock()
                    .map_err(|_| anyhow!("lock poisoned"))?
                    .take()
                    .ok_or_else(|| anyhow!("{} already opened", descriptor))?;
                Ok(Box::new(source))
            }
            FactoryMode::Healthy { width, height } => {
                Ok(Box::new(ScriptedSource::healthy(*width, *height)))
            }
            FactoryMode::Unavailable => Err(anyhow!("no device at {}", descriptor)),
        }
    }
}

pub(crate) struct ScriptedClassifier {
    script: Vec<Result<Prediction, String>>,
    window: usize,
    calls: Arc<AtomicUsize>,
}

impl ScriptedClassifier {
    pub(crate) fn constant(label: &str, confidence: f32, window: usize) -> Self {
        Self::sequence(vec![Prediction::new(label, confidence)], window)
    }

    /// Cycles through `predictions`, one per call.
    pub(crate) fn sequence(predictions: Vec<Prediction>, window: usize) -> Self {
        Self {
            script: predictions.into_iter().map(Ok).collect(),
            window,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn failing(window: usize) -> Self {
        Self {
            script: vec![Err("scripted classifier failure".to_string())],
            window,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub(crate) fn into_shared(self) -> SharedClassifier {
        Arc::new(Mutex::new(self))
    }
}

impl ClipClassifier for ScriptedClassifier {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn window_size(&self) -> usize {
        self.window
    }

    fn predict(&mut self, clip: &[SharedFrame]) -> Result<Prediction> {
        if clip.len() != self.window {
            return Err(anyhow!("expected {} frames, got {}", self.window, clip.len()));
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.script.is_empty() {
            return Err(anyhow!("empty script"));
        }
        match &self.script[call % self.script.len()] {
            Ok(prediction) => Ok(prediction.clone()),
            Err(message) => Err(anyhow!("{}", message)),
        }
    }
}
