//! Per-camera pipeline: capture worker, inference worker and viewer fan-out.
//!
//! Each pipeline owns one mutex guarding the latest frame, the clip buffer, the
//! display detection and the debounce state. The capture worker is the only writer of
//! frames, the inference worker the only writer of detections; viewers and status
//! queries copy what they need and drop the lock immediately.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::alert::AlertContext;
use crate::classify::{Prediction, SharedClassifier, NORMAL_LABEL};
use crate::codec::DEFAULT_JPEG_QUALITY;
use crate::frame::{ClipBuffer, Frame, SharedFrame};
use crate::ingest::{FrameSource, SourceDescriptor, SourceFactory, SourceStats};
use crate::CameraId;

mod capture;
pub mod debounce;
pub mod fanout;
mod inference;

pub use debounce::{AlertDebouncer, DebounceDecision, DebounceSettings, DebounceState};
pub use fanout::{multipart_part, FrameStream, MULTIPART_BOUNDARY, MULTIPART_CONTENT_TYPE};
pub use inference::{display_detection, DisplayPolicy, TickOutcome};

/// Label reported by status queries before the first inference completes.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Longest single sleep inside a worker loop; bounds how long a stop takes to be seen.
const SLEEP_SLICE: Duration = Duration::from_millis(50);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Timing and threshold parameters for one pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub target_fps: u32,
    /// Consecutive failed reads after which the source counts as lost.
    pub read_failure_ceiling: u32,
    pub read_backoff: Duration,
    pub inference_interval: Duration,
    pub alert_threshold: f32,
    /// Normal verdicts below this confidence display as normal/0.0.
    pub display_floor: f32,
    pub normal_label: String,
    pub required_stability: u32,
    pub cooldown: Duration,
    pub stream_fps: u32,
    pub stream_poll: Duration,
    pub stop_timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            read_failure_ceiling: 50,
            read_backoff: Duration::from_millis(100),
            inference_interval: Duration::from_millis(1500),
            alert_threshold: 0.80,
            display_floor: 0.20,
            normal_label: NORMAL_LABEL.to_string(),
            required_stability: 1,
            cooldown: Duration::from_secs(30),
            stream_fps: 15,
            stream_poll: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(2),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl PipelineConfig {
    pub fn debounce_settings(&self) -> DebounceSettings {
        DebounceSettings {
            alert_threshold: self.alert_threshold,
            normal_label: self.normal_label.clone(),
            required_stability: self.required_stability.max(1),
            cooldown: self.cooldown,
        }
    }

    pub fn display_policy(&self) -> DisplayPolicy {
        DisplayPolicy {
            normal_label: self.normal_label.clone(),
            display_floor: self.display_floor,
            alert_threshold: self.alert_threshold,
        }
    }
}

/// Status snapshot for `GET /stats/<camera_id>`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub camera_id: CameraId,
    pub label: String,
    pub confidence: f32,
    pub running: bool,
}

/// Counters and flags readable without the state lock.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_captured: AtomicU64,
    pub read_failures: AtomicU64,
    pub inferences: AtomicU64,
    pub classifier_errors: AtomicU64,
    pub alerts_fired: AtomicU64,
    /// Set while the open source reports itself unhealthy.
    pub source_degraded: AtomicBool,
}

/// Everything guarded by the pipeline's single lock.
pub(crate) struct SharedState {
    pub(crate) latest: Option<SharedFrame>,
    pub(crate) clip: ClipBuffer,
    pub(crate) display: Option<Prediction>,
    pub(crate) debouncer: AlertDebouncer,
}

/// Owns the open source. The source is taken out exactly once, so however the
/// pipeline ends the device is released a single time.
pub(crate) struct CaptureHandle {
    source: Mutex<Option<Box<dyn FrameSource>>>,
    released: AtomicBool,
}

impl CaptureHandle {
    fn new() -> Self {
        Self {
            source: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// Hand the freshly opened source to the handle. A handle that was already
    /// released refuses it and releases the source on the spot.
    pub(crate) fn install(&self, mut source: Box<dyn FrameSource>) -> bool {
        let mut slot = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        if self.released.load(Ordering::SeqCst) {
            source.release();
            return false;
        }
        *slot = Some(source);
        true
    }

    /// Read one frame, or `None` once the source has been released.
    pub(crate) fn read_frame(&self) -> Option<Result<Frame>> {
        let mut slot = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_mut().map(|source| source.read_frame())
    }

    /// Whether the open source considers itself healthy. `false` when nothing is open.
    pub(crate) fn is_healthy(&self) -> bool {
        let slot = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map_or(false, |source| source.is_healthy())
    }

    /// Release the source if this is the first release, returning its final stats.
    /// Blocks while a read is in flight.
    pub(crate) fn release(&self) -> Option<SourceStats> {
        let mut slot = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        Self::release_slot(&self.released, &mut slot)
    }

    /// Like `release`, but gives up instead of waiting for an in-flight read.
    pub(crate) fn try_release(&self) -> Option<SourceStats> {
        match self.source.try_lock() {
            Ok(mut slot) => Self::release_slot(&self.released, &mut slot),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                let mut slot = poisoned.into_inner();
                Self::release_slot(&self.released, &mut slot)
            }
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn release_slot(
        released: &AtomicBool,
        slot: &mut Option<Box<dyn FrameSource>>,
    ) -> Option<SourceStats> {
        released.store(true, Ordering::SeqCst);
        let mut source = slot.take()?;
        let stats = source.stats();
        source.release();
        Some(stats)
    }
}

/// State shared between the pipeline handle and its workers.
pub(crate) struct PipelineCore {
    pub(crate) camera_id: CameraId,
    pub(crate) config: PipelineConfig,
    pub(crate) window_size: usize,
    pub(crate) running: AtomicBool,
    pub(crate) state: Mutex<SharedState>,
    pub(crate) capture: CaptureHandle,
    pub(crate) counters: PipelineCounters,
}

impl PipelineCore {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Workers never give up on a poisoned lock; a panicking viewer must not wedge
    /// capture.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `duration`, waking early once the pipeline stops.
    pub(crate) fn sleep_while_running(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if !self.is_running() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// One camera's running pipeline.
pub struct Pipeline {
    core: Arc<PipelineCore>,
    source: SourceDescriptor,
    workers: Mutex<Vec<Worker>>,
}

impl Pipeline {
    /// Build the pipeline and start its capture and inference workers. The source is
    /// opened by the capture worker; an open failure shows up as `is_running() ==
    /// false`, not as an error here.
    pub fn start(
        camera_id: CameraId,
        source: SourceDescriptor,
        factory: Arc<dyn SourceFactory>,
        classifier: SharedClassifier,
        alerts: AlertContext,
        config: PipelineConfig,
    ) -> Result<Arc<Self>> {
        let window_size = classifier
            .lock()
            .map_err(|_| anyhow!("classifier lock poisoned"))?
            .window_size();
        if window_size == 0 {
            return Err(anyhow!("classifier window size must be non-zero"));
        }

        let state = SharedState {
            latest: None,
            clip: ClipBuffer::for_window(window_size),
            display: None,
            debouncer: AlertDebouncer::new(config.debounce_settings()),
        };
        let core = Arc::new(PipelineCore {
            camera_id,
            config,
            window_size,
            running: AtomicBool::new(true),
            state: Mutex::new(state),
            capture: CaptureHandle::new(),
            counters: PipelineCounters::default(),
        });

        let pipeline = Arc::new(Self {
            core: core.clone(),
            source: source.clone(),
            workers: Mutex::new(Vec::with_capacity(2)),
        });

        let capture_core = core.clone();
        let capture = std::thread::Builder::new()
            .name(format!("capture-{}", camera_id))
            .spawn(move || capture::run(capture_core, factory, source))
            .context("spawn capture worker")?;
        pipeline.push_worker("capture", capture);

        let inference_core = core.clone();
        let inference = std::thread::Builder::new()
            .name(format!("inference-{}", camera_id))
            .spawn(move || inference::run(inference_core, classifier, alerts));
        let inference = match inference {
            Ok(handle) => handle,
            Err(err) => {
                pipeline.stop(core.config.stop_timeout);
                return Err(err).context("spawn inference worker");
            }
        };
        pipeline.push_worker("inference", inference);

        log::info!(
            "camera={} pipeline started (source {}, window {})",
            camera_id,
            pipeline.source,
            window_size
        );
        Ok(pipeline)
    }

    pub fn camera_id(&self) -> CameraId {
        self.core.camera_id
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.core.config
    }

    pub fn window_size(&self) -> usize {
        self.core.window_size
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.core.counters
    }

    /// Current display detection, `None` before the first inference.
    pub fn display_detection(&self) -> Option<Prediction> {
        self.core.lock_state().display.clone()
    }

    pub fn latest_frame(&self) -> Option<SharedFrame> {
        self.core.lock_state().latest.clone()
    }

    pub fn debounce_state(&self) -> DebounceState {
        self.core.lock_state().debouncer.state().clone()
    }

    pub fn status(&self) -> PipelineStatus {
        let display = self.display_detection();
        let (label, confidence) = match display {
            Some(detection) => (detection.label, detection.confidence),
            None => (UNKNOWN_LABEL.to_string(), 0.0),
        };
        PipelineStatus {
            camera_id: self.core.camera_id,
            label,
            confidence,
            running: self.is_running(),
        }
    }

    /// A fresh viewer stream over this pipeline.
    pub fn frames(&self) -> FrameStream {
        FrameStream::new(self.core.clone())
    }

    pub fn capture_released(&self) -> bool {
        self.core.capture.is_released()
    }

    /// Stop the workers and release the source. Waits at most `timeout` for the
    /// workers; anything still running after that is detached. Returns `true` when
    /// every worker was joined. Safe to call more than once.
    ///
    /// If a read is still in flight when `timeout` expires, the source is released by
    /// the capture worker once that read returns, not before `stop` returns.
    pub fn stop(&self, timeout: Duration) -> bool {
        let was_running = self.core.running.swap(false, Ordering::SeqCst);
        if let Some(stats) = self.core.capture.try_release() {
            log_released(self.core.camera_id, &stats);
        }

        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        let deadline = Instant::now() + timeout;
        let mut joined_all = true;
        for worker in workers {
            while !worker.handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(JOIN_POLL);
            }
            if worker.handle.is_finished() {
                if worker.handle.join().is_err() {
                    log::error!(
                        "camera={} {} worker panicked",
                        self.core.camera_id,
                        worker.name
                    );
                }
            } else {
                log::warn!(
                    "camera={} {} worker did not stop within {:?}; detaching",
                    self.core.camera_id,
                    worker.name,
                    timeout
                );
                joined_all = false;
            }
        }

        match self.core.capture.try_release() {
            Some(stats) => log_released(self.core.camera_id, &stats),
            None if !self.core.capture.is_released() => log::warn!(
                "camera={} capture source busy; the capture worker will release it",
                self.core.camera_id
            ),
            None => {}
        }

        if was_running {
            log::info!(
                "camera={} pipeline stopped (frames={}, inferences={}, alerts={})",
                self.core.camera_id,
                self.core.counters.frames_captured.load(Ordering::Relaxed),
                self.core.counters.inferences.load(Ordering::Relaxed),
                self.core.counters.alerts_fired.load(Ordering::Relaxed)
            );
        }
        joined_all
    }

    fn push_worker(&self, name: &'static str, handle: JoinHandle<()>) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Worker { name, handle });
    }
}

pub(crate) fn log_released(camera_id: CameraId, stats: &SourceStats) {
    log::info!(
        "camera={} capture released {} (frames={}, read_errors={})",
        camera_id,
        stats.source,
        stats.frames_captured,
        stats.read_errors
    );
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Workers hold their own reference to the core; make sure they wind down.
        self.core.mark_stopped();
    }
}
