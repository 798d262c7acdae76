use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::{log_released, PipelineCore};
use crate::ingest::{frame_interval, SourceDescriptor, SourceFactory};

/// Capture worker body. Opens the source once, then reads until the pipeline stops or
/// the source is declared lost. Always releases the source on the way out.
pub(super) fn run(core: Arc<PipelineCore>, factory: Arc<dyn SourceFactory>, source: SourceDescriptor) {
    let camera_id = core.camera_id;
    let opened = match factory.open(&source) {
        Ok(opened) => opened,
        Err(err) => {
            log::error!("camera={} failed to open {}: {:#}", camera_id, source, err);
            core.mark_stopped();
            return;
        }
    };
    if !core.capture.install(opened) {
        log::debug!("camera={} stopped while opening {}", camera_id, source);
        return;
    }
    log::info!("camera={} capture opened {}", camera_id, source);

    let interval = frame_interval(core.config.target_fps);
    let ceiling = core.config.read_failure_ceiling.max(1);
    let mut failures: u32 = 0;
    let mut healthy = true;

    while core.is_running() {
        let started = Instant::now();
        match core.capture.read_frame() {
            None => break,
            Some(Ok(frame)) => {
                failures = 0;
                let frame = frame.into_shared();
                {
                    let mut state = core.lock_state();
                    state.latest = Some(frame.clone());
                    state.clip.push(frame);
                }
                core.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                note_health(&core, &source, &mut healthy);
            }
            Some(Err(err)) => {
                failures += 1;
                core.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                note_health(&core, &source, &mut healthy);
                if failures >= ceiling {
                    log::error!(
                        "camera={} source {} lost after {} consecutive read failures: {:#}",
                        camera_id,
                        source,
                        failures,
                        err
                    );
                    core.mark_stopped();
                    break;
                }
                log::debug!(
                    "camera={} read failed ({}/{}): {:#}",
                    camera_id,
                    failures,
                    ceiling,
                    err
                );
                core.sleep_while_running(core.config.read_backoff);
                continue;
            }
        }

        let elapsed = started.elapsed();
        if elapsed < interval {
            core.sleep_while_running(interval - elapsed);
        }
    }

    if let Some(stats) = core.capture.release() {
        log_released(camera_id, &stats);
    }
}

/// Log health transitions reported by the source and mirror them in the counters.
fn note_health(core: &PipelineCore, source: &SourceDescriptor, healthy: &mut bool) {
    let now = core.capture.is_healthy();
    if now == *healthy {
        return;
    }
    *healthy = now;
    core.counters.source_degraded.store(!now, Ordering::Relaxed);
    if now {
        log::info!("camera={} source {} healthy again", core.camera_id, source);
    } else {
        log::warn!("camera={} source {} reports unhealthy", core.camera_id, source);
    }
}
