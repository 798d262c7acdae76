use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use super::{DebounceDecision, PipelineCore};
use crate::alert::AlertContext;
use crate::classify::{Prediction, SharedClassifier};

/// Thresholds used to turn a raw verdict into what viewers see.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayPolicy {
    pub normal_label: String,
    pub display_floor: f32,
    pub alert_threshold: f32,
}

/// Display form of a raw verdict. Normal verdicts need only clear the display floor;
/// anomalies must clear the alert threshold. Everything else shows as normal/0.0.
pub fn display_detection(raw: &Prediction, policy: &DisplayPolicy) -> Prediction {
    let is_normal = raw.label == policy.normal_label;
    if is_normal && raw.confidence >= policy.display_floor {
        return raw.clone();
    }
    if !is_normal && raw.confidence >= policy.alert_threshold {
        return raw.clone();
    }
    Prediction::new(policy.normal_label.clone(), 0.0)
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// Not enough buffered frames for a full window.
    Skipped,
    /// The classifier returned an error; nothing changed.
    Failed,
    Classified {
        raw: Prediction,
        display: Prediction,
        decision: DebounceDecision,
    },
}

pub(super) fn run(core: Arc<PipelineCore>, classifier: SharedClassifier, alerts: AlertContext) {
    let interval = core.config.inference_interval;
    let policy = core.config.display_policy();
    while core.is_running() {
        let started = Instant::now();
        tick(&core, &classifier, &alerts, &policy, started);
        let elapsed = started.elapsed();
        if elapsed < interval {
            core.sleep_while_running(interval - elapsed);
        }
    }
    log::debug!("camera={} inference worker exiting", core.camera_id);
}

/// One inference tick. Alert side effects run after the state lock is dropped.
pub(super) fn tick(
    core: &PipelineCore,
    classifier: &SharedClassifier,
    alerts: &AlertContext,
    policy: &DisplayPolicy,
    now: Instant,
) -> TickOutcome {
    let window = core.lock_state().clip.latest_window(core.window_size);
    let Some(window) = window else {
        return TickOutcome::Skipped;
    };

    let result = {
        let mut model = classifier.lock().unwrap_or_else(PoisonError::into_inner);
        model.predict(&window)
    };
    let raw = match result {
        Ok(raw) => raw,
        Err(err) => {
            core.counters.classifier_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("camera={} classifier error: {:#}", core.camera_id, err);
            return TickOutcome::Failed;
        }
    };
    core.counters.inferences.fetch_add(1, Ordering::Relaxed);

    let display = display_detection(&raw, policy);
    let decision = {
        let mut state = core.lock_state();
        state.display = Some(display.clone());
        state.debouncer.observe(&raw, now)
    };
    log::debug!(
        "camera={} raw {} ({:.2}) shown as {} ({:.2}): {:?}",
        core.camera_id,
        raw.label,
        raw.confidence,
        display.label,
        display.confidence,
        decision
    );

    if decision == DebounceDecision::Fire {
        core.counters.alerts_fired.fetch_add(1, Ordering::Relaxed);
        alerts.dispatch(core.camera_id, &raw, &window);
    }

    TickOutcome::Classified {
        raw,
        display,
        decision,
    }
}
