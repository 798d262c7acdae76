//! Alert debouncing.
//!
//! Raw classifier verdicts go in; a decision to fire comes out only after the same
//! non-normal label has been seen `required_stability` times in a row above the alert
//! threshold, and only once per cooldown window.

use std::time::{Duration, Instant};

use crate::classify::Prediction;

#[derive(Clone, Debug, PartialEq)]
pub struct DebounceSettings {
    pub alert_threshold: f32,
    pub normal_label: String,
    pub required_stability: u32,
    pub cooldown: Duration,
}

/// Streak and cooldown bookkeeping. Lives under the pipeline lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebounceState {
    pub pending_label: Option<String>,
    pub pending_count: u32,
    pub last_alert_at: Option<Instant>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DebounceDecision {
    /// Normal label or below threshold; the streak was reset.
    Reset,
    /// Streak still shorter than the required stability.
    Pending { label: String, count: u32 },
    /// Stable detection, but an alert fired too recently.
    Cooldown,
    /// Fire now. `last_alert_at` has already been updated.
    Fire,
}

#[derive(Clone, Debug)]
pub struct AlertDebouncer {
    settings: DebounceSettings,
    state: DebounceState,
}

impl AlertDebouncer {
    pub fn new(settings: DebounceSettings) -> Self {
        Self {
            settings,
            state: DebounceState::default(),
        }
    }

    pub fn settings(&self) -> &DebounceSettings {
        &self.settings
    }

    pub fn state(&self) -> &DebounceState {
        &self.state
    }

    /// Feed one raw verdict observed at `now`.
    pub fn observe(&mut self, raw: &Prediction, now: Instant) -> DebounceDecision {
        if raw.label == self.settings.normal_label
            || raw.confidence < self.settings.alert_threshold
        {
            self.state.pending_label = None;
            self.state.pending_count = 0;
            return DebounceDecision::Reset;
        }

        if self.state.pending_label.as_deref() == Some(raw.label.as_str()) {
            self.state.pending_count = self.state.pending_count.saturating_add(1);
        } else {
            self.state.pending_label = Some(raw.label.clone());
            self.state.pending_count = 1;
        }

        if self.state.pending_count < self.settings.required_stability {
            return DebounceDecision::Pending {
                label: raw.label.clone(),
                count: self.state.pending_count,
            };
        }

        if let Some(last) = self.state.last_alert_at {
            if now.saturating_duration_since(last) < self.settings.cooldown {
                return DebounceDecision::Cooldown;
            }
        }

        self.state.last_alert_at = Some(now);
        DebounceDecision::Fire
    }
}
