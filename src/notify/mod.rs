//! Best-effort alert notification.
//!
//! A notifier is told about every alert that fires. Delivery failures are reported to
//! the caller, which logs them; they never undo the alert itself.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::CameraId;

pub mod mqtt;
#[cfg(feature = "http")]
pub mod webhook;

pub use mqtt::{MqttNotifier, MqttSettings};
#[cfg(feature = "http")]
pub use webhook::WebhookNotifier;

/// Payload describing one fired alert.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertNotice {
    pub camera_id: CameraId,
    pub label: String,
    pub confidence: f32,
    pub snapshot_ref: Option<String>,
    pub record_id: Option<i64>,
    pub timestamp: u64,
}

pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn notify(&self, notice: &AlertNotice) -> Result<()>;

    /// Flush and close any background connection. Called once at process exit.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Used when no notification channel is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn notify(&self, notice: &AlertNotice) -> Result<()> {
        log::debug!(
            "camera={} alert {} not forwarded (no notifier configured)",
            notice.camera_id,
            notice.label
        );
        Ok(())
    }
}

/// Forwards each notice to every inner notifier. All of them are attempted; the
/// error reports which ones failed.
pub struct FanoutNotifier {
    notifiers: Vec<SharedNotifier>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<SharedNotifier>) -> Self {
        Self { notifiers }
    }

    /// Collapse to the cheapest equivalent notifier.
    pub fn into_shared(self) -> SharedNotifier {
        match self.notifiers.len() {
            0 => Arc::new(NoopNotifier),
            1 => self.notifiers.into_iter().next().unwrap_or_else(|| Arc::new(NoopNotifier)),
            _ => Arc::new(self),
        }
    }
}

impl Notifier for FanoutNotifier {
    fn name(&self) -> &'static str {
        "fanout"
    }

    fn notify(&self, notice: &AlertNotice) -> Result<()> {
        let mut failed = Vec::new();
        for notifier in &self.notifiers {
            if let Err(err) = notifier.notify(notice) {
                failed.push(format!("{}: {}", notifier.name(), err));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("notification failed: {}", failed.join("; ")))
        }
    }

    fn shutdown(&self) -> Result<()> {
        let mut failed = Vec::new();
        for notifier in &self.notifiers {
            if let Err(err) = notifier.shutdown() {
                failed.push(format!("{}: {}", notifier.name(), err));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("notifier shutdown failed: {}", failed.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<String>>);

    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn notify(&self, notice: &AlertNotice) -> Result<()> {
            self.0
                .lock()
                .map_err(|_| anyhow!("lock poisoned"))?
                .push(notice.label.clone());
            Ok(())
        }
    }

    struct Failing;

    impl Notifier for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn notify(&self, _notice: &AlertNotice) -> Result<()> {
            Err(anyhow!("broker unreachable"))
        }

        fn shutdown(&self) -> Result<()> {
            Err(anyhow!("already closed"))
        }
    }

    #[derive(Default)]
    struct Closing(AtomicUsize);

    impl Notifier for Closing {
        fn name(&self) -> &'static str {
            "closing"
        }

        fn notify(&self, _notice: &AlertNotice) -> Result<()> {
            Ok(())
        }

        fn shutdown(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn notice() -> AlertNotice {
        AlertNotice {
            camera_id: 2,
            label: "Robbery".to_string(),
            confidence: 0.91,
            snapshot_ref: None,
            record_id: Some(5),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn fanout_attempts_every_notifier() {
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let fanout = FanoutNotifier::new(vec![Arc::new(Failing), recording.clone()]);

        let err = fanout.notify(&notice()).unwrap_err();
        assert!(err.to_string().contains("failing"));
        assert_eq!(recording.0.lock().unwrap().as_slice(), ["Robbery"]);
    }

    #[test]
    fn fanout_shuts_down_every_notifier() {
        let first = Arc::new(Closing::default());
        let second = Arc::new(Closing::default());
        let fanout = FanoutNotifier::new(vec![first.clone(), Arc::new(Failing), second.clone()]);

        let err = fanout.shutdown().unwrap_err();
        assert!(err.to_string().contains("failing"));
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_fanout_collapses_to_noop() {
        let notifier = FanoutNotifier::new(Vec::new()).into_shared();
        assert_eq!(notifier.name(), "noop");
        assert!(notifier.notify(&notice()).is_ok());
    }

    #[test]
    fn notice_serializes_as_flat_json() {
        let json = serde_json::to_value(notice()).unwrap();
        assert_eq!(json["camera_id"], 2);
        assert_eq!(json["record_id"], 5);
        assert!(json["snapshot_ref"].is_null());
    }
}
