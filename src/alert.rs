//! Side effects of a fired alert: snapshot, persisted record, notification.
//!
//! `AlertContext` is built once at startup and handed to every pipeline. Each step is
//! best-effort: a failed snapshot leaves the record without a reference, a failed
//! record still notifies, and a failed notification is only logged.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::classify::Prediction;
use crate::codec::{encode_jpeg, DEFAULT_JPEG_QUALITY};
use crate::frame::{Frame, SharedFrame};
use crate::notify::{AlertNotice, NoopNotifier, SharedNotifier};
use crate::overlay::{detection_text, draw_label, TEXT_RED};
use crate::snapshot::{InMemorySnapshotStore, SharedSnapshotStore};
use crate::storage::{InMemoryAlertStore, NewAlert, SharedAlertStore};
use crate::{now_s, CameraId};

#[derive(Clone)]
pub struct AlertContext {
    pub store: SharedAlertStore,
    pub snapshots: SharedSnapshotStore,
    pub notifier: SharedNotifier,
    pub jpeg_quality: u8,
}

/// What actually happened when an alert fired.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertOutcome {
    pub record_id: Option<i64>,
    pub snapshot_ref: Option<String>,
    pub notified: bool,
}

impl AlertContext {
    pub fn new(
        store: SharedAlertStore,
        snapshots: SharedSnapshotStore,
        notifier: SharedNotifier,
    ) -> Self {
        Self {
            store,
            snapshots,
            notifier,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    /// In-memory store and snapshots, no notifications.
    pub fn in_memory() -> Self {
        Self::new(
            InMemoryAlertStore::new().into_shared(),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(NoopNotifier),
        )
    }

    /// Run every side effect of one fired alert. `window` is the clip that produced
    /// the detection; its middle frame becomes the snapshot.
    pub fn dispatch(
        &self,
        camera_id: CameraId,
        detection: &Prediction,
        window: &[SharedFrame],
    ) -> AlertOutcome {
        let timestamp = now_s().unwrap_or(0);

        let snapshot_ref = match self.save_snapshot(camera_id, timestamp, detection, window) {
            Ok(reference) => Some(reference),
            Err(err) => {
                log::warn!("camera={} snapshot not saved: {:#}", camera_id, err);
                None
            }
        };

        let alert = NewAlert {
            camera_id,
            timestamp,
            label: detection.label.clone(),
            confidence: detection.confidence,
            snapshot_ref: snapshot_ref.clone(),
        };
        let record_id = match self.create_record(&alert) {
            Ok(id) => Some(id),
            Err(err) => {
                log::warn!("camera={} alert record not persisted: {:#}", camera_id, err);
                None
            }
        };

        let notice = AlertNotice {
            camera_id,
            label: detection.label.clone(),
            confidence: detection.confidence,
            snapshot_ref: snapshot_ref.clone(),
            record_id,
            timestamp,
        };
        let notified = match self.notifier.notify(&notice) {
            Ok(()) => true,
            Err(err) => {
                log::warn!(
                    "camera={} {} notification failed: {:#}",
                    camera_id,
                    self.notifier.name(),
                    err
                );
                false
            }
        };

        log::info!(
            "camera={} alert fired: {} ({:.2}) record={:?}",
            camera_id,
            detection.label,
            detection.confidence,
            record_id
        );

        AlertOutcome {
            record_id,
            snapshot_ref,
            notified,
        }
    }

    fn save_snapshot(
        &self,
        camera_id: CameraId,
        timestamp: u64,
        detection: &Prediction,
        window: &[SharedFrame],
    ) -> Result<String> {
        let middle = window
            .get(window.len() / 2)
            .ok_or_else(|| anyhow!("empty clip window"))?;
        let mut frame: Frame = middle.as_ref().clone();
        draw_label(
            &mut frame,
            &detection_text(&detection.label, detection.confidence),
            TEXT_RED,
        );
        let jpeg = encode_jpeg(&frame, self.jpeg_quality)?;
        self.snapshots.save(camera_id, timestamp, &jpeg)
    }

    fn create_record(&self, alert: &NewAlert) -> Result<i64> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| anyhow!("alert store lock poisoned"))?;
        store.create_alert_record(alert)
    }
}
