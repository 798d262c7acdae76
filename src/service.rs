//! Wiring between the camera catalog, the stream registry and the alert store.
//!
//! The HTTP API talks to a `WatchService`; the daemon builds one from `WatchConfig`.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::alert::AlertContext;
use crate::classify::{ClassifierRegistry, SharedClassifier, StubClassifier};
use crate::config::{CameraConfig, InferenceSettings, NotifySettings, WatchConfig};
use crate::ingest::{DefaultSourceFactory, SourceFactory};
use crate::notify::{FanoutNotifier, MqttNotifier, SharedNotifier};
use crate::pipeline::{FrameStream, PipelineStatus};
use crate::registry::StreamRegistry;
use crate::snapshot::FilesystemSnapshotStore;
use crate::storage::{AlertRecord, SqliteAlertStore};
use crate::CameraId;

pub const DEFAULT_ALERT_LIMIT: usize = 50;
pub const MAX_ALERT_LIMIT: usize = 500;

pub struct WatchService {
    cameras: Vec<CameraConfig>,
    registry: StreamRegistry,
}

impl WatchService {
    pub fn new(cameras: Vec<CameraConfig>, registry: StreamRegistry) -> Self {
        Self { cameras, registry }
    }

    /// Build every collaborator from configuration: source factory, classifier,
    /// SQLite alert store, snapshot directory and notifiers.
    pub fn from_config(cfg: &WatchConfig) -> Result<Self> {
        let factory: Arc<dyn SourceFactory> =
            Arc::new(DefaultSourceFactory::new(cfg.source_settings()));
        let classifier = build_classifier(&cfg.inference)?;
        let store = SqliteAlertStore::open(&cfg.db_path)?.into_shared();
        let snapshots = Arc::new(FilesystemSnapshotStore::new(&cfg.snapshot_dir)?);
        let notifier = build_notifier(&cfg.notify)?;
        let alerts = AlertContext::new(store, snapshots, notifier);
        let registry = StreamRegistry::new(factory, classifier, alerts, cfg.pipeline_config());
        Ok(Self::new(cfg.cameras.clone(), registry))
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Catalog entry, only for known and active cameras.
    pub fn camera(&self, camera_id: CameraId) -> Option<&CameraConfig> {
        self.cameras
            .iter()
            .find(|camera| camera.id == camera_id && camera.active)
    }

    pub fn active_cameras(&self) -> Vec<CameraConfig> {
        self.cameras
            .iter()
            .filter(|camera| camera.active)
            .cloned()
            .collect()
    }

    /// A new viewer stream, starting the camera's pipeline if needed. `None` for
    /// unknown or inactive cameras.
    pub fn stream(&self, camera_id: CameraId) -> Result<Option<FrameStream>> {
        let Some(camera) = self.camera(camera_id) else {
            return Ok(None);
        };
        let pipeline = self
            .registry
            .get_or_create(camera.id, &camera.descriptor()?)?;
        Ok(Some(pipeline.frames()))
    }

    /// Current status. Like the stream endpoint this starts the pipeline on first use.
    pub fn status(&self, camera_id: CameraId) -> Result<Option<PipelineStatus>> {
        let Some(camera) = self.camera(camera_id) else {
            return Ok(None);
        };
        let pipeline = self
            .registry
            .get_or_create(camera.id, &camera.descriptor()?)?;
        Ok(Some(pipeline.status()))
    }

    pub fn stop(&self, camera_id: CameraId) -> Result<bool> {
        self.registry.stop(camera_id)
    }

    pub fn stop_all(&self) -> Result<usize> {
        self.registry.stop_all()
    }

    /// Stop every pipeline, then close the notifiers so queued alerts get a chance
    /// to leave the process.
    pub fn shutdown(&self) -> Result<usize> {
        let stopped = self.registry.stop_all()?;
        if let Err(err) = self.registry.alerts().notifier.shutdown() {
            log::warn!("notifier shutdown: {:#}", err);
        }
        Ok(stopped)
    }

    pub fn recent_alerts(
        &self,
        camera_id: Option<CameraId>,
        limit: usize,
    ) -> Result<Vec<AlertRecord>> {
        let limit = limit.clamp(1, MAX_ALERT_LIMIT);
        let mut store = self
            .registry
            .alerts()
            .store
            .lock()
            .map_err(|_| anyhow!("alert store lock poisoned"))?;
        store.list_alerts(camera_id, limit)
    }
}

pub fn build_classifier(settings: &InferenceSettings) -> Result<SharedClassifier> {
    let mut classifiers = ClassifierRegistry::new();
    let mut stub = StubClassifier::new(settings.window_size);
    if let Some(label) = &settings.stub_motion_label {
        stub = stub.with_motion_label(label.clone());
    }
    classifiers.register(stub);

    #[cfg(feature = "backend-tract")]
    if settings.backend == "tract" {
        let model_path = settings
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow!("tract backend requires a model path"))?;
        classifiers.register(crate::classify::TractClassifier::new(
            model_path,
            settings.window_size,
            settings.input_size,
            settings.input_size,
            settings.labels.clone(),
        )?);
    }
    #[cfg(not(feature = "backend-tract"))]
    if settings.backend == "tract" {
        return Err(anyhow!("tract backend requires the backend-tract feature"));
    }

    classifiers.set_default(&settings.backend)?;
    classifiers.warm_up_all()?;
    log::info!(
        "classifier backends: {} (using {})",
        classifiers.list().join(", "),
        settings.backend
    );
    classifiers
        .default_classifier()
        .ok_or_else(|| anyhow!("no classifier backend available"))
}

pub fn build_notifier(settings: &NotifySettings) -> Result<SharedNotifier> {
    let mut notifiers: Vec<SharedNotifier> = Vec::new();
    if let Some(mqtt) = &settings.mqtt {
        notifiers.push(Arc::new(MqttNotifier::connect(mqtt)?));
    }
    if let Some(url) = &settings.webhook_url {
        #[cfg(feature = "http")]
        notifiers.push(Arc::new(crate::notify::WebhookNotifier::new(url)?));
        #[cfg(not(feature = "http"))]
        log::warn!("webhook {} ignored: built without the http feature", url);
    }
    Ok(FanoutNotifier::new(notifiers).into_shared())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;

    fn service(dir: &std::path::Path) -> WatchService {
        let mut cfg = test_config();
        cfg.db_path = dir.join("alerts.db").to_string_lossy().into_owned();
        cfg.snapshot_dir = dir.join("snaps");
        cfg.cameras = vec![
            CameraConfig {
                id: 1,
                name: "Lobby".to_string(),
                source: "stub://lobby".to_string(),
                active: true,
            },
            CameraConfig {
                id: 2,
                name: "Dock".to_string(),
                source: "stub://dock".to_string(),
                active: false,
            },
        ];
        WatchService::from_config(&cfg).unwrap()
    }

    fn test_config() -> WatchConfig {
        let mut cfg = WatchConfig::defaults().unwrap();
        cfg.inference.window_size = 2;
        cfg.capture.width = 32;
        cfg.capture.height = 24;
        cfg.notify = NotifySettings::default();
        cfg
    }

    #[test]
    fn unknown_and_inactive_cameras_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert!(service.status(2).unwrap().is_none());
        assert!(service.status(9).unwrap().is_none());
        assert!(service.stream(2).unwrap().is_none());
        assert!(service.registry().is_empty());
    }

    #[test]
    fn status_starts_the_pipeline_with_neutral_detection() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let status = service.status(1).unwrap().unwrap();
        assert_eq!(status.camera_id, 1);
        assert!(status.running);
        assert_eq!(service.registry().camera_ids(), vec![1]);

        assert!(service.stop(1).unwrap());
        assert!(!service.stop(1).unwrap());
    }

    #[derive(Default)]
    struct ClosingNotifier(std::sync::atomic::AtomicUsize);

    impl crate::notify::Notifier for ClosingNotifier {
        fn name(&self) -> &'static str {
            "closing"
        }

        fn notify(&self, _notice: &crate::notify::AlertNotice) -> Result<()> {
            Ok(())
        }

        fn shutdown(&self) -> Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn shutdown_stops_pipelines_then_closes_notifier() {
        use crate::test_support::{ScriptedClassifier, ScriptedFactory};
        use std::sync::atomic::Ordering;

        let notifier = Arc::new(ClosingNotifier::default());
        let alerts = AlertContext::new(
            crate::storage::InMemoryAlertStore::new().into_shared(),
            Arc::new(crate::snapshot::InMemorySnapshotStore::new()),
            notifier.clone(),
        );
        let registry = StreamRegistry::new(
            Arc::new(ScriptedFactory::healthy(16, 12)),
            ScriptedClassifier::constant("Normal Videos", 0.9, 2).into_shared(),
            alerts,
            crate::pipeline::PipelineConfig::default(),
        );
        let cameras = test_config().cameras;
        let service = WatchService::new(cameras, registry);

        assert!(service.status(1).unwrap().is_some());
        assert_eq!(service.shutdown().unwrap(), 1);
        assert!(service.registry().is_empty());
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stub_backend_reports_configured_motion_label() {
        use crate::frame::Frame;

        let mut settings = test_config().inference;
        settings.stub_motion_label = Some("Vandalism".to_string());
        let classifier = build_classifier(&settings).unwrap();

        let moving = vec![
            Frame::filled(16, 12, [10, 10, 10]).unwrap().into_shared(),
            Frame::filled(16, 12, [200, 10, 10]).unwrap().into_shared(),
        ];
        let still = vec![moving[0].clone(), moving[0].clone()];
        let mut classifier = classifier.lock().unwrap();
        assert_eq!(classifier.predict(&moving).unwrap().label, "Vandalism");
        assert_eq!(
            classifier.predict(&still).unwrap().label,
            crate::classify::NORMAL_LABEL
        );
    }

    #[test]
    fn recent_alerts_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert!(service.recent_alerts(None, 10).unwrap().is_empty());
    }
}
