use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crimewatch::codec::decode_jpeg;
use crimewatch::ingest::SourceStats;
use crimewatch::notify::{AlertNotice, Notifier};
use crimewatch::snapshot::InMemorySnapshotStore;
use crimewatch::storage::InMemoryAlertStore;
use crimewatch::{
    AlertContext, AlertStore, ClipClassifier, Frame, FrameSource, PipelineConfig, Prediction,
    SharedFrame, SourceDescriptor, SourceFactory, StreamRegistry,
};

struct CountingSource {
    tick: u8,
    releases: Arc<AtomicUsize>,
}

impl FrameSource for CountingSource {
    fn read_frame(&mut self) -> Result<Frame> {
        self.tick = self.tick.wrapping_add(1);
        Frame::filled(32, 24, [self.tick, 90, 30])
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }
}

#[derive(Default)]
struct CountingFactory {
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl SourceFactory for CountingFactory {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>> {
        if matches!(descriptor, SourceDescriptor::Uri(uri) if uri == "test://offline") {
            return Err(anyhow!("{} is offline", descriptor));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingSource {
            tick: 0,
            releases: self.releases.clone(),
        }))
    }
}

struct FixedClassifier {
    label: &'static str,
    confidence: f32,
}

impl ClipClassifier for FixedClassifier {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn window_size(&self) -> usize {
        4
    }

    fn predict(&mut self, clip: &[SharedFrame]) -> Result<Prediction> {
        if clip.len() != 4 {
            return Err(anyhow!("unexpected clip length {}", clip.len()));
        }
        Ok(Prediction::new(self.label, self.confidence))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<AlertNotice>>,
}

impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn notify(&self, notice: &AlertNotice) -> Result<()> {
        self.notices
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push(notice.clone());
        Ok(())
    }
}

struct Harness {
    registry: StreamRegistry,
    factory: Arc<CountingFactory>,
    snapshots: Arc<InMemorySnapshotStore>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(label: &'static str, confidence: f32) -> Harness {
    let factory = Arc::new(CountingFactory::default());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let alerts = AlertContext::new(
        InMemoryAlertStore::new().into_shared(),
        snapshots.clone(),
        notifier.clone(),
    );
    let config = PipelineConfig {
        target_fps: 100,
        read_backoff: Duration::from_millis(1),
        inference_interval: Duration::from_millis(20),
        cooldown: Duration::from_secs(60),
        required_stability: 2,
        stream_fps: 50,
        stream_poll: Duration::from_millis(5),
        stop_timeout: Duration::from_secs(2),
        ..PipelineConfig::default()
    };
    let classifier = Arc::new(Mutex::new(FixedClassifier { label, confidence }));
    Harness {
        registry: StreamRegistry::new(factory.clone(), classifier, alerts, config),
        factory,
        snapshots,
        notifier,
    }
}

fn uri(value: &str) -> SourceDescriptor {
    SourceDescriptor::Uri(value.to_string())
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn one_pipeline_per_camera() {
    let h = harness("Normal Videos", 0.95);

    let first = h.registry.get_or_create(1, &uri("test://lobby")).unwrap();
    let again = h.registry.get_or_create(1, &uri("test://lobby")).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(h.factory.opens.load(Ordering::SeqCst), 1);

    let other = h.registry.get_or_create(2, &uri("test://bay")).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(h.registry.camera_ids(), vec![1, 2]);

    assert_eq!(h.registry.stop_all().unwrap(), 2);
    assert!(h.registry.is_empty());
    assert!(!first.is_running());
    assert_eq!(h.factory.releases.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_viewers_share_a_pipeline() {
    let h = Arc::new(harness("Normal Videos", 0.95));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let h = h.clone();
            std::thread::spawn(move || h.registry.get_or_create(5, &uri("test://gate")).unwrap())
        })
        .collect();
    let pipelines: Vec<_> = handles.into_iter().map(|j| j.join().unwrap()).collect();

    for pipeline in &pipelines[1..] {
        assert!(Arc::ptr_eq(&pipelines[0], pipeline));
    }
    assert_eq!(h.factory.opens.load(Ordering::SeqCst), 1);
    h.registry.stop_all().unwrap();
}

#[test]
fn sustained_anomaly_fires_one_alert_with_snapshot() {
    let h = harness("Robbery", 0.95);
    let pipeline = h.registry.get_or_create(3, &uri("test://store")).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.counters().alerts_fired.load(Ordering::SeqCst) >= 1
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        pipeline.counters().inferences.load(Ordering::SeqCst) >= 6
    }));
    assert_eq!(pipeline.counters().alerts_fired.load(Ordering::SeqCst), 1);

    let status = pipeline.status();
    assert_eq!(status.label, "Robbery");
    assert!(status.confidence >= 0.9);

    assert!(wait_until(Duration::from_secs(2), || {
        h.notifier.notices.lock().unwrap().len() == 1
    }));
    let notice = h.notifier.notices.lock().unwrap()[0].clone();
    assert_eq!(notice.camera_id, 3);
    assert_eq!(notice.label, "Robbery");
    assert!(notice.record_id.is_some());
    let snapshot_ref = notice.snapshot_ref.expect("snapshot saved");
    let jpeg = h.snapshots.get(&snapshot_ref).expect("snapshot bytes");
    let decoded = decode_jpeg(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 24));

    let records = h.registry.alerts().store.lock().unwrap().list_alerts(Some(3), 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].snapshot_ref.as_deref(), Some(snapshot_ref.as_str()));

    h.registry.stop_all().unwrap();
}

#[test]
fn low_confidence_anomaly_never_alerts() {
    let h = harness("Robbery", 0.5);
    let pipeline = h.registry.get_or_create(4, &uri("test://yard")).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.counters().inferences.load(Ordering::SeqCst) >= 5
    }));
    assert_eq!(pipeline.counters().alerts_fired.load(Ordering::SeqCst), 0);
    let status = pipeline.status();
    assert_eq!(status.label, "Normal Videos");
    assert_eq!(status.confidence, 0.0);
    assert!(h.notifier.notices.lock().unwrap().is_empty());

    h.registry.stop_all().unwrap();
}

#[test]
fn stopped_pipeline_is_replaced_on_next_request() {
    let h = harness("Normal Videos", 0.95);

    let offline = h.registry.get_or_create(6, &uri("test://offline")).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !offline.is_running()));
    assert!(h.registry.get(6).is_none());

    let replacement = h.registry.get_or_create(6, &uri("test://online")).unwrap();
    assert!(!Arc::ptr_eq(&offline, &replacement));
    assert!(replacement.is_running());
    assert_eq!(h.registry.len(), 1);

    assert!(h.registry.stop(6).unwrap());
    assert!(!h.registry.stop(6).unwrap());
}

#[test]
fn viewer_stream_ends_when_pipeline_stops() {
    let h = harness("Normal Videos", 0.95);
    let pipeline = h.registry.get_or_create(7, &uri("test://hall")).unwrap();
    let mut frames = pipeline.frames();

    let part = frames.next().expect("first part");
    assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
    assert!(part.ends_with(b"\r\n"));

    h.registry.stop(7).unwrap();
    assert!(frames.next().is_none());
}
