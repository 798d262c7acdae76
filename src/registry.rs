//! Process-wide registry of camera pipelines.
//!
//! Built once at startup and shared as `Arc<StreamRegistry>`. The map lock is only
//! taken to look up, insert or remove pipelines; stopping a pipeline happens after it
//! has been taken out of the map so a slow stop never blocks other cameras.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::alert::AlertContext;
use crate::classify::SharedClassifier;
use crate::ingest::{SourceDescriptor, SourceFactory};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::CameraId;

pub struct StreamRegistry {
    pipelines: Mutex<HashMap<CameraId, Arc<Pipeline>>>,
    factory: Arc<dyn SourceFactory>,
    classifier: SharedClassifier,
    alerts: AlertContext,
    config: PipelineConfig,
}

impl StreamRegistry {
    pub fn new(
        factory: Arc<dyn SourceFactory>,
        classifier: SharedClassifier,
        alerts: AlertContext,
        config: PipelineConfig,
    ) -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            factory,
            classifier,
            alerts,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn alerts(&self) -> &AlertContext {
        &self.alerts
    }

    /// Running pipeline for `camera_id`, starting one if there is none. A registered
    /// pipeline that has stopped on its own is discarded and replaced.
    pub fn get_or_create(
        &self,
        camera_id: CameraId,
        source: &SourceDescriptor,
    ) -> Result<Arc<Pipeline>> {
        let stale = {
            let mut pipelines = self.lock()?;
            let existing = pipelines.get(&camera_id).cloned();
            match existing {
                Some(existing) if existing.is_running() => return Ok(existing),
                Some(_) => pipelines.remove(&camera_id),
                None => None,
            }
        };
        if let Some(stale) = stale {
            log::info!("camera={} replacing stopped pipeline", camera_id);
            stale.stop(self.config.stop_timeout);
        }

        let mut pipelines = self.lock()?;
        // Another request may have created it while the stale one was stopping.
        if let Some(existing) = pipelines.get(&camera_id) {
            if existing.is_running() {
                return Ok(existing.clone());
            }
        }
        let pipeline = Pipeline::start(
            camera_id,
            source.clone(),
            self.factory.clone(),
            self.classifier.clone(),
            self.alerts.clone(),
            self.config.clone(),
        )?;
        pipelines.insert(camera_id, pipeline.clone());
        Ok(pipeline)
    }

    /// Registered pipeline for `camera_id`, only if it is still running.
    pub fn get(&self, camera_id: CameraId) -> Option<Arc<Pipeline>> {
        let pipelines = self.lock().ok()?;
        pipelines
            .get(&camera_id)
            .filter(|pipeline| pipeline.is_running())
            .cloned()
    }

    /// Stop and forget one pipeline. Unknown cameras are a no-op; returns whether a
    /// pipeline was removed.
    pub fn stop(&self, camera_id: CameraId) -> Result<bool> {
        let removed = self.lock()?.remove(&camera_id);
        match removed {
            Some(pipeline) => {
                pipeline.stop(self.config.stop_timeout);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every pipeline. Returns how many were stopped.
    pub fn stop_all(&self) -> Result<usize> {
        let drained: Vec<Arc<Pipeline>> = {
            let mut pipelines = self.lock()?;
            pipelines.drain().map(|(_, pipeline)| pipeline).collect()
        };
        for pipeline in &drained {
            pipeline.stop(self.config.stop_timeout);
        }
        if !drained.is_empty() {
            log::info!("stopped {} pipeline(s)", drained.len());
        }
        Ok(drained.len())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|pipelines| pipelines.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = self
            .lock()
            .map(|pipelines| pipelines.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<CameraId, Arc<Pipeline>>>> {
        self.pipelines
            .lock()
            .map_err(|_| anyhow!("stream registry lock poisoned"))
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        if let Err(err) = self.stop_all() {
            log::warn!("stream registry teardown failed: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedClassifier, ScriptedFactory};
    use std::time::{Duration, Instant};

    fn registry(factory: ScriptedFactory) -> StreamRegistry {
        let config = PipelineConfig {
            target_fps: 200,
            read_backoff: Duration::from_millis(1),
            read_failure_ceiling: 3,
            inference_interval: Duration::from_millis(10),
            ..PipelineConfig::default()
        };
        StreamRegistry::new(
            Arc::new(factory),
            ScriptedClassifier::constant("Normal Videos", 0.9, 2).into_shared(),
            AlertContext::in_memory(),
            config,
        )
    }

    fn source() -> SourceDescriptor {
        SourceDescriptor::Uri("scripted://cam".to_string())
    }

    #[test]
    fn get_or_create_returns_the_same_pipeline_while_healthy() {
        let registry = registry(ScriptedFactory::healthy(16, 12));
        let first = registry.get_or_create(1, &source()).unwrap();
        let second = registry.get_or_create(1, &source()).unwrap();

        first.stop(Duration::from_secs(1));
        assert!(!second.is_running());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stopped_pipelines_are_replaced() {
        let registry = registry(ScriptedFactory::healthy(16, 12));
        let first = registry.get_or_create(2, &source()).unwrap();
        first.stop(Duration::from_secs(1));

        let second = registry.get_or_create(2, &source()).unwrap();
        assert!(second.is_running());
        assert!(!first.is_running());
        assert_eq!(registry.camera_ids(), vec![2]);
    }

    #[test]
    fn stop_is_idempotent() {
        let registry = registry(ScriptedFactory::healthy(16, 12));
        let pipeline = registry.get_or_create(3, &source()).unwrap();

        assert!(registry.stop(3).unwrap());
        assert!(!registry.stop(3).unwrap());
        assert!(!registry.stop(99).unwrap());
        assert!(!pipeline.is_running());
        assert!(registry.get(3).is_none());
    }

    #[test]
    fn stop_all_empties_registry_and_stops_everything() {
        let registry = registry(ScriptedFactory::healthy(16, 12));
        let pipelines: Vec<_> = (1..=3)
            .map(|id| registry.get_or_create(id, &source()).unwrap())
            .collect();

        let started = Instant::now();
        assert_eq!(registry.stop_all().unwrap(), 3);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.is_empty());
        assert!(pipelines.iter().all(|p| !p.is_running()));
    }

    #[test]
    fn get_ignores_pipelines_whose_source_failed() {
        let registry = registry(ScriptedFactory::unavailable());
        let pipeline = registry.get_or_create(4, &source()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(registry.get(4).is_none());
    }
}
