//! Alert snapshot storage.
//!
//! Snapshots are JPEG bytes written under a root directory. The reference handed back
//! to callers is the file name relative to that root, which is what alert records keep.

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::CameraId;

pub trait SnapshotStore: Send + Sync {
    /// Persist one snapshot and return a reference that can be stored with the alert.
    fn save(&self, camera_id: CameraId, timestamp: u64, jpeg: &[u8]) -> Result<String>;
}

pub type SharedSnapshotStore = Arc<dyn SnapshotStore>;

pub struct FilesystemSnapshotStore {
    root: PathBuf,
}

impl FilesystemSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create snapshot dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a reference returned by `save` back to a path under the root.
    pub fn resolve(&self, snapshot_ref: &str) -> Result<PathBuf> {
        if snapshot_ref.is_empty()
            || snapshot_ref.contains('/')
            || snapshot_ref.contains('\\')
            || snapshot_ref.starts_with('.')
        {
            return Err(anyhow!("invalid snapshot reference {:?}", snapshot_ref));
        }
        Ok(self.root.join(snapshot_ref))
    }
}

impl SnapshotStore for FilesystemSnapshotStore {
    fn save(&self, camera_id: CameraId, timestamp: u64, jpeg: &[u8]) -> Result<String> {
        if jpeg.is_empty() {
            return Err(anyhow!("refusing to store empty snapshot"));
        }
        let name = snapshot_name(camera_id, timestamp);
        let path = self.root.join(&name);
        write_atomic(&path, jpeg).with_context(|| format!("write snapshot {}", path.display()))?;
        Ok(name)
    }
}

/// Keeps snapshots in memory. Used when no snapshot directory is configured and in tests.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, snapshot_ref: &str) -> Option<Vec<u8>> {
        self.snapshots
            .lock()
            .ok()
            .and_then(|map| map.get(snapshot_ref).cloned())
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, camera_id: CameraId, timestamp: u64, jpeg: &[u8]) -> Result<String> {
        let name = snapshot_name(camera_id, timestamp);
        let mut map = self
            .snapshots
            .lock()
            .map_err(|_| anyhow!("snapshot store lock poisoned"))?;
        map.insert(name.clone(), jpeg.to_vec());
        Ok(name)
    }
}

fn snapshot_name(camera_id: CameraId, timestamp: u64) -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("cam{}_{}_{}.jpg", camera_id, timestamp, hex::encode(suffix))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}
