use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::CameraId;

/// Alert data handed to the store when an alert fires.
#[derive(Clone, Debug, PartialEq)]
pub struct NewAlert {
    pub camera_id: CameraId,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub label: String,
    pub confidence: f32,
    pub snapshot_ref: Option<String>,
}

/// A persisted alert record. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub camera_id: CameraId,
    pub timestamp: u64,
    pub label: String,
    pub confidence: f32,
    pub snapshot_ref: Option<String>,
}

pub trait AlertStore: Send {
    /// Persist an alert and return its record id.
    fn create_alert_record(&mut self, alert: &NewAlert) -> Result<i64>;

    /// Most recent alerts first, optionally restricted to one camera.
    fn list_alerts(&mut self, camera_id: Option<CameraId>, limit: usize)
        -> Result<Vec<AlertRecord>>;
}

pub type SharedAlertStore = Arc<Mutex<dyn AlertStore>>;

pub struct SqliteAlertStore {
    conn: Connection,
}

impl SqliteAlertStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(db_path)?
        };
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn into_shared(self) -> SharedAlertStore {
        Arc::new(Mutex::new(self))
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL,
              created_at INTEGER NOT NULL,
              label TEXT NOT NULL,
              confidence REAL NOT NULL,
              snapshot_ref TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_camera ON alerts(camera_id, created_at);
            "#,
        )?;
        Ok(())
    }
}

impl AlertStore for SqliteAlertStore {
    fn create_alert_record(&mut self, alert: &NewAlert) -> Result<i64> {
        let created_at = i64::try_from(alert.timestamp)
            .map_err(|_| anyhow!("alert timestamp exceeds i64 range"))?;
        self.conn.execute(
            r#"
            INSERT INTO alerts(camera_id, created_at, label, confidence, snapshot_ref)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                alert.camera_id,
                created_at,
                alert.label,
                alert.confidence as f64,
                alert.snapshot_ref
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_alerts(
        &mut self,
        camera_id: Option<CameraId>,
        limit: usize,
    ) -> Result<Vec<AlertRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, camera_id, created_at, label, confidence, snapshot_ref
            FROM alerts
            WHERE (?1 IS NULL OR camera_id = ?1)
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![camera_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let created_at: i64 = row.get(2)?;
            let confidence: f64 = row.get(4)?;
            out.push(AlertRecord {
                id: row.get(0)?,
                camera_id: row.get(1)?,
                timestamp: u64::try_from(created_at)
                    .map_err(|_| anyhow!("corrupt alert row: negative timestamp"))?,
                label: row.get(3)?,
                confidence: confidence as f32,
                snapshot_ref: row.get(5)?,
            });
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryAlertStore {
    records: Vec<AlertRecord>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedAlertStore {
        Arc::new(Mutex::new(self))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AlertStore for InMemoryAlertStore {
    fn create_alert_record(&mut self, alert: &NewAlert) -> Result<i64> {
        let id = self.records.len() as i64 + 1;
        self.records.push(AlertRecord {
            id,
            camera_id: alert.camera_id,
            timestamp: alert.timestamp,
            label: alert.label.clone(),
            confidence: alert.confidence,
            snapshot_ref: alert.snapshot_ref.clone(),
        });
        Ok(id)
    }

    fn list_alerts(
        &mut self,
        camera_id: Option<CameraId>,
        limit: usize,
    ) -> Result<Vec<AlertRecord>> {
        Ok(self
            .records
            .iter()
            .rev()
            .filter(|record| camera_id.map_or(true, |id| record.camera_id == id))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(camera_id: CameraId, label: &str) -> NewAlert {
        NewAlert {
            camera_id,
            timestamp: 1_700_000_000,
            label: label.to_string(),
            confidence: 0.9,
            snapshot_ref: Some(format!("cam{}.jpg", camera_id)),
        }
    }

    #[test]
    fn sqlite_store_round_trips_and_filters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("alerts.db");
        let mut store = SqliteAlertStore::open(&db_path.to_string_lossy())?;

        let first = store.create_alert_record(&alert(1, "Robbery"))?;
        let second = store.create_alert_record(&alert(2, "Arson"))?;
        let third = store.create_alert_record(&alert(1, "Fighting"))?;
        assert!(first < second && second < third);

        let cam1 = store.list_alerts(Some(1), 10)?;
        assert_eq!(cam1.len(), 2);
        assert_eq!(cam1[0].label, "Fighting");
        assert_eq!(cam1[1].snapshot_ref.as_deref(), Some("cam1.jpg"));

        let all = store.list_alerts(None, 2)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, third);
        Ok(())
    }

    #[test]
    fn in_memory_store_lists_newest_first() -> Result<()> {
        let mut store = InMemoryAlertStore::new();
        store.create_alert_record(&alert(3, "Robbery"))?;
        store.create_alert_record(&alert(3, "Shooting"))?;

        let listed = store.list_alerts(Some(3), 1)?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label, "Shooting");
        assert!(store.list_alerts(Some(4), 10)?.is_empty());
        Ok(())
    }
}
