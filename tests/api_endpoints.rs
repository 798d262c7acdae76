use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use crimewatch::api::{ApiConfig, ApiHandle, ApiServer};
use crimewatch::storage::{AlertStore, NewAlert, SqliteAlertStore};
use crimewatch::{CameraConfig, WatchConfig, WatchService};

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

struct TestApi {
    _dir: tempfile::TempDir,
    service: Arc<WatchService>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(seed_alerts: &[NewAlert]) -> Result<Self> {
        let dir = tempdir()?;
        let mut cfg = WatchConfig::defaults()?;
        cfg.db_path = dir.path().join("alerts.db").to_string_lossy().to_string();
        cfg.snapshot_dir = dir.path().join("snapshots");
        cfg.capture.width = 64;
        cfg.capture.height = 48;
        cfg.stream.stop_timeout = Duration::from_secs(2);
        cfg.cameras = vec![
            CameraConfig {
                id: 1,
                name: "Front Camera".to_string(),
                source: "stub://front_camera".to_string(),
                active: true,
            },
            CameraConfig {
                id: 2,
                name: "Back Door".to_string(),
                source: "stub://back_door".to_string(),
                active: false,
            },
        ];

        if !seed_alerts.is_empty() {
            let mut store = SqliteAlertStore::open(&cfg.db_path)?;
            for alert in seed_alerts {
                store.create_alert_record(alert)?;
            }
        }

        let service = Arc::new(WatchService::from_config(&cfg)?);
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let api_handle = ApiServer::new(api_config, service.clone()).spawn()?;
        Ok(Self {
            _dir: dir,
            service,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.api_handle.as_ref().expect("api handle").addr
    }

    fn request(&self, method: &str, path: &str) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.addr())?;
        let request = format!("{} {} HTTP/1.1\r\nHost: localhost\r\n\r\n", method, path);
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        let _ = self.service.stop_all();
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
    }
}

fn alert(camera_id: u32, timestamp: u64, label: &str) -> NewAlert {
    NewAlert {
        camera_id,
        timestamp,
        label: label.to_string(),
        confidence: 0.91,
        snapshot_ref: Some(format!("cam{}_{}_abcd.jpg", camera_id, timestamp)),
    }
}

#[test]
fn health_and_camera_catalog() -> Result<()> {
    let api = TestApi::new(&[])?;

    let (headers, body) = api.request("GET", "/health")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    let json: Value = serde_json::from_str(&body)?;
    assert_eq!(json["status"], "ok");

    let (headers, body) = api.request("GET", "/cameras")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    let json: Value = serde_json::from_str(&body)?;
    let cameras = json.as_array().expect("camera list");
    assert_eq!(cameras.len(), 1);
    assert_eq!(cameras[0]["id"], 1);
    assert_eq!(cameras[0]["name"], "Front Camera");
    Ok(())
}

#[test]
fn unknown_and_inactive_cameras_are_not_found() -> Result<()> {
    let api = TestApi::new(&[])?;

    let (headers, _) = api.request("GET", "/stream/99")?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    let (headers, _) = api.request("GET", "/stream/2")?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    let (headers, body) = api.request("GET", "/stats/2")?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    assert!(body.contains("camera_not_found"));

    assert!(api.service.registry().is_empty());
    Ok(())
}

#[test]
fn stats_start_pipeline_with_neutral_detection() -> Result<()> {
    let api = TestApi::new(&[])?;

    let (headers, body) = api.request("GET", "/stats/1")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    let json: Value = serde_json::from_str(&body)?;
    assert_eq!(json["camera_id"], 1);
    assert_eq!(json["label"], "Unknown");
    assert_eq!(json["confidence"], 0.0);
    assert_eq!(json["running"], true);
    assert_eq!(api.service.registry().camera_ids(), vec![1]);
    Ok(())
}

#[test]
fn stop_is_idempotent() -> Result<()> {
    let api = TestApi::new(&[])?;

    let (headers, _) = api.request("POST", "/stop/1")?;
    assert!(headers.starts_with("HTTP/1.1 204"));

    api.request("GET", "/stats/1")?;
    let (headers, _) = api.request("POST", "/stop/1")?;
    assert!(headers.starts_with("HTTP/1.1 204"));
    let (headers, _) = api.request("POST", "/stop/1")?;
    assert!(headers.starts_with("HTTP/1.1 204"));
    assert!(api.service.registry().get(1).is_none());

    let (headers, _) = api.request("POST", "/stop")?;
    assert!(headers.starts_with("HTTP/1.1 204"));
    Ok(())
}

#[test]
fn stream_delivers_multipart_jpeg_parts() -> Result<()> {
    let api = TestApi::new(&[])?;

    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /stream/1 HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let needle = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
        if let Some(pos) = received.windows(needle.len()).position(|w| w == needle) {
            if received.len() >= pos + needle.len() + 2 {
                break;
            }
        }
    }

    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    let pos = received
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("multipart part");
    let jpeg = &received[pos + needle.len()..];
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    drop(stream);

    assert!(api.service.registry().get(1).is_some());
    Ok(())
}

#[test]
fn wrong_method_is_rejected() -> Result<()> {
    let api = TestApi::new(&[])?;

    let (headers, _) = api.request("POST", "/stream/1")?;
    assert!(headers.starts_with("HTTP/1.1 405"));
    let (headers, _) = api.request("GET", "/stop")?;
    assert!(headers.starts_with("HTTP/1.1 405"));
    let (headers, _) = api.request("GET", "/nope")?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    Ok(())
}

#[test]
fn alert_feed_filters_by_camera_newest_first() -> Result<()> {
    let api = TestApi::new(&[
        alert(1, 1_700_000_000, "Robbery"),
        alert(3, 1_700_000_010, "Arson"),
        alert(1, 1_700_000_020, "Fighting"),
    ])?;

    let (headers, body) = api.request("GET", "/alerts?camera=1&limit=10")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    let json: Value = serde_json::from_str(&body)?;
    let records = json.as_array().expect("alert list");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["label"], "Fighting");
    assert_eq!(records[1]["label"], "Robbery");

    let (_, body) = api.request("GET", "/alerts?limit=1")?;
    let json: Value = serde_json::from_str(&body)?;
    assert_eq!(json.as_array().map(|a| a.len()), Some(1));

    let (headers, _) = api.request("GET", "/alerts?limit=0")?;
    assert!(headers.starts_with("HTTP/1.1 400"));
    Ok(())
}
