use crate::pipeline::{FrameStream, MULTIPART_CONTENT_TYPE};
use crate::service::{WatchService, DEFAULT_ALERT_LIMIT};
use crate::CameraId;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open viewer streams end when their pipelines stop.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<WatchService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<WatchService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;
        log::info!("camera api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let service = self.service;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, service, shutdown_thread) {
                log::error!("camera api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    service: Arc<WatchService>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let service = service.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &service) {
                            log::warn!("camera api request failed: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("camera api could not spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Cameras,
    Alerts,
    Stream(CameraId),
    Stats(CameraId),
    Stop(CameraId),
    StopAll,
    MethodNotAllowed,
    NotFound,
}

fn route(method: &str, path: &str) -> Route {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let (expected, route) = match segments.as_slice() {
        ["health"] => ("GET", Route::Health),
        ["cameras"] => ("GET", Route::Cameras),
        ["alerts"] => ("GET", Route::Alerts),
        ["stop"] => ("POST", Route::StopAll),
        ["stream", id] => match id.parse() {
            Ok(id) => ("GET", Route::Stream(id)),
            Err(_) => return Route::NotFound,
        },
        ["stats", id] => match id.parse() {
            Ok(id) => ("GET", Route::Stats(id)),
            Err(_) => return Route::NotFound,
        },
        ["stop", id] => match id.parse() {
            Ok(id) => ("POST", Route::Stop(id)),
            Err(_) => return Route::NotFound,
        },
        _ => return Route::NotFound,
    };
    if method == expected {
        route
    } else {
        Route::MethodNotAllowed
    }
}

fn handle_connection(mut stream: TcpStream, service: &WatchService) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match route(&request.method, &request.path) {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::Cameras => write_json(&mut stream, 200, &service.active_cameras()),
        Route::Alerts => match request.alert_query() {
            Ok((camera_id, limit)) => {
                let alerts = service.recent_alerts(camera_id, limit);
                respond_or_500(&mut stream, alerts)
            }
            Err(err) => {
                log::debug!("bad alert query {}: {}", request.raw_path, err);
                write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)
            }
        },
        Route::Stats(camera_id) => match service.status(camera_id) {
            Ok(Some(status)) => write_json(&mut stream, 200, &status),
            Ok(None) => write_json_response(&mut stream, 404, r#"{"error":"camera_not_found"}"#),
            Err(err) => internal_error(&mut stream, err),
        },
        Route::Stop(camera_id) => match service.stop(camera_id) {
            Ok(_) => write_no_content(&mut stream),
            Err(err) => internal_error(&mut stream, err),
        },
        Route::StopAll => match service.stop_all() {
            Ok(_) => write_no_content(&mut stream),
            Err(err) => internal_error(&mut stream, err),
        },
        Route::Stream(camera_id) => match service.stream(camera_id) {
            Ok(Some(frames)) => serve_stream(&mut stream, frames),
            Ok(None) => write_json_response(&mut stream, 404, r#"{"error":"camera_not_found"}"#),
            Err(err) => internal_error(&mut stream, err),
        },
        Route::MethodNotAllowed => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        Route::NotFound => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Write multipart parts until the pipeline stops or the viewer goes away.
fn serve_stream(stream: &mut TcpStream, frames: FrameStream) -> Result<()> {
    let camera_id = frames.camera_id();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        MULTIPART_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;
    let mut sent: u64 = 0;
    for part in frames {
        if let Err(err) = stream.write_all(&part).and_then(|_| stream.flush()) {
            log::debug!(
                "camera={} viewer disconnected after {} frames: {}",
                camera_id,
                sent,
                err
            );
            return Ok(());
        }
        sent += 1;
    }
    log::debug!("camera={} stream ended after {} frames", camera_id, sent);
    Ok(())
}

fn respond_or_500<T: Serialize>(stream: &mut TcpStream, value: Result<T>) -> Result<()> {
    match value {
        Ok(value) => write_json(stream, 200, &value),
        Err(err) => internal_error(stream, err),
    }
}

fn internal_error(stream: &mut TcpStream, err: anyhow::Error) -> Result<()> {
    log::error!("camera api internal error: {:#}", err);
    write_json_response(stream, 500, r#"{"error":"internal"}"#)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
    })
}

fn write_json<T: Serialize + ?Sized>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_no_content(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(b"HTTP/1.1 204 No Content\r\nCache-Control: no-store\r\n\r\n")?;
    Ok(())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<&str> {
        let query = self.raw_path.split_once('?')?.1;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// `camera` and `limit` for the alert feed.
    fn alert_query(&self) -> Result<(Option<CameraId>, usize)> {
        let camera_id = match self.query_param("camera") {
            Some(raw) => Some(
                raw.parse::<CameraId>()
                    .map_err(|_| anyhow!("camera must be a numeric id"))?,
            ),
            None => None,
        };
        let limit = match self.query_param("limit") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| anyhow!("limit must be a positive integer"))?,
            None => DEFAULT_ALERT_LIMIT,
        };
        if limit == 0 {
            return Err(anyhow!("limit must be a positive integer"));
        }
        Ok((camera_id, limit))
    }
}
