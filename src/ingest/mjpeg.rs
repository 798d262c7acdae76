//! HTTP MJPEG/JPEG camera source.
//!
//! Connects to cameras that serve `multipart/x-mixed-replace` MJPEG, or a single JPEG
//! snapshot per request, and decodes each JPEG in-memory.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Instant;

use url::Url;

use super::{frame_interval, FrameSource, SourceStats};
use crate::codec::decode_jpeg;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct MjpegSource {
    url: String,
    target_fps: u32,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    read_errors: u64,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(url: &str, target_fps: u32) -> Result<Self> {
        let parsed = Url::parse(url).context("parse camera url")?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported mjpeg scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        Ok(Self {
            url: url.to_string(),
            target_fps,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
            read_errors: 0,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        let response = ureq::get(&self.url)
            .call()
            .with_context(|| format!("connect to camera stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegReader::new(reader)));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        log::info!("MjpegSource: connected to {}", self.url);
        Ok(())
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("mjpeg source not connected; call connect() first"))?;
        let min_interval = frame_interval(self.target_fps);
        loop {
            let jpeg = match stream {
                HttpStream::Mjpeg(reader) => reader.read_next_jpeg(),
                HttpStream::SingleJpeg => fetch_single_jpeg(&self.url),
            }?;

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < min_interval {
                    continue;
                }
            }
            self.last_frame_at = Some(now);
            return Ok(jpeg);
        }
    }
}

impl FrameSource for MjpegSource {
    fn read_frame(&mut self) -> Result<Frame> {
        let frame = self.next_jpeg().and_then(|jpeg| decode_jpeg(&jpeg));
        match frame {
            Ok(frame) => {
                self.frame_count += 1;
                Ok(frame)
            }
            Err(err) => {
                self.read_errors += 1;
                Err(err)
            }
        }
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("MjpegSource: released {}", self.url);
        }
    }

    fn is_healthy(&self) -> bool {
        self.stream.is_some()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_errors: self.read_errors,
            source: self.url.clone(),
        }
    }
}

/// Splits a multipart MJPEG byte stream into individual JPEG images.
struct MjpegReader {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Locate the first complete SOI..EOI span.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
