//! HTTP camera source.
//!
//! Reads `multipart/x-mixed-replace` MJPEG streams, or polls a single-JPEG snapshot URL when
//! the server answers with a plain image. A dropped stream is reconnected on the next read.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::ops::Range;
use std::time::{Duration, Instant};

use super::{CameraProperties, FrameSource, SourceStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

pub struct MjpegSource {
    url: String,
    camera: CameraProperties,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    running: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl MjpegSource {
    pub fn new(url: &str, camera: CameraProperties) -> Self {
        Self {
            url: url.to_string(),
            camera,
            agent: ureq::AgentBuilder::new()
                .timeout_connect(CONNECT_TIMEOUT)
                .timeout_read(Duration::from_secs(10))
                .build(),
            stream: None,
            running: false,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to camera stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
            log::info!("camera {}: mjpeg stream connected", self.url);
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
            log::info!("camera {}: polling single jpeg snapshots", self.url);
        }
        Ok(())
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("camera stream not connected"))?;
        match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg(),
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.agent, &self.url),
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if self.stream.is_none() {
            self.connect()?;
        }
        let min_interval = Duration::from_secs_f64(1.0 / self.camera.framerate());
        loop {
            let jpeg = self.next_jpeg()?;
            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < min_interval {
                    if matches!(self.stream, Some(HttpStream::SingleJpeg)) {
                        std::thread::sleep(min_interval - now.duration_since(last));
                    }
                    continue;
                }
            }
            self.frame_count += 1;
            self.last_frame_at = Some(now);
            return decode_jpeg(&jpeg, self.frame_count);
        }
    }
}

impl FrameSource for MjpegSource {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        if let Err(err) = self.connect() {
            // The first read retries; a camera that boots after us is not fatal.
            log::warn!("camera {} not reachable yet: {:#}", self.url, err);
            self.last_error = Some(err.to_string());
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.running {
            return Err(anyhow!("camera source {} not started", self.url));
        }
        match self.read_frame() {
            Ok(frame) => {
                self.last_error = None;
                Ok(Some(frame))
            }
            Err(err) => {
                self.stream = None;
                self.last_error = Some(err.to_string());
                std::thread::sleep(RECONNECT_BACKOFF);
                Err(err)
            }
        }
    }

    fn stop(&mut self) {
        self.running = false;
        self.stream = None;
    }

    fn capture_fps(&self) -> f64 {
        self.camera.framerate()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
            healthy: self.running && self.last_error.is_none(),
        }
    }
}

/// Splits a `multipart/x-mixed-replace` body into JPEG payloads.
///
/// Parts announcing a `Content-Length` are cut at exactly that length. Parts without one, and
/// cameras that send bare JPEGs back to back, are split on the SOI/EOI markers.
struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
}

/// Where the next payload sits in the buffer and how much of the buffer it uses up.
#[derive(Debug, PartialEq)]
struct PartSpan {
    payload: Range<usize>,
    consumed: usize,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            chunk: vec![0u8; 8192],
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(span) = next_part(&self.buffer)? {
                let jpeg = self.buffer[span.payload].to_vec();
                self.buffer.drain(..span.consumed);
                return Ok(jpeg);
            }
            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let read = self.reader.read(&mut self.chunk).context("read mjpeg chunk")?;
        if read == 0 {
            return Err(anyhow!("mjpeg stream ended"));
        }
        self.buffer.extend_from_slice(&self.chunk[..read]);
        if self.buffer.len() > MAX_JPEG_BYTES * 2 {
            // Lost sync; keep the tail in case a marker straddles the cut.
            let drain_len = self.buffer.len() - 2;
            self.buffer.drain(..drain_len);
        }
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Locate the next complete payload, or `None` when more bytes are needed.
fn next_part(buffer: &[u8]) -> Result<Option<PartSpan>> {
    let header_end = find(buffer, b"\r\n\r\n");
    let soi = find(buffer, &[0xFF, 0xD8]);
    let header_end = match (header_end, soi) {
        (Some(header_end), Some(soi)) if soi < header_end => None,
        (header_end, _) => header_end,
    };
    let Some(header_end) = header_end else {
        return Ok(find_jpeg_bounds(buffer).map(|(start, end)| PartSpan {
            payload: start..end,
            consumed: end,
        }));
    };

    let body_start = header_end + 4;
    match content_length(&buffer[..header_end])? {
        Some(len) => {
            let end = body_start + len;
            Ok((buffer.len() >= end).then(|| PartSpan {
                payload: body_start..end,
                consumed: end,
            }))
        }
        None => Ok(find_jpeg_bounds(&buffer[body_start..]).map(|(start, end)| PartSpan {
            payload: body_start + start..body_start + end,
            consumed: body_start + end,
        })),
    }
}

fn content_length(header: &[u8]) -> Result<Option<usize>> {
    let text = String::from_utf8_lossy(header);
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("content-length") {
            continue;
        }
        let len: usize = value
            .trim()
            .parse()
            .with_context(|| format!("bad part Content-Length '{}'", value.trim()))?;
        if len > MAX_JPEG_BYTES {
            return Err(anyhow!("mjpeg part of {} bytes exceeds limit", len));
        }
        return Ok(Some(len));
    }
    Ok(None)
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
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

fn decode_jpeg(bytes: &[u8], sequence: u64) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Ok(Frame::new(image.into_rgb8(), sequence))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
