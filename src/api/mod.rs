//! HTTP surface.
//!
//! | route         | purpose                                                     |
//! |---------------|-------------------------------------------------------------|
//! | `/`           | index page embedding the live feed                          |
//! | `/health`     | liveness                                                    |
//! | `/status`     | occupancy state and pipeline counters (JSON)                |
//! | `/config`     | runtime settings; query parameters patch them atomically    |
//! | `/camconfig`  | camera properties; query parameters patch them atomically   |
//! | `/image`      | latest annotated frame as JPEG                              |
//! | `/video_feed` | `multipart/x-mixed-replace` JPEG stream, rate limited       |
//!
//! Each connection gets its own thread so long-lived feeds never block other requests.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::JPEG_QUALITY;
use crate::pipeline::PipelineShared;
use crate::rate::RateLimiter;

const MAX_REQUEST_BYTES: usize = 8192;
const FEED_WAIT: Duration = Duration::from_millis(500);
const FEED_BOUNDARY: &str = "frame";

const INDEX_HTML: &str = "<!doctype html>\n<html><head><title>presenced</title></head>\n\
<body><h1>presenced</h1>\n<p><a href=\"/status\">status</a> | <a href=\"/config\">config</a> | \
<a href=\"/camconfig\">camera</a> | <a href=\"/image\">snapshot</a></p>\n\
<img src=\"/video_feed\" alt=\"live feed\">\n</body></html>\n";

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting and end open video feeds.
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
    addr: String,
    shared: Arc<PipelineShared>,
}

impl ApiServer {
    pub fn new(addr: impl Into<String>, shared: Arc<PipelineShared>) -> Self {
        Self {
            addr: addr.into(),
            shared,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let shared = self.shared;
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, shared, shutdown_thread) {
                    log::error!("http api stopped: {}", err);
                }
            })?;
        log::info!("http api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    shared: Arc<PipelineShared>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let shared = Arc::clone(&shared);
                let shutdown = Arc::clone(&shutdown);
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &shared, shutdown) {
                            log::debug!("http request ended: {:#}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("could not spawn connection handler: {}", err);
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

fn handle_connection(
    mut stream: TcpStream,
    shared: &Arc<PipelineShared>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match request.path.as_str() {
        "/" => write_response(&mut stream, 200, "text/html; charset=utf-8", INDEX_HTML.as_bytes()),
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/status" => write_json(&mut stream, 200, &shared.status()),
        "/config" => {
            let pairs = request.query_pairs();
            match shared
                .tunables
                .apply(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            {
                Ok(tunables) => write_json(&mut stream, 200, &tunables),
                Err(err) => write_error(&mut stream, 400, &err),
            }
        }
        "/camconfig" => {
            let pairs = request.query_pairs();
            match shared
                .camera
                .apply(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            {
                Ok(()) => write_json(&mut stream, 200, &shared.camera.snapshot()),
                Err(err) => write_error(&mut stream, 400, &err),
            }
        }
        "/image" => match shared.relay.latest() {
            Some(frame) => {
                let jpeg = frame.encode_jpeg(JPEG_QUALITY)?;
                write_response(&mut stream, 200, "image/jpeg", &jpeg)
            }
            None => write_json_response(&mut stream, 503, r#"{"error":"no_frame_yet"}"#),
        },
        "/video_feed" => stream_video(&mut stream, shared, shutdown),
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Serve the relay as MJPEG until the client leaves or the server stops.
fn stream_video(
    stream: &mut TcpStream,
    shared: &Arc<PipelineShared>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let _feed = shared.feed_guard();
    let max_feed_fps = shared.tunables.snapshot().video_feed_fps;
    let mut limiter = RateLimiter::new(max_feed_fps, shared.capture_fps(), shutdown);
    let mut reader = shared.relay.reader();

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        FEED_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;

    while limiter.should_continue() && !shared.is_stopping() {
        let Some(frame) = reader.wait_take(FEED_WAIT) else {
            continue;
        };
        let jpeg = match frame.encode_jpeg(JPEG_QUALITY) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!("video feed: {:#}", err);
                continue;
            }
        };
        let part = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            FEED_BOUNDARY,
            jpeg.len()
        );
        stream.write_all(part.as_bytes())?;
        stream.write_all(&jpeg)?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
    }
    Ok(())
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
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (raw_path.to_string(), String::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        query,
    })
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_error(stream: &mut TcpStream, status: u16, err: &anyhow::Error) -> Result<()> {
    log::warn!("rejected update: {:#}", err);
    write_json(
        stream,
        status,
        &serde_json::json!({ "error": format!("{:#}", err) }),
    )
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
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
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
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
    query: String,
}

impl HttpRequest {
    fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .into_owned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_are_decoded() {
        let request = HttpRequest {
            method: "GET".to_string(),
            path: "/config".to_string(),
            query: "threshold=30&exclude_mask=1%2C2%2C3%2C4&send_mqtt=off".to_string(),
        };
        assert_eq!(
            request.query_pairs(),
            vec![
                ("threshold".to_string(), "30".to_string()),
                ("exclude_mask".to_string(), "1,2,3,4".to_string()),
                ("send_mqtt".to_string(), "off".to_string()),
            ]
        );
    }
}
