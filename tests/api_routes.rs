use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use presence_kernel::api::{ApiHandle, ApiServer};
use presence_kernel::config::{SharedTunables, Tunables};
use presence_kernel::frame::Frame;
use presence_kernel::ingest::CameraProperties;
use presence_kernel::notify::Notifier;
use presence_kernel::pipeline::PipelineShared;

fn start(classifier_available: bool) -> (Arc<PipelineShared>, ApiHandle) {
    let shared = PipelineShared::new(
        SharedTunables::new(Tunables::default(), classifier_available),
        CameraProperties::new(),
        Notifier::disabled(),
    );
    let handle = ApiServer::new("127.0.0.1:0", shared.clone())
        .spawn()
        .expect("spawn api");
    (shared, handle)
}

fn request(addr: SocketAddr, method: &str, path: &str) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(
        stream,
        "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        method, path
    )
    .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let body = raw[split + 4..].to_vec();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    (status, head, body)
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).expect("json body")
}

#[test]
fn health_status_and_unknown_routes() {
    let (_shared, handle) = start(false);
    let addr = handle.addr;

    let (status, _, body) = request(addr, "GET", "/health");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["status"], "ok");

    let (status, head, body) = request(addr, "GET", "/status");
    assert_eq!(status, 200);
    assert!(head.contains("application/json"));
    let status_json = json(&body);
    assert_eq!(status_json["state"], "absent");
    assert_eq!(status_json["active_video_feeds"], 0);
    assert_eq!(status_json["frames_processed"], 0);
    assert!(status_json["source"].is_null());

    let (status, head, body) = request(addr, "GET", "/");
    assert_eq!(status, 200);
    assert!(head.contains("text/html"));
    assert!(String::from_utf8_lossy(&body).contains("/video_feed"));

    assert_eq!(request(addr, "GET", "/nope").0, 404);
    assert_eq!(request(addr, "POST", "/config").0, 405);

    handle.stop().unwrap();
}

#[test]
fn config_patches_are_atomic() {
    let (shared, handle) = start(false);
    let addr = handle.addr;

    let (status, _, body) = request(addr, "GET", "/config?threshold=30&min_area=200&exclude_mask=0,0,10,10");
    assert_eq!(status, 200);
    let cfg = json(&body);
    assert_eq!(cfg["motion"]["threshold"], 30);
    assert_eq!(cfg["motion"]["min_area"], 200);
    assert_eq!(cfg["motion"]["exclude_mask"], serde_json::json!([0, 0, 10, 10]));
    assert_eq!(shared.tunables.snapshot().motion.threshold, 30);

    // One bad value rejects the whole patch.
    let (status, _, body) = request(addr, "GET", "/config?threshold=40&min_area=lots");
    assert_eq!(status, 400);
    assert!(json(&body)["error"].as_str().unwrap().contains("min_area"));
    assert_eq!(shared.tunables.snapshot().motion.threshold, 30);

    let (status, _, _) = request(addr, "GET", "/config?detection_enabled=true");
    assert_eq!(status, 400);
    assert!(!shared.tunables.snapshot().presence.detection_enabled);

    let (status, _, _) = request(addr, "GET", "/config?reset_bg_model=1");
    assert_eq!(status, 200);
    assert!(shared.tunables.take_reset_request());

    let (status, _, body) = request(addr, "GET", "/config");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["video_feed_fps"], 5.0);

    handle.stop().unwrap();
}

#[test]
fn camera_properties_round_trip() {
    let (shared, handle) = start(false);
    let addr = handle.addr;

    let (status, _, body) = request(addr, "GET", "/camconfig?iso=400&awb_mode=sunlight");
    assert_eq!(status, 200);
    let props = json(&body);
    assert_eq!(props["iso"], 400);
    assert_eq!(props["awb_mode"], "sunlight");

    let (status, _, _) = request(addr, "GET", "/camconfig?iso=99999");
    assert_eq!(status, 400);
    assert_eq!(json(&request(addr, "GET", "/camconfig").2)["iso"], 400);
    assert_eq!(
        shared.camera.get("awb_mode").map(|v| v.to_string()),
        Some("sunlight".to_string())
    );

    handle.stop().unwrap();
}

#[test]
fn image_is_unavailable_until_a_frame_is_published() {
    let (shared, handle) = start(false);
    let addr = handle.addr;

    assert_eq!(request(addr, "GET", "/image").0, 503);

    shared.relay.publish(Frame::filled(32, 24, [10, 120, 200], 1));
    let (status, head, body) = request(addr, "GET", "/image");
    assert_eq!(status, 200);
    assert!(head.contains("image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    let decoded = image::load_from_memory(&body).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 24));

    handle.stop().unwrap();
}

#[test]
fn video_feed_streams_jpeg_parts() {
    let (shared, handle) = start(false);
    let addr = handle.addr;
    shared.relay.publish(Frame::filled(32, 24, [200, 30, 30], 1));

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !raw.windows(2).any(|w| w == [0xFF, 0xD9]) {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "feed closed early");
        raw.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("--frame\r\nContent-Type: image/jpeg"));
    assert_eq!(shared.active_video_feeds(), 1);

    handle.stop().unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && shared.active_video_feeds() > 0 {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(shared.active_video_feeds(), 0);
}
