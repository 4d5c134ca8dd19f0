use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tempfile::tempdir;

use detection_stream::api::{ApiConfig, ApiHandle, ApiServer};
use detection_stream::session::SessionOptions;
use detection_stream::{BackendRegistry, DetectionHistory, Frame, StreamEncoder};

fn encode_query(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn request(addr: std::net::SocketAddr, method: &str, target: &str) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(20)))?;
    let request = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes())?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    Ok((headers, response[split..].to_vec()))
}

fn count_parts(body: &[u8]) -> usize {
    body.windows(9).filter(|w| w == b"--frame\r\n").count()
}

struct TestApi {
    history: DetectionHistory,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(configure: impl FnOnce(&mut ApiConfig)) -> Result<Self> {
        let mut api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            camera: "stub://cam?fps=0&frames=2&width=16&height=8".to_string(),
            session: SessionOptions {
                pacing: Duration::ZERO,
                ..SessionOptions::default()
            },
            ..ApiConfig::default()
        };
        configure(&mut api_config);
        let history = DetectionHistory::default();
        let api_handle =
            ApiServer::new(api_config, history.clone(), BackendRegistry::with_stub()).spawn()?;
        Ok(Self {
            history,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_endpoint_reports_ok() -> Result<()> {
    let api = TestApi::new(|_| {})?;
    let (headers, body) = request(api.addr(), "GET", "/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, br#"{"status":"ok"}"#);
    Ok(())
}

#[test]
fn detections_start_empty() -> Result<()> {
    let api = TestApi::new(|_| {})?;
    let (headers, body) = request(api.addr(), "GET", "/get_detections")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("application/json"));
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value, Value::Array(vec![]));
    Ok(())
}

#[test]
fn file_feed_streams_annotated_frames_and_records_detections() -> Result<()> {
    let api = TestApi::new(|_| {})?;
    let target = format!(
        "/video_file_feed?file_path={}",
        encode_query("stub://clip?frames=3&width=16&height=8")
    );
    let (headers, body) = request(api.addr(), "GET", &target)?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(headers.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(count_parts(&body), 3);

    let (_, body) = request(api.addr(), "GET", "/get_detections")?;
    let value: Value = serde_json::from_slice(&body)?;
    let records = value.as_array().expect("detections array");
    assert_eq!(records.len(), 3);
    for record in records {
        assert_eq!(record["label"], "object");
        let confidence = record["confidence"].as_f64().expect("confidence");
        assert!((confidence - 0.9).abs() < 1e-6);
        assert!(record["timestamp"].as_f64().expect("timestamp") > 1_600_000_000.0);
    }
    assert_eq!(api.history.len(), 3);
    Ok(())
}

#[test]
fn raw_camera_feed_does_not_record() -> Result<()> {
    let api = TestApi::new(|_| {})?;
    let (headers, body) = request(api.addr(), "GET", "/video_feed?mode=raw")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(count_parts(&body), 2);
    assert!(api.history.is_empty());

    let (_, body) = request(api.addr(), "GET", "/video_feed")?;
    assert_eq!(count_parts(&body), 2);
    assert_eq!(api.history.len(), 2);
    Ok(())
}

#[test]
fn unavailable_camera_yields_empty_stream() -> Result<()> {
    let api = TestApi::new(|cfg| cfg.camera = "/dev/video-does-not-exist".to_string())?;
    let (headers, body) = request(api.addr(), "GET", "/video_feed")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("multipart/x-mixed-replace"));
    assert_eq!(count_parts(&body), 0);
    assert!(api.history.is_empty());
    Ok(())
}

#[test]
fn missing_file_is_not_found() -> Result<()> {
    let api = TestApi::new(|_| {})?;
    for target in [
        "/video_file_feed?file_path=%2Fno%2Fsuch%2Fclip.mp4",
        "/video_file_feed",
        "/video_file_feed?file_path=",
    ] {
        let (headers, body) = request(api.addr(), "GET", target)?;
        assert!(headers.contains("404 Not Found"), "{target}: {headers}");
        assert_eq!(body, b"File not found");
    }
    assert!(api.history.is_empty());
    Ok(())
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
#[test]
fn existing_file_without_decoder_is_unsupported_not_missing() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("clip.mp4");
    std::fs::write(&path, b"\x00\x00\x00\x18ftypmp42")?;

    let api = TestApi::new(|_| {})?;
    let target = format!(
        "/video_file_feed?file_path={}",
        encode_query(&path.to_string_lossy())
    );
    let (headers, body) = request(api.addr(), "GET", &target)?;
    assert!(headers.contains("415 Unsupported Media Type"), "{headers}");
    assert_eq!(body, b"Unsupported video format");
    assert!(api.history.is_empty());
    Ok(())
}

#[test]
fn mjpeg_file_on_disk_is_streamed() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("flight.mjpg");
    let encoder = StreamEncoder::new(85);
    let mut bytes = Vec::new();
    for shade in [20u8, 200] {
        let frame = Frame::from_rgb(vec![shade; 24 * 12 * 3], 24, 12, 1)?;
        bytes.extend(encoder.encode_jpeg(&frame)?);
    }
    std::fs::write(&path, bytes)?;

    let api = TestApi::new(|_| {})?;
    let target = format!(
        "/video_file_feed?file_path={}",
        encode_query(&path.to_string_lossy())
    );
    let (headers, body) = request(api.addr(), "GET", &target)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(count_parts(&body), 2);
    assert_eq!(api.history.len(), 2);
    Ok(())
}

#[test]
fn unknown_routes_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(|_| {})?;
    let (headers, body) = request(api.addr(), "GET", "/upload")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body, br#"{"error":"not_found"}"#);

    let (headers, body) = request(api.addr(), "POST", "/get_detections")?;
    assert!(headers.contains("405 Method Not Allowed"));
    assert_eq!(body, br#"{"error":"method_not_allowed"}"#);
    Ok(())
}

#[test]
fn session_limit_returns_service_unavailable() -> Result<()> {
    let api = TestApi::new(|cfg| {
        cfg.camera = "stub://cam?fps=20&width=8&height=8".to_string();
        cfg.max_sessions = 1;
    })?;

    let mut first = TcpStream::connect(api.addr())?;
    first.set_read_timeout(Some(Duration::from_secs(10)))?;
    first.write_all(b"GET /video_feed?mode=raw HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut buf = [0u8; 256];
    let n = first.read(&mut buf)?;
    assert!(String::from_utf8_lossy(&buf[..n]).contains("200 OK"));

    let (headers, body) = request(api.addr(), "GET", "/video_feed?mode=raw")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert_eq!(body, br#"{"error":"too_many_sessions"}"#);

    // Non-stream routes are not limited.
    let (headers, _) = request(api.addr(), "GET", "/health")?;
    assert!(headers.contains("200 OK"));

    drop(first);
    Ok(())
}
