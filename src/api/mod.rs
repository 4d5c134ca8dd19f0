//! Minimal HTTP/1.1 surface for browsers.
//!
//! Routes:
//! - `GET /video_feed?mode=processed|raw`: camera stream
//! - `GET /video_file_feed?file_path=<path>`: file stream, always processed
//! - `GET /get_detections`: JSON snapshot of the detection history
//! - `GET /health`
//!
//! Every connection is served on its own thread, so a slow detector or a
//! stalled client only ever blocks its own stream.

use crate::detect::BackendRegistry;
use crate::history::DetectionHistory;
use crate::ingest::{CaptureSettings, SourceOrigin};
use crate::session::{SessionOptions, StreamMode, StreamingSession};
use crate::{StreamError, MULTIPART_CONTENT_TYPE};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Camera used by `/video_feed`.
    pub camera: String,
    pub capture: CaptureSettings,
    /// Pacing, JPEG quality and frame limit for every session. The mode is
    /// chosen per request.
    pub session: SessionOptions,
    /// Concurrent streams allowed; further stream requests get 503.
    pub max_sessions: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            camera: "/dev/video0".to_string(),
            capture: CaptureSettings::default(),
            session: SessionOptions::default(),
            max_sessions: 8,
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
    /// Stop accepting connections and cancel every running stream.
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
    history: DetectionHistory,
    registry: BackendRegistry,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, history: DetectionHistory, registry: BackendRegistry) -> Self {
        Self {
            cfg,
            history,
            registry,
        }
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

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ServerState {
            cfg: self.cfg,
            history: self.history,
            registry: self.registry,
            active_sessions: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
        });
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, state) {
                log::error!("stream api stopped: {}", err);
            }
        });

        log::info!("stream api listening on http://{}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct ServerState {
    cfg: ApiConfig,
    history: DetectionHistory,
    registry: BackendRegistry,
    active_sessions: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

/// Holds one of the `max_sessions` stream slots until dropped.
struct SessionSlot<'a> {
    active: &'a AtomicUsize,
}

impl<'a> SessionSlot<'a> {
    fn acquire(active: &'a AtomicUsize, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self { active })
    }
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run_api(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state) {
                        log::warn!("stream api request from {} failed: {}", peer, err);
                    }
                });
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

fn handle_connection(mut stream: TcpStream, state: &ServerState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match request.path.as_str() {
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/get_detections" => {
            let payload = serde_json::to_vec(&state.history.snapshot())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/video_feed" => {
            let mode = StreamMode::from_query(request.query("mode"));
            let origin = SourceOrigin::device(&state.cfg.camera);
            serve_stream(stream, state, origin, mode)
        }
        "/video_file_feed" => match request.query("file_path") {
            Some(path) if !path.trim().is_empty() => {
                serve_stream(stream, state, SourceOrigin::file(path), StreamMode::Processed)
            }
            _ => write_response(&mut stream, 404, "text/plain", b"File not found"),
        },
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn serve_stream(
    mut stream: TcpStream,
    state: &ServerState,
    origin: SourceOrigin,
    mode: StreamMode,
) -> Result<()> {
    let Some(_slot) = SessionSlot::acquire(&state.active_sessions, state.cfg.max_sessions) else {
        log::warn!("stream api: session limit {} reached", state.cfg.max_sessions);
        return write_json_response(&mut stream, 503, r#"{"error":"too_many_sessions"}"#);
    };

    let detector = match mode {
        StreamMode::Raw => None,
        StreamMode::Processed => match state.registry.create_default() {
            Ok(detector) => Some(detector),
            Err(err) => {
                let err = StreamError::Detector(format!("{err:#}"));
                log::error!("stream api: {}", err);
                return write_json_response(
                    &mut stream,
                    500,
                    r#"{"error":"detector_unavailable"}"#,
                );
            }
        },
    };

    let options = SessionOptions {
        mode,
        ..state.cfg.session.clone()
    };
    let session = StreamingSession::open(
        &origin,
        &state.cfg.capture,
        options,
        state.history.clone(),
        detector,
    );
    let mut session = match session {
        Ok(session) => session.with_cancel(state.shutdown.clone()),
        Err(err) if err.is_source_unavailable() && !origin.is_live() => {
            log::info!("file session rejected: {}", err);
            return write_response(&mut stream, 404, "text/plain", b"File not found");
        }
        Err(err @ StreamError::UnsupportedFormat { .. }) => {
            log::warn!("file session rejected: {}", err);
            return write_response(&mut stream, 415, "text/plain", b"Unsupported video format");
        }
        Err(err) if err.is_source_unavailable() => {
            // An unavailable camera is an empty stream, not an HTTP error.
            write_stream_header(&mut stream)?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    write_stream_header(&mut stream)?;
    session.run(&mut stream)?;
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
    let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn write_stream_header(stream: &mut TcpStream) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {MULTIPART_CONTENT_TYPE}\r\nCache-Control: no-cache\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        415 => "HTTP/1.1 415 Unsupported Media Type",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
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
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_slots_are_bounded_and_released() {
        let active = AtomicUsize::new(0);
        let first = SessionSlot::acquire(&active, 2).expect("first slot");
        let second = SessionSlot::acquire(&active, 2).expect("second slot");
        assert!(SessionSlot::acquire(&active, 2).is_none());
        drop(first);
        assert!(SessionSlot::acquire(&active, 2).is_some());
        drop(second);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn parses_path_and_decoded_query() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let client = std::thread::spawn(move || -> std::io::Result<()> {
            let mut stream = TcpStream::connect(addr)?;
            stream.write_all(
                b"GET /video_file_feed?file_path=uploads%2Fmy+clip.mp4&x=1 HTTP/1.1\r\nHost: x\r\n\r\n",
            )
        });
        let (mut stream, _) = listener.accept()?;
        let request = read_request(&mut stream)?;
        client.join().expect("client thread")?;
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/video_file_feed");
        assert_eq!(request.query("file_path"), Some("uploads/my clip.mp4"));
        assert_eq!(request.query("mode"), None);
        Ok(())
    }
}
