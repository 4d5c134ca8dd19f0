//! Per-client streaming session.
//!
//! A session owns one frame source and, in processed mode, one detector. It
//! moves through `Opening -> Streaming -> Closed`, with `Error` entered when
//! the source fails mid-stream. Each iteration reads a frame, optionally runs
//! detection and records the results in the shared history, JPEG-encodes the
//! frame and writes it to the sink as one multipart chunk.
//!
//! File-backed sessions sleep a fixed pacing interval after every frame so
//! clips play back at roughly real time; live sources are never paced.
//!
//! A sink write failure means the client went away: the session closes
//! cleanly and releases its source. An external cancel flag is checked once
//! per iteration.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::{Detection, DetectorBackend};
use crate::encode::{StreamEncoder, DEFAULT_JPEG_QUALITY};
use crate::error::{StreamError, StreamResult};
use crate::frame::Frame;
use crate::history::{DetectionHistory, DetectionRecord};
use crate::ingest::{open_source, CaptureSettings, FrameSource, SourceOrigin};

/// Pacing applied to file sources, roughly 30 fps.
pub const DEFAULT_PACING: Duration = Duration::from_millis(33);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Called with every frame's detections in processed mode.
pub type DetectionObserver = Box<dyn FnMut(&Frame, &[Detection]) + Send>;

/// Whether frames go through the detector before being streamed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamMode {
    Raw,
    #[default]
    Processed,
}

impl StreamMode {
    /// Lenient parse for the `mode` query parameter: absent or `processed`
    /// selects processed mode, any other value streams raw frames.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            None => StreamMode::Processed,
            Some(v) if v.eq_ignore_ascii_case("processed") => StreamMode::Processed,
            Some(_) => StreamMode::Raw,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Raw => "raw",
            StreamMode::Processed => "processed",
        }
    }
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(StreamMode::Raw),
            "processed" => Ok(StreamMode::Processed),
            other => Err(format!("unknown stream mode '{other}' (expected raw or processed)")),
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Streaming,
    Closed,
    Error,
}

/// Why a session stopped streaming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    EndOfStream,
    ClientDisconnected,
    Cancelled,
    FrameLimit,
    SourceFailed,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SessionEnd::EndOfStream => "end of stream",
            SessionEnd::ClientDisconnected => "client disconnected",
            SessionEnd::Cancelled => "cancelled",
            SessionEnd::FrameLimit => "frame limit reached",
            SessionEnd::SourceFailed => "source failed",
        };
        f.write_str(reason)
    }
}

/// Counters for a finished session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub id: u64,
    pub frames_emitted: u64,
    /// Frames read but not emitted because encoding failed.
    pub frames_skipped: u64,
    pub detections_recorded: u64,
    pub end: SessionEnd,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub mode: StreamMode,
    /// Sleep after each frame from a non-live source.
    pub pacing: Duration,
    pub jpeg_quality: u8,
    /// Stop after this many frames have been read.
    pub max_frames: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: StreamMode::Processed,
            pacing: DEFAULT_PACING,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_frames: None,
        }
    }
}

/// One streaming session, bound to a single client.
pub struct StreamingSession {
    id: u64,
    origin: String,
    state: SessionState,
    source: Option<Box<dyn FrameSource>>,
    detector: Option<Box<dyn DetectorBackend>>,
    history: DetectionHistory,
    options: SessionOptions,
    encoder: StreamEncoder,
    cancel: Arc<AtomicBool>,
    observer: Option<DetectionObserver>,
}

impl StreamingSession {
    /// Open the source for `origin`.
    ///
    /// Fails with `SourceUnavailable` when the device or file cannot be
    /// opened; nothing is recorded in that case.
    pub fn open(
        origin: &SourceOrigin,
        capture: &CaptureSettings,
        options: SessionOptions,
        history: DetectionHistory,
        detector: Option<Box<dyn DetectorBackend>>,
    ) -> StreamResult<Self> {
        let source = open_source(origin, capture).map_err(|err| {
            log::warn!("session: cannot open {}: {}", origin, err);
            err
        })?;
        Ok(Self::from_source(source, options, history, detector))
    }

    /// Wrap an already-open source.
    pub fn from_source(
        source: Box<dyn FrameSource>,
        options: SessionOptions,
        history: DetectionHistory,
        detector: Option<Box<dyn DetectorBackend>>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            origin: source.describe(),
            state: SessionState::Opening,
            source: Some(source),
            detector,
            history,
            encoder: StreamEncoder::new(options.jpeg_quality),
            options,
            cancel: Arc::new(AtomicBool::new(false)),
            observer: None,
        }
    }

    /// Stop the session at the next iteration once `cancel` is set.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Observe detections as they are recorded, e.g. to print them.
    pub fn on_detections<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&Frame, &[Detection]) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> StreamMode {
        self.options.mode
    }

    /// Stream frames into `sink` until the source ends, the client goes
    /// away, the frame limit is hit or the session is cancelled.
    ///
    /// A session streams once; calling `run` again fails with
    /// `SessionClosed`.
    pub fn run<W: Write>(&mut self, sink: &mut W) -> StreamResult<SessionReport> {
        if self.state != SessionState::Opening {
            return Err(StreamError::SessionClosed(self.id));
        }
        let Some(mut source) = self.source.take() else {
            return Err(StreamError::SessionClosed(self.id));
        };

        if self.options.mode == StreamMode::Processed && self.detector.is_none() {
            log::warn!(
                "session {}: processed mode without a detector, streaming raw frames",
                self.id
            );
        }

        self.state = SessionState::Streaming;
        let live = source.is_live();
        let started = Instant::now();
        log::info!(
            "session {}: streaming {} ({} mode{})",
            self.id,
            self.origin,
            self.options.mode,
            if live { ", live" } else { "" }
        );

        let mut report = SessionReport {
            id: self.id,
            frames_emitted: 0,
            frames_skipped: 0,
            detections_recorded: 0,
            end: SessionEnd::EndOfStream,
        };
        let mut frames_read = 0u64;

        report.end = loop {
            if self.cancel.load(Ordering::SeqCst) {
                break SessionEnd::Cancelled;
            }
            if self.options.max_frames.is_some_and(|max| frames_read >= max) {
                break SessionEnd::FrameLimit;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break SessionEnd::EndOfStream,
                Err(err) => {
                    log::warn!("session {}: {}", self.id, err);
                    self.state = SessionState::Error;
                    break SessionEnd::SourceFailed;
                }
            };
            frames_read += 1;

            let frame = self.process(frame, &mut report);
            match self.encoder.encode_chunk(&frame) {
                Ok(chunk) => {
                    if sink.write_all(&chunk).and_then(|_| sink.flush()).is_err() {
                        break SessionEnd::ClientDisconnected;
                    }
                    report.frames_emitted += 1;
                }
                Err(err) => {
                    log::warn!("session {}: frame {} skipped: {}", self.id, frame.sequence, err);
                    report.frames_skipped += 1;
                }
            }

            if !live && !self.options.pacing.is_zero() {
                std::thread::sleep(self.options.pacing);
            }
        };

        source.close();
        drop(source);
        self.state = SessionState::Closed;

        log::info!(
            "session {}: closed after {} frames in {:.1}s ({}; {} detections recorded)",
            self.id,
            report.frames_emitted,
            started.elapsed().as_secs_f64(),
            report.end,
            report.detections_recorded
        );
        Ok(report)
    }

    /// Run detection in processed mode. On detector failure the raw frame
    /// is streamed and nothing is recorded.
    fn process(&mut self, frame: Frame, report: &mut SessionReport) -> Frame {
        if self.options.mode == StreamMode::Raw {
            return frame;
        }
        let Some(detector) = self.detector.as_mut() else {
            return frame;
        };

        match detector.detect(&frame) {
            Ok(output) => {
                let now = crate::now_epoch_secs();
                let recorded = self.history.append_batch(
                    output
                        .detections
                        .iter()
                        .map(|d| DetectionRecord::new(d.label.clone(), d.confidence, now)),
                );
                report.detections_recorded += recorded as u64;
                if let Some(observer) = self.observer.as_mut() {
                    observer(&frame, &output.detections);
                }
                output.annotated
            }
            Err(err) => {
                log::warn!(
                    "session {}: detector {} failed on frame {}: {:#}",
                    self.id,
                    detector.name(),
                    frame.sequence,
                    err
                );
                frame
            }
        }
    }
}

impl fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSession")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("state", &self.state)
            .field("mode", &self.options.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection, StubBackend};
    use std::io;

    fn clip(frames: u64) -> SourceOrigin {
        SourceOrigin::file(format!("stub://clip?frames={frames}&width=16&height=8"))
    }

    fn unpaced(mode: StreamMode) -> SessionOptions {
        SessionOptions {
            mode,
            pacing: Duration::ZERO,
            ..SessionOptions::default()
        }
    }

    fn two_per_frame() -> Box<dyn DetectorBackend> {
        let bbox = BoundingBox::new(1.0, 1.0, 6.0, 6.0);
        Box::new(StubBackend::repeating(vec![
            Detection::new("person", 0, 0.91, bbox),
            Detection::new("dog", 16, 0.75, bbox),
        ]))
    }

    fn count_parts(body: &[u8]) -> usize {
        body.windows(7).filter(|w| w == b"--frame").count()
    }

    /// File-like source whose second frame is empty and cannot be encoded.
    struct GappedClip {
        next: u64,
    }

    impl FrameSource for GappedClip {
        fn next_frame(&mut self) -> StreamResult<Option<Frame>> {
            self.next += 1;
            let frame = match self.next {
                2 => Frame::from_image(image::RgbImage::new(0, 0), 2),
                1 | 3 => Frame::from_image(image::RgbImage::new(8, 8), self.next),
                _ => return Ok(None),
            };
            Ok(Some(frame))
        }

        fn is_live(&self) -> bool {
            false
        }

        fn describe(&self) -> String {
            "file:gapped".to_string()
        }

        fn stats(&self) -> crate::ingest::SourceStats {
            crate::ingest::SourceStats {
                frames_captured: self.next,
                origin: "gapped".to_string(),
            }
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn mode_query_parsing_is_lenient() {
        assert_eq!(StreamMode::from_query(None), StreamMode::Processed);
        assert_eq!(StreamMode::from_query(Some("PROCESSED")), StreamMode::Processed);
        assert_eq!(StreamMode::from_query(Some("raw")), StreamMode::Raw);
        assert_eq!(StreamMode::from_query(Some("anything")), StreamMode::Raw);
        assert!("anything".parse::<StreamMode>().is_err());
        assert_eq!("Raw".parse::<StreamMode>(), Ok(StreamMode::Raw));
    }

    #[test]
    fn processed_session_records_every_detection_in_order() -> StreamResult<()> {
        let history = DetectionHistory::default();
        let mut session = StreamingSession::open(
            &clip(10),
            &CaptureSettings::default(),
            unpaced(StreamMode::Processed),
            history.clone(),
            Some(two_per_frame()),
        )?;
        assert_eq!(session.state(), SessionState::Opening);

        let mut body = Vec::new();
        let report = session.run(&mut body)?;
        assert_eq!(report.end, SessionEnd::EndOfStream);
        assert_eq!(report.frames_emitted, 10);
        assert_eq!(report.detections_recorded, 20);
        assert_eq!(count_parts(&body), 10);
        assert_eq!(session.state(), SessionState::Closed);

        let labels: Vec<String> = history.snapshot().into_iter().map(|r| r.label).collect();
        let expected: Vec<String> = (0..10)
            .flat_map(|_| ["person".to_string(), "dog".to_string()])
            .collect();
        assert_eq!(labels, expected);
        Ok(())
    }

    #[test]
    fn observer_sees_each_processed_frame() -> StreamResult<()> {
        use std::sync::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut session = StreamingSession::open(
            &clip(3),
            &CaptureSettings::default(),
            unpaced(StreamMode::Processed),
            DetectionHistory::default(),
            Some(two_per_frame()),
        )?
        .on_detections(move |frame, detections| {
            sink.lock().unwrap().push((frame.sequence, detections.len()));
        });
        session.run(&mut Vec::new())?;
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 2), (3, 2)]);
        Ok(())
    }

    #[test]
    fn raw_session_never_touches_history() -> StreamResult<()> {
        let history = DetectionHistory::default();
        let mut session = StreamingSession::open(
            &clip(5),
            &CaptureSettings::default(),
            unpaced(StreamMode::Raw),
            history.clone(),
            Some(two_per_frame()),
        )?;
        let report = session.run(&mut Vec::new())?;
        assert_eq!(report.frames_emitted, 5);
        assert_eq!(report.detections_recorded, 0);
        assert!(history.is_empty());
        Ok(())
    }

    #[test]
    fn detector_failure_falls_back_to_raw_frame() -> StreamResult<()> {
        let history = DetectionHistory::default();
        let mut session = StreamingSession::open(
            &clip(4),
            &CaptureSettings::default(),
            unpaced(StreamMode::Processed),
            history.clone(),
            Some(Box::new(StubBackend::new().failing_every(2))),
        )?;
        let report = session.run(&mut Vec::new())?;
        assert_eq!(report.frames_emitted, 4);
        assert_eq!(report.detections_recorded, 2);
        assert_eq!(history.len(), 2);
        Ok(())
    }

    #[test]
    fn client_disconnect_closes_session() -> StreamResult<()> {
        let mut session = StreamingSession::open(
            &clip(50),
            &CaptureSettings::default(),
            unpaced(StreamMode::Raw),
            DetectionHistory::default(),
            None,
        )?;
        let report = session.run(&mut BrokenPipe)?;
        assert_eq!(report.end, SessionEnd::ClientDisconnected);
        assert_eq!(report.frames_emitted, 0);
        assert_eq!(session.state(), SessionState::Closed);
        Ok(())
    }

    #[test]
    fn unencodable_frame_is_skipped_and_streaming_continues() -> StreamResult<()> {
        let mut session = StreamingSession::from_source(
            Box::new(GappedClip { next: 0 }),
            unpaced(StreamMode::Raw),
            DetectionHistory::default(),
            None,
        );
        let mut body = Vec::new();
        let report = session.run(&mut body)?;
        assert_eq!(report.frames_skipped, 1);
        assert_eq!(report.frames_emitted, 2);
        assert_eq!(report.end, SessionEnd::EndOfStream);
        assert_eq!(count_parts(&body), 2);
        assert_eq!(session.state(), SessionState::Closed);
        Ok(())
    }

    #[test]
    fn closed_session_cannot_run_again() -> StreamResult<()> {
        let mut session = StreamingSession::open(
            &clip(1),
            &CaptureSettings::default(),
            unpaced(StreamMode::Raw),
            DetectionHistory::default(),
            None,
        )?;
        session.run(&mut Vec::new())?;
        assert!(matches!(
            session.run(&mut Vec::new()),
            Err(StreamError::SessionClosed(id)) if id == session.id()
        ));
        Ok(())
    }

    #[test]
    fn cancel_and_frame_limit_stop_an_endless_camera() -> StreamResult<()> {
        let camera = SourceOrigin::device("stub://cam?fps=0&width=8&height=8");
        let options = SessionOptions {
            max_frames: Some(3),
            ..unpaced(StreamMode::Raw)
        };
        let mut limited = StreamingSession::open(
            &camera,
            &CaptureSettings::default(),
            options,
            DetectionHistory::default(),
            None,
        )?;
        let report = limited.run(&mut Vec::new())?;
        assert_eq!((report.end, report.frames_emitted), (SessionEnd::FrameLimit, 3));

        let cancel = Arc::new(AtomicBool::new(true));
        let mut cancelled = StreamingSession::open(
            &camera,
            &CaptureSettings::default(),
            unpaced(StreamMode::Raw),
            DetectionHistory::default(),
            None,
        )?
        .with_cancel(cancel);
        let report = cancelled.run(&mut Vec::new())?;
        assert_eq!((report.end, report.frames_emitted), (SessionEnd::Cancelled, 0));
        Ok(())
    }

    #[test]
    fn missing_file_is_unavailable_and_records_nothing() {
        let history = DetectionHistory::default();
        let result = StreamingSession::open(
            &SourceOrigin::file("/no/such/clip.mp4"),
            &CaptureSettings::default(),
            SessionOptions::default(),
            history.clone(),
            Some(two_per_frame()),
        );
        assert!(matches!(result, Err(ref err) if err.is_source_unavailable()));
        assert!(history.is_empty());
    }
}
