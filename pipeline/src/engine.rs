//! Frame stream engine.
//!
//! One engine drives one playback of one source:
//! `Opening -> Running -> (Draining | Failed) -> Closed`.
//!
//! Every pulled frame yields exactly one `EncodedFrame`. Only every Nth frame
//! (a processing frame) runs detection, annotation and a fresh encode; the
//! frames in between replay the cached encoding untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use roadwatch_common::config::{DetectorConfig, StreamConfig};
use roadwatch_common::frame::{EncodedFrame, Frame};
use roadwatch_common::position::PositionFix;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::annotate::annotate;
use crate::detector::DetectorAdapter;
use crate::encode::{encode_jpeg, EncodeCache};
use crate::error::{FailureReport, PipelineError};
use crate::hub::{InferenceSummary, MetricsHub};
use crate::position::SimulatedDrift;
use crate::severity;
use crate::snapshot::{SnapshotPolicy, SnapshotRecord};
use crate::source::FrameSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Opening,
    Running,
    Draining,
    Failed,
    Closed,
}

/// Per-playback state, readable from outside while the engine runs.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub phase: StreamPhase,
    /// Number of frames pulled so far, i.e. the index the next frame gets.
    pub frame_index: u64,
    pub frames_emitted: u64,
    /// Detections on the most recent processing frame.
    pub detection_count: usize,
    pub position: Option<PositionFix>,
    pub last_snapshot: Option<SnapshotRecord>,
    pub failure: Option<FailureReport>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            phase: StreamPhase::Opening,
            frame_index: 0,
            frames_emitted: 0,
            detection_count: 0,
            position: None,
            last_snapshot: None,
            failure: None,
        }
    }
}

pub type SharedStreamState = Arc<Mutex<StreamState>>;

pub fn new_shared_state() -> SharedStreamState {
    Arc::new(Mutex::new(StreamState::default()))
}

pub fn read_state(state: &SharedStreamState) -> StreamState {
    state.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Cooperative cancellation shared between the engine and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub skip_interval: u64,
    pub jpeg_quality: u8,
    pub confidence: f32,
    pub max_detections: usize,
    /// Pause after each emitted frame; file sources only.
    pub frame_delay: Duration,
    pub is_live: bool,
}

impl StreamSettings {
    pub fn for_source(stream: &StreamConfig, detector: &DetectorConfig, is_live: bool) -> Self {
        Self {
            skip_interval: if is_live {
                stream.live_skip_interval
            } else {
                stream.file_skip_interval
            }
            .max(1),
            jpeg_quality: stream.jpeg_quality,
            confidence: detector.confidence,
            max_detections: detector.max_detections,
            frame_delay: if is_live {
                Duration::ZERO
            } else {
                Duration::from_millis(stream.file_frame_delay_ms)
            },
            is_live,
        }
    }
}

pub type SourceOpener =
    Box<dyn FnOnce() -> Result<Box<dyn FrameSource>, PipelineError> + Send + 'static>;

pub struct StreamEngine {
    stream_id: String,
    settings: StreamSettings,
    detector: Arc<DetectorAdapter>,
    opener: Option<SourceOpener>,
    source: Option<Box<dyn FrameSource>>,
    hub: Option<Arc<MetricsHub>>,
    snapshots: Option<SnapshotPolicy>,
    drift: Option<SimulatedDrift>,
    cancel: CancelFlag,
    state: SharedStreamState,
    cache: EncodeCache,
    next_index: u64,
    phase: StreamPhase,
}

impl StreamEngine {
    pub fn new(
        stream_id: impl Into<String>,
        opener: SourceOpener,
        detector: Arc<DetectorAdapter>,
        settings: StreamSettings,
    ) -> Self {
        let settings = StreamSettings {
            skip_interval: settings.skip_interval.max(1),
            ..settings
        };
        Self {
            stream_id: stream_id.into(),
            settings,
            detector,
            opener: Some(opener),
            source: None,
            hub: None,
            snapshots: None,
            drift: None,
            cancel: CancelFlag::new(),
            state: new_shared_state(),
            cache: EncodeCache::new(),
            next_index: 0,
            phase: StreamPhase::Opening,
        }
    }

    pub fn with_hub(mut self, hub: Arc<MetricsHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_snapshots(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshots = Some(policy);
        self
    }

    pub fn with_drift(mut self, drift: Option<SimulatedDrift>) -> Self {
        self.drift = drift;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_state(mut self, state: SharedStreamState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> SharedStreamState {
        self.state.clone()
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    fn update_state(&self, f: impl FnOnce(&mut StreamState)) {
        let mut guard: MutexGuard<'_, StreamState> =
            self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    fn set_phase(&mut self, phase: StreamPhase) {
        debug!(stream_id = %self.stream_id, from = ?self.phase, to = ?phase, "stream phase change");
        self.phase = phase;
        self.update_state(|s| s.phase = phase);
    }

    /// Acquire the source. Idempotent once past `Opening`; the iterator calls
    /// it lazily if the caller did not.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.phase != StreamPhase::Opening {
            return Ok(());
        }
        let Some(opener) = self.opener.take() else {
            return Ok(());
        };

        match opener() {
            Ok(source) => {
                self.source = Some(source);
                let position = self.drift.as_ref().map(SimulatedDrift::current);
                self.update_state(|s| s.position = position);
                self.set_phase(StreamPhase::Running);
                info!(
                    stream_id = %self.stream_id,
                    skip_interval = self.settings.skip_interval,
                    live = self.settings.is_live,
                    "stream running"
                );
                Ok(())
            }
            Err(e) => {
                let report = FailureReport::from(&e);
                error!(stream_id = %self.stream_id, error = %e, "stream failed to open");
                self.fail(report);
                Err(e)
            }
        }
    }

    /// Cancel from the engine side, e.g. when the consumer went away.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if self.phase == StreamPhase::Running {
            self.drain("cancelled");
        }
    }

    fn drain(&mut self, reason: &str) {
        self.set_phase(StreamPhase::Draining);
        self.release();
        let (frames, emitted) = (self.next_index, self.frames_emitted());
        info!(stream_id = %self.stream_id, reason, frames, emitted, "stream drained");
        self.set_phase(StreamPhase::Closed);
    }

    fn fail(&mut self, report: FailureReport) {
        self.update_state(|s| s.failure = Some(report));
        self.set_phase(StreamPhase::Failed);
        self.release();
        self.set_phase(StreamPhase::Closed);
    }

    fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        self.opener = None;
        self.cache.clear();
    }

    fn frames_emitted(&self) -> u64 {
        read_state(&self.state).frames_emitted
    }

    /// Full pipeline for a processing frame. `Err` only for failures that
    /// must end the stream.
    fn process(&mut self, frame: Frame, index: u64) -> Result<Option<EncodedFrame>, PipelineError> {
        let started = Instant::now();
        let detections = match self.detector.detect(
            &frame.image,
            self.settings.confidence,
            Some(self.settings.max_detections),
        ) {
            Ok(d) => d,
            Err(e @ PipelineError::ModelUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!(stream_id = %self.stream_id, frame_index = index, error = %e, "detection failed, passing frame through");
                return Ok(self.passthrough(frame));
            }
        };
        let elapsed = started.elapsed();
        let count = detections.len();
        self.update_state(|s| s.detection_count = count);
        debug!(stream_id = %self.stream_id, frame_index = index, detections = count, elapsed_ms = elapsed.as_millis() as u64, "processing frame");

        if let Some(hub) = &self.hub {
            hub.record_inference(elapsed);
            match severity::score(&detections, frame.width(), frame.height()) {
                Ok(sev) => {
                    hub.publish(InferenceSummary::new(&sev, elapsed).for_stream(&self.stream_id));
                }
                Err(e) => debug!(stream_id = %self.stream_id, error = %e, "frame not scored"),
            }
        }

        let position = self.drift.as_ref().map(SimulatedDrift::current);
        let annotated = annotate(&frame.image, &detections);

        let out = match encode_jpeg(&annotated, self.settings.jpeg_quality) {
            Ok(encoded) => {
                self.cache.store(encoded.clone());
                if let Some(policy) = &self.snapshots {
                    match policy.maybe_capture(&encoded, &detections, position) {
                        Ok(Some(record)) => self.update_state(|s| s.last_snapshot = Some(record)),
                        Ok(None) => {}
                        Err(e) => warn!(stream_id = %self.stream_id, error = %e, "snapshot not saved"),
                    }
                }
                Some(encoded)
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, frame_index = index, error = %e, "annotated frame encode failed");
                self.passthrough(frame)
            }
        };

        if let Some(drift) = self.drift.as_mut() {
            let fix = drift.advance();
            self.update_state(|s| s.position = Some(fix));
        }

        Ok(out)
    }

    /// Replay the cache, seeding it from the raw frame when cold.
    fn passthrough(&mut self, frame: Frame) -> Option<EncodedFrame> {
        if let Some(cached) = self.cache.get() {
            return Some(cached);
        }
        match encode_jpeg(&frame.image, self.settings.jpeg_quality) {
            Ok(encoded) => {
                self.cache.store(encoded.clone());
                Some(encoded)
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "raw frame encode failed, dropping frame");
                None
            }
        }
    }
}

impl Iterator for StreamEngine {
    type Item = EncodedFrame;

    fn next(&mut self) -> Option<EncodedFrame> {
        if self.phase == StreamPhase::Opening && self.start().is_err() {
            return None;
        }

        loop {
            if self.phase != StreamPhase::Running {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.drain("cancelled");
                return None;
            }

            let pulled = match self.source.as_mut() {
                Some(source) => source.next_frame(),
                None => Ok(None),
            };
            let frame = match pulled {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.drain("source exhausted");
                    return None;
                }
                Err(e) => {
                    error!(stream_id = %self.stream_id, error = %e, "source failed");
                    self.fail(FailureReport::from(&e));
                    return None;
                }
            };

            let index = self.next_index;
            self.next_index += 1;
            let next_index = self.next_index;
            self.update_state(|s| s.frame_index = next_index);

            let out = if index % self.settings.skip_interval == 0 {
                match self.process(frame, index) {
                    Ok(out) => out,
                    Err(e) => {
                        error!(stream_id = %self.stream_id, error = %e, "detector unavailable, stopping stream");
                        self.fail(FailureReport::from(&e));
                        return None;
                    }
                }
            } else {
                self.passthrough(frame)
            };

            // A dropped frame is not fatal; pull the next one.
            let Some(encoded) = out else { continue };
            self.update_state(|s| s.frames_emitted += 1);
            if !self.settings.frame_delay.is_zero() {
                std::thread::sleep(self.settings.frame_delay);
            }
            return Some(encoded);
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if self.phase == StreamPhase::Running {
            self.drain("consumer dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::stub::{FailingBackend, StubBackend};
    use crate::detector::{BoxLayout, DetectorBackend, RawDetection};
    use crate::error::ErrorKind;
    use crate::hub::HubEvent;
    use crate::source::SyntheticSource;
    use roadwatch_common::position::{Position, PositionSource};

    fn settings(skip_interval: u64) -> StreamSettings {
        StreamSettings {
            skip_interval,
            jpeg_quality: 75,
            confidence: 0.35,
            max_detections: 50,
            frame_delay: Duration::ZERO,
            is_live: false,
        }
    }

    fn opener(source: SyntheticSource) -> SourceOpener {
        Box::new(move || Ok(Box::new(source) as Box<dyn FrameSource>))
    }

    fn confident_stub() -> Arc<StubBackend> {
        let raw = |confidence: f64, x: f64| RawDetection {
            class_id: 4.0,
            confidence,
            coords: [x, 0.1, x + 0.2, 0.4],
            layout: BoxLayout::CornersNormalized,
        };
        Arc::new(StubBackend::scripted(vec![raw(0.9, 0.1), raw(0.85, 0.5)]))
    }

    fn adapter(backend: Arc<dyn DetectorBackend>) -> Arc<DetectorAdapter> {
        Arc::new(DetectorAdapter::new(backend, vec!["Pothole".into(); 5]))
    }

    fn engine(frames: u64, skip: u64, backend: Arc<dyn DetectorBackend>) -> StreamEngine {
        StreamEngine::new(
            "test",
            opener(SyntheticSource::new(32, 24, frames)),
            adapter(backend),
            settings(skip),
        )
    }

    #[test]
    fn one_detector_call_per_skip_window() {
        let stub = Arc::new(StubBackend::demo());
        let frames: Vec<_> = engine(5, 5, stub.clone()).collect();
        assert_eq!(frames.len(), 5);
        assert_eq!(stub.calls(), 1);

        let stub = Arc::new(StubBackend::demo());
        let frames: Vec<_> = engine(23, 5, stub.clone()).collect();
        assert_eq!(frames.len(), 23);
        assert_eq!(stub.calls(), 5);
    }

    #[test]
    fn passthrough_frames_reuse_cached_buffer() {
        let frames: Vec<_> = engine(10, 5, Arc::new(StubBackend::demo())).collect();
        for f in &frames[1..5] {
            assert!(f.shares_buffer_with(&frames[0]));
        }
        for f in &frames[6..10] {
            assert!(f.shares_buffer_with(&frames[5]));
        }
        assert!(!frames[5].shares_buffer_with(&frames[0]));
        assert_eq!(frames[0].quality, 75);
    }

    #[test]
    fn exhaustion_drains_to_closed() {
        let mut eng = engine(3, 2, Arc::new(StubBackend::demo()));
        let state = eng.state();
        assert_eq!(eng.by_ref().count(), 3);
        assert_eq!(eng.phase(), StreamPhase::Closed);
        let s = read_state(&state);
        assert_eq!(s.phase, StreamPhase::Closed);
        assert_eq!(s.frame_index, 3);
        assert_eq!(s.frames_emitted, 3);
        assert!(s.failure.is_none());
        assert!(eng.next().is_none());
    }

    #[test]
    fn open_failure_fails_before_any_frame() {
        let open: SourceOpener = Box::new(|| {
            Err(PipelineError::SourceUnopenable {
                source_ref: "missing.mp4".into(),
                reason: "does not exist".into(),
                missing: true,
            })
        });
        let mut eng = StreamEngine::new("x", open, adapter(Arc::new(StubBackend::demo())), settings(5));
        let err = eng.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnopenable);
        assert!(eng.next().is_none());
        let s = read_state(&eng.state());
        assert_eq!(s.phase, StreamPhase::Closed);
        assert_eq!(s.failure.unwrap().kind, ErrorKind::SourceUnopenable);
    }

    #[test]
    fn source_io_failure_ends_stream_as_failed() {
        let src = SyntheticSource::new(16, 16, 10).failing_after(4);
        let mut eng = StreamEngine::new("io", opener(src), adapter(Arc::new(StubBackend::demo())), settings(2));
        assert_eq!(eng.by_ref().count(), 4);
        let s = read_state(&eng.state());
        assert_eq!(s.failure.unwrap().kind, ErrorKind::SourceIo);
        assert_eq!(s.phase, StreamPhase::Closed);
    }

    #[test]
    fn missing_model_fails_stream() {
        let mut eng = StreamEngine::new(
            "nomodel",
            opener(SyntheticSource::new(16, 16, 10)),
            Arc::new(DetectorAdapter::unavailable("not loaded")),
            settings(5),
        );
        assert!(eng.next().is_none());
        let s = read_state(&eng.state());
        assert_eq!(s.failure.unwrap().kind, ErrorKind::ModelUnavailable);
    }

    #[test]
    fn inference_error_is_not_fatal() {
        let frames: Vec<_> = engine(6, 3, Arc::new(FailingBackend)).collect();
        assert_eq!(frames.len(), 6);
    }

    #[test]
    fn one_snapshot_per_qualifying_processing_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(10, 5, confident_stub())
            .with_snapshots(SnapshotPolicy::new(dir.path()));
        let state = eng.state();
        assert_eq!(eng.by_ref().count(), 10);

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
        let s = read_state(&state);
        let snap = s.last_snapshot.unwrap();
        assert_eq!(snap.detection_count, 2);
        assert_eq!(s.detection_count, 2);
    }

    #[test]
    fn low_confidence_never_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubBackend::scripted(vec![RawDetection {
            class_id: 0.0,
            confidence: 0.7,
            coords: [1.0, 1.0, 10.0, 10.0],
            layout: BoxLayout::CornersPixels,
        }]);
        let mut eng = engine(10, 5, Arc::new(stub)).with_snapshots(SnapshotPolicy::new(dir.path()));
        let state = eng.state();
        eng.by_ref().for_each(drop);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(read_state(&state).last_snapshot.is_none());
    }

    #[test]
    fn drift_advances_once_per_processing_frame() {
        let drift = SimulatedDrift::new(Position::new(0.0, 0.0), 1.0);
        let mut eng = engine(10, 5, Arc::new(StubBackend::demo())).with_drift(Some(drift));
        let state = eng.state();
        eng.by_ref().for_each(drop);
        let fix = read_state(&state).position.unwrap();
        assert_eq!(fix.position(), Position::new(2.0, 2.0));
        assert_eq!(fix.source, PositionSource::Simulated);
    }

    #[test]
    fn snapshot_carries_position_before_advance() {
        let dir = tempfile::tempdir().unwrap();
        let drift = SimulatedDrift::new(Position::new(10.0, 20.0), 1.0);
        let mut eng = engine(1, 5, confident_stub())
            .with_drift(Some(drift))
            .with_snapshots(SnapshotPolicy::new(dir.path()));
        let state = eng.state();
        eng.by_ref().for_each(drop);
        let s = read_state(&state);
        assert_eq!(s.last_snapshot.unwrap().position.unwrap().position(), Position::new(10.0, 20.0));
        assert_eq!(s.position.unwrap().position(), Position::new(11.0, 21.0));
    }

    #[test]
    fn cancellation_drains_and_releases_source() {
        let src = SyntheticSource::new(16, 16, 1_000);
        let closed = src.closed_flag();
        let cancel = CancelFlag::new();
        let mut eng = StreamEngine::new("live", opener(src), adapter(Arc::new(StubBackend::demo())), settings(10))
            .with_cancel(cancel.clone());
        assert!(eng.next().is_some());
        assert!(eng.next().is_some());
        cancel.cancel();
        assert!(eng.next().is_none());
        assert!(closed.load(Ordering::Acquire));
        let s = read_state(&eng.state());
        assert_eq!(s.phase, StreamPhase::Closed);
        assert!(s.failure.is_none());
        assert_eq!(s.frames_emitted, 2);
    }

    #[test]
    fn dropping_engine_releases_source() {
        let src = SyntheticSource::new(16, 16, 1_000);
        let closed = src.closed_flag();
        let mut eng = StreamEngine::new("drop", opener(src), adapter(Arc::new(StubBackend::demo())), settings(10));
        eng.next();
        drop(eng);
        assert!(closed.load(Ordering::Acquire));
    }

    #[test]
    fn concurrent_engines_keep_separate_state() {
        let a = engine(10, 5, confident_stub());
        let b = engine(3, 1, Arc::new(StubBackend::scripted(vec![])));
        let (sa, sb) = (a.state(), b.state());

        let ha = std::thread::spawn(move || a.count());
        let hb = std::thread::spawn(move || b.count());
        assert_eq!(ha.join().unwrap(), 10);
        assert_eq!(hb.join().unwrap(), 3);

        let (sa, sb) = (read_state(&sa), read_state(&sb));
        assert_eq!(sa.frame_index, 10);
        assert_eq!(sa.detection_count, 2);
        assert_eq!(sb.frame_index, 3);
        assert_eq!(sb.detection_count, 0);
    }

    #[test]
    fn processing_frames_feed_hub() {
        let hub = Arc::new(MetricsHub::new());
        let mut sub = hub.subscribe();
        let eng = engine(10, 5, Arc::new(StubBackend::demo())).with_hub(hub.clone());
        assert_eq!(eng.count(), 10);

        assert_eq!(hub.snapshot().total_requests, 2);
        let mut completes = 0;
        while let Ok(ev) = sub.receiver.try_recv() {
            if let HubEvent::InferenceComplete { data } = ev {
                assert_eq!(data.stream_id.as_deref(), Some("test"));
                completes += 1;
            }
        }
        assert_eq!(completes, 2);
    }

    #[test]
    fn zero_skip_interval_processes_every_frame() {
        let stub = Arc::new(StubBackend::demo());
        let frames: Vec<_> = engine(4, 0, stub.clone()).collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(stub.calls(), 4);
    }

    #[test]
    fn unencodable_frames_are_dropped_and_stream_continues() {
        let mut eng = StreamEngine::new(
            "empty",
            opener(SyntheticSource::new(0, 0, 4)),
            adapter(Arc::new(StubBackend::scripted(vec![]))),
            settings(2),
        );
        let state = eng.state();
        assert_eq!(eng.by_ref().count(), 0);
        let s = read_state(&state);
        assert_eq!(s.frame_index, 4);
        assert_eq!(s.frames_emitted, 0);
        assert_eq!(s.phase, StreamPhase::Closed);
        assert!(s.failure.is_none());
    }

    #[test]
    fn settings_pick_interval_by_source_kind() {
        let stream = StreamConfig::default();
        let detector = DetectorConfig::default();
        let file = StreamSettings::for_source(&stream, &detector, false);
        let live = StreamSettings::for_source(&stream, &detector, true);
        assert_eq!(file.skip_interval, 5);
        assert_eq!(live.skip_interval, 10);
        assert!(live.frame_delay.is_zero());
        assert_eq!(file.frame_delay, Duration::from_millis(10));
    }
}
