use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use roadwatch_common::detection::Detection;
use roadwatch_common::frame::EncodedFrame;
use roadwatch_common::position::PositionFix;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::PipelineError;

/// Strict lower bound a detection's confidence must exceed to trigger a
/// snapshot.
pub const HIGH_CONFIDENCE_BOUND: f32 = 0.7;

/// Process-wide so that concurrent streams never mint the same name.
static SNAPSHOT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Persisted evidence of a high-confidence frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    /// File name under the snapshot directory.
    pub image_reference: String,
    pub detection_count: usize,
    pub detections: Vec<Detection>,
    pub position: Option<PositionFix>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    dir: PathBuf,
}

impl SnapshotPolicy {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn should_capture(detections: &[Detection]) -> bool {
        detections
            .iter()
            .any(|d| d.confidence > HIGH_CONFIDENCE_BOUND)
    }

    /// Persist `jpeg` if any detection qualifies. Returns `Ok(None)` when the
    /// frame does not qualify. Call at most once per processing frame.
    pub fn maybe_capture(
        &self,
        jpeg: &EncodedFrame,
        detections: &[Detection],
        position: Option<PositionFix>,
    ) -> Result<Option<SnapshotRecord>, PipelineError> {
        if !Self::should_capture(detections) {
            return Ok(None);
        }
        self.capture(jpeg, detections, position).map(Some)
    }

    pub fn capture(
        &self,
        jpeg: &EncodedFrame,
        detections: &[Detection],
        position: Option<PositionFix>,
    ) -> Result<SnapshotRecord, PipelineError> {
        let io_err = |path: &Path, source: std::io::Error| PipelineError::Snapshot {
            path: path.display().to_string(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;

        let timestamp = Utc::now();
        // create_new guards against a name left over from a previous run.
        let (name, mut file) = loop {
            let seq = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed);
            let name = format!("snap_{}_{seq:06}.jpg", timestamp.format("%Y%m%d_%H%M%S_%3f"));
            let path = self.dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (name, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(name = %name, "snapshot name taken, retrying");
                }
                Err(e) => return Err(io_err(&path, e)),
            }
        };

        let path = self.dir.join(&name);
        file.write_all(&jpeg.bytes)
            .and_then(|_| file.flush())
            .map_err(|e| io_err(&path, e))?;

        info!(
            snapshot = %name,
            detections = detections.len(),
            bytes = jpeg.len(),
            "snapshot saved"
        );
        Ok(SnapshotRecord {
            image_reference: name,
            detection_count: detections.len(),
            detections: detections.to_vec(),
            position,
            timestamp,
        })
    }

    /// Resolve a snapshot name to its path, refusing anything that is not a
    /// plain file name.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty()
            && !name.contains(['/', '\\'])
            && name != "."
            && name != ".."
            && name.ends_with(".jpg");
        plain.then(|| self.dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadwatch_common::detection::BoundingBox;
    use roadwatch_common::position::{Position, PositionSource};
    use std::collections::HashSet;

    fn det(confidence: f32) -> Detection {
        Detection {
            class_id: 2,
            class_name: "Alligator Crack".into(),
            confidence,
            bbox: BoundingBox::new(1.0, 1.0, 5.0, 5.0),
        }
    }

    fn jpeg() -> EncodedFrame {
        EncodedFrame::new(vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9], 75)
    }

    #[test]
    fn bound_is_strict() {
        assert!(!SnapshotPolicy::should_capture(&[det(0.7)]));
        assert!(SnapshotPolicy::should_capture(&[det(0.3), det(0.71)]));
        assert!(!SnapshotPolicy::should_capture(&[]));
    }

    #[test]
    fn non_qualifying_frame_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SnapshotPolicy::new(dir.path().join("snaps"));
        let record = policy.maybe_capture(&jpeg(), &[det(0.5)], None).unwrap();
        assert!(record.is_none());
        assert!(!dir.path().join("snaps").exists());
    }

    #[test]
    fn capture_writes_bytes_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SnapshotPolicy::new(dir.path());
        let fix = PositionFix::new(Position::new(40.7128, -74.006), PositionSource::Simulated);
        let record = policy
            .maybe_capture(&jpeg(), &[det(0.9), det(0.4)], Some(fix))
            .unwrap()
            .unwrap();

        assert!(record.image_reference.starts_with("snap_"));
        assert_eq!(record.detection_count, 2);
        assert_eq!(record.position, Some(fix));
        let written = std::fs::read(dir.path().join(&record.image_reference)).unwrap();
        assert_eq!(written, jpeg().bytes.to_vec());
    }

    #[test]
    fn rapid_captures_get_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SnapshotPolicy::new(dir.path());
        let names: HashSet<String> = (0..20)
            .map(|_| policy.capture(&jpeg(), &[det(0.9)], None).unwrap().image_reference)
            .collect();
        assert_eq!(names.len(), 20);
    }

    #[test]
    fn unwritable_dir_is_snapshot_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let policy = SnapshotPolicy::new(blocker.join("nested"));
        let err = policy.capture(&jpeg(), &[det(0.9)], None).unwrap_err();
        assert!(matches!(err, PipelineError::Snapshot { .. }));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let policy = SnapshotPolicy::new("/tmp/snaps");
        assert!(policy.resolve("snap_1.jpg").is_some());
        assert!(policy.resolve("../etc/passwd").is_none());
        assert!(policy.resolve("a/b.jpg").is_none());
        assert!(policy.resolve("notes.txt").is_none());
    }
}
