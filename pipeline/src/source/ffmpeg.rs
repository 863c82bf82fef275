use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use roadwatch_common::frame::Frame;
use tracing::{debug, info, warn};

use super::mjpeg::MjpegParser;
use super::{FrameSource, SourceSpec};
use crate::error::PipelineError;

const READ_CHUNK: usize = 64 * 1024;
const STDERR_KEEP: usize = 4 * 1024;

/// Decodes a file or capture device by running ffmpeg as a subprocess and
/// splitting its multipart JPEG output.
pub struct FfmpegSource {
    source_ref: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<Mutex<String>>,
    stderr_thread: Option<JoinHandle<()>>,
    parser: MjpegParser,
    /// First frame, pulled during open to prove the source is readable.
    pending: Option<Frame>,
    frames_read: u64,
    eof: bool,
}

impl FfmpegSource {
    pub fn open(spec: &SourceSpec, ffmpeg: &str, quality: u32) -> Result<Self, PipelineError> {
        let source_ref = spec.describe();
        let input = match spec {
            SourceSpec::File(path) => path.clone(),
            SourceSpec::Device(index) => PathBuf::from(format!("/dev/video{index}")),
        };
        if !input.exists() {
            return Err(PipelineError::SourceUnopenable {
                source_ref,
                reason: format!("{} does not exist", input.display()),
                missing: true,
            });
        }

        let mut cmd = Command::new(ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        if spec.is_live() {
            cmd.args(["-f", "v4l2"]);
        }
        cmd.arg("-i")
            .arg(&input)
            .args(["-f", "mpjpeg", "-boundary_tag", "frame", "-q:v"])
            .arg(quality.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::unopenable(&source_ref, format!("failed to spawn {ffmpeg}: {e}"))
        })?;
        let stdout = child.stdout.take();
        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr_thread = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_reader(stderr, stderr_tail.clone()));

        debug!(source = %source_ref, ffmpeg, input = %input.display(), "ffmpeg decoder started");

        let mut source = Self {
            source_ref,
            child: Some(child),
            stdout,
            stderr_tail,
            stderr_thread,
            parser: MjpegParser::new(),
            pending: None,
            frames_read: 0,
            eof: false,
        };

        match source.read_frame() {
            Ok(Some(frame)) => {
                info!(
                    source = %source.source_ref,
                    width = frame.width(),
                    height = frame.height(),
                    "source opened"
                );
                source.pending = Some(frame);
                Ok(source)
            }
            Ok(None) => {
                let reason = source.take_stderr();
                source.close();
                Err(PipelineError::unopenable(
                    &source.source_ref,
                    if reason.is_empty() {
                        "no frames decoded".to_string()
                    } else {
                        reason
                    },
                ))
            }
            Err(e) => {
                source.close();
                Err(match e {
                    PipelineError::SourceIo(reason) => {
                        PipelineError::unopenable(&source.source_ref, reason)
                    }
                    other => other,
                })
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        loop {
            let jpeg = match self.parser.next_jpeg() {
                Some(jpeg) => Some(jpeg),
                None if self.eof => None,
                None => {
                    if self.fill()? {
                        continue;
                    }
                    self.parser.finish()
                }
            };
            let Some(jpeg) = jpeg else {
                return self.finish_eof();
            };

            match image::load_from_memory(&jpeg) {
                Ok(img) => {
                    self.frames_read += 1;
                    return Ok(Some(Frame::now(img.to_rgb8())));
                }
                Err(e) => {
                    warn!(source = %self.source_ref, error = %e, bytes = jpeg.len(), "skipping undecodable frame");
                }
            }
        }
    }

    /// Read one chunk from ffmpeg. Returns false at end of output.
    fn fill(&mut self) -> Result<bool, PipelineError> {
        let Some(stdout) = self.stdout.as_mut() else {
            self.eof = true;
            return Ok(false);
        };
        let mut buf = vec![0u8; READ_CHUNK];
        let n = stdout
            .read(&mut buf)
            .map_err(|e| PipelineError::SourceIo(format!("{}: {e}", self.source_ref)))?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.parser.push(&buf[..n]);
        Ok(true)
    }

    /// End of output: a clean exit ends the stream, a failed exit is an I/O
    /// error.
    fn finish_eof(&mut self) -> Result<Option<Frame>, PipelineError> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        self.stdout = None;
        let status = child
            .wait()
            .map_err(|e| PipelineError::SourceIo(format!("{}: {e}", self.source_ref)))?;
        self.join_stderr();
        if status.success() {
            debug!(source = %self.source_ref, frames = self.frames_read, "source exhausted");
            return Ok(None);
        }
        let stderr = self.take_stderr();
        Err(PipelineError::SourceIo(format!(
            "ffmpeg exited with {status} after {} frames: {stderr}",
            self.frames_read
        )))
    }

    fn join_stderr(&mut self) {
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }

    fn take_stderr(&mut self) -> String {
        self.join_stderr();
        let mut tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *tail).trim().to_string()
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.read_frame()
    }

    fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(source = %self.source_ref, error = %e, "ffmpeg already exited");
            }
            let _ = child.wait();
            debug!(source = %self.source_ref, "ffmpeg decoder stopped");
        }
        self.join_stderr();
        self.pending = None;
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_stderr_reader(
    mut stderr: std::process::ChildStderr,
    tail: Arc<Mutex<String>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 1024];
        while let Ok(n) = stderr.read(&mut buf) {
            if n == 0 {
                break;
            }
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            tail.push_str(&String::from_utf8_lossy(&buf[..n]));
            if tail.len() > STDERR_KEEP {
                let mut cut = tail.len() - STDERR_KEEP;
                while !tail.is_char_boundary(cut) {
                    cut += 1;
                }
                tail.drain(..cut);
            }
        }
    })
}

/// Check whether ffmpeg can be run. Logs a warning if not.
pub fn check_ffmpeg_available(ffmpeg: &str) -> bool {
    match Command::new(ffmpeg).arg("-version").output() {
        Ok(out) if out.status.success() => {
            debug!(ffmpeg, "ffmpeg is available");
            true
        }
        Ok(_) => {
            warn!(ffmpeg, "ffmpeg returned non-zero for -version; stream sources may fail");
            false
        }
        Err(e) => {
            warn!(ffmpeg, error = %e, "ffmpeg not found; file and device streams will fail to open");
            false
        }
    }
}
