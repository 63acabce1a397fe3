//! Streaming H.264 strategy backed by an external `ffmpeg` process.
//!
//! Raw RGB24 frames go in on stdin at a fixed size and rate; an
//! elementary H.264 bitstream comes out on stdout. A reader thread drains
//! stdout into a [`BitstreamBuffer`] so encoder latency never blocks the
//! capture loop's writes, and a second one forwards stderr to the log.
//!
//! ```text
//! capture loop ──write──► stdin ─► ffmpeg ─► stdout ──reader──► BitstreamBuffer
//!      ▲                                                          │
//!      └──────────────────────── take() ◄─────────────────────────┘
//! ```

use serde::Serialize;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{Codec, EncodedChunk};
use crate::error::EncoderError;
use crate::screen::limiter;
use crate::screen::FrameBuffer;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 64 * 1024;
/// Backlog cap for the bitstream buffer (several seconds of 35 Mbit/s).
pub const BUFFER_CAPACITY: usize = 16 * 1024 * 1024;

// ── Lifecycle ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Stopped,
    Starting,
    Running,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderProfile {
    /// NVENC: rate-controlled, no B-frames.
    Hardware,
    /// libx264: constant quality, no B-frames.
    Software,
}

impl EncoderProfile {
    pub fn encoder_name(self) -> &'static str {
        match self {
            EncoderProfile::Hardware => "h264_nvenc",
            EncoderProfile::Software => "libx264",
        }
    }
}

/// Negotiated stream format. Fixed for the lifetime of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// ffmpeg-style bitrate, e.g. `"35M"`.
    pub bitrate: String,
}

impl StreamParams {
    /// 4:2:0 chroma needs even dimensions; trim the odd row/column.
    pub fn for_frame(width: u32, height: u32, fps: u32, bitrate: &str) -> Self {
        Self {
            width: (width & !1).max(2),
            height: (height & !1).max(2),
            fps: fps.max(1),
            bitrate: bitrate.to_string(),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * FrameBuffer::BYTES_PER_PIXEL
    }
}

// ── Launchers ────────────────────────────────────────────────────

/// Builds the encoder command for a profile.
pub trait EncoderLauncher: Send + Sync {
    fn command(&self, profile: EncoderProfile, params: &StreamParams) -> Command;

    /// A process that dies within this window counts as a failed start.
    fn startup_grace(&self) -> Duration {
        Duration::from_millis(300)
    }
}

pub struct FfmpegLauncher {
    program: PathBuf,
}

impl FfmpegLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(profile: EncoderProfile, p: &StreamParams) -> Vec<String> {
        let fps = p.fps.to_string();
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(format!("{}x{}", p.width, p.height));
        args.extend(["-r".to_string(), fps.clone(), "-i".into(), "-".into()]);

        let codec_args: Vec<String> = match profile {
            EncoderProfile::Hardware => vec![
                "-c:v", "h264_nvenc", "-preset", "p4", "-tune", "ll", "-rc", "vbr", "-b:v",
                p.bitrate.as_str(), "-maxrate", p.bitrate.as_str(), "-bufsize",
                p.bitrate.as_str(), "-bf", "0", "-zerolatency", "1", "-forced-idr", "1", "-g",
                fps.as_str(),
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            EncoderProfile::Software => vec![
                "-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency", "-crf", "23",
                "-bf", "0", "-g", fps.as_str(), "-x264-params", "repeat-headers=1",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        };
        args.extend(codec_args);
        args.extend(
            ["-pix_fmt", "yuv420p", "-f", "h264", "-"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn command(&self, profile: EncoderProfile, params: &StreamParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::args(profile, params));
        cmd
    }
}

/// What the local ffmpeg build can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HardwareSupport {
    pub ffmpeg: bool,
    pub h264_nvenc: bool,
}

/// Ask ffmpeg which encoders it was built with.
pub fn probe_hardware(program: &Path) -> HardwareSupport {
    let mut support = HardwareSupport::default();
    let version = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .output();
    match version {
        Ok(out) if out.status.success() => support.ffmpeg = true,
        Ok(out) => {
            tracing::warn!("{} -version exited with {}", program.display(), out.status);
            return support;
        }
        Err(e) => {
            tracing::warn!("ffmpeg not found at {}: {}", program.display(), e);
            return support;
        }
    }
    if let Ok(out) = Command::new(program)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
    {
        support.h264_nvenc = String::from_utf8_lossy(&out.stdout).contains("h264_nvenc");
    }
    support
}

// ── Bitstream buffer ─────────────────────────────────────────────

/// Single-producer / single-consumer byte queue between the stdout reader
/// and the capture loop.
pub struct BitstreamBuffer {
    bytes: Mutex<Vec<u8>>,
    capacity: usize,
}

impl BitstreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Append encoder output. If the consumer has fallen so far behind
    /// that the cap is hit, the backlog is discarded; the decoder resyncs
    /// at the next keyframe.
    pub fn push(&self, chunk: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        if bytes.len() + chunk.len() > self.capacity {
            tracing::warn!(
                dropped = bytes.len(),
                "bitstream backlog over {} bytes, discarding",
                self.capacity
            );
            bytes.clear();
        }
        bytes.extend_from_slice(chunk);
    }

    /// Take everything accumulated since the previous call.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.bytes.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Kill handle ──────────────────────────────────────────────────

/// Lets the pipeline owner force-terminate the process when the capture
/// worker does not exit within its join timeout.
#[derive(Clone)]
pub struct KillHandle(Arc<Mutex<Child>>);

impl KillHandle {
    pub fn kill(&self) {
        let mut child = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = child.kill() {
            tracing::debug!("encoder kill: {}", e);
        }
    }
}

// ── StreamEncoder ────────────────────────────────────────────────

pub struct StreamEncoder {
    launcher: Arc<dyn EncoderLauncher>,
    state: EncoderState,
    params: Option<StreamParams>,
    profile: Option<EncoderProfile>,
    child: Option<Arc<Mutex<Child>>>,
    stdin: Option<ChildStdin>,
    buffer: Arc<BitstreamBuffer>,
    readers: Vec<JoinHandle<()>>,
}

impl StreamEncoder {
    pub fn new(launcher: Arc<dyn EncoderLauncher>) -> Self {
        Self {
            launcher,
            state: EncoderState::Stopped,
            params: None,
            profile: None,
            child: None,
            stdin: None,
            buffer: Arc::new(BitstreamBuffer::new(BUFFER_CAPACITY)),
            readers: Vec::new(),
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn params(&self) -> Option<&StreamParams> {
        self.params.as_ref()
    }

    /// Name of the active encoder, or of the last one that ran.
    pub fn encoder_name(&self) -> &'static str {
        self.profile
            .map(EncoderProfile::encoder_name)
            .unwrap_or("h264")
    }

    pub fn kill_handle(&self) -> Option<KillHandle> {
        self.child.as_ref().map(|c| KillHandle(Arc::clone(c)))
    }

    /// Spawn the encoder. With `hw_available` the hardware profile is tried
    /// first and the software profile is the single fallback.
    pub fn start(
        &mut self,
        width: u32,
        height: u32,
        fps: u32,
        bitrate: &str,
        hw_available: bool,
    ) -> Result<(), EncoderError> {
        if self.child.is_some() {
            self.stop();
        }
        self.state = EncoderState::Starting;
        let params = StreamParams::for_frame(width, height, fps, bitrate);

        let profiles: &[EncoderProfile] = if hw_available {
            &[EncoderProfile::Hardware, EncoderProfile::Software]
        } else {
            &[EncoderProfile::Software]
        };

        let mut last_err = String::from("no encoder profile attempted");
        for &profile in profiles {
            match self.spawn(profile, &params) {
                Ok(()) => {
                    tracing::info!(
                        encoder = profile.encoder_name(),
                        "started {}x{} @ {}fps, GOP {}",
                        params.width,
                        params.height,
                        params.fps,
                        params.fps
                    );
                    self.state = EncoderState::Running;
                    self.profile = Some(profile);
                    self.params = Some(params);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(encoder = profile.encoder_name(), "start failed: {}", e);
                    last_err = format!("{}: {}", profile.encoder_name(), e);
                }
            }
        }

        self.state = EncoderState::Failed;
        Err(EncoderError::StartFailed(last_err))
    }

    fn spawn(&mut self, profile: EncoderProfile, params: &StreamParams) -> Result<(), EncoderError> {
        let mut cmd = self.launcher.command(profile, params);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = self.attach(cmd.spawn()?, profile)?;

        // An encoder that cannot open its device exits right away.
        let deadline = Instant::now() + self.launcher.startup_grace();
        while Instant::now() < deadline {
            let exited = child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait()?;
            if let Some(status) = exited {
                self.release();
                return Err(EncoderError::StartFailed(format!("exited early with {}", status)));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    /// Take over a freshly spawned process and start its readers. On
    /// failure the process is killed and reaped before returning.
    fn attach(
        &mut self,
        mut child: Child,
        profile: EncoderProfile,
    ) -> Result<Arc<Mutex<Child>>, EncoderError> {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(child));
        self.child = Some(Arc::clone(&child));
        self.stdin = stdin;
        self.buffer = Arc::new(BitstreamBuffer::new(BUFFER_CAPACITY));

        if let Err(e) = self.spawn_readers(stdout, stderr, profile) {
            self.release();
            return Err(e);
        }
        Ok(child)
    }

    fn spawn_readers(
        &mut self,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        profile: EncoderProfile,
    ) -> Result<(), EncoderError> {
        let Some(out) = stdout else {
            return Err(EncoderError::StartFailed(format!(
                "{}: stdout is not piped",
                profile.encoder_name()
            )));
        };
        self.readers
            .push(spawn_stdout_reader(out, Arc::clone(&self.buffer))?);
        if let Some(err) = stderr {
            self.readers
                .push(spawn_stderr_reader(err, profile.encoder_name())?);
        }
        Ok(())
    }

    /// Feed one frame and collect whatever bitstream is ready. An empty
    /// result means "nothing yet", not failure.
    pub fn encode_frame(&mut self, frame: FrameBuffer) -> Result<EncodedChunk, EncoderError> {
        if self.state != EncoderState::Running {
            return Err(EncoderError::NotRunning);
        }
        let (width, height, expected) = match &self.params {
            Some(p) => (p.width, p.height, p.frame_bytes()),
            None => return Err(EncoderError::NotRunning),
        };

        if let Some(child) = &self.child {
            let exited = child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait()?;
            if let Some(status) = exited {
                tracing::error!(encoder = self.encoder_name(), "exited mid-stream with {}", status);
                self.mark_failed();
                return Err(EncoderError::NotRunning);
            }
        }

        let frame = limiter::resize_exact(frame, width, height);
        if frame.data.len() != expected {
            return Err(EncoderError::Encode(format!(
                "frame is {} bytes, encoder expects {}",
                frame.data.len(),
                expected
            )));
        }
        let write = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(&frame.data).and_then(|_| stdin.flush()),
            None => return Err(EncoderError::NotRunning),
        };
        if let Err(e) = write {
            tracing::error!(encoder = self.encoder_name(), "stdin write failed: {}", e);
            self.mark_failed();
            return Err(EncoderError::NotRunning);
        }

        Ok(EncodedChunk {
            codec: Codec::H264,
            data: self.buffer.take(),
        })
    }

    fn mark_failed(&mut self) {
        self.state = EncoderState::Failed;
        self.stdin = None;
    }

    /// Close stdin, give the process a bounded time to exit, kill it if it
    /// does not. The handle is released either way.
    pub fn stop(&mut self) {
        self.stdin = None;
        if let Some(child) = self.child.clone() {
            let deadline = Instant::now() + STOP_TIMEOUT;
            loop {
                let mut guard = child.lock().unwrap_or_else(PoisonError::into_inner);
                match guard.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {}
                    Ok(None) | Err(_) => {
                        tracing::warn!(encoder = self.encoder_name(), "did not exit, killing");
                        let _ = guard.kill();
                        let _ = guard.wait();
                        break;
                    }
                }
                drop(guard);
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        self.release();
        if self.state != EncoderState::Failed {
            self.state = EncoderState::Stopped;
        }
    }

    fn release(&mut self) {
        self.stdin = None;
        if let Some(child) = self.child.take() {
            let mut guard = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(None) = guard.try_wait() {
                let _ = guard.kill();
            }
            let _ = guard.wait();
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop();
        }
    }
}

fn spawn_stdout_reader(
    mut stdout: impl Read + Send + 'static,
    buffer: Arc<BitstreamBuffer>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("encoder-stdout".into())
        .spawn(move || {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => buffer.push(&chunk[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!("encoder stdout closed: {}", e);
                        break;
                    }
                }
            }
        })
}

fn spawn_stderr_reader(
    stderr: impl Read + Send + 'static,
    encoder: &'static str,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("encoder-stderr".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => {
                        tracing::debug!(target: "lanshare::ffmpeg", encoder, "{}", line)
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
}
