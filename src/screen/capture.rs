//! Frame sources.
//!
//! [`FrameSource`] is the only thing the capture loop knows about the
//! platform. [`PlatformSource`] dispatches monitor targets to `scrap` and
//! window targets to the Win32 renderer (Windows only).
//!
//! `scrap::Capturer` is `!Send` on X11, so a source must be created on
//! the thread that uses it. The pipeline takes a factory for that reason.

use scrap::{Capturer, Display};
use serde::Serialize;
use std::io::ErrorKind;
use std::time::Duration;

use super::{CaptureTarget, FrameBuffer, DEFAULT_MONITOR};
use crate::error::CaptureError;

/// Anything that can produce a frame for a target on demand.
pub trait FrameSource {
    fn capture(&mut self, target: &CaptureTarget) -> Result<FrameBuffer, CaptureError>;
}

/// Builds a source on the capture thread.
pub type SourceFactory = Box<dyn FnOnce() -> Box<dyn FrameSource> + Send>;

pub fn platform_factory() -> SourceFactory {
    Box::new(|| Box::new(PlatformSource::new()) as Box<dyn FrameSource>)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Monitor,
    Window,
}

/// Entry in the source picker.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub name: String,
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Thumbnails are rendered by the front end's own picker.
    pub thumbnail: Option<String>,
}

/// Enumerate monitors, then (on Windows) shareable top-level windows.
pub fn list_sources() -> Vec<SourceInfo> {
    let mut sources = list_monitors();
    #[cfg(target_os = "windows")]
    sources.extend(super::window::list_windows());
    sources
}

pub fn list_monitors() -> Vec<SourceInfo> {
    let displays = match Display::all() {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("display enumeration failed: {}", e);
            return Vec::new();
        }
    };
    displays
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let id = i as u32 + 1;
            SourceInfo {
                id: id as i64,
                kind: SourceKind::Monitor,
                name: format!("Display {}", id),
                title: format!("Display {} ({}x{})", id, d.width(), d.height()),
                width: d.width() as u32,
                height: d.height() as u32,
                thumbnail: None,
            }
        })
        .collect()
}

/// Map a requested 1-based monitor id onto an existing display index.
/// Displays come and go; an id that no longer exists falls back to the
/// first display instead of failing.
pub fn resolve_monitor(requested: u32, available: usize) -> u32 {
    if requested == 0 || requested as usize > available {
        DEFAULT_MONITOR
    } else {
        requested
    }
}

// ── Monitor capture ──────────────────────────────────────────────

const WOULD_BLOCK_RETRIES: u32 = 10;
const WOULD_BLOCK_SLEEP: Duration = Duration::from_millis(5);

/// Captures whole displays via `scrap`.
///
/// Platforms that only deliver a frame when the screen changed report
/// `WouldBlock` otherwise; the last frame is repeated so the encoder
/// keeps receiving a fixed-rate stream.
pub struct MonitorSource {
    active: Option<(u32, Capturer)>,
    last: Option<FrameBuffer>,
}

impl MonitorSource {
    pub fn new() -> Self {
        Self {
            active: None,
            last: None,
        }
    }

    fn open(&mut self, requested: u32) -> Result<(), CaptureError> {
        let mut displays = Display::all()
            .map_err(|e| CaptureError::unavailable(format!("no displays: {}", e)))?;
        let id = resolve_monitor(requested, displays.len());

        if self.active.as_ref().map(|(cur, _)| *cur) != Some(id) {
            if displays.is_empty() {
                return Err(CaptureError::unavailable("no displays attached"));
            }
            let display = displays.swap_remove(id as usize - 1);
            let capturer = Capturer::new(display)?;
            tracing::info!(monitor = id, "opened display capturer");
            self.active = Some((id, capturer));
            self.last = None;
        }
        Ok(())
    }

    pub fn capture_monitor(&mut self, requested: u32) -> Result<FrameBuffer, CaptureError> {
        self.open(requested)?;
        let capturer = match self.active.as_mut() {
            Some((_, capturer)) => capturer,
            None => return Err(CaptureError::unavailable("capturer missing")),
        };
        let (w, h) = (capturer.width(), capturer.height());

        let mut attempts = 0;
        let mut lost = false;
        let result = loop {
            match capturer.frame() {
                Ok(frame) => {
                    let stride = if h > 0 { frame.len() / h } else { 0 };
                    if stride < w * 4 {
                        break Err(CaptureError::unavailable("short frame from capturer"));
                    }
                    break Ok(FrameBuffer::from_bgra(&frame, w, h, stride));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    attempts += 1;
                    if attempts >= WOULD_BLOCK_RETRIES {
                        break Err(CaptureError::unavailable("no new frame"));
                    }
                    std::thread::sleep(WOULD_BLOCK_SLEEP);
                }
                Err(e) => {
                    lost = true;
                    break Err(CaptureError::Io(e));
                }
            }
        };

        if lost {
            // Access lost (mode switch, secure desktop). Reopen next tick.
            tracing::warn!("display capturer lost; reopening on next tick");
            self.active = None;
            self.last = None;
        }
        match result {
            Ok(frame) => {
                self.last = Some(frame.clone());
                Ok(frame)
            }
            Err(CaptureError::Unavailable(reason)) if !lost => match &self.last {
                Some(prev) => Ok(prev.clone()),
                None => Err(CaptureError::Unavailable(reason)),
            },
            Err(e) => Err(e),
        }
    }
}

impl Default for MonitorSource {
    fn default() -> Self {
        Self::new()
    }
}

// ── Dispatch ─────────────────────────────────────────────────────

pub struct PlatformSource {
    monitor: MonitorSource,
}

impl PlatformSource {
    pub fn new() -> Self {
        Self {
            monitor: MonitorSource::new(),
        }
    }
}

impl Default for PlatformSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for PlatformSource {
    fn capture(&mut self, target: &CaptureTarget) -> Result<FrameBuffer, CaptureError> {
        match target {
            CaptureTarget::Monitor { id } => self.monitor.capture_monitor(*id),
            #[cfg(target_os = "windows")]
            CaptureTarget::Window { id, .. } => super::window::capture_window(*id),
            #[cfg(not(target_os = "windows"))]
            CaptureTarget::Window { .. } => Err(CaptureError::unavailable(
                "window capture is only supported on Windows",
            )),
        }
    }
}
