use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: usize = 30;

/// Snapshot published every stats interval for external reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameStats {
    pub capture_ms: f64,
    pub encode_ms: f64,
    pub total_ms: f64,
    /// Average tick time over the last 30 ticks.
    pub avg_tick_ms: f64,
    pub frame_size: usize,
    pub fps: f64,
    pub dropped_frames: u64,
    pub resolution: String,
    pub encoder: String,
    /// JPEG quality in effect, `None` for the streaming encoder.
    pub quality: Option<u8>,
}

/// Per-tick bookkeeping owned by the capture worker.
pub(crate) struct StatsWindow {
    tick_ms: VecDeque<f64>,
    frames_since_report: u64,
    last_report: Instant,
    interval: Duration,
    pub dropped: u64,
}

impl StatsWindow {
    pub fn new(interval: Duration) -> Self {
        Self {
            tick_ms: VecDeque::with_capacity(WINDOW),
            frames_since_report: 0,
            last_report: Instant::now(),
            interval,
            dropped: 0,
        }
    }

    /// Record one encoded tick. Ticks over twice the budget count as
    /// dropped; the frame itself is still delivered.
    pub fn record(&mut self, total: Duration, budget: Duration) {
        if self.tick_ms.len() == WINDOW {
            self.tick_ms.pop_front();
        }
        self.tick_ms.push_back(total.as_secs_f64() * 1000.0);
        self.frames_since_report += 1;
        if total > budget * 2 {
            self.dropped += 1;
        }
    }

    pub fn avg_tick_ms(&self) -> f64 {
        if self.tick_ms.is_empty() {
            return 0.0;
        }
        self.tick_ms.iter().sum::<f64>() / self.tick_ms.len() as f64
    }

    /// If the interval elapsed, return the fps measured over it and start
    /// a new interval.
    pub fn due(&mut self) -> Option<f64> {
        let elapsed = self.last_report.elapsed();
        if elapsed < self.interval {
            return None;
        }
        let fps = self.frames_since_report as f64 / elapsed.as_secs_f64();
        self.frames_since_report = 0;
        self.last_report = Instant::now();
        Some(fps)
    }
}
