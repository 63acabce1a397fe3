//! Adaptive JPEG quality.
//!
//! Watches the full per-tick pipeline time and nudges the JPEG quality
//! down when the pipeline cannot keep up, and back up when there is
//! headroom. Only the still-image strategy consults this; the streaming
//! encoder's quality is fixed by its rate-control settings.

use std::collections::VecDeque;

pub const MIN_QUALITY: u8 = 70;
pub const MAX_QUALITY: u8 = 95;

const WINDOW: usize = 20;
const MIN_SAMPLES: usize = 5;
const COOLDOWN_TICKS: u32 = 15;
const STEP_DOWN: u8 = 5;
const STEP_UP: u8 = 3;
const SLOW_FACTOR: f64 = 1.3;
const FAST_FACTOR: f64 = 0.6;

#[derive(Debug, Clone)]
pub struct QualityController {
    target_frame_ms: f64,
    current_quality: u8,
    samples: VecDeque<f64>,
    cooldown: u32,
}

impl QualityController {
    pub fn new(target_fps: u32, initial_quality: u8) -> Self {
        Self {
            target_frame_ms: frame_ms(target_fps),
            current_quality: clamp_quality(initial_quality),
            samples: VecDeque::with_capacity(WINDOW),
            cooldown: 0,
        }
    }

    pub fn quality(&self) -> u8 {
        self.current_quality
    }

    #[cfg(test)]
    pub fn cooldown(&self) -> u32 {
        self.cooldown
    }

    /// Feed one tick's capture+resize+encode time. Returns the quality
    /// to use from now on.
    pub fn update(&mut self, tick_ms: f64) -> u8 {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(tick_ms);

        if self.cooldown > 0 {
            self.cooldown -= 1;
            return self.current_quality;
        }
        if self.samples.len() < MIN_SAMPLES {
            return self.current_quality;
        }

        let avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        if avg > self.target_frame_ms * SLOW_FACTOR {
            if self.current_quality > MIN_QUALITY {
                self.current_quality = self.current_quality.saturating_sub(STEP_DOWN).max(MIN_QUALITY);
                self.cooldown = COOLDOWN_TICKS;
                tracing::debug!(quality = self.current_quality, avg_ms = avg, "lowering JPEG quality");
            }
        } else if avg < self.target_frame_ms * FAST_FACTOR && self.current_quality < MAX_QUALITY {
            self.current_quality = (self.current_quality + STEP_UP).min(MAX_QUALITY);
            self.cooldown = COOLDOWN_TICKS;
            tracing::debug!(quality = self.current_quality, avg_ms = avg, "raising JPEG quality");
        }
        self.current_quality
    }

    pub fn set_target_fps(&mut self, fps: u32) {
        self.target_frame_ms = frame_ms(fps);
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.current_quality = clamp_quality(quality);
    }

    pub fn reset(&mut self, quality: u8) {
        self.current_quality = clamp_quality(quality);
        self.samples.clear();
        self.cooldown = 0;
    }
}

fn frame_ms(fps: u32) -> f64 {
    1000.0 / fps.max(1) as f64
}

fn clamp_quality(q: u8) -> u8 {
    q.clamp(MIN_QUALITY, MAX_QUALITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_five_samples() {
        let mut qc = QualityController::new(30, 90);
        for _ in 0..4 {
            assert_eq!(qc.update(500.0), 90);
        }
        assert_eq!(qc.update(500.0), 85);
    }

    #[test]
    fn frozen_for_fifteen_ticks_after_a_change() {
        let mut qc = QualityController::new(30, 90);
        for _ in 0..5 {
            qc.update(500.0);
        }
        assert_eq!(qc.quality(), 85);
        for _ in 0..15 {
            assert_eq!(qc.update(500.0), 85);
        }
        assert_eq!(qc.update(500.0), 80);
    }

    #[test]
    fn never_leaves_bounds() {
        let mut qc = QualityController::new(60, 95);
        for _ in 0..500 {
            let q = qc.update(1000.0);
            assert!((MIN_QUALITY..=MAX_QUALITY).contains(&q));
        }
        assert_eq!(qc.quality(), MIN_QUALITY);

        for _ in 0..500 {
            let q = qc.update(0.1);
            assert!((MIN_QUALITY..=MAX_QUALITY).contains(&q));
        }
        assert_eq!(qc.quality(), MAX_QUALITY);
    }

    #[test]
    fn steady_budget_is_left_alone() {
        // 30fps ≈ 33.3ms target; 25ms is between 0.6x and 1.3x.
        let mut qc = QualityController::new(30, 80);
        for _ in 0..50 {
            assert_eq!(qc.update(25.0), 80);
        }
        assert_eq!(qc.cooldown(), 0);
    }

    #[test]
    fn initial_quality_is_clamped() {
        assert_eq!(QualityController::new(30, 100).quality(), MAX_QUALITY);
        assert_eq!(QualityController::new(30, 10).quality(), MIN_QUALITY);
    }
}
