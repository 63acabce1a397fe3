//! Capture → limit → encode → deliver.
//!
//! One [`CapturePipeline`] owns one worker thread. The thread builds its
//! frame source from a factory (capturers are not `Send`), picks an encoder
//! strategy once, then ticks at the target frame rate until the running
//! flag drops. Output goes into a bounded channel with `try_send`; a slow
//! or vanished consumer costs frames, never the loop.

pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::encoder::jpeg::{self, JpegEncoder};
use crate::encoder::stream::{EncoderLauncher, EncoderState, KillHandle, StreamEncoder};
use crate::encoder::{Codec, EncodedChunk};
use crate::error::{CaptureError, PipelineError};
use crate::screen::capture::{FrameSource, SourceFactory};
use crate::screen::limiter;
use crate::screen::quality::{QualityController, MAX_QUALITY};
use crate::screen::{CaptureTarget, ResolutionLimit};

pub use stats::FrameStats;
use stats::StatsWindow;

/// Delivery queue depth. A couple of frames is enough to ride out a
/// broadcast hiccup without building latency.
pub const CHANNEL_CAPACITY: usize = 4;

const MIN_SLEEP: Duration = Duration::from_micros(100);
const UNAVAILABLE_BACKOFF: Duration = Duration::from_millis(50);
const ERROR_BACKOFF: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);
const KILL_GRACE: Duration = Duration::from_secs(1);
pub const STATS_INTERVAL: Duration = Duration::from_secs(3);

/// Settings the worker re-reads at the top of every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSettings {
    pub fps: u32,
    pub quality: u8,
    pub resolution_limit: ResolutionLimit,
}

impl LiveSettings {
    fn budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub target: CaptureTarget,
    pub live: LiveSettings,
    pub codec: Codec,
    pub bitrate: String,
    /// Let the controller drive JPEG quality. Ignored for H.264.
    pub adaptive_quality: bool,
    pub hw_available: bool,
    pub stats_interval: Duration,
}

/// One encoded frame ready for the wire.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub size: usize,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub codec: Codec,
    pub encoder: String,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Frame(FramePacket),
    Stats(FrameStats),
    /// The run ended on its own (encoder lost or never started).
    Failed(String),
}

/// How long to sleep after a tick that took `elapsed`. Never negative, and
/// no sleep at all for slivers under 100 µs.
pub fn pace_delay(budget: Duration, elapsed: Duration) -> Option<Duration> {
    let remaining = budget.checked_sub(elapsed)?;
    (remaining > MIN_SLEEP).then_some(remaining)
}

// ── Encoder strategy ────────────────────────────────────────────

enum Strategy {
    Still {
        encoder: JpegEncoder,
        quality: QualityController,
    },
    Stream(StreamEncoder),
}

impl Strategy {
    fn encoder_name(&self) -> String {
        match self {
            Strategy::Still { .. } => jpeg::NAME.to_string(),
            Strategy::Stream(enc) => enc.encoder_name().to_string(),
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────

struct Worker {
    target: CaptureTarget,
    bitrate: String,
    adaptive_quality: bool,
    hw_available: bool,
    running: Arc<AtomicBool>,
    live: Arc<Mutex<LiveSettings>>,
    applied: LiveSettings,
    snapshot: Arc<Mutex<FrameStats>>,
    kill_slot: Arc<Mutex<Option<KillHandle>>>,
    events: mpsc::Sender<PipelineEvent>,
    strategy: Strategy,
    window: StatsWindow,
    last: FrameStats,
    consumer_gone: bool,
}

impl Worker {
    fn run(mut self, source: SourceFactory) {
        let mut source = source();
        tracing::info!(
            target_source = %self.target,
            encoder = %self.strategy.encoder_name(),
            "capture loop started"
        );

        while self.running.load(Ordering::SeqCst) {
            let live = *self.live.lock().unwrap_or_else(PoisonError::into_inner);
            self.apply(live);
            let budget = live.budget();
            let started = Instant::now();

            match self.tick(source.as_mut(), live, budget) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("capture loop ending: {}", e);
                    let _ = self.events.try_send(PipelineEvent::Failed(e.to_string()));
                    break;
                }
                Err(PipelineError::Capture(CaptureError::Unavailable(reason))) => {
                    tracing::trace!("source unavailable: {}", reason);
                    std::thread::sleep(UNAVAILABLE_BACKOFF);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("tick failed: {}", e);
                    std::thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            }

            if let Some(delay) = pace_delay(budget, started.elapsed()) {
                std::thread::sleep(delay);
            }
        }

        match &mut self.strategy {
            Strategy::Stream(enc) => enc.stop(),
            Strategy::Still { encoder, .. } => {
                tracing::debug!(frames = encoder.frames_encoded(), "jpeg encoder finished")
            }
        }
        self.kill_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!(target_source = %self.target, "capture loop stopped");
    }

    /// Push changed live settings into the quality controller.
    fn apply(&mut self, live: LiveSettings) {
        if live == self.applied {
            return;
        }
        if let Strategy::Still { quality, .. } = &mut self.strategy {
            if live.resolution_limit != self.applied.resolution_limit {
                // Old tick timings say nothing about the new frame size.
                quality.reset(live.quality);
                quality.set_target_fps(live.fps);
            } else if live.fps != self.applied.fps {
                quality.set_target_fps(live.fps);
            }
            if live.quality != self.applied.quality {
                quality.set_quality(live.quality);
            }
        }
        tracing::debug!(
            fps = live.fps,
            quality = live.quality,
            limit = live.resolution_limit.as_str(),
            "live settings applied"
        );
        self.applied = live;
    }

    fn tick(
        &mut self,
        source: &mut dyn FrameSource,
        live: LiveSettings,
        budget: Duration,
    ) -> Result<(), PipelineError> {
        let t0 = Instant::now();
        let frame = source.capture(&self.target)?;
        let frame = limiter::limit_to(frame, live.resolution_limit);
        let captured = t0.elapsed();

        let t1 = Instant::now();
        let (chunk, width, height, quality) = match &mut self.strategy {
            Strategy::Still { encoder, quality } => {
                let q = if self.adaptive_quality {
                    quality.quality()
                } else {
                    live.quality.min(MAX_QUALITY)
                };
                let (w, h) = frame.dimensions();
                (encoder.encode(&frame, q)?, w, h, Some(q))
            }
            Strategy::Stream(enc) => {
                if enc.state() == EncoderState::Stopped {
                    let (w, h) = frame.dimensions();
                    enc.start(w, h, live.fps, &self.bitrate, self.hw_available)?;
                    *self.kill_slot.lock().unwrap_or_else(PoisonError::into_inner) =
                        enc.kill_handle();
                }
                let chunk = enc.encode_frame(frame)?;
                let (w, h) = enc
                    .params()
                    .map(|p| (p.width, p.height))
                    .unwrap_or_default();
                (chunk, w, h, None)
            }
        };
        let encoded = t1.elapsed();
        let total = t0.elapsed();

        if self.adaptive_quality {
            if let Strategy::Still { quality, .. } = &mut self.strategy {
                quality.update(total.as_secs_f64() * 1000.0);
            }
        }

        let size = chunk.data.len();
        if !chunk.is_empty() {
            self.deliver(chunk, width, height);
        }

        self.window.record(total, budget);
        self.last = FrameStats {
            capture_ms: captured.as_secs_f64() * 1000.0,
            encode_ms: encoded.as_secs_f64() * 1000.0,
            total_ms: total.as_secs_f64() * 1000.0,
            avg_tick_ms: self.window.avg_tick_ms(),
            frame_size: size,
            fps: self.last.fps,
            dropped_frames: self.window.dropped,
            resolution: format!("{}x{}", width, height),
            encoder: self.strategy.encoder_name(),
            quality,
        };

        if let Some(fps) = self.window.due() {
            self.last.fps = fps;
            self.publish();
        }
        Ok(())
    }

    fn deliver(&mut self, chunk: EncodedChunk, width: u32, height: u32) {
        let packet = FramePacket {
            size: chunk.data.len(),
            data: chunk.data,
            width,
            height,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            codec: chunk.codec,
            encoder: self.strategy.encoder_name(),
        };
        match self.events.try_send(PipelineEvent::Frame(packet)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("delivery queue full, frame dropped"),
            Err(TrySendError::Closed(_)) => {
                if !self.consumer_gone {
                    tracing::warn!("frame consumer went away");
                    self.consumer_gone = true;
                }
            }
        }
    }

    fn publish(&mut self) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = self.last.clone();
        tracing::info!(
            fps = self.last.fps,
            resolution = %self.last.resolution,
            encoder = %self.last.encoder,
            size = self.last.frame_size,
            dropped = self.last.dropped_frames,
            "capture stats"
        );
        if let Err(TrySendError::Full(_)) =
            self.events.try_send(PipelineEvent::Stats(self.last.clone()))
        {
            tracing::trace!("delivery queue full, stats dropped");
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────

pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    live: Arc<Mutex<LiveSettings>>,
    stats: Arc<Mutex<FrameStats>>,
    kill_slot: Arc<Mutex<Option<KillHandle>>>,
    worker: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Spawn the capture worker. Encoder start happens lazily on the first
    /// captured frame, so a start failure arrives as [`PipelineEvent::Failed`].
    pub fn start(
        config: PipelineConfig,
        source: SourceFactory,
        launcher: Arc<dyn EncoderLauncher>,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<Self, PipelineError> {
        let running = Arc::new(AtomicBool::new(true));
        let live = Arc::new(Mutex::new(config.live));
        let stats = Arc::new(Mutex::new(FrameStats::default()));
        let kill_slot = Arc::new(Mutex::new(None));

        let strategy = match config.codec {
            Codec::Jpeg => Strategy::Still {
                encoder: JpegEncoder::new(),
                quality: QualityController::new(config.live.fps, config.live.quality),
            },
            Codec::H264 => Strategy::Stream(StreamEncoder::new(launcher)),
        };

        let worker = Worker {
            target: config.target.clone(),
            bitrate: config.bitrate,
            adaptive_quality: config.adaptive_quality && config.codec == Codec::Jpeg,
            hw_available: config.hw_available,
            running: Arc::clone(&running),
            live: Arc::clone(&live),
            applied: config.live,
            snapshot: Arc::clone(&stats),
            kill_slot: Arc::clone(&kill_slot),
            events,
            strategy,
            window: StatsWindow::new(config.stats_interval),
            last: FrameStats::default(),
            consumer_gone: false,
        };

        let handle = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || worker.run(source))
            .map_err(PipelineError::Spawn)?;

        Ok(Self {
            running,
            live,
            stats,
            kill_slot,
            worker: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn live_settings(&self) -> LiveSettings {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applied by the worker at the top of its next tick.
    pub fn update_settings(&self, settings: LiveSettings) {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Last snapshot published by the worker.
    pub fn stats(&self) -> FrameStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Signal the worker and wait for it. Blocks for at most a few seconds:
    /// a worker stuck on its encoder gets the encoder process killed under
    /// it, and one that still will not exit is detached.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };

        if !wait_finished(&worker, JOIN_TIMEOUT) {
            tracing::warn!("capture worker slow to stop, killing encoder");
            if let Some(kill) = self
                .kill_slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                kill.kill();
            }
            if !wait_finished(&worker, KILL_GRACE) {
                tracing::error!("capture worker did not exit, detaching");
                return;
            }
        }
        if worker.join().is_err() {
            tracing::error!("capture worker panicked");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wait_finished(worker: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !worker.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::FrameBuffer;
    use std::sync::atomic::AtomicUsize;

    /// Serves a solid frame of a fixed size, optionally pausing to look slow.
    struct SolidSource {
        width: u32,
        height: u32,
        delay: Duration,
        captures: Arc<AtomicUsize>,
    }

    impl FrameSource for SolidSource {
        fn capture(&mut self, _target: &CaptureTarget) -> Result<FrameBuffer, CaptureError> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(FrameBuffer::filled(self.width, self.height, [40, 80, 120]))
        }
    }

    struct GoneSource;

    impl FrameSource for GoneSource {
        fn capture(&mut self, _target: &CaptureTarget) -> Result<FrameBuffer, CaptureError> {
            Err(CaptureError::unavailable("window closed"))
        }
    }

    fn solid(width: u32, height: u32, delay: Duration) -> (SourceFactory, Arc<AtomicUsize>) {
        let captures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&captures);
        let factory: SourceFactory = Box::new(move || {
            Box::new(SolidSource {
                width,
                height,
                delay,
                captures: counter,
            }) as Box<dyn FrameSource>
        });
        (factory, captures)
    }

    fn config(codec: Codec, fps: u32, limit: ResolutionLimit) -> PipelineConfig {
        PipelineConfig {
            target: CaptureTarget::default(),
            live: LiveSettings {
                fps,
                quality: 85,
                resolution_limit: limit,
            },
            codec,
            bitrate: "35M".into(),
            adaptive_quality: true,
            hw_available: false,
            stats_interval: Duration::from_millis(200),
        }
    }

    fn unused_launcher() -> Arc<dyn EncoderLauncher> {
        Arc::new(crate::encoder::stream::FfmpegLauncher::new("ffmpeg"))
    }

    /// Receive until a frame shows up, skipping stats.
    fn next_frame(rx: &mut mpsc::Receiver<PipelineEvent>, timeout: Duration) -> FramePacket {
        let deadline = Instant::now() + timeout;
        loop {
            match rx.try_recv() {
                Ok(PipelineEvent::Frame(f)) => return f,
                Ok(PipelineEvent::Failed(e)) => panic!("pipeline failed: {}", e),
                Ok(PipelineEvent::Stats(_)) => {}
                Err(_) => {
                    assert!(Instant::now() < deadline, "no frame within {:?}", timeout);
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    #[test]
    fn pacing_never_negative_and_skips_slivers() {
        let budget = Duration::from_millis(16);
        assert_eq!(pace_delay(budget, Duration::from_millis(20)), None);
        assert_eq!(pace_delay(budget, budget), None);
        assert_eq!(pace_delay(budget, budget - Duration::from_micros(50)), None);
        assert_eq!(
            pace_delay(budget, Duration::from_millis(6)),
            Some(Duration::from_millis(10))
        );
        for fps in 1..=240u32 {
            let b = LiveSettings {
                fps,
                quality: 80,
                resolution_limit: ResolutionLimit::Native,
            }
            .budget();
            if let Some(d) = pace_delay(b, Duration::ZERO) {
                assert!(d > MIN_SLEEP && d <= b);
            }
        }
    }

    #[test]
    fn jpeg_frames_are_delivered_in_bounds() {
        let (source, _) = solid(400, 300, Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut pipeline = CapturePipeline::start(
            config(Codec::Jpeg, 30, ResolutionLimit::FullHd),
            source,
            unused_launcher(),
            tx,
        )
        .unwrap();

        let frame = next_frame(&mut rx, Duration::from_secs(5));
        assert_eq!(frame.codec, Codec::Jpeg);
        assert_eq!(frame.encoder, "jpeg");
        assert_eq!((frame.width, frame.height), (400, 300));
        assert_eq!(frame.size, frame.data.len());
        assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn nothing_arrives_after_stop() {
        let (source, captures) = solid(64, 64, Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut pipeline = CapturePipeline::start(
            config(Codec::Jpeg, 60, ResolutionLimit::Native),
            source,
            unused_launcher(),
            tx,
        )
        .unwrap();
        next_frame(&mut rx, Duration::from_secs(5));
        pipeline.stop();

        while rx.try_recv().is_ok() {}
        let after = captures.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(captures.load(Ordering::SeqCst), after);
        // Worker and its sender are gone.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn live_resolution_change_applies_without_restart() {
        let (source, _) = solid(1600, 900, Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut pipeline = CapturePipeline::start(
            config(Codec::Jpeg, 30, ResolutionLimit::Native),
            source,
            unused_launcher(),
            tx,
        )
        .unwrap();
        let first = next_frame(&mut rx, Duration::from_secs(5));
        assert_eq!((first.width, first.height), (1600, 900));

        let mut live = pipeline.live_settings();
        live.resolution_limit = ResolutionLimit::Hd;
        pipeline.update_settings(live);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let f = next_frame(&mut rx, Duration::from_secs(5));
            if (f.width, f.height) == (1280, 720) {
                break;
            }
            assert!(Instant::now() < deadline, "limit never applied");
        }
        assert!(pipeline.is_running());
        pipeline.stop();
    }

    #[test]
    fn slow_ticks_are_counted_and_reported() {
        let (source, _) = solid(32, 32, Duration::from_millis(30));
        let (tx, mut rx) = mpsc::channel(64);
        let mut pipeline = CapturePipeline::start(
            config(Codec::Jpeg, 100, ResolutionLimit::Native),
            source,
            unused_launcher(),
            tx,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let stats = loop {
            match rx.try_recv() {
                Ok(PipelineEvent::Stats(s)) => break s,
                Ok(_) => {}
                Err(_) => {
                    assert!(Instant::now() < deadline, "no stats");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        };
        assert!(stats.dropped_frames > 0);
        assert!(stats.fps > 0.0 && stats.fps < 100.0);
        assert_eq!(stats.resolution, "32x32");
        assert_eq!(stats.encoder, "jpeg");
        assert!(stats.quality.is_some());
        assert_eq!(pipeline.stats().encoder, "jpeg");
        pipeline.stop();
    }

    #[test]
    fn unavailable_source_keeps_looping() {
        let factory: SourceFactory = Box::new(|| Box::new(GoneSource) as Box<dyn FrameSource>);
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut pipeline = CapturePipeline::start(
            config(Codec::Jpeg, 30, ResolutionLimit::Native),
            factory,
            unused_launcher(),
            tx,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(pipeline.is_running());
        assert!(rx.try_recv().is_err());
        pipeline.stop();
    }

    #[test]
    fn full_channel_does_not_stall_the_loop() {
        let (source, captures) = solid(16, 16, Duration::ZERO);
        let (tx, rx) = mpsc::channel(1);
        let mut pipeline = CapturePipeline::start(
            config(Codec::Jpeg, 120, ResolutionLimit::Native),
            source,
            unused_launcher(),
            tx,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(captures.load(Ordering::SeqCst) > 5);
        pipeline.stop();
        drop(rx);
    }

    #[cfg(unix)]
    mod stream {
        use super::*;
        use crate::encoder::stream::testing::ShellLauncher;

        #[test]
        fn uhd_source_under_fullhd_ceiling_streams_h264() {
            let (source, _) = solid(3840, 2160, Duration::ZERO);
            let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
            let mut pipeline = CapturePipeline::start(
                config(Codec::H264, 60, ResolutionLimit::FullHd),
                source,
                Arc::new(ShellLauncher::echo()),
                tx,
            )
            .unwrap();

            let frame = next_frame(&mut rx, Duration::from_secs(20));
            assert_eq!(frame.codec, Codec::H264);
            assert_eq!(frame.encoder, "libx264");
            assert!(frame.width <= 1920 && frame.height <= 1080);
            let ratio = frame.width as f64 / frame.height as f64;
            assert!((ratio - 16.0 / 9.0).abs() < 0.01);
            pipeline.stop();
        }

        #[test]
        fn hardware_failure_falls_back_to_software() {
            let (source, _) = solid(320, 240, Duration::ZERO);
            let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
            let mut cfg = config(Codec::H264, 30, ResolutionLimit::FullHd);
            cfg.hw_available = true;
            let mut pipeline = CapturePipeline::start(
                cfg,
                source,
                Arc::new(ShellLauncher::broken_hardware()),
                tx,
            )
            .unwrap();

            let frame = next_frame(&mut rx, Duration::from_secs(10));
            assert_eq!(frame.codec, Codec::H264);
            assert_eq!(frame.encoder, "libx264");
            pipeline.stop();
        }

        #[test]
        fn encoder_start_failure_ends_the_run() {
            let (source, _) = solid(320, 240, Duration::ZERO);
            let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
            let launcher = ShellLauncher {
                hardware: "exit 1",
                software: "exit 1",
            };
            let mut pipeline = CapturePipeline::start(
                config(Codec::H264, 30, ResolutionLimit::FullHd),
                source,
                Arc::new(launcher),
                tx,
            )
            .unwrap();

            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match rx.try_recv() {
                    Ok(PipelineEvent::Failed(_)) => break,
                    Ok(PipelineEvent::Frame(_)) => panic!("no frame expected"),
                    _ => {
                        assert!(Instant::now() < deadline, "no failure reported");
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            assert!(wait_finished(
                pipeline.worker.as_ref().unwrap(),
                Duration::from_secs(2)
            ));
            pipeline.stop();
        }

        #[test]
        fn stop_terminates_the_encoder() {
            let (source, _) = solid(64, 64, Duration::ZERO);
            let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
            let mut pipeline = CapturePipeline::start(
                config(Codec::H264, 30, ResolutionLimit::Native),
                source,
                Arc::new(ShellLauncher::echo()),
                tx,
            )
            .unwrap();
            next_frame(&mut rx, Duration::from_secs(10));
            let started = Instant::now();
            pipeline.stop();
            assert!(started.elapsed() < JOIN_TIMEOUT + KILL_GRACE);
            assert!(!pipeline.is_running());
            assert!(pipeline.kill_slot.lock().unwrap().is_none());
        }
    }
}
