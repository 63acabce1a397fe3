//! System audio capture.
//!
//! On Windows the default output device is opened as a WASAPI loopback
//! input, so viewers hear what the presenter hears. Elsewhere the default
//! input device is used. Samples are cut into 20 ms chunks of interleaved
//! little-endian PCM16 with at most two channels.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::AudioError;

const CHUNK_MS: usize = 20;
const MAX_CHANNELS: u16 = 2;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const CHANNEL_CAPACITY: usize = 16;

/// One chunk of interleaved PCM16.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

fn capture_device(host: &cpal::Host) -> Option<(cpal::Device, cpal::SupportedStreamConfig)> {
    #[cfg(target_os = "windows")]
    {
        if let Some(device) = host.default_output_device() {
            if let Ok(config) = device.default_output_config() {
                return Some((device, config));
            }
        }
    }
    let device = host.default_input_device()?;
    let config = device.default_input_config().ok()?;
    Some((device, config))
}

/// Whether a capture device exists at all. Checked once per command, so
/// it only enumerates defaults.
pub fn audio_available() -> bool {
    capture_device(&cpal::default_host()).is_some()
}

/// Splits a callback's interleaved samples into fixed 20 ms PCM16 chunks.
struct Chunker {
    in_channels: usize,
    out_channels: usize,
    chunk_frames: usize,
    pending: Vec<i16>,
}

impl Chunker {
    fn new(sample_rate: u32, in_channels: u16) -> Self {
        let in_channels = in_channels.max(1) as usize;
        let out_channels = in_channels.min(MAX_CHANNELS as usize);
        let chunk_frames = (sample_rate as usize * CHUNK_MS / 1000).max(1);
        Self {
            in_channels,
            out_channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * out_channels * 2),
        }
    }

    fn push<T>(&mut self, data: &[T]) -> Vec<Vec<u8>>
    where
        T: Sample,
        f32: FromSample<T>,
    {
        for frame in data.chunks_exact(self.in_channels) {
            for &s in &frame[..self.out_channels] {
                self.pending.push(to_pcm16(s.to_sample::<f32>()));
            }
        }

        let chunk_len = self.chunk_frames * self.out_channels;
        let mut out = Vec::new();
        while self.pending.len() >= chunk_len {
            let bytes = self
                .pending
                .drain(..chunk_len)
                .flat_map(i16::to_le_bytes)
                .collect();
            out.push(bytes);
        }
        out
    }
}

fn to_pcm16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: mpsc::Sender<AudioPacket>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let sample_rate = config.sample_rate.0;
    let mut chunker = Chunker::new(sample_rate, config.channels);
    let channels = chunker.out_channels as u16;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for data in chunker.push(data) {
                let packet = AudioPacket {
                    data,
                    sample_rate,
                    channels,
                };
                if let Err(TrySendError::Full(_)) = tx.try_send(packet) {
                    tracing::trace!("audio queue full, chunk dropped");
                }
            }
        },
        |err| tracing::warn!("audio stream error: {}", err),
        None,
    )
}

fn open_stream(tx: mpsc::Sender<AudioPacket>) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let (device, supported) = capture_device(&host).ok_or(AudioError::NoDevice)?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    tracing::info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        rate = config.sample_rate.0,
        channels = config.channels,
        ?format,
        "opening audio capture"
    );

    let stream = match format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, tx),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, tx),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, tx),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, tx),
        other => return Err(AudioError::Stream(format!("unsupported sample format {:?}", other))),
    }
    .map_err(|e| AudioError::Stream(e.to_string()))?;
    stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
    Ok(stream)
}

/// Owns the audio worker. The cpal stream lives on that thread because it
/// is not `Send` on every backend.
pub struct AudioProducer {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AudioProducer {
    /// Open the device and start streaming chunks into `tx`. Returns once
    /// the stream is playing, or with the reason it could not start.
    pub fn start(tx: mpsc::Sender<AudioPacket>) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let worker = std::thread::Builder::new()
            .name("audio".into())
            .spawn(move || {
                let stream = match open_stream(tx) {
                    Ok(s) => {
                        let _ = ready_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while flag.load(Ordering::SeqCst) {
                    std::thread::sleep(POLL_INTERVAL);
                }
                drop(stream);
                tracing::info!("audio capture stopped");
            })
            .map_err(AudioError::Spawn)?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                running,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                Err(AudioError::Stream("audio device did not start in time".into()))
            }
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("audio worker panicked");
            }
        }
    }
}

impl Drop for AudioProducer {
    fn drop(&mut self) {
        self.stop();
    }
}
