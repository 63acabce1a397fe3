//! Presenter arbitration.
//!
//! All session commands funnel through [`Arbitrator`]. Its one lock is held
//! across a whole command, including the blocking teardown of a previous
//! pipeline, so two pipelines never coexist and a takeover cannot
//! interleave frames from two sources.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::hub::{Hub, Outbox};
use super::{generate_client_id, ClientId, ClientRegistry, Session, Settings, PRESETS};
use crate::audio::{self, AudioPacket, AudioProducer};
use crate::encoder::stream::{EncoderLauncher, EncoderProfile, HardwareSupport};
use crate::encoder::{jpeg, Codec};
use crate::error::{AudioError, CaptureError, PipelineError};
use crate::pipeline::{self, CapturePipeline, PipelineConfig, PipelineEvent};
use crate::protocol::{
    ChatMessage, ClientCommand, Connected, ServerEvent, SettingsChange, SharingStarted,
    SourceSelected, SourceSelection, StartSharing,
};
use crate::screen::capture::{self, SourceFactory, SourceInfo};
use crate::screen::CaptureTarget;

const AUDIO_UNAVAILABLE: &str = "Audio sharing is not available on this host";
const STOPPED: &str = "Screen sharing stopped";

/// A running audio capture that can be shut down.
pub trait AudioStream: Send {
    fn stop(&mut self);
}

impl AudioStream for AudioProducer {
    fn stop(&mut self) {
        AudioProducer::stop(self);
    }
}

/// Host capture capabilities.
pub trait Devices: Send + Sync {
    /// Factory for a new pipeline's frame source. Fails when the target
    /// can never be captured on this host.
    fn frame_source(&self, target: &CaptureTarget) -> Result<SourceFactory, CaptureError>;
    fn list_sources(&self) -> Vec<SourceInfo>;
    fn audio_available(&self) -> bool;
    fn start_audio(&self, tx: mpsc::Sender<AudioPacket>) -> Result<Box<dyn AudioStream>, AudioError>;
}

/// The real screens, windows and sound card.
pub struct SystemDevices;

impl Devices for SystemDevices {
    fn frame_source(&self, target: &CaptureTarget) -> Result<SourceFactory, CaptureError> {
        match target {
            CaptureTarget::Monitor { .. } if capture::list_monitors().is_empty() => {
                Err(CaptureError::unavailable("no displays found"))
            }
            #[cfg(not(target_os = "windows"))]
            CaptureTarget::Window { .. } => Err(CaptureError::unavailable(
                "window capture is only supported on Windows",
            )),
            _ => Ok(capture::platform_factory()),
        }
    }

    fn list_sources(&self) -> Vec<SourceInfo> {
        capture::list_sources()
    }

    fn audio_available(&self) -> bool {
        audio::audio_available()
    }

    fn start_audio(&self, tx: mpsc::Sender<AudioPacket>) -> Result<Box<dyn AudioStream>, AudioError> {
        Ok(Box::new(AudioProducer::start(tx)?))
    }
}

/// How pipelines encode.
#[derive(Clone)]
pub struct EncoderSetup {
    pub launcher: Arc<dyn EncoderLauncher>,
    /// Probe result, reported to clients.
    pub hardware: HardwareSupport,
    /// Try the hardware profile first.
    pub hw_available: bool,
    pub adaptive_quality: bool,
    pub stats_interval: Duration,
}

impl EncoderSetup {
    /// Encoder a new pipeline would start with.
    fn expected_encoder(&self, codec: Codec) -> &'static str {
        match codec {
            Codec::Jpeg => jpeg::NAME,
            Codec::H264 if self.hw_available => EncoderProfile::Hardware.encoder_name(),
            Codec::H264 => EncoderProfile::Software.encoder_name(),
        }
    }
}

struct ActiveShare {
    pipeline: CapturePipeline,
    forwarder: JoinHandle<()>,
}

struct ActiveAudio {
    stream: Box<dyn AudioStream>,
    forwarder: JoinHandle<()>,
}

struct Inner {
    session: Session,
    registry: ClientRegistry,
    share: Option<ActiveShare>,
    audio: Option<ActiveAudio>,
}

pub struct Arbitrator {
    inner: Mutex<Inner>,
    hub: Hub,
    devices: Arc<dyn Devices>,
    encoder: EncoderSetup,
    /// Probed once; device enumeration blocks.
    audio_available: bool,
}

impl Arbitrator {
    /// Probes audio devices, so call it off the async runtime.
    pub fn new(hub: Hub, devices: Arc<dyn Devices>, encoder: EncoderSetup, settings: Settings) -> Self {
        let audio_available = devices.audio_available();
        if !audio_available {
            tracing::info!("no audio capture device; audio sharing disabled");
        }
        Self {
            inner: Mutex::new(Inner {
                session: Session::new(settings),
                registry: ClientRegistry::default(),
                share: None,
                audio: None,
            }),
            hub,
            devices,
            encoder,
            audio_available,
        }
    }

    #[cfg(test)]
    pub async fn session(&self) -> Session {
        self.inner.lock().await.session.clone()
    }

    #[cfg(test)]
    pub async fn is_capturing(&self) -> bool {
        self.inner
            .lock()
            .await
            .share
            .as_ref()
            .is_some_and(|s| s.pipeline.is_running())
    }

    // ── Connection lifecycle ────────────────────────────────────

    pub async fn connect(&self, addr: IpAddr, outbox: Outbox) -> ClientId {
        let client = generate_client_id();
        let audio_available = self.audio_available;
        let mut inner = self.inner.lock().await;
        let count = inner.registry.add(client.clone(), addr);
        self.hub.register(client.clone(), outbox).await;

        let session = &inner.session;
        let connected = Connected {
            client_id: client.clone(),
            client_count: count,
            audio_available,
            presets: PRESETS.iter().map(|p| p.to_string()).collect(),
            hardware: self.encoder.hardware,
            is_sharing: session.sharer.is_some(),
            current_sharer: session.sharer.clone(),
            codec: session.settings.codec,
            encoder: self.encoder.expected_encoder(session.settings.codec).to_string(),
            settings: session.settings.clone(),
        };
        tracing::info!(
            client = %client,
            %addr,
            viewers = count,
            connections = inner.registry.connections(),
            "client connected"
        );
        self.hub.send_to(&client, ServerEvent::Connected(connected)).await;
        self.hub
            .broadcast(ServerEvent::ClientCountUpdated { count })
            .await;
        client
    }

    pub async fn disconnect(&self, client: &str) {
        let mut inner = self.inner.lock().await;
        self.hub.unregister(client).await;
        let count = inner.registry.remove(client);
        tracing::info!(
            client,
            viewers = count,
            connections = inner.registry.connections(),
            "client disconnected"
        );

        if inner.session.is_sharer(client) {
            tracing::info!(client, "sharer left, stopping");
            self.stop_locked(&mut inner, STOPPED.into()).await;
        }
        self.hub
            .broadcast(ServerEvent::ClientCountUpdated { count })
            .await;
    }

    // ── Commands ────────────────────────────────────────────────

    pub async fn handle(&self, caller: &str, command: ClientCommand) {
        tracing::debug!(client = caller, "command {}", command.name());
        match command {
            ClientCommand::GetSources => self.get_sources(caller).await,
            ClientCommand::SelectSource(sel) => self.select_source(caller, sel).await,
            ClientCommand::StartSharing(req) => self.start_sharing(caller, req).await,
            ClientCommand::StopSharing => self.stop_sharing(caller).await,
            ClientCommand::ChangeSettings(change) => self.change_settings(caller, change).await,
            ClientCommand::StartAudio => self.start_audio(caller).await,
            ClientCommand::SendMessage(ChatMessage { message }) => {
                self.send_message(caller, message).await
            }
            ClientCommand::StopAudio => self.stop_audio(caller).await,
        }
    }

    /// Anyone may browse.
    pub async fn get_sources(&self, caller: &str) {
        let devices = Arc::clone(&self.devices);
        let sources = match tokio::task::spawn_blocking(move || devices.list_sources()).await {
            Ok(sources) => sources,
            Err(e) => {
                tracing::error!("source enumeration failed: {}", e);
                Vec::new()
            }
        };
        let current = self.inner.lock().await.session.target.clone();
        tracing::debug!(client = caller, "sending {} sources", sources.len());
        self.hub
            .send_to(caller, ServerEvent::SourcesList { sources, current })
            .await;
    }

    /// Anyone may select. Takes effect on the next start.
    pub async fn select_source(&self, caller: &str, selection: SourceSelection) {
        let mut inner = self.inner.lock().await;
        self.select_locked(&mut inner, caller, selection).await;
    }

    async fn select_locked(&self, inner: &mut Inner, caller: &str, selection: SourceSelection) {
        let target = selection.into_target();
        tracing::info!(client = caller, "selected {}", target);
        let ack = SourceSelected::from(&target);
        inner.session.target = target;
        self.hub.send_to(caller, ServerEvent::SourceSelected(ack)).await;
    }

    pub async fn start_sharing(&self, caller: &str, request: StartSharing) {
        let mut inner = self.inner.lock().await;

        if let Some(previous) = inner.session.sharer.clone() {
            if previous != caller {
                tracing::info!(from = %previous, to = caller, "sharing taken over");
                self.hub
                    .send_to(
                        &previous,
                        ServerEvent::SharingTakenOver {
                            new_sharer: caller.to_string(),
                        },
                    )
                    .await;
            }
        }
        // The previous run is fully gone before anything new starts.
        self.stop_audio_locked(&mut inner).await;
        self.stop_pipeline_locked(&mut inner).await;

        inner.session.sharer = Some(caller.to_string());
        if request.preset.is_some() {
            let change = SettingsChange {
                preset: request.preset.clone(),
                ..Default::default()
            };
            inner.session.settings.apply(&change);
        }
        if let Some(selection) = request.source {
            self.select_locked(&mut inner, caller, selection).await;
        }
        if request.with_audio && self.audio_available {
            if let Err(e) = self.start_audio_locked(&mut inner).await {
                tracing::warn!("audio did not start with the share: {}", e);
            }
        }

        if let Err(e) = self.start_pipeline_locked(&mut inner) {
            tracing::error!(client = caller, "could not start capture: {}", e);
            self.stop_locked(&mut inner, format!("Screen sharing could not start: {}", e))
                .await;
            return;
        }

        let session = &inner.session;
        tracing::info!(
            client = caller,
            target_source = %session.target,
            fps = session.settings.fps,
            codec = %session.settings.codec,
            state = ?session.state(),
            "sharing started"
        );
        self.hub
            .broadcast(ServerEvent::SharingStarted(SharingStarted {
                target: session.target.to_string(),
                sharer_id: caller.to_string(),
                settings: session.settings.clone(),
            }))
            .await;
    }

    /// Sharer only. Anyone else is ignored without a reply.
    pub async fn stop_sharing(&self, caller: &str) {
        let mut inner = self.inner.lock().await;
        if !inner.session.is_sharer(caller) {
            return;
        }
        self.stop_locked(&mut inner, STOPPED.into()).await;
    }

    /// Sharer only. Frame rate, quality and resolution ceiling go straight
    /// into the running pipeline; codec or bitrate changes restart it.
    pub async fn change_settings(&self, caller: &str, change: SettingsChange) {
        let mut inner = self.inner.lock().await;
        if !inner.session.is_sharer(caller) {
            return;
        }
        let before = inner.session.settings.clone();
        inner.session.settings.apply(&change);
        let after = inner.session.settings.clone();

        if inner.share.is_some() {
            if before.needs_restart(&after) {
                tracing::info!(codec = %after.codec, bitrate = %after.bitrate, "restarting pipeline");
                self.stop_pipeline_locked(&mut inner).await;
                if let Err(e) = self.start_pipeline_locked(&mut inner) {
                    tracing::error!("could not restart capture: {}", e);
                    self.stop_locked(
                        &mut inner,
                        format!("Screen sharing could not restart: {}", e),
                    )
                    .await;
                    return;
                }
            } else if let Some(share) = &inner.share {
                if share.pipeline.live_settings() != after.live() {
                    share.pipeline.update_settings(after.live());
                }
            }
        }

        self.hub.broadcast(ServerEvent::SettingsChanged(after)).await;
    }

    /// Missing audio is reported to anyone who asks; otherwise sharer only.
    pub async fn start_audio(&self, caller: &str) {
        if !self.audio_available {
            self.hub
                .send_to(
                    caller,
                    ServerEvent::AudioError {
                        message: AUDIO_UNAVAILABLE.into(),
                    },
                )
                .await;
            return;
        }
        let mut inner = self.inner.lock().await;
        if !inner.session.is_sharer(caller) || inner.audio.is_some() {
            return;
        }
        match self.start_audio_locked(&mut inner).await {
            Ok(()) => {
                self.hub
                    .broadcast(ServerEvent::AudioStarted {
                        message: "Audio sharing started".into(),
                    })
                    .await;
            }
            Err(e) => {
                tracing::warn!("audio start failed: {}", e);
                self.hub
                    .send_to(
                        caller,
                        ServerEvent::AudioError {
                            message: e.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    pub async fn stop_audio(&self, caller: &str) {
        let mut inner = self.inner.lock().await;
        if !inner.session.is_sharer(caller) {
            return;
        }
        self.stop_audio_locked(&mut inner).await;
        self.hub
            .broadcast(ServerEvent::AudioStopped {
                message: "Audio sharing stopped".into(),
            })
            .await;
    }

    /// Anyone may post. Blank messages are dropped.
    pub async fn send_message(&self, caller: &str, message: String) {
        if message.trim().is_empty() {
            return;
        }
        tracing::info!(client = caller, "message: {}", message);
        self.hub
            .broadcast(ServerEvent::MessageReceived {
                message,
                from: caller.to_string(),
            })
            .await;
    }

    /// Stop whatever is running before the process exits.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session.sharer.is_some() {
            self.stop_locked(&mut inner, STOPPED.into()).await;
        }
    }

    // ── Internals (lock held) ───────────────────────────────────

    async fn stop_locked(&self, inner: &mut Inner, message: String) {
        self.stop_audio_locked(inner).await;
        self.stop_pipeline_locked(inner).await;
        inner.session.sharer = None;
        tracing::info!(state = ?inner.session.state(), "sharing stopped");
        self.hub
            .broadcast(ServerEvent::SharingStopped { message })
            .await;
    }

    fn start_pipeline_locked(&self, inner: &mut Inner) -> Result<(), PipelineError> {
        let settings = &inner.session.settings;
        let config = PipelineConfig {
            target: inner.session.target.clone(),
            live: settings.live(),
            codec: settings.codec,
            bitrate: settings.bitrate.clone(),
            adaptive_quality: self.encoder.adaptive_quality,
            hw_available: self.encoder.hw_available,
            stats_interval: self.encoder.stats_interval,
        };
        let (tx, mut rx) = mpsc::channel(pipeline::CHANNEL_CAPACITY);
        let source = self.devices.frame_source(&config.target)?;
        let pipeline = CapturePipeline::start(
            config,
            source,
            Arc::clone(&self.encoder.launcher),
            tx,
        )?;

        let hub = self.hub.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PipelineEvent::Frame(packet) => {
                        hub.broadcast(ServerEvent::Frame(packet.into())).await
                    }
                    PipelineEvent::Stats(stats) => {
                        hub.broadcast(ServerEvent::Stats((&stats).into())).await
                    }
                    PipelineEvent::Failed(reason) => {
                        tracing::warn!("capture pipeline ended: {}", reason)
                    }
                }
            }
        });
        inner.share = Some(ActiveShare {
            pipeline,
            forwarder,
        });
        Ok(())
    }

    /// Join the worker (encoder included), then retire its forwarder so
    /// nothing it produced is emitted afterwards.
    async fn stop_pipeline_locked(&self, inner: &mut Inner) {
        let Some(ActiveShare {
            mut pipeline,
            forwarder,
        }) = inner.share.take()
        else {
            return;
        };
        let stats = pipeline.stats();
        if let Err(e) = tokio::task::spawn_blocking(move || pipeline.stop()).await {
            tracing::error!("pipeline stop task failed: {}", e);
        }
        tracing::debug!(
            encoder = %stats.encoder,
            dropped = stats.dropped_frames,
            "capture stopped"
        );
        forwarder.abort();
        let _ = forwarder.await;
    }

    async fn start_audio_locked(&self, inner: &mut Inner) -> Result<(), AudioError> {
        if inner.audio.is_some() {
            return Ok(());
        }
        let (tx, mut rx) = mpsc::channel(audio::CHANNEL_CAPACITY);
        let devices = Arc::clone(&self.devices);
        let stream = tokio::task::spawn_blocking(move || devices.start_audio(tx))
            .await
            .map_err(|e| AudioError::Stream(e.to_string()))??;

        let hub = self.hub.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                hub.broadcast(ServerEvent::Audio(packet.into())).await;
            }
        });
        inner.audio = Some(ActiveAudio { stream, forwarder });
        inner.session.audio_active = true;
        tracing::info!("audio sharing started");
        Ok(())
    }

    async fn stop_audio_locked(&self, inner: &mut Inner) {
        inner.session.audio_active = false;
        let Some(ActiveAudio { mut stream, forwarder }) = inner.audio.take() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || stream.stop()).await {
            tracing::error!("audio stop task failed: {}", e);
        }
        forwarder.abort();
        let _ = forwarder.await;
        tracing::info!("audio sharing stopped");
    }
}
