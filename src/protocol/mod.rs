//! Wire format.
//!
//! Every WebSocket text frame is a JSON envelope `{"event": ..., "data": ...}`.
//! Commands flow client → server, events server → client. Binary payloads
//! (encoded frames, PCM) travel base64-encoded inside the JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::AudioPacket;
use crate::encoder::stream::HardwareSupport;
use crate::encoder::Codec;
use crate::error::ProtocolError;
use crate::pipeline::{FramePacket, FrameStats};
use crate::screen::capture::{SourceInfo, SourceKind};
use crate::screen::{CaptureTarget, DEFAULT_MONITOR};
use crate::session::{ClientId, Settings};

// ── Commands ────────────────────────────────────────────────────

/// `select_source` payload, also embedded in `start_sharing`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourceSelection {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
}

impl SourceSelection {
    #[cfg(test)]
    pub fn monitor(id: i64) -> Self {
        Self {
            kind: Some("monitor".into()),
            id: Some(id),
            title: None,
        }
    }

    /// Anything other than `"window"` selects a monitor.
    pub fn into_target(self) -> CaptureTarget {
        match self.kind.as_deref() {
            Some("window") => {
                let id = self.id.unwrap_or_default();
                CaptureTarget::Window {
                    id: id as isize,
                    title: self.title.unwrap_or_else(|| format!("Window {}", id)),
                }
            }
            _ => CaptureTarget::Monitor {
                id: self
                    .id
                    .and_then(|id| u32::try_from(id).ok())
                    .unwrap_or(DEFAULT_MONITOR),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StartSharing {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub source: Option<SourceSelection>,
    #[serde(rename = "withAudio", default)]
    pub with_audio: bool,
}

/// Partial settings. A preset is applied first, explicit fields on top.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SettingsChange {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub resolution_limit: Option<String>,
    #[serde(default)]
    pub codec: Option<Codec>,
    #[serde(default)]
    pub bitrate: Option<String>,
}

/// Free-text note relayed to every viewer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    GetSources,
    SelectSource(SourceSelection),
    StartSharing(StartSharing),
    StopSharing,
    ChangeSettings(SettingsChange),
    StartAudio,
    StopAudio,
    SendMessage(ChatMessage),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Missing or null `data` means "all defaults".
fn payload<T: DeserializeOwned + Default>(data: Value) -> Result<T, ProtocolError> {
    if data.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(data)?)
}

impl ClientCommand {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let Envelope { event, data } = serde_json::from_str(text)?;
        let cmd = match event.as_str() {
            "get_sources" => Self::GetSources,
            "select_source" => Self::SelectSource(payload(data)?),
            "start_sharing" => Self::StartSharing(payload(data)?),
            "stop_sharing" => Self::StopSharing,
            "change_settings" => Self::ChangeSettings(payload(data)?),
            "start_audio" => Self::StartAudio,
            "stop_audio" => Self::StopAudio,
            "send_message" => Self::SendMessage(payload(data)?),
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };
        Ok(cmd)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetSources => "get_sources",
            Self::SelectSource(_) => "select_source",
            Self::StartSharing(_) => "start_sharing",
            Self::StopSharing => "stop_sharing",
            Self::ChangeSettings(_) => "change_settings",
            Self::StartAudio => "start_audio",
            Self::StopAudio => "stop_audio",
            Self::SendMessage(_) => "send_message",
        }
    }
}

// ── Events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Connected {
    pub client_id: ClientId,
    pub client_count: usize,
    pub audio_available: bool,
    pub presets: Vec<String>,
    pub hardware: HardwareSupport,
    pub is_sharing: bool,
    pub current_sharer: Option<ClientId>,
    pub codec: Codec,
    pub encoder: String,
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSelected {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub id: i64,
    pub title: String,
}

impl From<&CaptureTarget> for SourceSelected {
    fn from(target: &CaptureTarget) -> Self {
        let (kind, id) = match target {
            CaptureTarget::Monitor { id } => (SourceKind::Monitor, i64::from(*id)),
            CaptureTarget::Window { id, .. } => (SourceKind::Window, *id as i64),
        };
        Self {
            kind,
            id,
            title: target.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SharingStarted {
    pub target: String,
    pub sharer_id: ClientId,
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize)]
pub struct FramePayload {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub size: usize,
    pub timestamp: f64,
    pub codec: Codec,
    pub encoder: String,
}

impl From<FramePacket> for FramePayload {
    fn from(p: FramePacket) -> Self {
        Self {
            image: BASE64.encode(&p.data),
            width: p.width,
            height: p.height,
            size: p.size,
            timestamp: p.timestamp,
            codec: p.codec,
            encoder: p.encoder,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioPayload {
    pub data: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u16,
}

impl From<AudioPacket> for AudioPayload {
    fn from(p: AudioPacket) -> Self {
        Self {
            data: BASE64.encode(&p.data),
            sample_rate: p.sample_rate,
            channels: p.channels,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsPayload {
    pub fps: f64,
    #[serde(rename = "frameSize")]
    pub frame_size: usize,
    pub resolution: String,
    pub encoder: String,
}

impl From<&FrameStats> for StatsPayload {
    fn from(s: &FrameStats) -> Self {
        Self {
            fps: (s.fps * 10.0).round() / 10.0,
            frame_size: s.frame_size,
            resolution: s.resolution.clone(),
            encoder: s.encoder.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected(Connected),
    ClientCountUpdated {
        count: usize,
    },
    SourcesList {
        sources: Vec<SourceInfo>,
        current: CaptureTarget,
    },
    SourceSelected(SourceSelected),
    SharingStarted(SharingStarted),
    SharingTakenOver {
        new_sharer: ClientId,
    },
    SharingStopped {
        message: String,
    },
    SettingsChanged(Settings),
    AudioStarted {
        message: String,
    },
    AudioStopped {
        message: String,
    },
    AudioError {
        message: String,
    },
    MessageReceived {
        message: String,
        from: ClientId,
    },
    Frame(FramePayload),
    Audio(AudioPayload),
    Stats(StatsPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::ClientCountUpdated { .. } => "client_count_updated",
            Self::SourcesList { .. } => "sources_list",
            Self::SourceSelected(_) => "source_selected",
            Self::SharingStarted(_) => "sharing_started",
            Self::SharingTakenOver { .. } => "sharing_taken_over",
            Self::SharingStopped { .. } => "sharing_stopped",
            Self::SettingsChanged(_) => "settings_changed",
            Self::AudioStarted { .. } => "audio_started",
            Self::AudioStopped { .. } => "audio_stopped",
            Self::AudioError { .. } => "audio_error",
            Self::MessageReceived { .. } => "message_received",
            Self::Frame(_) => "frame",
            Self::Audio(_) => "audio",
            Self::Stats(_) => "stats",
        }
    }

    /// Media events a slow client may miss without harm.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Frame(_) | Self::Audio(_) | Self::Stats(_))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
