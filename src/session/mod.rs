//! Session state: who is presenting, what, and how.

pub mod arbitrator;
pub mod hub;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::encoder::Codec;
use crate::pipeline::LiveSettings;
use crate::protocol::SettingsChange;
use crate::screen::{CaptureTarget, ResolutionLimit};

pub use arbitrator::Arbitrator;
pub use hub::Hub;

pub type ClientId = String;

pub fn generate_client_id() -> ClientId {
    use rand::Rng;
    let random_bytes: Vec<u8> = (0..8).map(|_| rand::thread_rng().gen()).collect();
    hex::encode(random_bytes)
}

pub const MAX_FPS: u32 = 120;
pub const DEFAULT_BITRATE: &str = "35M";

/// Named presets offered to clients.
pub const PRESETS: &[&str] = &["hd60", "4k30"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub fps: u32,
    pub quality: u8,
    pub resolution_limit: ResolutionLimit,
    pub codec: Codec,
    pub bitrate: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::preset("hd60").unwrap_or(Self {
            fps: 60,
            quality: 100,
            resolution_limit: ResolutionLimit::FullHd,
            codec: Codec::H264,
            bitrate: DEFAULT_BITRATE.into(),
        })
    }
}

impl Settings {
    pub fn preset(name: &str) -> Option<Self> {
        let (fps, resolution_limit) = match name {
            "hd60" => (60, ResolutionLimit::FullHd),
            "4k30" => (30, ResolutionLimit::Uhd4k),
            _ => return None,
        };
        Some(Self {
            fps,
            quality: 100,
            resolution_limit,
            codec: Codec::H264,
            bitrate: DEFAULT_BITRATE.into(),
        })
    }

    /// Apply a preset (if named and known), then any explicit fields.
    /// Unknown presets leave the settings untouched.
    pub fn apply(&mut self, change: &SettingsChange) {
        if let Some(name) = &change.preset {
            match Self::preset(name) {
                Some(preset) => {
                    // Presets do not carry a bitrate choice of their own.
                    let bitrate = std::mem::take(&mut self.bitrate);
                    *self = Self { bitrate, ..preset };
                }
                None => tracing::warn!("unknown preset {:?}", name),
            }
        }
        if let Some(fps) = change.fps {
            self.fps = fps.clamp(1, MAX_FPS);
        }
        if let Some(q) = change.quality {
            self.quality = q.clamp(1, 100);
        }
        if let Some(limit) = &change.resolution_limit {
            self.resolution_limit = ResolutionLimit::parse(limit);
        }
        if let Some(codec) = change.codec {
            self.codec = codec;
        }
        if let Some(bitrate) = &change.bitrate {
            self.bitrate = bitrate.clone();
        }
    }

    pub fn live(&self) -> LiveSettings {
        LiveSettings {
            fps: self.fps,
            quality: self.quality,
            resolution_limit: self.resolution_limit,
        }
    }

    /// Codec and bitrate are fixed for the life of an encoder.
    pub fn needs_restart(&self, other: &Settings) -> bool {
        self.codec != other.codec || self.bitrate != other.bitrate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareState {
    Idle,
    Sharing(ClientId),
    SharingWithAudio(ClientId),
}

/// Everything the arbitrator mutates. Only touched under its lock.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub sharer: Option<ClientId>,
    pub target: CaptureTarget,
    pub settings: Settings,
    pub audio_active: bool,
}

impl Session {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn state(&self) -> ShareState {
        match (&self.sharer, self.audio_active) {
            (None, _) => ShareState::Idle,
            (Some(id), false) => ShareState::Sharing(id.clone()),
            (Some(id), true) => ShareState::SharingWithAudio(id.clone()),
        }
    }

    pub fn is_sharer(&self, client: &str) -> bool {
        self.sharer.as_deref() == Some(client)
    }
}

/// Connections grouped by remote address. One machine with several tabs
/// open counts as one viewer.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    addrs: HashMap<ClientId, IpAddr>,
    by_addr: HashMap<IpAddr, HashSet<ClientId>>,
}

impl ClientRegistry {
    pub fn add(&mut self, client: ClientId, addr: IpAddr) -> usize {
        self.by_addr.entry(addr).or_default().insert(client.clone());
        self.addrs.insert(client, addr);
        self.headcount()
    }

    pub fn remove(&mut self, client: &str) -> usize {
        if let Some(addr) = self.addrs.remove(client) {
            if let Some(set) = self.by_addr.get_mut(&addr) {
                set.remove(client);
                if set.is_empty() {
                    self.by_addr.remove(&addr);
                }
            }
        }
        self.headcount()
    }

    pub fn headcount(&self) -> usize {
        self.by_addr.len()
    }

    pub fn connections(&self) -> usize {
        self.addrs.len()
    }
}
