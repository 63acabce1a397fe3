//! Server configuration, loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::encoder::stream::HardwareSupport;
use crate::encoder::Codec;
use crate::error::ConfigError;
use crate::protocol::SettingsChange;
use crate::screen::ResolutionLimit;
use crate::session::{Settings, DEFAULT_BITRATE};

pub const DEFAULT_PATH: &str = "lanshare.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: NetworkConfig,
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// WebSocket bind address.
    pub addr: String,
}

/// Settings a share starts with until a client picks a preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Optional preset. When set it replaces fps, quality, resolution
    /// and codec; the bitrate below still applies.
    pub preset: Option<String>,
    pub fps: u32,
    /// JPEG quality (1-100). Only used with `codec = "jpeg"`.
    pub quality: u8,
    /// "hd", "fullhd", "qhd", "4k" or "native".
    pub resolution: String,
    pub codec: Codec,
    /// H.264 target bitrate in ffmpeg notation, e.g. "35M".
    pub bitrate: String,
    /// Let frame timing drive JPEG quality.
    pub adaptive_quality: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Use NVENC if the ffmpeg probe lists it.
    #[default]
    Auto,
    /// Always try NVENC first; software remains the fallback.
    On,
    Off,
}

impl HardwareMode {
    pub fn try_hardware(self, probe: &HardwareSupport) -> bool {
        match self {
            HardwareMode::Auto => probe.h264_nvenc,
            HardwareMode::On => true,
            HardwareMode::Off => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// ffmpeg executable, looked up on PATH if not absolute.
    pub ffmpeg: PathBuf,
    pub hardware: HardwareMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preset: None,
            fps: 60,
            quality: 85,
            resolution: ResolutionLimit::FullHd.as_str().into(),
            codec: Codec::H264,
            bitrate: DEFAULT_BITRATE.into(),
            adaptive_quality: true,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            hardware: HardwareMode::Auto,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file. A missing file means defaults;
    /// an unreadable or malformed one is an error for the caller to report.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default()
            .to_toml()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, text)
    }

    /// Initial session settings.
    pub fn settings(&self) -> Settings {
        let c = &self.capture;
        let mut settings = Settings {
            fps: c.fps,
            quality: c.quality,
            resolution_limit: ResolutionLimit::parse(&c.resolution),
            codec: c.codec,
            bitrate: c.bitrate.clone(),
        };
        let change = match &c.preset {
            Some(name) => SettingsChange {
                preset: Some(name.clone()),
                ..Default::default()
            },
            // Clamp through the same path clients use.
            None => SettingsChange {
                fps: Some(c.fps),
                quality: Some(c.quality),
                ..Default::default()
            },
        };
        settings.apply(&change);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_round_trips() {
        let text = ServerConfig::default().to_toml().unwrap();
        assert!(text.contains("[capture]"));
        assert!(text.contains("hardware = \"auto\""));
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.addr, "0.0.0.0:5000");
        assert_eq!(parsed.capture.codec, Codec::H264);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[capture]\ncodec = \"jpeg\"\nfps = 500\n\n[encoder]\nhardware = \"off\""
        )
        .unwrap();
        let cfg = ServerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.capture.codec, Codec::Jpeg);
        assert_eq!(cfg.encoder.hardware, HardwareMode::Off);
        assert_eq!(cfg.logging.level, "info");

        let settings = cfg.settings();
        assert_eq!(settings.fps, crate::session::MAX_FPS);
        assert_eq!(settings.codec, Codec::Jpeg);
    }

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ServerConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(missing.capture.fps, 60);
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[capture\nfps = ").unwrap();
        let err = ServerConfig::load(&bad).unwrap_err();
        assert!(matches!(&err, ConfigError::Parse { path, .. } if path == &bad));
        assert!(err.to_string().contains("bad.toml"));

        let wrong_type = dir.path().join("wrong.toml");
        std::fs::write(&wrong_type, "[capture]\nfps = \"fast\"\n").unwrap();
        assert!(matches!(
            ServerConfig::load(&wrong_type),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn unreadable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory exists but cannot be read as a file.
        assert!(matches!(
            ServerConfig::load(dir.path()),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn write_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_PATH);
        ServerConfig::write_default(&path).unwrap();
        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.encoder.ffmpeg, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn preset_in_config_replaces_fields() {
        let cfg: ServerConfig = toml::from_str("[capture]\npreset = \"4k30\"\nfps = 10\n").unwrap();
        let s = cfg.settings();
        assert_eq!(s.resolution_limit, ResolutionLimit::Uhd4k);
        assert_eq!(s.fps, 30);
    }

    #[test]
    fn hardware_mode_resolution() {
        let none = HardwareSupport::default();
        let nvenc = HardwareSupport {
            ffmpeg: true,
            h264_nvenc: true,
        };
        assert!(!HardwareMode::Auto.try_hardware(&none));
        assert!(HardwareMode::Auto.try_hardware(&nvenc));
        assert!(HardwareMode::On.try_hardware(&none));
        assert!(!HardwareMode::Off.try_hardware(&nvenc));
    }
}
