pub mod capture;
pub mod limiter;
pub mod quality;

#[cfg(target_os = "windows")]
mod window;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to capture. Monitor ids are 1-based, window ids are native handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CaptureTarget {
    Monitor {
        id: u32,
    },
    Window {
        id: isize,
        #[serde(default)]
        title: String,
    },
}

impl Default for CaptureTarget {
    fn default() -> Self {
        CaptureTarget::Monitor { id: DEFAULT_MONITOR }
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTarget::Monitor { id } => write!(f, "Display {}", id),
            CaptureTarget::Window { title, .. } => f.write_str(title),
        }
    }
}

/// Monitor used when the requested index does not exist.
pub const DEFAULT_MONITOR: u32 = 1;

/// One captured frame: tightly packed RGB24, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl FrameBuffer {
    pub const BYTES_PER_PIXEL: usize = 3;

    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * Self::BYTES_PER_PIXEL
        );
        Self { width, height, data }
    }

    #[cfg(test)]
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * Self::BYTES_PER_PIXEL)
            .collect();
        Self { width, height, data }
    }

    /// Build from a BGRA buffer whose rows may be padded to `stride` bytes.
    pub fn from_bgra(bgra: &[u8], width: usize, height: usize, stride: usize) -> Self {
        let mut rgb = Vec::with_capacity(width * height * Self::BYTES_PER_PIXEL);
        for y in 0..height {
            let row = &bgra[y * stride..];
            for x in 0..width {
                let px = &row[x * 4..x * 4 + 3];
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
        Self::new(width as u32, height as u32, rgb)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn into_image(self) -> RgbImage {
        // Length is checked in `new`; fall back to a blank image rather than panic.
        let (w, h) = (self.width, self.height);
        RgbImage::from_raw(w, h, self.data).unwrap_or_else(|| RgbImage::new(w, h))
    }

    pub fn from_image(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }
}

/// Output ceiling applied before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionLimit {
    Hd,
    #[serde(rename = "fullhd")]
    FullHd,
    Qhd,
    #[serde(rename = "4k")]
    Uhd4k,
    Native,
}

impl ResolutionLimit {
    /// Parse a limit name; unknown names fall back to full HD.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "hd" => Self::Hd,
            "fullhd" => Self::FullHd,
            "qhd" => Self::Qhd,
            "4k" => Self::Uhd4k,
            "native" => Self::Native,
            _ => Self::FullHd,
        }
    }

    pub fn max_dimensions(self) -> (u32, u32) {
        match self {
            Self::Hd => (1280, 720),
            Self::FullHd => (1920, 1080),
            Self::Qhd => (2560, 1440),
            Self::Uhd4k => (3840, 2160),
            Self::Native => (u32::MAX, u32::MAX),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hd => "hd",
            Self::FullHd => "fullhd",
            Self::Qhd => "qhd",
            Self::Uhd4k => "4k",
            Self::Native => "native",
        }
    }
}

impl Default for ResolutionLimit {
    fn default() -> Self {
        Self::FullHd
    }
}
