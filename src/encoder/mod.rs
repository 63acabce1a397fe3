//! Frame encoders.
//!
//! Two strategies, picked once when a pipeline starts and never swapped
//! mid-stream:
//!
//! - [`jpeg::JpegEncoder`]: one still image per tick, quality driven by
//!   the adaptive controller.
//! - [`stream::StreamEncoder`]: an external H.264 encoder process fed raw
//!   frames, producing one continuous elementary bitstream.

pub mod jpeg;
pub mod stream;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Jpeg,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Jpeg => "jpeg",
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::H264
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one encode call. Not retained past the tick.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub codec: Codec,
    pub data: Vec<u8>,
}

impl EncodedChunk {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
