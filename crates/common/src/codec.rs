//! Codec role, compression format, and rate control enums.

use serde::{Deserialize, Serialize};

/// Whether a session decodes or encodes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecRole {
    #[default]
    Decoder,
    Encoder,
}

/// Compressed video format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionFormat {
    #[default]
    Avc,
    Hevc,
}

impl CompressionFormat {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Avc => "H.264/AVC",
            Self::Hevc => "H.265/HEVC",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Avc => "video/avc",
            Self::Hevc => "video/hevc",
        }
    }
}

/// Encoder rate control mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitrateMode {
    Cbr,
    #[default]
    Vbr,
    /// Constant quality; the bitrate target is ignored.
    Cq,
}

/// H.264 profile.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvcProfile {
    #[default]
    Baseline,
    Main,
    Extended,
    High,
    High10,
    High422,
    High444,
}

/// H.264 level.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvcLevel {
    #[default]
    Level1,
    Level1b,
    Level11,
    Level12,
    Level13,
    Level2,
    Level21,
    Level22,
    Level3,
    Level31,
    Level32,
    Level4,
    Level41,
    Level42,
    Level5,
    Level51,
}
