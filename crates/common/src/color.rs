//! Raw pixel formats exchanged with the codec.

use serde::{Deserialize, Serialize};

use crate::types::Resolution;

/// Raw video pixel format on the pipeline side.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Y plane + interleaved UV at half resolution.
    #[default]
    Nv12,
    /// Y plane + interleaved VU at half resolution.
    Nv21,
    /// Three planes, U and V at quarter size.
    I420,
    /// 4 channels, 8 bits each.
    Rgba8,
}

impl PixelFormat {
    pub fn is_planar(self) -> bool {
        !matches!(self, Self::Rgba8)
    }

    /// Bytes for one frame with tightly packed rows.
    pub fn frame_size(self, resolution: Resolution) -> usize {
        match self {
            Self::Nv12 | Self::Nv21 | Self::I420 => resolution.nv12_byte_size(),
            Self::Rgba8 => resolution.width as usize * resolution.height as usize * 4,
        }
    }
}
