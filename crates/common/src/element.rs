//! Pipeline-side format description exchanged with the parameter manager.
//!
//! `CodecElement` is what the pipeline element knows about the stream:
//! geometry, frame rate, pixel format, per-port buffer requirements, and
//! encoder rate control. `SetParameter` reads it; `GetParameter` writes
//! back what the driver decided.

use serde::{Deserialize, Serialize};

use crate::codec::{AvcLevel, AvcProfile, BitrateMode, CompressionFormat};
use crate::color::PixelFormat;
use crate::types::Resolution;

/// Parameter groups understood by the parameter manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKey {
    /// Input port geometry, frame rate, compression, and buffer count.
    InputCommon,
    /// Output port geometry, frame rate, and buffer count.
    OutputCommon,
    /// Raw color format of the uncompressed port.
    VideoFormat,
    /// Switch the raw port to zero-copy graphic handles.
    SurfaceInit,
    /// Force the next encoded frame to be an IDR frame.
    RequestIFrame,
    /// Change the target bitrate while executing.
    DynamicBitrate,
    /// Rate control and H.264 profile/level/GOP settings.
    EncoderConfig,
}

/// Buffer requirements and geometry for one port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortInfo {
    pub min_buffer_count: u32,
    pub buffer_count: u32,
    pub buffer_size: u32,
    pub resolution: Resolution,
    /// Frames per second, integral.
    pub frame_rate: u32,
}

/// Encoder rate control and stream structure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Target bitrate in bits/sec.
    pub bitrate: u32,
    pub bitrate_mode: BitrateMode,
    /// Quality for constant-quality mode.
    pub quality: u32,
    pub profile: AvcProfile,
    pub level: AvcLevel,
    /// Distance between IDR frames in milliseconds.
    pub i_frame_interval_ms: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bitrate: 4_000_000,
            bitrate_mode: BitrateMode::Vbr,
            quality: 50,
            profile: AvcProfile::Baseline,
            level: AvcLevel::Level1,
            i_frame_interval_ms: 1000,
        }
    }
}

/// Format description of the stream on the pipeline side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecElement {
    pub compression: CompressionFormat,
    pub resolution: Resolution,
    pub frame_rate: u32,
    pub format: PixelFormat,
    pub input: PortInfo,
    pub output: PortInfo,
    /// Row stride of raw frames in bytes, as reported by the driver.
    pub stride: u32,
    /// Plane height of raw frames, as reported by the driver.
    pub slice_height: u32,
    /// Allocation usage flags for zero-copy surfaces.
    pub usage: u64,
    /// Raw formats the driver offers, filled by `GetParameter(VideoFormat)`.
    pub supported_formats: Vec<PixelFormat>,
    pub encoder: EncoderSettings,
}

impl Default for CodecElement {
    fn default() -> Self {
        Self {
            compression: CompressionFormat::Avc,
            resolution: Resolution::HD,
            frame_rate: 30,
            format: PixelFormat::Nv12,
            input: PortInfo::default(),
            output: PortInfo::default(),
            stride: 0,
            slice_height: 0,
            usage: 0,
            supported_formats: Vec::new(),
            encoder: EncoderSettings::default(),
        }
    }
}

impl CodecElement {
    pub fn new(compression: CompressionFormat, resolution: Resolution, frame_rate: u32) -> Self {
        Self {
            compression,
            resolution,
            frame_rate,
            ..Self::default()
        }
    }

    /// Check the fields every parameter group depends on.
    pub fn validate(&self) -> Result<(), String> {
        if self.resolution.is_empty() {
            return Err(format!("Resolution must be > 0, got {}", self.resolution));
        }
        if self.frame_rate == 0 {
            return Err("Frame rate must be > 0".to_string());
        }
        if self.input.buffer_count != 0 && self.input.buffer_count < self.input.min_buffer_count
        {
            return Err(format!(
                "Input buffer count {} below minimum {}",
                self.input.buffer_count, self.input.min_buffer_count
            ));
        }
        if self.output.buffer_count != 0
            && self.output.buffer_count < self.output.min_buffer_count
        {
            return Err(format!(
                "Output buffer count {} below minimum {}",
                self.output.buffer_count, self.output.min_buffer_count
            ));
        }
        Ok(())
    }
}
