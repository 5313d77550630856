//! Tables between pipeline-side enums and driver parameter codes.

use hwc_common::{AvcLevel, AvcProfile, BitrateMode, CompressionFormat, PixelFormat};

use crate::driver::{AvcLevelCode, AvcProfileCode, CodingType, ColorFormat, RateControl};

/// Frame rates cross the driver boundary in Q16 fixed point.
pub const FRAME_RATE_Q16_SHIFT: u32 = 16;

pub fn frame_rate_to_q16(fps: u32) -> u32 {
    fps.saturating_mul(1 << FRAME_RATE_Q16_SHIFT)
}

pub fn frame_rate_from_q16(q16: u32) -> u32 {
    q16 >> FRAME_RATE_Q16_SHIFT
}

pub fn color_format(format: PixelFormat) -> ColorFormat {
    match format {
        PixelFormat::Nv12 => ColorFormat::Yuv420SemiPlanar,
        PixelFormat::Nv21 => ColorFormat::Yvu420SemiPlanar,
        PixelFormat::I420 => ColorFormat::Yuv420Planar,
        PixelFormat::Rgba8 => ColorFormat::Rgba8888,
    }
}

/// `None` for formats the pipeline cannot represent.
pub fn pixel_format(format: ColorFormat) -> Option<PixelFormat> {
    match format {
        ColorFormat::Yuv420SemiPlanar => Some(PixelFormat::Nv12),
        ColorFormat::Yvu420SemiPlanar => Some(PixelFormat::Nv21),
        ColorFormat::Yuv420Planar => Some(PixelFormat::I420),
        ColorFormat::Rgba8888 => Some(PixelFormat::Rgba8),
        ColorFormat::Unused => None,
    }
}

pub fn coding_type(compression: CompressionFormat) -> CodingType {
    match compression {
        CompressionFormat::Avc => CodingType::Avc,
        CompressionFormat::Hevc => CodingType::Hevc,
    }
}

pub fn rate_control(mode: BitrateMode) -> Option<RateControl> {
    match mode {
        BitrateMode::Cbr => Some(RateControl::Constant),
        BitrateMode::Vbr => Some(RateControl::Variable),
        BitrateMode::Cq => None,
    }
}

pub fn bitrate_mode(control: RateControl) -> BitrateMode {
    match control {
        RateControl::Constant => BitrateMode::Cbr,
        RateControl::Variable => BitrateMode::Vbr,
    }
}

pub fn avc_profile(profile: AvcProfile) -> AvcProfileCode {
    match profile {
        AvcProfile::Baseline => AvcProfileCode::Baseline,
        AvcProfile::Main => AvcProfileCode::Main,
        AvcProfile::Extended => AvcProfileCode::Extended,
        AvcProfile::High => AvcProfileCode::High,
        AvcProfile::High10 => AvcProfileCode::High10,
        AvcProfile::High422 => AvcProfileCode::High422,
        AvcProfile::High444 => AvcProfileCode::High444,
    }
}

pub fn avc_profile_from_code(code: AvcProfileCode) -> AvcProfile {
    match code {
        AvcProfileCode::Baseline => AvcProfile::Baseline,
        AvcProfileCode::Main => AvcProfile::Main,
        AvcProfileCode::Extended => AvcProfile::Extended,
        AvcProfileCode::High => AvcProfile::High,
        AvcProfileCode::High10 => AvcProfile::High10,
        AvcProfileCode::High422 => AvcProfile::High422,
        AvcProfileCode::High444 => AvcProfile::High444,
    }
}

const AVC_LEVELS: [(AvcLevel, u32); 16] = [
    (AvcLevel::Level1, 10),
    (AvcLevel::Level1b, 9),
    (AvcLevel::Level11, 11),
    (AvcLevel::Level12, 12),
    (AvcLevel::Level13, 13),
    (AvcLevel::Level2, 20),
    (AvcLevel::Level21, 21),
    (AvcLevel::Level22, 22),
    (AvcLevel::Level3, 30),
    (AvcLevel::Level31, 31),
    (AvcLevel::Level32, 32),
    (AvcLevel::Level4, 40),
    (AvcLevel::Level41, 41),
    (AvcLevel::Level42, 42),
    (AvcLevel::Level5, 50),
    (AvcLevel::Level51, 51),
];

pub fn avc_level(level: AvcLevel) -> AvcLevelCode {
    AVC_LEVELS
        .iter()
        .find(|(l, _)| *l == level)
        .map(|&(_, code)| AvcLevelCode(code))
        .unwrap_or(AvcLevelCode(10))
}

pub fn avc_level_from_code(code: AvcLevelCode) -> Option<AvcLevel> {
    AVC_LEVELS
        .iter()
        .find(|(_, c)| *c == code.0)
        .map(|&(level, _)| level)
}
