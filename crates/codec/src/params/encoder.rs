//! Encoder parameter groups. Raw frames enter on the input port; the
//! compressed stream leaves on the output port.

use hwc_common::{
    AvcProfile, CodecElement, CodecError, CodecResult, CodecRole, CompressionFormat,
    EncoderSettings, ParamKey,
};

use super::{mapping, mismatched, unsupported, ParamManager};
use crate::driver::{
    AvcParam, BitrateParam, BufferKind, CodingType, ParamRecord, PICTURE_TYPE_B, PICTURE_TYPE_I,
    PICTURE_TYPE_P,
};

pub(super) fn set(params: &ParamManager, key: ParamKey, element: &CodecElement) -> CodecResult<()> {
    let output = params.output_port;
    match key {
        ParamKey::InputCommon => {
            params.update_port_definition(params.input_port, |def| {
                def.video.compression = CodingType::Unused;
                def.video.resolution = element.resolution;
                def.video.frame_rate_q16 = mapping::frame_rate_to_q16(element.frame_rate);
                def.video.stride = element.resolution.width;
                def.video.slice_height = element.resolution.height;
                def.video.color_format = mapping::color_format(element.format);
                def.buffer_size = u32::try_from(element.format.frame_size(element.resolution))
                    .unwrap_or(u32::MAX);
                if element.input.buffer_count != 0 {
                    def.buffer_count_actual = element.input.buffer_count;
                }
            })?;
            params.set_config(
                &ParamRecord::FrameRate {
                    port_index: output,
                    frame_rate_q16: mapping::frame_rate_to_q16(element.frame_rate),
                },
                "SetConfig(FrameRate)",
            )
        }
        ParamKey::OutputCommon => params.update_port_definition(output, |def| {
            def.video.compression = mapping::coding_type(element.compression);
            def.video.resolution = element.resolution;
            def.video.frame_rate_q16 = mapping::frame_rate_to_q16(element.frame_rate);
            if element.output.buffer_count != 0 {
                def.buffer_count_actual = element.output.buffer_count;
            }
        }),
        ParamKey::VideoFormat => {
            params.set_video_format(params.input_port, element.format, element.frame_rate)
        }
        ParamKey::SurfaceInit => {
            params.select_buffer_kind(params.input_port, BufferKind::DynamicHandle)
        }
        ParamKey::RequestIFrame => params.set_config(
            &ParamRecord::IntraRefresh {
                port_index: output,
                refresh: true,
            },
            "SetConfig(IntraRefresh)",
        ),
        ParamKey::DynamicBitrate => params.set_config(
            &ParamRecord::BitrateConfig {
                port_index: output,
                bitrate: element.encoder.bitrate,
            },
            "SetConfig(BitrateConfig)",
        ),
        ParamKey::EncoderConfig => set_encoder_config(params, element),
    }
}

pub(super) fn get(
    params: &ParamManager,
    key: ParamKey,
    element: &mut CodecElement,
) -> CodecResult<()> {
    match key {
        ParamKey::InputCommon => {
            params.read_port_info(params.input_port, &mut element.input)?;
            Ok(())
        }
        ParamKey::OutputCommon => {
            params.read_port_info(params.output_port, &mut element.output)?;
            Ok(())
        }
        ParamKey::VideoFormat => {
            element.supported_formats = params.supported_formats(params.input_port)?;
            Ok(())
        }
        ParamKey::EncoderConfig => get_encoder_config(params, element),
        _ => Err(unsupported(CodecRole::Encoder, key, "get")),
    }
}

fn set_encoder_config(params: &ParamManager, element: &CodecElement) -> CodecResult<()> {
    let output = params.output_port;
    let settings = &element.encoder;

    match mapping::rate_control(settings.bitrate_mode) {
        Some(control) => {
            let mut record = ParamRecord::Bitrate(BitrateParam {
                port_index: output,
                ..Default::default()
            });
            params.get_param(&mut record, "GetParameter(Bitrate)")?;
            let ParamRecord::Bitrate(mut bitrate) = record else {
                return Err(mismatched("Bitrate", &record));
            };
            bitrate.control = control;
            if settings.bitrate != 0 {
                bitrate.target_bitrate = settings.bitrate;
            }
            params.set_param(&ParamRecord::Bitrate(bitrate), "SetParameter(Bitrate)")?;
        }
        None => {
            let mut record = ParamRecord::ConstantQuality {
                port_index: output,
                quality: 0,
            };
            params.get_param(&mut record, "GetParameter(ConstantQuality)")?;
            params.set_param(
                &ParamRecord::ConstantQuality {
                    port_index: output,
                    quality: settings.quality,
                },
                "SetParameter(ConstantQuality)",
            )?;
        }
    }

    if element.compression != CompressionFormat::Avc {
        return Ok(());
    }
    let mut record = ParamRecord::Avc(AvcParam {
        port_index: output,
        ..Default::default()
    });
    params.get_param(&mut record, "GetParameter(Avc)")?;
    let ParamRecord::Avc(mut avc) = record else {
        return Err(mismatched("Avc", &record));
    };
    configure_avc(&mut avc, settings, element.frame_rate);
    params.set_param(&ParamRecord::Avc(avc), "SetParameter(Avc)")
}

fn get_encoder_config(params: &ParamManager, element: &mut CodecElement) -> CodecResult<()> {
    let output = params.output_port;
    let mut record = ParamRecord::Bitrate(BitrateParam {
        port_index: output,
        ..Default::default()
    });
    params.get_param(&mut record, "GetParameter(Bitrate)")?;
    if let ParamRecord::Bitrate(bitrate) = record {
        element.encoder.bitrate_mode = mapping::bitrate_mode(bitrate.control);
        element.encoder.bitrate = bitrate.target_bitrate;
    }

    if element.compression != CompressionFormat::Avc {
        return Ok(());
    }
    let mut record = ParamRecord::Avc(AvcParam {
        port_index: output,
        ..Default::default()
    });
    params.get_param(&mut record, "GetParameter(Avc)")?;
    let ParamRecord::Avc(avc) = record else {
        return Err(mismatched("Avc", &record));
    };
    element.encoder.profile = mapping::avc_profile_from_code(avc.profile);
    element.encoder.level = mapping::avc_level_from_code(avc.level).ok_or_else(|| {
        CodecError::InvalidArgument(format!("driver reported unknown AVC level {}", avc.level.0))
    })?;
    Ok(())
}

/// Fill an AVC record from encoder settings.
///
/// The P-frame count between IDR frames follows from the frame rate and
/// the I-frame interval. Baseline disables CABAC and every B/weighted
/// prediction tool; other profiles enable them.
pub fn configure_avc(avc: &mut AvcParam, settings: &EncoderSettings, frame_rate: u32) {
    avc.profile = mapping::avc_profile(settings.profile);
    avc.level = mapping::avc_level(settings.level);
    avc.use_hadamard = true;
    avc.frame_mbs_only = true;
    avc.loop_filter = true;
    avc.b_frames = 0;
    avc.ref_frames = 1;

    let gop = u64::from(frame_rate) * u64::from(settings.i_frame_interval_ms) / 1000;
    let gop = u32::try_from(gop).unwrap_or(u32::MAX);
    let baseline = settings.profile == AvcProfile::Baseline;
    avc.p_frames = if baseline {
        gop.saturating_sub(1)
    } else {
        (gop / (avc.b_frames + 1)).saturating_sub(1)
    };

    avc.cabac = !baseline;
    avc.cabac_init_idc = u32::from(!baseline);
    avc.weighted_p_prediction = !baseline;
    avc.constrained_intra_pred = !baseline;
    avc.direct_8x8_inference = !baseline;
    avc.direct_spatial_temporal = !baseline;

    avc.allowed_picture_types = PICTURE_TYPE_I;
    if avc.p_frames != 0 {
        avc.allowed_picture_types |= PICTURE_TYPE_P;
    }
    if avc.b_frames != 0 {
        avc.allowed_picture_types |= PICTURE_TYPE_B;
    }
}
