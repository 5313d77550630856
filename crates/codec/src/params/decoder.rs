//! Decoder parameter groups. Compressed data enters on the input port; raw
//! frames leave on the output port.

use hwc_common::{CodecElement, CodecResult, CodecRole, ParamKey};

use super::{mapping, unsupported, ParamManager};
use crate::driver::{BufferKind, CodingType};

pub(super) fn set(params: &ParamManager, key: ParamKey, element: &CodecElement) -> CodecResult<()> {
    match key {
        ParamKey::InputCommon => params.update_port_definition(params.input_port, |def| {
            def.video.compression = mapping::coding_type(element.compression);
            def.video.resolution = element.resolution;
            def.video.frame_rate_q16 = mapping::frame_rate_to_q16(element.frame_rate);
            if element.input.buffer_count != 0 {
                def.buffer_count_actual = element.input.buffer_count;
            }
        }),
        ParamKey::OutputCommon => params.update_port_definition(params.output_port, |def| {
            def.video.compression = CodingType::Unused;
            def.video.resolution = element.resolution;
            def.video.frame_rate_q16 = mapping::frame_rate_to_q16(element.frame_rate);
            if element.output.buffer_count != 0 {
                def.buffer_count_actual = element.output.buffer_count;
            }
        }),
        ParamKey::VideoFormat => {
            params.set_video_format(params.output_port, element.format, element.frame_rate)
        }
        ParamKey::SurfaceInit => params.select_buffer_kind(params.output_port, BufferKind::Handle),
        _ => Err(unsupported(CodecRole::Decoder, key, "set")),
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
            let def = params.read_port_info(params.output_port, &mut element.output)?;
            element.stride = def.video.stride;
            element.slice_height = def.video.slice_height;
            Ok(())
        }
        ParamKey::VideoFormat => {
            element.supported_formats = params.supported_formats(params.output_port)?;
            Ok(())
        }
        ParamKey::SurfaceInit => {
            element.usage = params.handle_usage(params.output_port)?;
            Ok(())
        }
        _ => Err(unsupported(CodecRole::Decoder, key, "get")),
    }
}
