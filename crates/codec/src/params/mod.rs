//! Parameter manager -- translates the pipeline's [`CodecElement`] into
//! driver parameter records and back.
//!
//! The manager holds no stream state. Every `set_parameter` reads the
//! current driver record, modifies the fields the key covers, and writes
//! it back; every `get_parameter` copies driver records into the element.
//! A failing driver call is returned as-is, never retried.
//!
//! | Key              | Decoder                  | Encoder                      |
//! |------------------|--------------------------|------------------------------|
//! | `InputCommon`    | set/get                  | set/get (+ frame rate config)|
//! | `OutputCommon`   | set/get (+ stride)       | set/get                      |
//! | `VideoFormat`    | set/get (output port)    | set/get (input port)         |
//! | `SurfaceInit`    | set/get (handle usage)   | set (dynamic handles)        |
//! | `RequestIFrame`  | -                        | set                          |
//! | `DynamicBitrate` | -                        | set                          |
//! | `EncoderConfig`  | -                        | set/get                      |

mod decoder;
mod encoder;
pub mod mapping;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use hwc_common::{
    CodecElement, CodecError, CodecResult, CodecRole, DriverStatus, ParamKey, PixelFormat,
    PortInfo,
};

use crate::driver::{BufferKind, CodecComponent, ParamRecord, PortDefinition, VideoPortFormat};

pub use encoder::configure_avc;

/// Set/Get parameter dispatch for one session.
pub struct ParamManager {
    component: Arc<dyn CodecComponent>,
    role: CodecRole,
    input_port: u32,
    output_port: u32,
}

impl fmt::Debug for ParamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamManager")
            .field("role", &self.role)
            .field("input_port", &self.input_port)
            .field("output_port", &self.output_port)
            .finish()
    }
}

impl ParamManager {
    pub fn new(
        component: Arc<dyn CodecComponent>,
        role: CodecRole,
        input_port: u32,
        output_port: u32,
    ) -> Self {
        Self {
            component,
            role,
            input_port,
            output_port,
        }
    }

    pub fn role(&self) -> CodecRole {
        self.role
    }

    /// Push the part of `element` covered by `key` to the driver.
    pub fn set_parameter(&self, key: ParamKey, element: &CodecElement) -> CodecResult<()> {
        debug!(?key, role = ?self.role, "SetParameter");
        let result = match self.role {
            CodecRole::Decoder => decoder::set(self, key, element),
            CodecRole::Encoder => encoder::set(self, key, element),
        };
        if let Err(e) = &result {
            warn!(?key, error = %e, "SetParameter failed");
        }
        result
    }

    /// Read the part of the driver state covered by `key` into `element`.
    pub fn get_parameter(&self, key: ParamKey, element: &mut CodecElement) -> CodecResult<()> {
        debug!(?key, role = ?self.role, "GetParameter");
        let result = match self.role {
            CodecRole::Decoder => decoder::get(self, key, element),
            CodecRole::Encoder => encoder::get(self, key, element),
        };
        if let Err(e) = &result {
            warn!(?key, error = %e, "GetParameter failed");
        }
        result
    }

    // ── driver access ──

    fn get_param(&self, record: &mut ParamRecord, op: &'static str) -> CodecResult<()> {
        self.component
            .get_parameter(record)
            .map_err(|status| CodecError::DriverCall { op, status })
    }

    fn set_param(&self, record: &ParamRecord, op: &'static str) -> CodecResult<()> {
        self.component
            .set_parameter(record)
            .map_err(|status| CodecError::DriverCall { op, status })
    }

    fn get_config(&self, record: &mut ParamRecord, op: &'static str) -> CodecResult<()> {
        self.component
            .get_config(record)
            .map_err(|status| CodecError::DriverCall { op, status })
    }

    fn set_config(&self, record: &ParamRecord, op: &'static str) -> CodecResult<()> {
        self.component
            .set_config(record)
            .map_err(|status| CodecError::DriverCall { op, status })
    }

    fn port_definition(&self, port_index: u32) -> CodecResult<PortDefinition> {
        let mut record = ParamRecord::PortDefinition(PortDefinition::query(port_index));
        self.get_param(&mut record, "GetParameter(PortDefinition)")?;
        match record {
            ParamRecord::PortDefinition(def) => Ok(def),
            other => Err(mismatched("PortDefinition", &other)),
        }
    }

    /// Read-modify-write of a port definition.
    fn update_port_definition(
        &self,
        port_index: u32,
        update: impl FnOnce(&mut PortDefinition),
    ) -> CodecResult<()> {
        let mut def = self.port_definition(port_index)?;
        update(&mut def);
        self.set_param(
            &ParamRecord::PortDefinition(def),
            "SetParameter(PortDefinition)",
        )
    }

    /// Copy buffer requirements and geometry of a port into `info`.
    fn read_port_info(&self, port_index: u32, info: &mut PortInfo) -> CodecResult<PortDefinition> {
        let def = self.port_definition(port_index)?;
        info.min_buffer_count = def.buffer_count_min;
        info.buffer_count = def.buffer_count_actual;
        info.buffer_size = def.buffer_size;
        info.resolution = def.video.resolution;
        info.frame_rate = mapping::frame_rate_from_q16(def.video.frame_rate_q16);
        Ok(def)
    }

    fn set_video_format(
        &self,
        port_index: u32,
        format: PixelFormat,
        frame_rate: u32,
    ) -> CodecResult<()> {
        let record = ParamRecord::VideoPortFormat(VideoPortFormat {
            port_index,
            index: 0,
            compression: Default::default(),
            color_format: mapping::color_format(format),
            frame_rate_q16: mapping::frame_rate_to_q16(frame_rate),
        });
        self.set_param(&record, "SetParameter(VideoPortFormat)")
    }

    /// Enumerate every raw format the driver offers on a port.
    fn supported_formats(&self, port_index: u32) -> CodecResult<Vec<PixelFormat>> {
        let mut formats = Vec::new();
        for index in 0.. {
            let mut record = ParamRecord::VideoPortFormat(VideoPortFormat {
                port_index,
                index,
                ..Default::default()
            });
            match self.component.get_parameter(&mut record) {
                Ok(()) => {}
                Err(DriverStatus::NO_MORE) => break,
                Err(status) if index > 0 => {
                    debug!(port_index, index, status = %status, "Format enumeration ended");
                    break;
                }
                Err(status) => {
                    return Err(CodecError::DriverCall {
                        op: "GetParameter(VideoPortFormat)",
                        status,
                    })
                }
            }
            match record {
                ParamRecord::VideoPortFormat(entry) => {
                    match mapping::pixel_format(entry.color_format) {
                        Some(format) if !formats.contains(&format) => formats.push(format),
                        Some(_) => {}
                        None => debug!(
                            port_index,
                            color_format = ?entry.color_format,
                            "Skipping unmapped color format"
                        ),
                    }
                }
                other => return Err(mismatched("VideoPortFormat", &other)),
            }
        }
        Ok(formats)
    }

    /// Select a buffer kind for a port after checking the driver offers it.
    fn select_buffer_kind(&self, port_index: u32, kind: BufferKind) -> CodecResult<()> {
        let mut record = ParamRecord::SupportedBufferTypes {
            port_index,
            mask: 0,
        };
        self.get_param(&mut record, "GetParameter(SupportedBufferTypes)")?;
        let ParamRecord::SupportedBufferTypes { mask, .. } = record else {
            return Err(mismatched("SupportedBufferTypes", &record));
        };
        if mask & kind.mask_bit() == 0 {
            return Err(CodecError::Unsupported(format!(
                "port {port_index} does not support {kind:?} buffers (mask {mask:#x})"
            )));
        }
        self.set_param(
            &ParamRecord::UseBufferType { port_index, kind },
            "SetParameter(UseBufferType)",
        )
    }

    fn handle_usage(&self, port_index: u32) -> CodecResult<u64> {
        let mut record = ParamRecord::BufferHandleUsage {
            port_index,
            usage: 0,
        };
        self.get_param(&mut record, "GetParameter(BufferHandleUsage)")?;
        match record {
            ParamRecord::BufferHandleUsage { usage, .. } => Ok(usage),
            other => Err(mismatched("BufferHandleUsage", &other)),
        }
    }
}

fn mismatched(expected: &str, got: &ParamRecord) -> CodecError {
    CodecError::InvalidArgument(format!(
        "driver answered {expected} with {}",
        got.name()
    ))
}

fn unsupported(role: CodecRole, key: ParamKey, direction: &str) -> CodecError {
    CodecError::Unsupported(format!("{direction} {key:?} on {role:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackManager;
    use crate::test_support::NullCallbacks;
    use hwc_common::{CompressionFormat, Resolution};

    fn make_params(role: CodecRole) -> (Arc<dyn CodecComponent>, ParamManager) {
        let manager = LoopbackManager::new();
        let name = match role {
            CodecRole::Decoder => LoopbackManager::DECODER_AVC,
            CodecRole::Encoder => LoopbackManager::ENCODER_AVC,
        };
        let (_id, component) = crate::driver::ComponentManager::create_component(
            &manager,
            name,
            Arc::new(NullCallbacks),
        )
        .unwrap();
        let params = ParamManager::new(component.clone(), role, 0, 1);
        (component, params)
    }

    fn make_element() -> CodecElement {
        let mut element = CodecElement::new(CompressionFormat::Avc, Resolution::new(1280, 720), 25);
        element.input.buffer_count = 6;
        element.output.buffer_count = 5;
        element
    }

    // ── decoder ──

    #[test]
    fn decoder_common_round_trip() {
        let (_c, params) = make_params(CodecRole::Decoder);
        let element = make_element();
        params.set_parameter(ParamKey::InputCommon, &element).unwrap();
        params.set_parameter(ParamKey::OutputCommon, &element).unwrap();

        let mut read = CodecElement::default();
        params.get_parameter(ParamKey::InputCommon, &mut read).unwrap();
        params.get_parameter(ParamKey::OutputCommon, &mut read).unwrap();
        assert_eq!(read.input.buffer_count, 6);
        assert_eq!(read.input.frame_rate, 25);
        assert_eq!(read.output.buffer_count, 5);
        assert_eq!(read.output.resolution, Resolution::new(1280, 720));
        assert_eq!(read.stride, 1280);
        assert_eq!(read.slice_height, 720);
    }

    #[test]
    fn decoder_video_formats_enumerated() {
        let (_c, params) = make_params(CodecRole::Decoder);
        let mut element = CodecElement::default();
        params.get_parameter(ParamKey::VideoFormat, &mut element).unwrap();
        assert!(element.supported_formats.contains(&PixelFormat::Nv12));
        assert!(element.supported_formats.len() >= 2);
    }

    #[test]
    fn decoder_surface_init_reads_usage() {
        let (_c, params) = make_params(CodecRole::Decoder);
        let mut element = CodecElement::default();
        params.set_parameter(ParamKey::SurfaceInit, &element).unwrap();
        params.get_parameter(ParamKey::SurfaceInit, &mut element).unwrap();
        assert_ne!(element.usage, 0);
    }

    #[test]
    fn decoder_rejects_encoder_keys() {
        let (_c, params) = make_params(CodecRole::Decoder);
        let element = CodecElement::default();
        for key in [
            ParamKey::RequestIFrame,
            ParamKey::DynamicBitrate,
            ParamKey::EncoderConfig,
        ] {
            assert!(matches!(
                params.set_parameter(key, &element),
                Err(CodecError::Unsupported(_))
            ));
        }
    }

    #[test]
    fn driver_failure_is_surfaced() {
        let (_c, params) = make_params(CodecRole::Decoder);
        let mut element = make_element();
        // Fewer buffers than the driver minimum is refused by the driver.
        element.input.buffer_count = 1;
        let err = params
            .set_parameter(ParamKey::InputCommon, &element)
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::DriverCall {
                status: DriverStatus::INVALID_PARAM,
                ..
            }
        ));
    }

    // ── encoder ──

    #[test]
    fn encoder_input_common_sets_frame_rate_config() {
        let (component, params) = make_params(CodecRole::Encoder);
        params.set_parameter(ParamKey::InputCommon, &make_element()).unwrap();

        let mut record = ParamRecord::FrameRate {
            port_index: 1,
            frame_rate_q16: 0,
        };
        component.get_config(&mut record).unwrap();
        assert_eq!(
            record,
            ParamRecord::FrameRate {
                port_index: 1,
                frame_rate_q16: 25 << 16
            }
        );
    }

    #[test]
    fn encoder_request_iframe_and_bitrate() {
        let (component, params) = make_params(CodecRole::Encoder);
        let mut element = make_element();
        params.set_parameter(ParamKey::RequestIFrame, &element).unwrap();
        let mut record = ParamRecord::IntraRefresh {
            port_index: 1,
            refresh: false,
        };
        component.get_config(&mut record).unwrap();
        assert!(matches!(record, ParamRecord::IntraRefresh { refresh: true, .. }));

        element.encoder.bitrate = 1_500_000;
        params.set_parameter(ParamKey::DynamicBitrate, &element).unwrap();
        let mut record = ParamRecord::BitrateConfig {
            port_index: 1,
            bitrate: 0,
        };
        component.get_config(&mut record).unwrap();
        assert!(matches!(
            record,
            ParamRecord::BitrateConfig {
                bitrate: 1_500_000,
                ..
            }
        ));
    }

    #[test]
    fn encoder_config_round_trip() {
        let (_c, params) = make_params(CodecRole::Encoder);
        let mut element = make_element();
        element.encoder.bitrate_mode = hwc_common::BitrateMode::Cbr;
        element.encoder.bitrate = 3_000_000;
        element.encoder.profile = hwc_common::AvcProfile::High;
        element.encoder.level = hwc_common::AvcLevel::Level41;
        params.set_parameter(ParamKey::EncoderConfig, &element).unwrap();

        let mut read = CodecElement::default();
        params.get_parameter(ParamKey::EncoderConfig, &mut read).unwrap();
        assert_eq!(read.encoder.bitrate_mode, hwc_common::BitrateMode::Cbr);
        assert_eq!(read.encoder.bitrate, 3_000_000);
        assert_eq!(read.encoder.profile, hwc_common::AvcProfile::High);
        assert_eq!(read.encoder.level, hwc_common::AvcLevel::Level41);
    }

    #[test]
    fn encoder_surface_init_selects_dynamic_handles() {
        let (component, params) = make_params(CodecRole::Encoder);
        params
            .set_parameter(ParamKey::SurfaceInit, &CodecElement::default())
            .unwrap();
        let mut record = ParamRecord::UseBufferType {
            port_index: 0,
            kind: BufferKind::SharedMemory,
        };
        component.get_parameter(&mut record).unwrap();
        assert_eq!(
            record,
            ParamRecord::UseBufferType {
                port_index: 0,
                kind: BufferKind::DynamicHandle
            }
        );
    }
}
