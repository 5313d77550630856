//! Driver peer interface.
//!
//! The codec component lives behind three traits:
//!
//! - [`ComponentManager`] creates and destroys components by name.
//! - [`CodecComponent`] accepts commands, parameter records, and buffer
//!   hand-offs from the session.
//! - [`CodecCallbacks`] is implemented by the session and called from the
//!   driver's own thread when a command completes, a buffer comes back, or
//!   something goes wrong.
//!
//! Buffers cross the boundary as [`DriverBuffer`] headers. A header carries
//! the memory by reference (`Backing` is reference counted), so a hand-off
//! never copies payload bytes.

use std::fmt;
use std::sync::Arc;

use hwc_common::{Backing, BufferFlags, DriverStatus, PortDirection, Resolution, SessionState};

/// Result of a driver peer call.
pub type DriverResult<T> = Result<T, DriverStatus>;

/// Port index meaning "every port" in a flush command.
pub const ALL_PORTS: u32 = u32::MAX;

/// Identifier of a created component.
pub type ComponentId = u32;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Lifecycle command sent to a component.
///
/// The same values come back through [`CodecCallbacks::on_command_complete`]
/// with the data the driver settled on: the reached state for `StateSet`,
/// and one completion per port for a `Flush(ALL_PORTS)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    StateSet(SessionState),
    Flush(u32),
    PortEnable(u32),
    PortDisable(u32),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateSet(state) => write!(f, "StateSet({state})"),
            Self::Flush(ALL_PORTS) => write!(f, "Flush(all)"),
            Self::Flush(port) => write!(f, "Flush({port})"),
            Self::PortEnable(port) => write!(f, "PortEnable({port})"),
            Self::PortDisable(port) => write!(f, "PortDisable({port})"),
        }
    }
}

/// Which record a port-settings-changed event refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SettingsIndex {
    /// Geometry, format, or buffer requirements changed.
    PortDefinition,
    /// Only the visible crop rectangle changed.
    OutputCrop,
    Other(u32),
}

// ---------------------------------------------------------------------------
// Buffer headers
// ---------------------------------------------------------------------------

/// How a buffer's memory is presented to the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Shared memory the driver maps and reads/writes.
    SharedMemory,
    /// A graphic handle fixed at registration.
    Handle,
    /// A graphic handle attached per hand-off; the registered buffer has
    /// no memory of its own.
    DynamicHandle,
}

impl BufferKind {
    /// Bit used in [`ParamRecord::SupportedBufferTypes`] masks.
    pub fn mask_bit(self) -> u32 {
        match self {
            Self::SharedMemory => 0x1,
            Self::Handle => 0x2,
            Self::DynamicHandle => 0x4,
        }
    }
}

/// Driver-visible buffer header.
#[derive(Clone, Debug)]
pub struct DriverBuffer {
    /// Assigned by the driver when the buffer is registered.
    pub buffer_id: u32,
    pub port_index: u32,
    pub kind: BufferKind,
    /// `None` only for a dynamic-handle buffer with nothing attached.
    pub memory: Option<Backing>,
    pub alloc_len: usize,
    pub offset: usize,
    pub filled_len: usize,
    pub pts: i64,
    pub flags: BufferFlags,
    pub read_only: bool,
}

impl DriverBuffer {
    pub fn new(port_index: u32, kind: BufferKind, memory: Option<Backing>, alloc_len: usize) -> Self {
        Self {
            buffer_id: 0,
            port_index,
            kind,
            memory,
            alloc_len,
            offset: 0,
            filled_len: 0,
            pts: 0,
            flags: BufferFlags::NONE,
            read_only: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter records
// ---------------------------------------------------------------------------

/// Compression format as the driver names it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CodingType {
    #[default]
    Unused,
    Avc,
    Hevc,
}

/// Raw color format as the driver names it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    #[default]
    Unused,
    Yuv420SemiPlanar,
    Yvu420SemiPlanar,
    Yuv420Planar,
    Rgba8888,
}

/// Range of port indices a component exposes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortRange {
    pub start_port: u32,
    pub count: u32,
}

/// Video part of a port definition.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoPortDefinition {
    pub resolution: Resolution,
    pub stride: u32,
    pub slice_height: u32,
    /// Frames per second in Q16 fixed point.
    pub frame_rate_q16: u32,
    pub compression: CodingType,
    pub color_format: ColorFormat,
}

/// Buffer requirements and format of one port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortDefinition {
    pub port_index: u32,
    pub direction: PortDirection,
    pub enabled: bool,
    pub buffer_count_actual: u32,
    pub buffer_count_min: u32,
    pub buffer_size: u32,
    pub video: VideoPortDefinition,
}

impl PortDefinition {
    /// Query template for `port_index`; the driver fills in the rest.
    pub fn query(port_index: u32) -> Self {
        Self {
            port_index,
            direction: PortDirection::Input,
            enabled: true,
            buffer_count_actual: 0,
            buffer_count_min: 0,
            buffer_size: 0,
            video: VideoPortDefinition::default(),
        }
    }
}

/// One entry of a port's supported format list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoPortFormat {
    pub port_index: u32,
    /// Enumeration index; the driver answers `NO_MORE` past the end.
    pub index: u32,
    pub compression: CodingType,
    pub color_format: ColorFormat,
    pub frame_rate_q16: u32,
}

/// Encoder rate control.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RateControl {
    #[default]
    Variable,
    Constant,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BitrateParam {
    pub port_index: u32,
    pub control: RateControl,
    pub target_bitrate: u32,
}

/// Driver-side H.264 profile code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AvcProfileCode {
    #[default]
    Baseline,
    Main,
    Extended,
    High,
    High10,
    High422,
    High444,
}

/// Driver-side H.264 level code, the level times ten (`1b` is 9).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AvcLevelCode(pub u32);

/// Allowed picture type bits in [`AvcParam::allowed_picture_types`].
pub const PICTURE_TYPE_I: u32 = 0x1;
pub const PICTURE_TYPE_P: u32 = 0x2;
pub const PICTURE_TYPE_B: u32 = 0x4;

/// H.264 stream structure.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AvcParam {
    pub port_index: u32,
    pub profile: AvcProfileCode,
    pub level: AvcLevelCode,
    pub p_frames: u32,
    pub b_frames: u32,
    pub ref_frames: u32,
    pub allowed_picture_types: u32,
    pub cabac: bool,
    pub cabac_init_idc: u32,
    pub weighted_p_prediction: bool,
    pub constrained_intra_pred: bool,
    pub direct_8x8_inference: bool,
    pub direct_spatial_temporal: bool,
    pub use_hadamard: bool,
    pub frame_mbs_only: bool,
    pub loop_filter: bool,
}

/// Parameter and config records exchanged with
/// [`CodecComponent::get_parameter`] and friends.
///
/// Getters are in/out: the caller sets the port (and index) and the driver
/// fills in the rest of the same variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamRecord {
    PortRange(PortRange),
    PortDefinition(PortDefinition),
    VideoPortFormat(VideoPortFormat),
    /// Bit mask of [`BufferKind::mask_bit`] values.
    SupportedBufferTypes { port_index: u32, mask: u32 },
    UseBufferType { port_index: u32, kind: BufferKind },
    BufferHandleUsage { port_index: u32, usage: u64 },
    Bitrate(BitrateParam),
    ConstantQuality { port_index: u32, quality: u32 },
    Avc(AvcParam),
    /// Config: encode frame rate in Q16.
    FrameRate { port_index: u32, frame_rate_q16: u32 },
    /// Config: bitrate change while executing.
    BitrateConfig { port_index: u32, bitrate: u32 },
    /// Config: force the next frame to be intra coded.
    IntraRefresh { port_index: u32, refresh: bool },
}

impl ParamRecord {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PortRange(_) => "PortRange",
            Self::PortDefinition(_) => "PortDefinition",
            Self::VideoPortFormat(_) => "VideoPortFormat",
            Self::SupportedBufferTypes { .. } => "SupportedBufferTypes",
            Self::UseBufferType { .. } => "UseBufferType",
            Self::BufferHandleUsage { .. } => "BufferHandleUsage",
            Self::Bitrate(_) => "Bitrate",
            Self::ConstantQuality { .. } => "ConstantQuality",
            Self::Avc(_) => "Avc",
            Self::FrameRate { .. } => "FrameRate",
            Self::BitrateConfig { .. } => "BitrateConfig",
            Self::IntraRefresh { .. } => "IntraRefresh",
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A created codec component.
///
/// Calls may deliver callbacks on another thread at any time after they
/// return; implementations must not call back synchronously from inside a
/// call.
pub trait CodecComponent: Send + Sync {
    fn send_command(&self, command: Command) -> DriverResult<()>;

    fn get_parameter(&self, record: &mut ParamRecord) -> DriverResult<()>;
    fn set_parameter(&self, record: &ParamRecord) -> DriverResult<()>;
    fn get_config(&self, record: &mut ParamRecord) -> DriverResult<()>;
    fn set_config(&self, record: &ParamRecord) -> DriverResult<()>;

    /// Register caller memory. The driver writes `buffer.buffer_id`.
    fn use_buffer(&self, port_index: u32, buffer: &mut DriverBuffer) -> DriverResult<()>;
    /// Register driver-allocated shared memory of `size` bytes.
    fn allocate_buffer(&self, port_index: u32, size: usize) -> DriverResult<DriverBuffer>;
    fn free_buffer(&self, port_index: u32, buffer: &DriverBuffer) -> DriverResult<()>;

    /// Hand a filled input buffer to the driver.
    fn empty_this_buffer(&self, buffer: DriverBuffer) -> DriverResult<()>;
    /// Hand an empty output buffer to the driver.
    fn fill_this_buffer(&self, buffer: DriverBuffer) -> DriverResult<()>;
}

/// Events delivered by the driver.
pub trait CodecCallbacks: Send + Sync {
    fn on_command_complete(&self, command: Command) -> DriverResult<()>;
    fn on_error(&self, code: u32) -> DriverResult<()>;
    fn on_port_settings_changed(&self, port_index: u32, index: SettingsIndex) -> DriverResult<()>;
    fn on_buffer_flag(&self, port_index: u32, flags: BufferFlags) -> DriverResult<()>;
    fn on_input_buffer_returned(&self, buffer: &DriverBuffer) -> DriverResult<()>;
    fn on_output_buffer_filled(&self, buffer: &DriverBuffer) -> DriverResult<()>;
}

/// Factory for codec components.
pub trait ComponentManager: Send + Sync {
    /// Names of the components this manager can create.
    fn component_names(&self) -> Vec<String>;

    fn create_component(
        &self,
        name: &str,
        callbacks: Arc<dyn CodecCallbacks>,
    ) -> DriverResult<(ComponentId, Arc<dyn CodecComponent>)>;

    fn destroy_component(&self, id: ComponentId) -> DriverResult<()>;
}
