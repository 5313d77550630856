//! Core session/port state types and small newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One direction of a codec session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

impl PortDirection {
    pub const ALL: [Self; 2] = [Self::Input, Self::Output];
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Port selection for flush and enable/disable operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortSelect {
    Input,
    Output,
    Both,
}

impl PortSelect {
    /// The directions covered by this selection, input first.
    pub fn directions(self) -> &'static [PortDirection] {
        match self {
            Self::Input => &[PortDirection::Input],
            Self::Output => &[PortDirection::Output],
            Self::Both => &PortDirection::ALL,
        }
    }
}

impl From<PortDirection> for PortSelect {
    fn from(dir: PortDirection) -> Self {
        match dir {
            PortDirection::Input => Self::Input,
            PortDirection::Output => Self::Output,
        }
    }
}

/// Codec component lifecycle state.
///
/// Ordered: `Invalid < Loaded < Idle < Executing`.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SessionState {
    #[default]
    Invalid,
    Loaded,
    Idle,
    Executing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "Invalid",
            Self::Loaded => "Loaded",
            Self::Idle => "Idle",
            Self::Executing => "Executing",
        };
        f.write_str(name)
    }
}

/// Enable/disable lifecycle of a single port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    #[default]
    Activated,
    Activating,
    Deactivated,
    Deactivating,
}

impl PortState {
    /// Whether the port accepts new buffer hand-offs.
    pub fn accepts_buffers(self) -> bool {
        self == Self::Activated
    }

    /// Whether an enable/disable command is still waiting for completion.
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::Activating | Self::Deactivating)
    }
}

/// Video/image resolution.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Byte size for NV12 pixel data (Y plane + interleaved UV at half res).
    pub fn nv12_byte_size(self) -> usize {
        let y_size = self.width as usize * self.height as usize;
        let uv_size = self.width as usize * (self.height as usize).div_ceil(2);
        y_size + uv_size
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
