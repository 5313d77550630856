//! Per-port strategy: what differs between the input and output port of a
//! decoder or encoder.
//!
//! | Port           | Registration | Handle kind     | Returned to | First fill      |
//! |----------------|--------------|-----------------|-------------|-----------------|
//! | decoder input  | immediate    | -               | idle        | -               |
//! | decoder output | immediate    | `Handle`        | dirty       | queued on start |
//! | encoder input  | deferred     | `DynamicHandle` | idle        | -               |
//! | encoder output | immediate    | `Handle`        | dirty       | queued on start |

use hwc_common::{Backing, CodecRole, ExternalBuffer, PortDirection};

use crate::descriptor::{BufferDescriptor, DescriptorState};
use crate::driver::BufferKind;

/// Strategy object selecting the port-specific behaviour of a
/// [`PortBufferManager`](super::PortBufferManager).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortProfile {
    pub direction: PortDirection,
    pub role: CodecRole,
}

impl PortProfile {
    pub fn new(direction: PortDirection, role: CodecRole) -> Self {
        Self { direction, role }
    }

    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    /// Encoder input descriptors are registered with the driver only when
    /// the session leaves `Loaded`.
    pub fn defers_registration(&self) -> bool {
        self.is_input() && self.role == CodecRole::Encoder
    }

    /// Handles attached per hand-off instead of at registration.
    pub fn uses_dynamic_handles(&self) -> bool {
        self.defers_registration()
    }

    /// Driver buffer kind for imported memory.
    pub fn descriptor_kind(&self, backing: &Backing) -> BufferKind {
        match backing {
            Backing::Shared(_) => BufferKind::SharedMemory,
            Backing::Handle(_) if self.uses_dynamic_handles() => BufferKind::DynamicHandle,
            Backing::Handle(_) => BufferKind::Handle,
        }
    }

    /// Build the unregistered descriptor for an imported buffer.
    pub fn import_descriptor(&self, buffer: &ExternalBuffer, port_index: u32) -> BufferDescriptor {
        let kind = self.descriptor_kind(buffer.backing());
        let backing = match kind {
            BufferKind::DynamicHandle => None,
            _ => Some(buffer.backing().clone()),
        };
        let mut descriptor =
            BufferDescriptor::imported(port_index, kind, backing, buffer.capacity());
        descriptor.read_only = self.is_input();
        descriptor
    }

    /// Imported output buffers wait for the port to start and are then
    /// handed to the driver for filling.
    pub fn queues_imports_for_fill(&self) -> bool {
        !self.is_input()
    }

    /// Where a descriptor goes when the driver hands it back. Output
    /// descriptors stay dirty until the pipeline recycles them.
    pub fn returns_to(&self) -> DescriptorState {
        if self.is_input() {
            DescriptorState::Idle
        } else {
            DescriptorState::Dirty
        }
    }

    pub fn label(&self) -> &'static str {
        match (self.role, self.direction) {
            (CodecRole::Decoder, PortDirection::Input) => "decoder input",
            (CodecRole::Decoder, PortDirection::Output) => "decoder output",
            (CodecRole::Encoder, PortDirection::Input) => "encoder input",
            (CodecRole::Encoder, PortDirection::Output) => "encoder output",
        }
    }
}
