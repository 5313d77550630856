//! `hwc-codec` -- Hardware codec session controller.
//!
//! Drives a hardware encoder or decoder component through its command and
//! callback interface: lifecycle state changes, per-port buffer exchange,
//! flushing, port enable/disable, and parameter translation.
//!
//! # Architecture
//!
//! - [`driver`] -- Driver peer traits (`CodecComponent`, `CodecCallbacks`,
//!   `ComponentManager`), commands, buffer headers, parameter records
//! - [`registry`] -- Creates and tracks components by name
//! - [`session`] -- `CodecSession`: lifecycle commands, command tracking,
//!   callback routing
//! - [`port`] -- `PortBufferManager`: one port's descriptors and the
//!   blocking push/pull exchange
//! - [`descriptor`] -- Buffer descriptors in an arena with idle/coding/dirty
//!   bookkeeping
//! - [`params`] -- `ParamManager`: pipeline format to driver records
//! - [`loopback`] -- In-process passthrough component
//!
//! # Buffer Flow (decoder)
//!
//! ```text
//! compressed ExternalBuffer
//!   --> push_input_buffer  (idle -> coding, EmptyThisBuffer)
//!     --> driver decodes
//!       --> on_input_buffer_returned  (coding -> idle)
//!       --> on_output_buffer_filled   (coding -> dirty)
//!         --> pull_output_buffer  (raw frame to the pipeline)
//!           --> push_output_buffer  (dirty -> coding, FillThisBuffer)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use hwc_codec::{CodecSession, ComponentRegistry, LoopbackManager};
//! use hwc_common::{CodecRole, PortDirection, SessionConfig};
//!
//! let registry = Arc::new(ComponentRegistry::new(Arc::new(LoopbackManager::new())));
//! let config = SessionConfig::new(LoopbackManager::DECODER_AVC, CodecRole::Decoder);
//! let session = CodecSession::open(&registry, &config)?;
//! session.allocate_buffers(PortDirection::Input)?;
//! session.allocate_buffers(PortDirection::Output)?;
//! session.start()?;
//! ```

pub mod descriptor;
pub mod driver;
pub mod loopback;
pub mod params;
pub mod port;
pub mod registry;
pub mod session;

#[cfg(test)]
mod test_support;

pub use driver::{CodecCallbacks, CodecComponent, Command, ComponentManager, SettingsIndex};
pub use loopback::{LoopbackComponent, LoopbackManager};
pub use params::ParamManager;
pub use port::{PortBufferManager, PortStats, PullOutcome, PushOutcome};
pub use registry::ComponentRegistry;
pub use session::{CodecSession, SessionStats};
