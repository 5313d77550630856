//! `hwc-common` -- Shared types, buffers, errors, and configuration for the
//! hardware codec session crates.
//!
//! This crate is the foundation the codec crate depends on:
//!
//! - **Types**: `SessionState`, `PortState`, `PortDirection`, `Resolution`
//! - **Buffers**: `SharedMemory`, `GraphicHandle`, `ExternalBuffer`, `BufferFlags`
//! - **Pool**: `SharedMemoryPool` (blocking acquire, release on drop)
//! - **Element**: `CodecElement`, the pipeline-side format description
//! - **Errors**: `CodecError`, `DriverStatus`, `ConfigError` (thiserror-based)
//! - **Config**: `SessionConfig` with JSON loading

pub mod buffer;
pub mod codec;
pub mod color;
pub mod config;
pub mod element;
pub mod error;
pub mod shmem;
pub mod types;

// Re-export commonly used items at crate root
pub use buffer::{Backing, BufferFlags, ExternalBuffer, GraphicHandle, SharedMemory};
pub use codec::{AvcLevel, AvcProfile, BitrateMode, CodecRole, CompressionFormat};
pub use color::PixelFormat;
pub use config::SessionConfig;
pub use element::{CodecElement, EncoderSettings, ParamKey, PortInfo};
pub use error::{
    check_status, CodecError, CodecResult, ConfigError, DriverStatus, PoolError,
};
pub use shmem::SharedMemoryPool;
pub use types::{PortDirection, PortSelect, PortState, Resolution, SessionState};
