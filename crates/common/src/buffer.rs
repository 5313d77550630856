//! Buffer memory and the pipeline-side buffer handle.
//!
//! Memory is either a shared-memory block (bytes visible to both the
//! pipeline and the driver) or an opaque graphic handle (a surface the
//! driver reads or writes without the bytes ever crossing the API). Both
//! are reference counted; holding an [`ExternalBuffer`] is holding a
//! reference on its memory.
//!
//! Every backing gets a process-unique id at creation. Port managers use
//! the id to find the descriptor registered for a buffer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::color::PixelFormat;
use crate::shmem::PoolShared;
use crate::types::Resolution;

static NEXT_BACKING_ID: AtomicU64 = AtomicU64::new(1);

fn next_backing_id() -> u64 {
    NEXT_BACKING_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Shared memory
// ---------------------------------------------------------------------------

/// A block of shared memory.
///
/// Blocks acquired from a [`crate::shmem::SharedMemoryPool`] return their
/// storage to the pool when the last reference is dropped.
pub struct SharedMemory {
    id: u64,
    data: Mutex<Box<[u8]>>,
    pool: Option<Weak<PoolShared>>,
}

impl SharedMemory {
    /// Allocate a zeroed block of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            id: next_backing_id(),
            data: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
            pool: None,
        }
    }

    /// Allocate a block holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            id: next_backing_id(),
            data: Mutex::new(bytes.to_vec().into_boxed_slice()),
            pool: None,
        }
    }

    pub(crate) fn pooled(storage: Box<[u8]>, pool: Weak<PoolShared>) -> Self {
        Self {
            id: next_backing_id(),
            data: Mutex::new(storage),
            pool: Some(pool),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.lock().len()
    }

    /// Copy `bytes` into the block at `offset`, truncating at the end of the
    /// block. Returns the number of bytes written.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> usize {
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = bytes.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Copy `len` bytes starting at `offset`, clamped to the block.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Vec::new();
        }
        let end = offset.saturating_add(len).min(data.len());
        data[offset..end].to_vec()
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            let storage = std::mem::take(self.data.get_mut());
            pool.recycle(storage);
        }
    }
}

// ---------------------------------------------------------------------------
// Graphic handle
// ---------------------------------------------------------------------------

/// An opaque graphic surface passed to the driver without copying.
#[derive(Debug)]
pub struct GraphicHandle {
    id: u64,
    pub resolution: Resolution,
    pub stride: u32,
    pub format: PixelFormat,
    /// Allocation usage flags negotiated with the driver.
    pub usage: u64,
}

impl GraphicHandle {
    pub fn new(resolution: Resolution, format: PixelFormat) -> Self {
        let stride = match format {
            PixelFormat::Rgba8 => resolution.width * 4,
            _ => resolution.width,
        };
        Self {
            id: next_backing_id(),
            resolution,
            stride,
            format,
            usage: 0,
        }
    }

    pub fn with_usage(mut self, usage: u64) -> Self {
        self.usage = usage;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn byte_size(&self) -> usize {
        self.format.frame_size(self.resolution)
    }
}

// ---------------------------------------------------------------------------
// Backing
// ---------------------------------------------------------------------------

/// Memory behind a buffer.
#[derive(Clone, Debug)]
pub enum Backing {
    Shared(Arc<SharedMemory>),
    Handle(Arc<GraphicHandle>),
}

impl Backing {
    pub fn id(&self) -> u64 {
        match self {
            Self::Shared(mem) => mem.id(),
            Self::Handle(handle) => handle.id(),
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            Self::Shared(mem) => mem.capacity(),
            Self::Handle(handle) => handle.byte_size(),
        }
    }

    pub fn is_handle(&self) -> bool {
        matches!(self, Self::Handle(_))
    }

    pub fn as_shared(&self) -> Option<&Arc<SharedMemory>> {
        match self {
            Self::Shared(mem) => Some(mem),
            Self::Handle(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer flags
// ---------------------------------------------------------------------------

/// Driver-visible buffer flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    /// End of stream: no further buffers follow.
    pub const EOS: Self = Self(0x0001);
    /// The buffer ends a frame. Absent means the payload is a partial frame.
    pub const END_OF_FRAME: Self = Self(0x0010);
    /// Sync frame (IDR / keyframe).
    pub const KEYFRAME: Self = Self(0x0020);
    /// Codec configuration data (SPS/PPS).
    pub const CODEC_CONFIG: Self = Self(0x0080);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_eos(self) -> bool {
        self.contains(Self::EOS)
    }

    pub fn is_partial(self) -> bool {
        !self.contains(Self::END_OF_FRAME)
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// External buffer
// ---------------------------------------------------------------------------

/// A pipeline-owned buffer handed to or received from a codec port.
///
/// Cloning shares the memory. A port manager keeps the buffer it was given
/// for as long as the driver holds the matching descriptor.
#[derive(Clone, Debug)]
pub struct ExternalBuffer {
    backing: Backing,
    /// Start of valid data within the memory.
    pub offset: usize,
    /// Bytes of valid data.
    pub length: usize,
    /// Presentation timestamp in microseconds.
    pub pts: i64,
    pub flags: BufferFlags,
    /// The driver may read but must not write the memory.
    pub read_only: bool,
}

impl ExternalBuffer {
    pub fn new(backing: Backing) -> Self {
        Self {
            backing,
            offset: 0,
            length: 0,
            pts: 0,
            flags: BufferFlags::NONE,
            read_only: false,
        }
    }

    pub fn shared(memory: Arc<SharedMemory>) -> Self {
        Self::new(Backing::Shared(memory))
    }

    pub fn handle(handle: Arc<GraphicHandle>) -> Self {
        Self::new(Backing::Handle(handle))
    }

    /// Shared-memory buffer holding `payload` as its valid data.
    pub fn from_payload(payload: &[u8], pts: i64) -> Self {
        let mut buffer = Self::shared(Arc::new(SharedMemory::from_bytes(payload)));
        buffer.length = payload.len();
        buffer.pts = pts;
        buffer
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn backing_id(&self) -> u64 {
        self.backing.id()
    }

    pub fn capacity(&self) -> usize {
        self.backing.capacity()
    }

    /// Copy of the valid data. Empty for graphic handles.
    pub fn payload(&self) -> Vec<u8> {
        match &self.backing {
            Backing::Shared(mem) => mem.read_at(self.offset, self.length),
            Backing::Handle(_) => Vec::new(),
        }
    }

    /// Set the valid data window.
    pub fn resize(&mut self, offset: usize, length: usize) {
        self.offset = offset;
        self.length = length;
    }
}
