//! Port buffer manager -- owns one port's descriptors and the blocking
//! buffer exchange with the pipeline.
//!
//! ```text
//!   pipeline                PortBufferManager                  driver
//!   ────────                ─────────────────                  ──────
//!   use_buffers() ────────▶ arena.insert (idle) ──UseBuffer──▶
//!   push_buffer() ──wait──▶ idle → coding ──EmptyThisBuffer──▶
//!                           coding → idle   ◀──buffer_available──  (input)
//!   pull_buffer() ◀──wait── coding → dirty  ◀──buffer_available──  (output)
//!   push_buffer() ────────▶ dirty → coding ──FillThisBuffer───▶   (output)
//!   free_buffers() ──wait until coding empty──FreeBuffer──────▶
//! ```
//!
//! One manager type serves all four ports; [`PortProfile`] selects the
//! port-specific behaviour. All bookkeeping happens under one mutex; the
//! driver is always called with the lock released.
//!
//! # Usage
//!
//! ```ignore
//! let port = PortBufferManager::new(profile, 0, component);
//! port.use_buffers(buffers)?;
//! port.start()?;
//! match port.push_buffer(Some(frame))? {
//!     PushOutcome::Queued => {}
//!     PushOutcome::Flushing | PushOutcome::Stopped => return Ok(()),
//! }
//! ```

pub mod profile;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use hwc_common::{BufferFlags, CodecError, CodecResult, ExternalBuffer, PortState};

use crate::descriptor::{BufferDescriptor, DescriptorArena, DescriptorId, DescriptorState};
use crate::driver::{BufferKind, CodecComponent, DriverBuffer, ParamRecord, PortDefinition};

pub use profile::PortProfile;

// ---------------------------------------------------------------------------
// Outcomes and stats
// ---------------------------------------------------------------------------

/// Result of handing a buffer to the port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// The buffer is with the driver.
    Queued,
    /// The port is flushing; the buffer was not taken.
    Flushing,
    /// The port is stopped or disabled; the buffer was not taken.
    Stopped,
    /// The driver changed the input format; renegotiate before pushing.
    FormatChanged,
}

/// Result of waiting for an output buffer.
#[derive(Clone, Debug)]
pub enum PullOutcome {
    Buffer(ExternalBuffer),
    /// Last buffer of the stream. The buffer must still be pushed back.
    EndOfStream(ExternalBuffer),
    Flushing,
    Stopped,
    /// The driver changed the output format; renegotiate before pulling.
    FormatChanged,
}

impl PullOutcome {
    pub fn buffer(&self) -> Option<&ExternalBuffer> {
        match self {
            Self::Buffer(buf) | Self::EndOfStream(buf) => Some(buf),
            _ => None,
        }
    }
}

/// Snapshot of one port's bookkeeping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PortStats {
    pub total: usize,
    pub idle: usize,
    pub coding: usize,
    pub dirty: usize,
    /// Output buffers waiting for the port to start.
    pub pending_fill: usize,
    /// Output buffers filled by the driver and not yet pulled.
    pub filled: usize,
    pub handed_to_driver: u64,
    pub returned_by_driver: u64,
}

impl PortStats {
    /// Every descriptor is in exactly one of idle, coding, or dirty.
    pub fn accounted(&self) -> bool {
        self.idle + self.coding + self.dirty == self.total
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct FilledEntry {
    id: DescriptorId,
    buffer: ExternalBuffer,
    eos: bool,
}

struct PortInner {
    arena: DescriptorArena,
    pending_fill: VecDeque<ExternalBuffer>,
    filled: VecDeque<FilledEntry>,
    activation: PortState,
    started: bool,
    /// Flush command outstanding.
    flushing: bool,
    /// Flushed since the last start; push and pull report `Flushing`.
    flushed: bool,
    fatal: Option<u32>,
    closed: bool,
    handed_to_driver: u64,
    returned_by_driver: u64,
}

impl PortInner {
    fn check_fatal(&self) -> CodecResult<()> {
        if let Some(code) = self.fatal {
            return Err(CodecError::DriverError { code });
        }
        if self.closed {
            return Err(CodecError::SessionClosed);
        }
        Ok(())
    }
}

/// Buffer bookkeeping for one port of a codec session.
pub struct PortBufferManager {
    profile: PortProfile,
    port_index: u32,
    component: Arc<dyn CodecComponent>,
    inner: Mutex<PortInner>,
    /// Signalled when a descriptor returns or a terminal condition fires.
    buffer_cond: Condvar,
    /// Signalled when a flush completes or coding drains.
    flush_cond: Condvar,
    /// Signalled when coding drains.
    free_cond: Condvar,
}

impl fmt::Debug for PortBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PortBufferManager")
            .field("port", &self.profile.label())
            .field("port_index", &self.port_index)
            .field("descriptors", &inner.arena.len())
            .field("coding", &inner.arena.coding_len())
            .field("started", &inner.started)
            .field("flushed", &inner.flushed)
            .field("activation", &inner.activation)
            .finish()
    }
}

impl PortBufferManager {
    pub fn new(profile: PortProfile, port_index: u32, component: Arc<dyn CodecComponent>) -> Self {
        Self {
            profile,
            port_index,
            component,
            inner: Mutex::new(PortInner {
                arena: DescriptorArena::new(),
                pending_fill: VecDeque::new(),
                filled: VecDeque::new(),
                activation: PortState::Activated,
                started: false,
                flushing: false,
                flushed: false,
                fatal: None,
                closed: false,
                handed_to_driver: 0,
                returned_by_driver: 0,
            }),
            buffer_cond: Condvar::new(),
            flush_cond: Condvar::new(),
            free_cond: Condvar::new(),
        }
    }

    pub fn profile(&self) -> PortProfile {
        self.profile
    }

    pub fn port_index(&self) -> u32 {
        self.port_index
    }

    /// Current buffer requirements of this port, read from the driver.
    pub fn port_definition(&self) -> CodecResult<PortDefinition> {
        let mut record = ParamRecord::PortDefinition(PortDefinition::query(self.port_index));
        self.component
            .get_parameter(&mut record)
            .map_err(|status| CodecError::DriverCall {
                op: "GetParameter(PortDefinition)",
                status,
            })?;
        match record {
            ParamRecord::PortDefinition(def) => Ok(def),
            other => Err(CodecError::InvalidArgument(format!(
                "driver answered PortDefinition with {}",
                other.name()
            ))),
        }
    }

    // ── population ──

    /// Import pipeline-owned memory as this port's descriptors.
    ///
    /// # Errors
    /// `BufferCountMismatch` if `buffers.len()` differs from the port's
    /// negotiated buffer count; `DriverCall` if registration fails, in which
    /// case every descriptor registered so far is freed again.
    pub fn use_buffers(&self, buffers: Vec<ExternalBuffer>) -> CodecResult<()> {
        if buffers.is_empty() {
            return Err(CodecError::InvalidArgument(format!(
                "no buffers supplied for {} port",
                self.profile.label()
            )));
        }
        let definition = self.port_definition()?;
        if buffers.len() != definition.buffer_count_actual as usize {
            return Err(CodecError::BufferCountMismatch {
                expected: definition.buffer_count_actual,
                actual: buffers.len(),
            });
        }
        self.ensure_unpopulated()?;

        let mut descriptors = Vec::with_capacity(buffers.len());
        for buffer in &buffers {
            let mut descriptor = self.profile.import_descriptor(buffer, self.port_index);
            if !self.profile.defers_registration() {
                if let Err(e) = self.register(&mut descriptor) {
                    self.release_registered(&descriptors);
                    return Err(e);
                }
            }
            descriptors.push(descriptor);
        }

        let mut inner = self.inner.lock();
        if !inner.arena.is_empty() {
            drop(inner);
            self.release_registered(&descriptors);
            return Err(self.populated_error());
        }
        for descriptor in descriptors {
            inner.arena.insert(descriptor);
        }
        if self.profile.queues_imports_for_fill() {
            inner.pending_fill.extend(buffers);
        }
        info!(
            port = self.profile.label(),
            count = inner.arena.len(),
            deferred = self.profile.defers_registration(),
            "Port buffers imported"
        );
        Ok(())
    }

    /// Let the driver allocate this port's memory.
    pub fn allocate_buffers(&self) -> CodecResult<()> {
        let definition = self.port_definition()?;
        if definition.buffer_count_actual == 0 {
            return Err(CodecError::InvalidArgument(format!(
                "{} port negotiated zero buffers",
                self.profile.label()
            )));
        }
        self.ensure_unpopulated()?;

        let mut descriptors = Vec::with_capacity(definition.buffer_count_actual as usize);
        for _ in 0..definition.buffer_count_actual {
            match self
                .component
                .allocate_buffer(self.port_index, definition.buffer_size as usize)
            {
                Ok(header) => {
                    let mut descriptor = BufferDescriptor::from_driver(&header);
                    descriptor.read_only = self.profile.is_input();
                    descriptors.push(descriptor);
                }
                Err(status) => {
                    self.release_registered(&descriptors);
                    return Err(CodecError::DriverCall {
                        op: "AllocateBuffer",
                        status,
                    });
                }
            }
        }

        let mut inner = self.inner.lock();
        if !inner.arena.is_empty() {
            drop(inner);
            self.release_registered(&descriptors);
            return Err(self.populated_error());
        }
        for descriptor in descriptors {
            if self.profile.queues_imports_for_fill() {
                if let Some(backing) = descriptor.backing.clone() {
                    inner.pending_fill.push_back(ExternalBuffer::new(backing));
                }
            }
            inner.arena.insert(descriptor);
        }
        info!(
            port = self.profile.label(),
            count = inner.arena.len(),
            size = definition.buffer_size,
            "Port buffers allocated"
        );
        Ok(())
    }

    /// Register descriptors whose registration was deferred.
    pub fn register_deferred(&self) -> CodecResult<()> {
        let pending: Vec<DescriptorId> = {
            let inner = self.inner.lock();
            inner
                .arena
                .iter()
                .filter(|d| !d.registered)
                .map(|d| d.id)
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }
        for id in &pending {
            let Some(mut descriptor) = self.inner.lock().arena.get(*id).cloned() else {
                continue;
            };
            self.register(&mut descriptor)?;
            if let Some(slot) = self.inner.lock().arena.get_mut(*id) {
                slot.buffer_id = descriptor.buffer_id;
                slot.registered = true;
            }
        }
        info!(
            port = self.profile.label(),
            count = pending.len(),
            "Deferred port buffers registered"
        );
        Ok(())
    }

    /// Whether any descriptor (registered or deferred) exists.
    pub fn is_populated(&self) -> bool {
        !self.inner.lock().arena.is_empty()
    }

    fn register(&self, descriptor: &mut BufferDescriptor) -> CodecResult<()> {
        let mut header = descriptor.to_driver_buffer();
        self.component
            .use_buffer(self.port_index, &mut header)
            .map_err(|status| CodecError::DriverCall {
                op: "UseBuffer",
                status,
            })?;
        descriptor.buffer_id = header.buffer_id;
        descriptor.registered = true;
        debug!(
            port = self.profile.label(),
            buffer_id = header.buffer_id,
            kind = ?descriptor.kind,
            "Buffer registered"
        );
        Ok(())
    }

    fn release_registered(&self, descriptors: &[BufferDescriptor]) {
        for descriptor in descriptors.iter().filter(|d| d.registered) {
            if let Err(status) = self
                .component
                .free_buffer(self.port_index, &descriptor.to_driver_buffer())
            {
                warn!(
                    port = self.profile.label(),
                    buffer_id = descriptor.buffer_id,
                    status = %status,
                    "FreeBuffer failed during rollback"
                );
            }
        }
    }

    fn ensure_unpopulated(&self) -> CodecResult<()> {
        let inner = self.inner.lock();
        inner.check_fatal()?;
        if !inner.arena.is_empty() {
            return Err(self.populated_error());
        }
        Ok(())
    }

    fn populated_error(&self) -> CodecError {
        CodecError::InvalidArgument(format!("{} port is already populated", self.profile.label()))
    }

    // ── buffer exchange ──

    /// Hand a buffer to the driver.
    ///
    /// Input: blocks until an idle descriptor exists. `None` sends an empty
    /// buffer flagged end-of-stream.
    ///
    /// Output: recycles a buffer previously pulled (or imported) for the
    /// driver to fill. Never blocks; while the port is stopped or flushed
    /// the buffer is kept for the next start.
    pub fn push_buffer(&self, buffer: Option<ExternalBuffer>) -> CodecResult<PushOutcome> {
        if self.profile.is_input() {
            self.push_input(buffer)
        } else {
            match buffer {
                Some(buffer) => self.push_output(buffer),
                None => Err(CodecError::InvalidArgument(
                    "output push needs a buffer".into(),
                )),
            }
        }
    }

    fn push_input(&self, buffer: Option<ExternalBuffer>) -> CodecResult<PushOutcome> {
        let mut inner = self.inner.lock();
        let (id, copy) = loop {
            inner.check_fatal()?;
            if inner.flushed {
                return Ok(PushOutcome::Flushing);
            }
            if !inner.started || !inner.activation.accepts_buffers() {
                return Ok(PushOutcome::Stopped);
            }
            if let Some(found) = self.select_input(&inner, buffer.as_ref())? {
                break found;
            }
            self.buffer_cond.wait(&mut inner);
        };

        let Some(descriptor) = inner.arena.get_mut(id) else {
            return Err(CodecError::InvalidArgument(format!("descriptor {id} vanished")));
        };
        descriptor.reset();
        let external = match buffer {
            None => {
                descriptor.flags = BufferFlags::EOS;
                None
            }
            Some(buffer) => {
                descriptor.pts = buffer.pts;
                descriptor.flags = buffer.flags;
                if copy {
                    let payload = buffer.payload();
                    if payload.len() > descriptor.capacity {
                        return Err(CodecError::InvalidArgument(format!(
                            "payload of {} bytes exceeds input buffer capacity {}",
                            payload.len(),
                            descriptor.capacity
                        )));
                    }
                    if let Some(mem) = descriptor.backing.as_ref().and_then(|b| b.as_shared()) {
                        mem.write_at(0, &payload);
                    }
                    descriptor.filled_len = payload.len();
                    None
                } else {
                    descriptor.offset = buffer.offset;
                    descriptor.filled_len = buffer.length;
                    if descriptor.kind == BufferKind::DynamicHandle {
                        descriptor.backing = Some(buffer.backing().clone());
                    }
                    Some(buffer)
                }
            }
        };
        let header = descriptor.to_driver_buffer();
        inner.arena.hand_off(id, external);
        inner.handed_to_driver += 1;
        drop(inner);

        debug!(
            port = self.profile.label(),
            buffer_id = header.buffer_id,
            len = header.filled_len,
            pts = header.pts,
            eos = header.flags.is_eos(),
            "EmptyThisBuffer"
        );
        if let Err(status) = self.component.empty_this_buffer(header) {
            let mut inner = self.inner.lock();
            inner.arena.complete_id(id, DescriptorState::Idle);
            if let Some(descriptor) = inner.arena.get_mut(id) {
                descriptor.reset();
                if descriptor.kind == BufferKind::DynamicHandle {
                    descriptor.backing = None;
                }
            }
            inner.handed_to_driver -= 1;
            drop(inner);
            self.buffer_cond.notify_all();
            return Err(CodecError::DriverCall {
                op: "EmptyThisBuffer",
                status,
            });
        }
        Ok(PushOutcome::Queued)
    }

    /// Pick the descriptor for an input push. `Ok(None)` means wait.
    /// The flag says whether the payload must be copied.
    fn select_input(
        &self,
        inner: &PortInner,
        buffer: Option<&ExternalBuffer>,
    ) -> CodecResult<Option<(DescriptorId, bool)>> {
        let Some(buffer) = buffer else {
            return Ok(inner.arena.front_idle().map(|id| (id, false)));
        };
        let backing = buffer.backing_id();
        if let Some(id) = inner.arena.find_idle_by_backing(backing) {
            return Ok(Some((id, false)));
        }
        if inner.arena.iter().any(|d| d.backing_id() == Some(backing)) {
            // Registered but still with the driver.
            return Ok(None);
        }
        let Some(front) = inner.arena.iter().next() else {
            return Err(CodecError::InvalidArgument(format!(
                "{} port has no buffers",
                self.profile.label()
            )));
        };
        let copy = match front.kind {
            BufferKind::DynamicHandle if buffer.backing().is_handle() => false,
            BufferKind::SharedMemory if front.driver_allocated => true,
            _ => return Err(CodecError::UnknownBuffer { backing }),
        };
        Ok(inner.arena.front_idle().map(|id| (id, copy)))
    }

    fn push_output(&self, mut buffer: ExternalBuffer) -> CodecResult<PushOutcome> {
        let mut inner = self.inner.lock();
        inner.check_fatal()?;
        let backing = buffer.backing_id();
        let Some(id) = inner.arena.find_available_by_backing(backing) else {
            return Err(CodecError::UnknownBuffer { backing });
        };
        inner.filled.retain(|entry| entry.id != id);
        buffer.resize(0, 0);
        buffer.flags = BufferFlags::NONE;

        if inner.flushed || !inner.started || !inner.activation.accepts_buffers() {
            inner.arena.recycle_dirty(id);
            if let Some(descriptor) = inner.arena.get_mut(id) {
                descriptor.reset();
            }
            if !inner.pending_fill.iter().any(|b| b.backing_id() == backing) {
                inner.pending_fill.push_back(buffer);
            }
            return Ok(if inner.flushed {
                PushOutcome::Flushing
            } else {
                PushOutcome::Stopped
            });
        }

        let header = match inner.arena.get_mut(id) {
            Some(descriptor) => {
                descriptor.reset();
                descriptor.to_driver_buffer()
            }
            None => return Err(CodecError::UnknownBuffer { backing }),
        };
        inner.arena.hand_off(id, Some(buffer));
        inner.handed_to_driver += 1;
        drop(inner);

        self.fill(id, header)?;
        Ok(PushOutcome::Queued)
    }

    /// Send one output descriptor to the driver; on failure the descriptor
    /// goes back to idle and its buffer waits for the next start.
    fn fill(&self, id: DescriptorId, header: DriverBuffer) -> CodecResult<()> {
        debug!(
            port = self.profile.label(),
            buffer_id = header.buffer_id,
            "FillThisBuffer"
        );
        if let Err(status) = self.component.fill_this_buffer(header) {
            let mut inner = self.inner.lock();
            if let Some((_, Some(buffer))) = inner.arena.complete_id(id, DescriptorState::Idle) {
                inner.pending_fill.push_back(buffer);
            }
            inner.handed_to_driver -= 1;
            return Err(CodecError::DriverCall {
                op: "FillThisBuffer",
                status,
            });
        }
        Ok(())
    }

    /// Wait for the next filled output buffer.
    ///
    /// Buffers the driver already filled are always delivered before a
    /// `Flushing` or `Stopped` status.
    pub fn pull_buffer(&self) -> CodecResult<PullOutcome> {
        if self.profile.is_input() {
            return Err(CodecError::InvalidArgument(
                "pull is only valid on an output port".into(),
            ));
        }
        let mut inner = self.inner.lock();
        loop {
            inner.check_fatal()?;
            if let Some(entry) = inner.filled.pop_front() {
                debug!(
                    port = self.profile.label(),
                    descriptor = %entry.id,
                    len = entry.buffer.length,
                    eos = entry.eos,
                    "Output buffer pulled"
                );
                return Ok(if entry.eos {
                    PullOutcome::EndOfStream(entry.buffer)
                } else {
                    PullOutcome::Buffer(entry.buffer)
                });
            }
            if inner.flushed {
                return Ok(PullOutcome::Flushing);
            }
            if !inner.started {
                return Ok(PullOutcome::Stopped);
            }
            self.buffer_cond.wait(&mut inner);
        }
    }

    /// Driver returned a descriptor (input emptied or output filled).
    ///
    /// # Errors
    /// `UnknownDescriptor` if no descriptor with that id is in flight.
    pub fn buffer_available(&self, buffer: &DriverBuffer) -> CodecResult<()> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.arena.find_coding(buffer.buffer_id) else {
            warn!(
                port = self.profile.label(),
                buffer_id = buffer.buffer_id,
                "Driver returned a buffer that is not in flight"
            );
            return Err(CodecError::UnknownDescriptor {
                buffer_id: buffer.buffer_id,
            });
        };
        inner.returned_by_driver += 1;

        // Dropped after the lock is released: dropping the last reference
        // to pooled memory runs the pool's notifier.
        let mut released = None;
        if self.profile.is_input() {
            if let Some((_, external)) = inner.arena.complete_id(id, DescriptorState::Idle) {
                released = external;
            }
            if let Some(descriptor) = inner.arena.get_mut(id) {
                descriptor.reset();
                if descriptor.kind == BufferKind::DynamicHandle {
                    descriptor.backing = None;
                }
            }
            debug!(port = self.profile.label(), descriptor = %id, "Input buffer returned");
        } else {
            let halted = !inner.started || !inner.activation.accepts_buffers();
            let park = inner.flushed
                || (halted && buffer.filled_len == 0 && !buffer.flags.is_eos());
            if park {
                if let Some((_, Some(external))) = inner.arena.complete_id(id, DescriptorState::Idle)
                {
                    inner.pending_fill.push_back(external);
                }
                if let Some(descriptor) = inner.arena.get_mut(id) {
                    descriptor.reset();
                }
                debug!(port = self.profile.label(), descriptor = %id, "Output buffer parked");
            } else {
                let returned = inner.arena.complete_id(id, self.profile.returns_to());
                if let Some(descriptor) = inner.arena.get_mut(id) {
                    descriptor.update_from(buffer);
                }
                if let Some((_, external)) = returned {
                    let descriptor_backing = inner.arena.get(id).and_then(|d| d.backing.clone());
                    let mut external = match (external, descriptor_backing) {
                        (Some(external), _) => external,
                        (None, Some(backing)) => ExternalBuffer::new(backing),
                        (None, None) => {
                            return Err(CodecError::UnknownDescriptor {
                                buffer_id: buffer.buffer_id,
                            })
                        }
                    };
                    external.resize(buffer.offset, buffer.filled_len);
                    external.pts = buffer.pts;
                    external.flags = buffer.flags;
                    inner.filled.push_back(FilledEntry {
                        id,
                        buffer: external,
                        eos: buffer.flags.is_eos(),
                    });
                }
                debug!(
                    port = self.profile.label(),
                    descriptor = %id,
                    len = buffer.filled_len,
                    eos = buffer.flags.is_eos(),
                    "Output buffer filled"
                );
            }
        }

        let drained = inner.arena.coding_len() == 0;
        drop(inner);
        drop(released);

        self.buffer_cond.notify_all();
        if drained {
            self.free_cond.notify_all();
            self.flush_cond.notify_all();
        }
        Ok(())
    }

    // ── lifecycle ──

    /// Accept buffers again. Output buffers waiting for a fill are handed
    /// to the driver.
    pub fn start(&self) -> CodecResult<()> {
        let submissions = {
            let mut inner = self.inner.lock();
            inner.check_fatal()?;
            inner.started = true;
            inner.flushed = false;
            inner.flushing = false;
            self.take_fill_submissions(&mut inner)
        };
        self.buffer_cond.notify_all();
        debug!(
            port = self.profile.label(),
            submissions = submissions.len(),
            "Port started"
        );
        self.submit_fills(submissions)
    }

    fn take_fill_submissions(&self, inner: &mut PortInner) -> Vec<(DescriptorId, DriverBuffer)> {
        let mut submissions = Vec::new();
        if !self.profile.queues_imports_for_fill() || !inner.activation.accepts_buffers() {
            return submissions;
        }
        while let Some(mut buffer) = inner.pending_fill.pop_front() {
            let backing = buffer.backing_id();
            let Some(id) = inner.arena.find_available_by_backing(backing) else {
                warn!(
                    port = self.profile.label(),
                    backing, "Queued output buffer is not registered; dropping it"
                );
                continue;
            };
            let Some(descriptor) = inner.arena.get_mut(id) else {
                continue;
            };
            descriptor.reset();
            let header = descriptor.to_driver_buffer();
            buffer.resize(0, 0);
            inner.arena.hand_off(id, Some(buffer));
            inner.handed_to_driver += 1;
            submissions.push((id, header));
        }
        submissions
    }

    fn submit_fills(&self, submissions: Vec<(DescriptorId, DriverBuffer)>) -> CodecResult<()> {
        let mut result = Ok(());
        for (id, header) in submissions {
            if result.is_err() {
                // Earlier fill failed: undo the remaining hand-offs.
                let mut inner = self.inner.lock();
                if let Some((_, Some(buffer))) = inner.arena.complete_id(id, DescriptorState::Idle) {
                    inner.pending_fill.push_back(buffer);
                }
                inner.handed_to_driver -= 1;
                continue;
            }
            result = self.fill(id, header);
        }
        result
    }

    /// Stop accepting buffers and wake blocked callers with `Stopped`.
    pub fn stop(&self) {
        self.inner.lock().started = false;
        self.buffer_cond.notify_all();
        self.flush_cond.notify_all();
        debug!(port = self.profile.label(), "Port stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    /// Enter (`true`) or leave (`false`) flushing.
    ///
    /// Entering wakes blocked push/pull callers with `Flushing`; filled
    /// output buffers nobody pulled yet are queued for the next start.
    pub fn flush(&self, enable: bool) {
        let mut inner = self.inner.lock();
        if enable {
            inner.flushing = true;
            inner.flushed = true;
            while let Some(entry) = inner.filled.pop_front() {
                inner.arena.recycle_dirty(entry.id);
                if let Some(descriptor) = inner.arena.get_mut(entry.id) {
                    descriptor.reset();
                }
                let mut buffer = entry.buffer;
                buffer.resize(0, 0);
                buffer.flags = BufferFlags::NONE;
                inner.pending_fill.push_back(buffer);
            }
            drop(inner);
            self.buffer_cond.notify_all();
        } else {
            inner.flushing = false;
            drop(inner);
            self.flush_cond.notify_all();
        }
    }

    /// Block until the flush completed and the driver returned every
    /// descriptor it held.
    pub fn wait_flushed(&self) -> CodecResult<()> {
        let mut inner = self.inner.lock();
        loop {
            inner.check_fatal()?;
            if !inner.flushing && inner.arena.coding_len() == 0 {
                return Ok(());
            }
            self.flush_cond.wait(&mut inner);
        }
    }

    /// Wait for the driver to return every descriptor, then release them
    /// all. Deferred descriptors that were never registered are discarded.
    pub fn free_buffers(&self) -> CodecResult<()> {
        let descriptors = {
            let mut inner = self.inner.lock();
            loop {
                if let Some(code) = inner.fatal {
                    // The driver will not return anything; release locally.
                    let dropped = Self::release_locally(&mut inner);
                    warn!(
                        port = self.profile.label(),
                        count = dropped,
                        "Port buffers released after driver error"
                    );
                    return Err(CodecError::DriverError { code });
                }
                if inner.closed && inner.arena.coding_len() > 0 {
                    let dropped = Self::release_locally(&mut inner);
                    warn!(
                        port = self.profile.label(),
                        count = dropped,
                        "Port buffers still with the driver released at teardown"
                    );
                    return Ok(());
                }
                if inner.arena.coding_len() == 0 {
                    break;
                }
                debug!(
                    port = self.profile.label(),
                    coding = inner.arena.coding_len(),
                    "Waiting for driver to return buffers"
                );
                self.free_cond.wait(&mut inner);
            }
            inner.filled.clear();
            inner.pending_fill.clear();
            inner.arena.drain()
        };
        self.buffer_cond.notify_all();

        let mut first_error = None;
        let mut freed = 0usize;
        for descriptor in descriptors.iter().filter(|d| d.registered) {
            match self
                .component
                .free_buffer(self.port_index, &descriptor.to_driver_buffer())
            {
                Ok(()) => freed += 1,
                Err(status) => {
                    warn!(
                        port = self.profile.label(),
                        buffer_id = descriptor.buffer_id,
                        status = %status,
                        "FreeBuffer failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(CodecError::DriverCall {
                            op: "FreeBuffer",
                            status,
                        });
                    }
                }
            }
        }
        if descriptors.is_empty() {
            return Ok(());
        }
        info!(
            port = self.profile.label(),
            freed,
            discarded = descriptors.len() - freed,
            "Port buffers freed"
        );
        first_error.map_or(Ok(()), Err)
    }

    fn release_locally(inner: &mut PortInner) -> usize {
        inner.filled.clear();
        inner.pending_fill.clear();
        inner.arena.drain().len()
    }

    // ── state shared with the session ──

    pub fn set_activation(&self, state: PortState) {
        let submissions = {
            let mut inner = self.inner.lock();
            inner.activation = state;
            if state == PortState::Activated && inner.started {
                self.take_fill_submissions(&mut inner)
            } else {
                Vec::new()
            }
        };
        self.buffer_cond.notify_all();
        if let Err(e) = self.submit_fills(submissions) {
            warn!(port = self.profile.label(), error = %e, "Refill after port enable failed");
        }
    }

    pub fn activation(&self) -> PortState {
        self.inner.lock().activation
    }

    /// Record a driver error; every current and future wait fails with it.
    pub fn fail(&self, code: u32) {
        self.inner.lock().fatal = Some(code);
        self.notify_all();
    }

    /// Wake every waiter for teardown.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.started = false;
            inner.filled.clear();
            inner.pending_fill.clear();
        }
        self.notify_all();
    }

    pub fn stats(&self) -> PortStats {
        let inner = self.inner.lock();
        PortStats {
            total: inner.arena.len(),
            idle: inner.arena.idle_len(),
            coding: inner.arena.coding_len(),
            dirty: inner.arena.dirty_len(),
            pending_fill: inner.pending_fill.len(),
            filled: inner.filled.len(),
            handed_to_driver: inner.handed_to_driver,
            returned_by_driver: inner.returned_by_driver,
        }
    }

    /// Verify the descriptor bookkeeping.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.inner.lock().arena.check_invariants()
    }

    fn notify_all(&self) {
        self.buffer_cond.notify_all();
        self.flush_cond.notify_all();
        self.free_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Command, DriverResult};
    use hwc_common::{
        Backing, CodecRole, DriverStatus, GraphicHandle, PixelFormat, PortDirection, Resolution,
        SharedMemory,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Component that records hand-offs; tests return buffers by hand.
    struct MockComponent {
        buffer_count: u32,
        buffer_size: u32,
        next_id: AtomicU32,
        emptied: Mutex<Vec<DriverBuffer>>,
        filled: Mutex<Vec<DriverBuffer>>,
        freed: Mutex<Vec<u32>>,
        fail_use_at: Option<u32>,
    }

    impl MockComponent {
        fn new(buffer_count: u32) -> Self {
            Self {
                buffer_count,
                buffer_size: 64,
                next_id: AtomicU32::new(1),
                emptied: Mutex::new(Vec::new()),
                filled: Mutex::new(Vec::new()),
                freed: Mutex::new(Vec::new()),
                fail_use_at: None,
            }
        }
    }

    impl CodecComponent for MockComponent {
        fn send_command(&self, _command: Command) -> DriverResult<()> {
            Ok(())
        }
        fn get_parameter(&self, record: &mut ParamRecord) -> DriverResult<()> {
            if let ParamRecord::PortDefinition(def) = record {
                def.buffer_count_actual = self.buffer_count;
                def.buffer_count_min = self.buffer_count;
                def.buffer_size = self.buffer_size;
                return Ok(());
            }
            Err(DriverStatus::NOT_SUPPORTED)
        }
        fn set_parameter(&self, _record: &ParamRecord) -> DriverResult<()> {
            Ok(())
        }
        fn get_config(&self, _record: &mut ParamRecord) -> DriverResult<()> {
            Ok(())
        }
        fn set_config(&self, _record: &ParamRecord) -> DriverResult<()> {
            Ok(())
        }
        fn use_buffer(&self, _port: u32, buffer: &mut DriverBuffer) -> DriverResult<()> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if Some(id) == self.fail_use_at {
                return Err(DriverStatus::NO_MEMORY);
            }
            buffer.buffer_id = id;
            Ok(())
        }
        fn allocate_buffer(&self, port: u32, size: usize) -> DriverResult<DriverBuffer> {
            let memory = Backing::Shared(Arc::new(SharedMemory::new(size)));
            let mut buffer = DriverBuffer::new(port, BufferKind::SharedMemory, Some(memory), size);
            buffer.buffer_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(buffer)
        }
        fn free_buffer(&self, _port: u32, buffer: &DriverBuffer) -> DriverResult<()> {
            self.freed.lock().push(buffer.buffer_id);
            Ok(())
        }
        fn empty_this_buffer(&self, buffer: DriverBuffer) -> DriverResult<()> {
            self.emptied.lock().push(buffer);
            Ok(())
        }
        fn fill_this_buffer(&self, buffer: DriverBuffer) -> DriverResult<()> {
            self.filled.lock().push(buffer);
            Ok(())
        }
    }

    fn make_port(
        direction: PortDirection,
        role: CodecRole,
        count: u32,
    ) -> (Arc<MockComponent>, Arc<PortBufferManager>) {
        let component = Arc::new(MockComponent::new(count));
        let index = match direction {
            PortDirection::Input => 0,
            PortDirection::Output => 1,
        };
        let port = Arc::new(PortBufferManager::new(
            PortProfile::new(direction, role),
            index,
            component.clone(),
        ));
        (component, port)
    }

    fn shared_buffers(count: usize) -> Vec<ExternalBuffer> {
        (0..count)
            .map(|_| ExternalBuffer::shared(Arc::new(SharedMemory::new(64))))
            .collect()
    }

    fn handle_buffers(count: usize) -> Vec<ExternalBuffer> {
        (0..count)
            .map(|_| {
                ExternalBuffer::handle(Arc::new(GraphicHandle::new(
                    Resolution::new(16, 16),
                    PixelFormat::Nv12,
                )))
            })
            .collect()
    }

    fn wait_for<F: Fn() -> bool>(pred: F) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    // ── population ──

    #[test]
    fn use_buffers_count_mismatch() {
        let (_c, port) = make_port(PortDirection::Output, CodecRole::Decoder, 4);
        let err = port.use_buffers(handle_buffers(3)).unwrap_err();
        assert_eq!(
            err,
            CodecError::BufferCountMismatch {
                expected: 4,
                actual: 3
            }
        );
        assert!(!port.is_populated());
    }

    #[test]
    fn use_buffers_registers_each() {
        let (_c, port) = make_port(PortDirection::Input, CodecRole::Decoder, 3);
        port.use_buffers(shared_buffers(3)).unwrap();
        let stats = port.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.idle, 3);
        assert!(stats.accounted());
    }

    #[test]
    fn use_buffers_twice_rejected() {
        let (_c, port) = make_port(PortDirection::Input, CodecRole::Decoder, 2);
        port.use_buffers(shared_buffers(2)).unwrap();
        assert!(matches!(
            port.use_buffers(shared_buffers(2)),
            Err(CodecError::InvalidArgument(_))
        ));
    }

    #[test]
    fn failed_registration_rolls_back() {
        let mut component = MockComponent::new(3);
        component.fail_use_at = Some(3);
        let component = Arc::new(component);
        let port = PortBufferManager::new(
            PortProfile::new(PortDirection::Input, CodecRole::Decoder),
            0,
            component.clone(),
        );
        let err = port.use_buffers(shared_buffers(3)).unwrap_err();
        assert!(matches!(err, CodecError::DriverCall { op: "UseBuffer", .. }));
        assert_eq!(*component.freed.lock(), vec![1, 2]);
        assert!(!port.is_populated());
    }

    #[test]
    fn encoder_input_registration_deferred() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Encoder, 2);
        port.use_buffers(handle_buffers(2)).unwrap();
        assert_eq!(component.next_id.load(Ordering::SeqCst), 1);

        port.register_deferred().unwrap();
        assert_eq!(component.next_id.load(Ordering::SeqCst), 3);
        // Second call has nothing left to do.
        port.register_deferred().unwrap();
        assert_eq!(component.next_id.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unregistered_deferred_buffers_are_discarded_on_free() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Encoder, 2);
        port.use_buffers(handle_buffers(2)).unwrap();
        port.free_buffers().unwrap();
        assert!(component.freed.lock().is_empty());
        assert!(!port.is_populated());
    }

    // ── input push ──

    #[test]
    fn push_null_sends_eos() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        port.use_buffers(shared_buffers(1)).unwrap();
        port.start().unwrap();

        assert_eq!(port.push_buffer(None).unwrap(), PushOutcome::Queued);
        let sent = component.emptied.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].filled_len, 0);
        assert!(sent[0].flags.is_eos());
    }

    #[test]
    fn push_before_start_is_stopped() {
        let (_c, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        let buffers = shared_buffers(1);
        port.use_buffers(buffers.clone()).unwrap();
        assert_eq!(
            port.push_buffer(Some(buffers[0].clone())).unwrap(),
            PushOutcome::Stopped
        );
    }

    #[test]
    fn returned_input_is_reset_to_idle() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        let buffers = shared_buffers(1);
        port.use_buffers(buffers.clone()).unwrap();
        port.start().unwrap();

        let mut frame = buffers[0].clone();
        frame.length = 40;
        frame.pts = 1234;
        port.push_buffer(Some(frame)).unwrap();
        assert_eq!(port.stats().coding, 1);

        let header = component.emptied.lock()[0].clone();
        assert_eq!(header.filled_len, 40);
        port.buffer_available(&header).unwrap();

        let stats = port.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.coding, 0);
        port.check_invariants().unwrap();
        let inner = port.inner.lock();
        let desc = inner.arena.get(DescriptorId(0)).unwrap();
        assert_eq!(desc.filled_len, 0);
        assert_eq!(desc.flags, BufferFlags::NONE);
    }

    #[test]
    fn push_blocks_until_buffer_returns() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        port.use_buffers(shared_buffers(1)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();

        let pusher = {
            let port = port.clone();
            thread::spawn(move || port.push_buffer(None))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!pusher.is_finished());

        let header = component.emptied.lock()[0].clone();
        port.buffer_available(&header).unwrap();
        assert_eq!(pusher.join().unwrap().unwrap(), PushOutcome::Queued);
        assert_eq!(component.emptied.lock().len(), 2);
    }

    #[test]
    fn flush_wakes_blocked_push() {
        let (_c, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        port.use_buffers(shared_buffers(1)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();

        let pusher = {
            let port = port.clone();
            thread::spawn(move || port.push_buffer(None))
        };
        thread::sleep(Duration::from_millis(20));
        port.flush(true);
        assert_eq!(pusher.join().unwrap().unwrap(), PushOutcome::Flushing);
    }

    #[test]
    fn fail_wakes_blocked_push_with_error() {
        let (_c, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        port.use_buffers(shared_buffers(1)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();

        let pusher = {
            let port = port.clone();
            thread::spawn(move || port.push_buffer(None))
        };
        thread::sleep(Duration::from_millis(20));
        port.fail(0x8000_1001);
        assert_eq!(
            pusher.join().unwrap().unwrap_err(),
            CodecError::DriverError { code: 0x8000_1001 }
        );
    }

    #[test]
    fn unknown_input_buffer_rejected() {
        let (_c, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        port.use_buffers(shared_buffers(1)).unwrap();
        port.start().unwrap();
        let stranger = ExternalBuffer::from_payload(&[1, 2, 3], 0);
        assert!(matches!(
            port.push_buffer(Some(stranger)),
            Err(CodecError::UnknownBuffer { .. })
        ));
    }

    #[test]
    fn allocated_input_copies_payload() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 2);
        port.allocate_buffers().unwrap();
        port.start().unwrap();
        port.push_buffer(Some(ExternalBuffer::from_payload(b"nal", 7)))
            .unwrap();

        let header = component.emptied.lock()[0].clone();
        assert_eq!(header.filled_len, 3);
        assert_eq!(header.pts, 7);
        let mem = header.memory.as_ref().and_then(|m| m.as_shared()).unwrap();
        assert_eq!(mem.read_at(0, 3), b"nal".to_vec());
    }

    #[test]
    fn dynamic_handle_attached_per_push() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Encoder, 1);
        port.use_buffers(handle_buffers(1)).unwrap();
        port.register_deferred().unwrap();
        port.start().unwrap();

        let frame = handle_buffers(1).remove(0);
        let backing = frame.backing_id();
        port.push_buffer(Some(frame)).unwrap();
        let header = component.emptied.lock()[0].clone();
        assert_eq!(header.kind, BufferKind::DynamicHandle);
        assert_eq!(header.memory.as_ref().map(Backing::id), Some(backing));

        port.buffer_available(&header).unwrap();
        let inner = port.inner.lock();
        assert!(inner.arena.get(DescriptorId(0)).unwrap().backing.is_none());
    }

    // ── output ──

    #[test]
    fn output_imports_fill_on_start() {
        let (component, port) = make_port(PortDirection::Output, CodecRole::Decoder, 3);
        port.use_buffers(handle_buffers(3)).unwrap();
        assert_eq!(port.stats().pending_fill, 3);
        assert!(component.filled.lock().is_empty());

        port.start().unwrap();
        assert_eq!(component.filled.lock().len(), 3);
        let stats = port.stats();
        assert_eq!(stats.coding, 3);
        assert_eq!(stats.pending_fill, 0);
    }

    #[test]
    fn output_pull_and_recycle() {
        let (component, port) = make_port(PortDirection::Output, CodecRole::Decoder, 2);
        port.allocate_buffers().unwrap();
        port.start().unwrap();

        let mut header = component.filled.lock()[0].clone();
        header.filled_len = 10;
        header.pts = 42;
        port.buffer_available(&header).unwrap();
        assert_eq!(port.stats().dirty, 1);

        let buffer = match port.pull_buffer().unwrap() {
            PullOutcome::Buffer(buffer) => buffer,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(buffer.length, 10);
        assert_eq!(buffer.pts, 42);

        assert_eq!(port.push_buffer(Some(buffer)).unwrap(), PushOutcome::Queued);
        assert_eq!(component.filled.lock().len(), 3);
        assert_eq!(port.stats().coding, 2);
        port.check_invariants().unwrap();
    }

    #[test]
    fn output_eos_is_reported() {
        let (component, port) = make_port(PortDirection::Output, CodecRole::Decoder, 1);
        port.allocate_buffers().unwrap();
        port.start().unwrap();
        let mut header = component.filled.lock()[0].clone();
        header.flags = BufferFlags::EOS;
        port.buffer_available(&header).unwrap();
        assert!(matches!(
            port.pull_buffer().unwrap(),
            PullOutcome::EndOfStream(_)
        ));
    }

    #[test]
    fn pull_wakes_on_stop() {
        let (_c, port) = make_port(PortDirection::Output, CodecRole::Decoder, 1);
        port.allocate_buffers().unwrap();
        port.start().unwrap();
        let puller = {
            let port = port.clone();
            thread::spawn(move || port.pull_buffer())
        };
        thread::sleep(Duration::from_millis(20));
        port.stop();
        assert!(matches!(
            puller.join().unwrap().unwrap(),
            PullOutcome::Stopped
        ));
    }

    #[test]
    fn output_push_while_stopped_is_kept() {
        let (component, port) = make_port(PortDirection::Output, CodecRole::Decoder, 1);
        port.allocate_buffers().unwrap();
        port.start().unwrap();
        let mut header = component.filled.lock()[0].clone();
        header.filled_len = 4;
        port.buffer_available(&header).unwrap();
        let buffer = port.pull_buffer().unwrap().buffer().cloned().unwrap();

        port.stop();
        assert_eq!(port.push_buffer(Some(buffer)).unwrap(), PushOutcome::Stopped);
        let stats = port.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.pending_fill, 1);

        port.start().unwrap();
        assert_eq!(component.filled.lock().len(), 2);
    }

    #[test]
    fn flush_requeues_unpulled_output() {
        let (component, port) = make_port(PortDirection::Output, CodecRole::Decoder, 2);
        port.allocate_buffers().unwrap();
        port.start().unwrap();
        let mut header = component.filled.lock()[0].clone();
        header.filled_len = 8;
        port.buffer_available(&header).unwrap();

        port.flush(true);
        let stats = port.stats();
        assert_eq!(stats.filled, 0);
        assert_eq!(stats.pending_fill, 1);
        assert!(matches!(port.pull_buffer().unwrap(), PullOutcome::Flushing));

        // The driver returns the other buffer empty while flushing.
        let header = component.filled.lock()[1].clone();
        port.buffer_available(&header).unwrap();
        port.flush(false);
        port.wait_flushed().unwrap();
        assert_eq!(port.stats().pending_fill, 2);
        port.check_invariants().unwrap();
    }

    // ── teardown ──

    #[test]
    fn wait_flushed_blocks_for_coding() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 2);
        port.use_buffers(shared_buffers(2)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();
        port.flush(true);
        port.flush(false);

        let waiter = {
            let port = port.clone();
            thread::spawn(move || port.wait_flushed())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        let header = component.emptied.lock()[0].clone();
        port.buffer_available(&header).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn wait_flushed_on_stopped_port_still_waits() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 2);
        port.use_buffers(shared_buffers(2)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();
        port.stop();
        port.flush(true);
        port.flush(false);

        let waiter = {
            let port = port.clone();
            thread::spawn(move || port.wait_flushed())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        let header = component.emptied.lock()[0].clone();
        port.buffer_available(&header).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn free_after_close_releases_held_buffers_locally() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 2);
        port.use_buffers(shared_buffers(2)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();
        port.close();

        port.free_buffers().unwrap();
        let stats = port.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.coding, 0);
        assert!(component.freed.lock().is_empty());
    }

    #[test]
    fn free_waits_for_driver_then_frees_all() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 2);
        port.use_buffers(shared_buffers(2)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();
        port.stop();

        let freer = {
            let port = port.clone();
            thread::spawn(move || port.free_buffers())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!freer.is_finished());

        let header = component.emptied.lock()[0].clone();
        port.buffer_available(&header).unwrap();
        freer.join().unwrap().unwrap();
        wait_for(|| component.freed.lock().len() == 2);
        assert!(!port.is_populated());
    }

    #[test]
    fn late_return_after_free_is_unknown() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        port.use_buffers(shared_buffers(1)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();
        let header = component.emptied.lock()[0].clone();
        port.buffer_available(&header).unwrap();
        port.free_buffers().unwrap();
        assert_eq!(
            port.buffer_available(&header).unwrap_err(),
            CodecError::UnknownDescriptor {
                buffer_id: header.buffer_id
            }
        );
    }

    #[test]
    fn free_after_fatal_releases_locally() {
        let (component, port) = make_port(PortDirection::Input, CodecRole::Decoder, 1);
        port.use_buffers(shared_buffers(1)).unwrap();
        port.start().unwrap();
        port.push_buffer(None).unwrap();
        port.fail(7);
        assert_eq!(
            port.free_buffers().unwrap_err(),
            CodecError::DriverError { code: 7 }
        );
        assert!(!port.is_populated());
        assert!(component.freed.lock().is_empty());
    }
}
