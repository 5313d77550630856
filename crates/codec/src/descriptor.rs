//! Buffer descriptors and the three-list arena.
//!
//! Every descriptor of a port lives in one arena slot addressed by a stable
//! [`DescriptorId`]. Ownership is tracked by which queue holds the id:
//!
//! ```text
//!            hand_off()                 complete(Idle)
//!   idle ─────────────────▶ coding ─────────────────────▶ idle     (input)
//!    ▲                         │
//!    │                         │ complete(Dirty)
//!    │   recycle_dirty()       ▼
//!    └──────────────────── dirty ──── hand_off() ──▶ coding       (output)
//! ```
//!
//! An id is in exactly one queue at a time and its tagged state always
//! matches that queue. [`DescriptorArena::check_invariants`] verifies both.

use std::collections::VecDeque;
use std::fmt;

use hwc_common::{Backing, BufferFlags, ExternalBuffer};

use crate::driver::{BufferKind, DriverBuffer};

/// Stable index of a descriptor within its port's arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub usize);

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which queue currently owns a descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorState {
    /// Free for the next hand-off.
    Idle,
    /// Held by the driver.
    Coding,
    /// Returned by the driver, still held downstream.
    Dirty,
}

/// One unit of port memory plus the driver-visible metadata.
#[derive(Clone, Debug)]
pub struct BufferDescriptor {
    pub id: DescriptorId,
    /// Id the driver assigned at registration.
    pub buffer_id: u32,
    pub port_index: u32,
    pub kind: BufferKind,
    /// `None` for a dynamic-handle descriptor with nothing attached.
    pub backing: Option<Backing>,
    pub capacity: usize,
    pub filled_len: usize,
    pub offset: usize,
    pub flags: BufferFlags,
    pub pts: i64,
    pub read_only: bool,
    /// Memory came from `AllocateBuffer` rather than the pipeline.
    pub driver_allocated: bool,
    /// `UseBuffer`/`AllocateBuffer` has succeeded for this descriptor.
    pub registered: bool,
    pub state: DescriptorState,
}

impl BufferDescriptor {
    /// Unregistered descriptor for imported memory.
    pub fn imported(port_index: u32, kind: BufferKind, backing: Option<Backing>, capacity: usize) -> Self {
        Self {
            id: DescriptorId(usize::MAX),
            buffer_id: 0,
            port_index,
            kind,
            backing,
            capacity,
            filled_len: 0,
            offset: 0,
            flags: BufferFlags::NONE,
            pts: 0,
            read_only: false,
            driver_allocated: false,
            registered: false,
            state: DescriptorState::Idle,
        }
    }

    /// Registered descriptor for memory the driver allocated.
    pub fn from_driver(buffer: &DriverBuffer) -> Self {
        Self {
            id: DescriptorId(usize::MAX),
            buffer_id: buffer.buffer_id,
            port_index: buffer.port_index,
            kind: buffer.kind,
            backing: buffer.memory.clone(),
            capacity: buffer.alloc_len,
            filled_len: 0,
            offset: 0,
            flags: BufferFlags::NONE,
            pts: 0,
            read_only: false,
            driver_allocated: true,
            registered: true,
            state: DescriptorState::Idle,
        }
    }

    /// Header handed to the driver.
    pub fn to_driver_buffer(&self) -> DriverBuffer {
        DriverBuffer {
            buffer_id: self.buffer_id,
            port_index: self.port_index,
            kind: self.kind,
            memory: self.backing.clone(),
            alloc_len: self.capacity,
            offset: self.offset,
            filled_len: self.filled_len,
            pts: self.pts,
            flags: self.flags,
            read_only: self.read_only,
        }
    }

    /// Copy the metadata the driver wrote on return.
    pub fn update_from(&mut self, buffer: &DriverBuffer) {
        self.offset = buffer.offset;
        self.filled_len = buffer.filled_len;
        self.pts = buffer.pts;
        self.flags = buffer.flags;
    }

    /// Clear per-hand-off metadata for reuse.
    pub fn reset(&mut self) {
        self.filled_len = 0;
        self.offset = 0;
        self.flags = BufferFlags::NONE;
        self.pts = 0;
    }

    pub fn backing_id(&self) -> Option<u64> {
        self.backing.as_ref().map(Backing::id)
    }
}

/// A descriptor in flight plus the pipeline buffer attached to it.
#[derive(Clone, Debug)]
pub struct CodingEntry {
    pub id: DescriptorId,
    /// Released when the driver returns the descriptor.
    pub external: Option<ExternalBuffer>,
}

/// Arena of descriptors with idle/coding/dirty queues.
#[derive(Debug, Default)]
pub struct DescriptorArena {
    slots: Vec<BufferDescriptor>,
    idle: VecDeque<DescriptorId>,
    coding: VecDeque<CodingEntry>,
    dirty: VecDeque<DescriptorId>,
}

impl DescriptorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor to the idle queue and return its id.
    pub fn insert(&mut self, mut descriptor: BufferDescriptor) -> DescriptorId {
        let id = DescriptorId(self.slots.len());
        descriptor.id = id;
        descriptor.state = DescriptorState::Idle;
        self.slots.push(descriptor);
        self.idle.push_back(id);
        id
    }

    pub fn get(&self, id: DescriptorId) -> Option<&BufferDescriptor> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: DescriptorId) -> Option<&mut BufferDescriptor> {
        self.slots.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferDescriptor> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferDescriptor> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn coding_len(&self) -> usize {
        self.coding.len()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Oldest idle descriptor.
    pub fn front_idle(&self) -> Option<DescriptorId> {
        self.idle.front().copied()
    }

    pub fn find_idle_by_backing(&self, backing: u64) -> Option<DescriptorId> {
        self.idle
            .iter()
            .copied()
            .find(|id| self.slots[id.0].backing_id() == Some(backing))
    }

    /// Idle or dirty descriptor registered for `backing`.
    pub fn find_available_by_backing(&self, backing: u64) -> Option<DescriptorId> {
        self.find_idle_by_backing(backing).or_else(|| {
            self.dirty
                .iter()
                .copied()
                .find(|id| self.slots[id.0].backing_id() == Some(backing))
        })
    }

    /// Coding entry whose descriptor carries `buffer_id`.
    pub fn find_coding(&self, buffer_id: u32) -> Option<DescriptorId> {
        self.coding
            .iter()
            .map(|entry| entry.id)
            .find(|id| self.slots[id.0].buffer_id == buffer_id)
    }

    /// Move an idle or dirty descriptor into the coding queue.
    ///
    /// Returns `false` if the descriptor is not idle or dirty.
    pub fn hand_off(&mut self, id: DescriptorId, external: Option<ExternalBuffer>) -> bool {
        let Some(state) = self.slots.get(id.0).map(|d| d.state) else {
            return false;
        };
        let removed = match state {
            DescriptorState::Idle => remove_id(&mut self.idle, id),
            DescriptorState::Dirty => remove_id(&mut self.dirty, id),
            DescriptorState::Coding => false,
        };
        if !removed {
            return false;
        }
        self.slots[id.0].state = DescriptorState::Coding;
        self.coding.push_back(CodingEntry { id, external });
        true
    }

    /// Remove the coding entry for `buffer_id` and file the descriptor
    /// under `next`. Returns the descriptor id and the attached buffer.
    pub fn complete(
        &mut self,
        buffer_id: u32,
        next: DescriptorState,
    ) -> Option<(DescriptorId, Option<ExternalBuffer>)> {
        let id = self.find_coding(buffer_id)?;
        self.complete_id(id, next)
    }

    /// Like [`complete`](Self::complete), by descriptor id.
    pub fn complete_id(
        &mut self,
        id: DescriptorId,
        next: DescriptorState,
    ) -> Option<(DescriptorId, Option<ExternalBuffer>)> {
        let pos = self.coding.iter().position(|entry| entry.id == id)?;
        let entry = self.coding.remove(pos)?;
        self.file(id, next);
        Some((id, entry.external))
    }

    /// Return a dirty descriptor to the idle queue.
    pub fn recycle_dirty(&mut self, id: DescriptorId) -> bool {
        if !remove_id(&mut self.dirty, id) {
            return false;
        }
        self.file(id, DescriptorState::Idle);
        true
    }

    /// Remove every descriptor, returning them for release.
    pub fn drain(&mut self) -> Vec<BufferDescriptor> {
        self.idle.clear();
        self.coding.clear();
        self.dirty.clear();
        std::mem::take(&mut self.slots)
    }

    /// Verify that every descriptor sits in exactly one queue matching its
    /// tagged state.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = vec![0u8; self.slots.len()];
        let queues = [
            (DescriptorState::Idle, self.idle.iter().copied().collect::<Vec<_>>()),
            (
                DescriptorState::Coding,
                self.coding.iter().map(|e| e.id).collect::<Vec<_>>(),
            ),
            (DescriptorState::Dirty, self.dirty.iter().copied().collect::<Vec<_>>()),
        ];
        for (state, ids) in &queues {
            for id in ids {
                let Some(slot) = self.slots.get(id.0) else {
                    return Err(format!("{id} in {state:?} queue has no slot"));
                };
                if slot.state != *state {
                    return Err(format!("{id} in {state:?} queue tagged {:?}", slot.state));
                }
                seen[id.0] += 1;
            }
        }
        if let Some(pos) = seen.iter().position(|&count| count != 1) {
            return Err(format!("#{pos} is in {} queues", seen[pos]));
        }
        Ok(())
    }

    fn file(&mut self, id: DescriptorId, state: DescriptorState) {
        self.slots[id.0].state = state;
        match state {
            DescriptorState::Idle => self.idle.push_back(id),
            DescriptorState::Dirty => self.dirty.push_back(id),
            DescriptorState::Coding => self.coding.push_back(CodingEntry { id, external: None }),
        }
    }
}

fn remove_id(queue: &mut VecDeque<DescriptorId>, id: DescriptorId) -> bool {
    match queue.iter().position(|&queued| queued == id) {
        Some(pos) => {
            queue.remove(pos);
            true
        }
        None => false,
    }
}
