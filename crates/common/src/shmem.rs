//! Shared-memory block pool.
//!
//! A fixed number of equally sized blocks. [`SharedMemoryPool::acquire`]
//! blocks while every block is out; a block comes back when the last
//! reference to its [`SharedMemory`] drops. An optional notifier runs on
//! every return so a caller that chose not to block can retry.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::buffer::SharedMemory;
use crate::error::PoolError;

type Notifier = Box<dyn Fn() + Send + Sync>;

struct PoolState {
    free: Vec<Box<[u8]>>,
    outstanding: usize,
    closed: bool,
}

pub(crate) struct PoolShared {
    block_size: usize,
    max_blocks: usize,
    state: Mutex<PoolState>,
    available: Condvar,
    notifier: Mutex<Option<Notifier>>,
}

impl PoolShared {
    pub(crate) fn recycle(&self, mut storage: Box<[u8]>) {
        {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if !state.closed {
                storage.fill(0);
                state.free.push(storage);
            }
        }
        self.available.notify_one();
        if let Some(notify) = self.notifier.lock().as_ref() {
            notify();
        }
    }
}

/// Pool of shared-memory blocks.
#[derive(Clone)]
pub struct SharedMemoryPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for SharedMemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SharedMemoryPool")
            .field("block_size", &self.shared.block_size)
            .field("max_blocks", &self.shared.max_blocks)
            .field("outstanding", &state.outstanding)
            .field("closed", &state.closed)
            .finish()
    }
}

impl SharedMemoryPool {
    pub fn new(max_blocks: usize, block_size: usize) -> Self {
        debug!(max_blocks, block_size, "Shared memory pool created");
        Self {
            shared: Arc::new(PoolShared {
                block_size,
                max_blocks,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    outstanding: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                notifier: Mutex::new(None),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    pub fn max_blocks(&self) -> usize {
        self.shared.max_blocks
    }

    /// Blocks currently handed out.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding
    }

    /// Install the callback run whenever a block returns to the pool.
    pub fn set_available_notifier(&self, notify: impl Fn() + Send + Sync + 'static) {
        *self.shared.notifier.lock() = Some(Box::new(notify));
    }

    /// Take a block, waiting until one is free.
    pub fn acquire(&self, size: usize) -> Result<Arc<SharedMemory>, PoolError> {
        self.check_size(size)?;
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if state.outstanding < self.shared.max_blocks {
                return Ok(self.take_block(&mut state));
            }
            self.shared.available.wait(&mut state);
        }
    }

    /// Take a block if one is free right now.
    pub fn try_acquire(&self, size: usize) -> Result<Arc<SharedMemory>, PoolError> {
        self.check_size(size)?;
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if state.outstanding >= self.shared.max_blocks {
            return Err(PoolError::Exhausted {
                count: self.shared.max_blocks,
            });
        }
        Ok(self.take_block(&mut state))
    }

    /// Fail every pending and future acquire.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.free.clear();
        drop(state);
        self.shared.available.notify_all();
    }

    fn check_size(&self, size: usize) -> Result<(), PoolError> {
        if size > self.shared.block_size {
            return Err(PoolError::TooLarge {
                requested: size,
                block_size: self.shared.block_size,
            });
        }
        Ok(())
    }

    fn take_block(&self, state: &mut PoolState) -> Arc<SharedMemory> {
        let storage = state
            .free
            .pop()
            .unwrap_or_else(|| vec![0u8; self.shared.block_size].into_boxed_slice());
        state.outstanding += 1;
        Arc::new(SharedMemory::pooled(storage, Arc::downgrade(&self.shared)))
    }
}
