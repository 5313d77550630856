//! Callback sinks shared by unit tests.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use hwc_common::BufferFlags;

use crate::driver::{CodecCallbacks, Command, DriverBuffer, DriverResult, SettingsIndex};

/// Accepts and discards every callback.
pub struct NullCallbacks;

impl CodecCallbacks for NullCallbacks {
    fn on_command_complete(&self, _command: Command) -> DriverResult<()> {
        Ok(())
    }
    fn on_error(&self, _code: u32) -> DriverResult<()> {
        Ok(())
    }
    fn on_port_settings_changed(&self, _port: u32, _index: SettingsIndex) -> DriverResult<()> {
        Ok(())
    }
    fn on_buffer_flag(&self, _port: u32, _flags: BufferFlags) -> DriverResult<()> {
        Ok(())
    }
    fn on_input_buffer_returned(&self, _buffer: &DriverBuffer) -> DriverResult<()> {
        Ok(())
    }
    fn on_output_buffer_filled(&self, _buffer: &DriverBuffer) -> DriverResult<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct CallbackLog {
    pub completed: Vec<Command>,
    pub errors: Vec<u32>,
    pub settings: Vec<(u32, SettingsIndex)>,
    pub flags: Vec<(u32, BufferFlags)>,
    pub returned: Vec<DriverBuffer>,
    pub filled: Vec<DriverBuffer>,
}

/// Records every callback and lets a test wait for a condition on the log.
#[derive(Default)]
pub struct RecordingCallbacks {
    log: Mutex<CallbackLog>,
    changed: Condvar,
}

impl RecordingCallbacks {
    pub fn log(&self) -> CallbackLog {
        self.log.lock().clone()
    }

    /// Block until `ready` holds, panicking after two seconds.
    pub fn wait_for(&self, ready: impl Fn(&CallbackLog) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut log = self.log.lock();
        while !ready(&log) {
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for callbacks: {log:?}");
            self.changed
                .wait_for(&mut log, (deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn record(&self, update: impl FnOnce(&mut CallbackLog)) -> DriverResult<()> {
        update(&mut self.log.lock());
        self.changed.notify_all();
        Ok(())
    }
}

impl CodecCallbacks for RecordingCallbacks {
    fn on_command_complete(&self, command: Command) -> DriverResult<()> {
        self.record(|log| log.completed.push(command))
    }
    fn on_error(&self, code: u32) -> DriverResult<()> {
        self.record(|log| log.errors.push(code))
    }
    fn on_port_settings_changed(&self, port: u32, index: SettingsIndex) -> DriverResult<()> {
        self.record(|log| log.settings.push((port, index)))
    }
    fn on_buffer_flag(&self, port: u32, flags: BufferFlags) -> DriverResult<()> {
        self.record(|log| log.flags.push((port, flags)))
    }
    fn on_input_buffer_returned(&self, buffer: &DriverBuffer) -> DriverResult<()> {
        self.record(|log| log.returned.push(buffer.clone()))
    }
    fn on_output_buffer_filled(&self, buffer: &DriverBuffer) -> DriverResult<()> {
        self.record(|log| log.filled.push(buffer.clone()))
    }
}
