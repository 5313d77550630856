//! Codec session controller.
//!
//! Drives one codec component through `Loaded → Idle → Executing` and back,
//! owns the input and output [`PortBufferManager`]s, and routes the driver's
//! callbacks to them.
//!
//! ```text
//!  pipeline thread(s)                 CodecSession              driver thread
//!  ──────────────────                 ────────────              ─────────────
//!  start/stop/flush ──command_lock──▶ send_command ─────────▶
//!        │                            ControlState ◀─────────── on_command_complete
//!        └──── wait on control_cond ◀─┘            ◀─────────── on_error
//!  push/pull ──────────────────────▶ PortBufferManager ◀──────── on_*_buffer_*
//! ```
//!
//! Lifecycle commands are serialized by `command_lock`; a command's caller
//! blocks until the matching completion, a driver error, teardown, or the
//! configured guard timeout. Driver errors are sticky: every later wait
//! fails fast with `DriverError`.
//!
//! Lock order: `control` may be held while taking a port lock, never the
//! reverse. Neither is held while calling the driver.
//!
//! # Usage
//!
//! ```ignore
//! let session = CodecSession::open(&registry, &config)?;
//! session.use_buffers(PortDirection::Input, input_buffers)?;
//! session.allocate_buffers(PortDirection::Output)?;
//! session.start()?;
//! session.push_input_buffer(Some(frame))?;
//! if let PullOutcome::Buffer(buf) = session.pull_output_buffer()? {
//!     consume(&buf);
//!     session.push_output_buffer(buf)?;
//! }
//! session.stop()?;
//! session.free_buffers(PortSelect::Both)?;
//! session.close()?;
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use hwc_common::{
    BufferFlags, CodecElement, CodecError, CodecResult, CodecRole, DriverStatus, ExternalBuffer,
    ParamKey, PortDirection, PortSelect, PortState, SessionConfig, SessionState,
};

use crate::driver::{
    CodecCallbacks, CodecComponent, Command, ComponentId, DriverBuffer, DriverResult,
    ParamRecord, PortRange, SettingsIndex, ALL_PORTS,
};
use crate::params::ParamManager;
use crate::port::{PortBufferManager, PortProfile, PortStats, PullOutcome, PushOutcome};
use crate::registry::ComponentRegistry;

/// Session-wide counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub commands_sent: u64,
    pub buffers_pushed: u64,
    pub buffers_pulled: u64,
    pub flushes: u64,
    pub format_changes: u64,
}

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

fn slot(direction: PortDirection) -> usize {
    match direction {
        PortDirection::Input => 0,
        PortDirection::Output => 1,
    }
}

struct ControlState {
    current: SessionState,
    /// Last state requested from the driver.
    target: SessionState,
    port_states: [PortState; 2],
    /// Flush sent for the port and not yet completed.
    flush_pending: [bool; 2],
    fatal: Option<u32>,
    started: bool,
    /// Port definition changed by the driver and not yet reported.
    format_changed: [bool; 2],
    crop_changed: bool,
    /// Teardown began while a lifecycle call was waiting on the driver.
    closing: bool,
    closed: bool,
    stats: SessionStats,
}

impl ControlState {
    fn check_usable(&self) -> CodecResult<()> {
        if let Some(code) = self.fatal {
            return Err(CodecError::DriverError { code });
        }
        if self.closed || self.closing {
            return Err(CodecError::SessionClosed);
        }
        Ok(())
    }
}

struct SessionInner {
    name: String,
    role: CodecRole,
    component_id: ComponentId,
    component: Arc<dyn CodecComponent>,
    registry: Arc<ComponentRegistry>,
    input: PortBufferManager,
    output: PortBufferManager,
    params: ParamManager,
    /// Serializes lifecycle commands and their waits.
    command_lock: Mutex<()>,
    control: Mutex<ControlState>,
    control_cond: Condvar,
    command_timeout: Option<Duration>,
}

impl SessionInner {
    fn port(&self, direction: PortDirection) -> &PortBufferManager {
        match direction {
            PortDirection::Input => &self.input,
            PortDirection::Output => &self.output,
        }
    }

    fn direction_of(&self, port_index: u32) -> Option<PortDirection> {
        if port_index == self.input.port_index() {
            Some(PortDirection::Input)
        } else if port_index == self.output.port_index() {
            Some(PortDirection::Output)
        } else {
            None
        }
    }

    fn send(&self, command: Command) -> CodecResult<()> {
        debug!(session = %self.name, %command, "SendCommand");
        self.component.send_command(command).map_err(|status| {
            warn!(session = %self.name, %command, status = %status, "Command rejected");
            CodecError::CommandRejected {
                command: command.to_string(),
                status,
            }
        })?;
        self.control.lock().stats.commands_sent += 1;
        Ok(())
    }

    /// Block until `done` holds for the control state.
    fn wait_until(
        &self,
        what: &str,
        mut done: impl FnMut(&ControlState) -> bool,
    ) -> CodecResult<()> {
        let deadline = self.command_timeout.map(|timeout| Instant::now() + timeout);
        let mut control = self.control.lock();
        loop {
            if let Some(code) = control.fatal {
                return Err(CodecError::DriverError { code });
            }
            if done(&control) {
                return Ok(());
            }
            if control.closed || control.closing {
                return Err(CodecError::SessionClosed);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .control_cond
                        .wait_until(&mut control, deadline)
                        .timed_out()
                        && !done(&control)
                        && control.fatal.is_none()
                    {
                        warn!(session = %self.name, what, "Timed out waiting for driver");
                        return Err(CodecError::Timeout(what.to_string()));
                    }
                }
                None => self.control_cond.wait(&mut control),
            }
        }
    }

    fn wait_for_state(&self, state: SessionState) -> CodecResult<()> {
        self.wait_until(&format!("state {state}"), |c| c.current == state)
    }

    /// Ask the driver for `target` unless it is already there or on its way.
    fn request_state(&self, target: SessionState) -> CodecResult<()> {
        let previous = {
            let mut control = self.control.lock();
            control.check_usable()?;
            if control.current == target || control.target == target {
                return Ok(());
            }
            std::mem::replace(&mut control.target, target)
        };
        info!(session = %self.name, %target, "Requesting state change");
        if let Err(e) = self.send(Command::StateSet(target)) {
            self.control.lock().target = previous;
            return Err(e);
        }
        Ok(())
    }

    fn transition(&self, target: SessionState) -> CodecResult<()> {
        self.request_state(target)?;
        self.wait_for_state(target)
    }

    fn is_populated(&self) -> bool {
        self.input.is_populated() || self.output.is_populated()
    }

    /// Body of [`CodecSession::stop`]; the caller holds `command_lock`.
    fn stop(&self) -> CodecResult<()> {
        self.input.stop();
        self.output.stop();
        let current = {
            let mut control = self.control.lock();
            control.started = false;
            control.check_usable()?;
            control.current
        };
        if current == SessionState::Executing {
            self.transition(SessionState::Idle)?;
        }
        if current >= SessionState::Idle {
            self.request_state(SessionState::Loaded)?;
            if !self.is_populated() {
                self.wait_for_state(SessionState::Loaded)?;
            }
        }
        info!(session = %self.name, "Session stopped");
        Ok(())
    }

    /// Wake every lifecycle, flush, and buffer wait with `SessionClosed`.
    fn abort_waits(&self) {
        self.control.lock().closing = true;
        self.control_cond.notify_all();
        self.input.close();
        self.output.close();
    }

    // ── driver events ──

    fn command_complete(&self, command: Command) {
        let mut activation = None;
        let mut flushed = Vec::new();
        {
            let mut control = self.control.lock();
            match command {
                Command::StateSet(state) => {
                    info!(session = %self.name, %state, "State change complete");
                    control.current = state;
                }
                Command::Flush(port) => {
                    let directions: &[PortDirection] = if port == ALL_PORTS {
                        PortSelect::Both.directions()
                    } else {
                        match self.direction_of(port) {
                            Some(PortDirection::Input) => &[PortDirection::Input],
                            Some(PortDirection::Output) => &[PortDirection::Output],
                            None => &[],
                        }
                    };
                    for &direction in directions {
                        control.flush_pending[slot(direction)] = false;
                        flushed.push(direction);
                    }
                    debug!(session = %self.name, port, "Flush complete");
                }
                Command::PortEnable(port) | Command::PortDisable(port) => {
                    let state = if matches!(command, Command::PortEnable(_)) {
                        PortState::Activated
                    } else {
                        PortState::Deactivated
                    };
                    match self.direction_of(port) {
                        Some(direction) => {
                            control.port_states[slot(direction)] = state;
                            activation = Some((direction, state));
                            info!(session = %self.name, %direction, ?state, "Port state changed");
                        }
                        None => warn!(session = %self.name, port, "Completion for unknown port"),
                    }
                }
            }
        }
        self.control_cond.notify_all();

        for direction in flushed {
            self.port(direction).flush(false);
        }
        if let Some((direction, state)) = activation {
            self.port(direction).set_activation(state);
        }
    }

    fn driver_error(&self, code: u32) {
        warn!(session = %self.name, code, "Driver error");
        // Ports first, so a recorded error implies failed ports.
        self.input.fail(code);
        self.output.fail(code);
        {
            let mut control = self.control.lock();
            control.fatal = Some(code);
            control.flush_pending = [false; 2];
        }
        self.control_cond.notify_all();
    }

    fn port_settings_changed(&self, port_index: u32, index: SettingsIndex) {
        let Some(direction) = self.direction_of(port_index) else {
            debug!(session = %self.name, port_index, ?index, "Ignoring settings change");
            return;
        };
        match index {
            SettingsIndex::PortDefinition => {
                {
                    let mut control = self.control.lock();
                    control.format_changed[slot(direction)] = true;
                    control.stats.format_changes += 1;
                }
                info!(session = %self.name, %direction, "Port format changed");
                self.port(direction).stop();
            }
            SettingsIndex::OutputCrop if direction == PortDirection::Output => {
                self.control.lock().crop_changed = true;
                debug!(session = %self.name, "Output crop changed");
            }
            SettingsIndex::OutputCrop => {
                debug!(session = %self.name, %direction, "Ignoring crop change on input port");
            }
            SettingsIndex::Other(other) => {
                debug!(session = %self.name, index = other, "Unhandled settings change");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Callback router
// ---------------------------------------------------------------------------

/// Forwards driver callbacks to the session while it is alive.
struct CallbackRouter {
    session: OnceLock<Weak<SessionInner>>,
}

impl CallbackRouter {
    fn session(&self) -> DriverResult<Arc<SessionInner>> {
        match self.session.get().and_then(Weak::upgrade) {
            Some(session) => Ok(session),
            None => {
                warn!("Driver callback for a session that no longer exists");
                Err(DriverStatus::INVALID_OBJECT)
            }
        }
    }
}

fn to_status(result: CodecResult<()>) -> DriverResult<()> {
    result.map_err(|_| DriverStatus::INVALID_PARAM)
}

impl CodecCallbacks for CallbackRouter {
    fn on_command_complete(&self, command: Command) -> DriverResult<()> {
        self.session()?.command_complete(command);
        Ok(())
    }

    fn on_error(&self, code: u32) -> DriverResult<()> {
        self.session()?.driver_error(code);
        Ok(())
    }

    fn on_port_settings_changed(&self, port_index: u32, index: SettingsIndex) -> DriverResult<()> {
        self.session()?.port_settings_changed(port_index, index);
        Ok(())
    }

    fn on_buffer_flag(&self, port_index: u32, flags: BufferFlags) -> DriverResult<()> {
        let session = self.session()?;
        debug!(session = %session.name, port_index, flags = flags.0, "Buffer flag");
        Ok(())
    }

    fn on_input_buffer_returned(&self, buffer: &DriverBuffer) -> DriverResult<()> {
        to_status(self.session()?.input.buffer_available(buffer))
    }

    fn on_output_buffer_filled(&self, buffer: &DriverBuffer) -> DriverResult<()> {
        to_status(self.session()?.output.buffer_available(buffer))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One open codec component and its two ports.
pub struct CodecSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for CodecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = self.inner.control.lock();
        f.debug_struct("CodecSession")
            .field("name", &self.inner.name)
            .field("role", &self.inner.role)
            .field("component_id", &self.inner.component_id)
            .field("state", &control.current)
            .field("target", &control.target)
            .field("fatal", &control.fatal)
            .field("closed", &control.closed)
            .finish()
    }
}

impl CodecSession {
    /// Create the component named in `config` and configure its ports from
    /// the config's element.
    ///
    /// # Errors
    /// `InvalidArgument` for an invalid config, `DriverUnavailable` if the
    /// component cannot be created, or the first failing parameter call.
    pub fn open(registry: &Arc<ComponentRegistry>, config: &SessionConfig) -> CodecResult<Self> {
        config
            .validate()
            .map_err(|e| CodecError::InvalidArgument(e.to_string()))?;

        let router = Arc::new(CallbackRouter {
            session: OnceLock::new(),
        });
        let (component_id, component) = registry.create(&config.component, router.clone())?;

        let mut record = ParamRecord::PortRange(PortRange::default());
        let range = match component.get_parameter(&mut record) {
            Ok(()) => match record {
                ParamRecord::PortRange(range) if range.count >= 2 => Ok(range),
                other => Err(CodecError::InvalidArgument(format!(
                    "driver reported unusable port range {other:?}"
                ))),
            },
            Err(status) => Err(CodecError::DriverCall {
                op: "GetParameter(PortRange)",
                status,
            }),
        };
        let range = match range {
            Ok(range) => range,
            Err(e) => {
                if let Err(destroy) = registry.destroy(component_id) {
                    warn!(error = %destroy, "Failed to destroy component after open error");
                }
                return Err(e);
            }
        };
        let input_port = range.start_port;
        let output_port = range.start_port + 1;

        let inner = Arc::new(SessionInner {
            name: config.component.clone(),
            role: config.role,
            component_id,
            component: component.clone(),
            registry: registry.clone(),
            input: PortBufferManager::new(
                PortProfile::new(PortDirection::Input, config.role),
                input_port,
                component.clone(),
            ),
            output: PortBufferManager::new(
                PortProfile::new(PortDirection::Output, config.role),
                output_port,
                component.clone(),
            ),
            params: ParamManager::new(component, config.role, input_port, output_port),
            command_lock: Mutex::new(()),
            control: Mutex::new(ControlState {
                current: SessionState::Loaded,
                target: SessionState::Loaded,
                port_states: [PortState::Activated; 2],
                flush_pending: [false; 2],
                fatal: None,
                started: false,
                format_changed: [false; 2],
                crop_changed: false,
                closing: false,
                closed: false,
                stats: SessionStats::default(),
            }),
            control_cond: Condvar::new(),
            command_timeout: config.command_timeout(),
        });
        // Set once; the router was created above and is not shared yet.
        let _ = router.session.set(Arc::downgrade(&inner));

        let session = Self { inner };
        session.set_parameter(ParamKey::InputCommon, &config.element)?;
        session.set_parameter(ParamKey::OutputCommon, &config.element)?;
        info!(
            session = %config.component,
            role = ?config.role,
            component_id,
            input_port,
            output_port,
            "Codec session opened"
        );
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn role(&self) -> CodecRole {
        self.inner.role
    }

    pub fn component_id(&self) -> ComponentId {
        self.inner.component_id
    }

    pub fn input_port_index(&self) -> u32 {
        self.inner.input.port_index()
    }

    pub fn output_port_index(&self) -> u32 {
        self.inner.output.port_index()
    }

    pub fn state(&self) -> SessionState {
        self.inner.control.lock().current
    }

    pub fn port_state(&self, direction: PortDirection) -> PortState {
        self.inner.control.lock().port_states[slot(direction)]
    }

    pub fn port_stats(&self, direction: PortDirection) -> PortStats {
        self.inner.port(direction).stats()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.control.lock().stats
    }

    /// Driver error code, once one was reported.
    pub fn fatal_error(&self) -> Option<u32> {
        self.inner.control.lock().fatal
    }

    /// Whether the output crop changed since the last call.
    pub fn take_crop_change(&self) -> bool {
        std::mem::take(&mut self.inner.control.lock().crop_changed)
    }

    /// Verify both ports' descriptor bookkeeping.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.inner.input.check_invariants()?;
        self.inner.output.check_invariants()
    }

    // ── parameters ──

    pub fn set_parameter(&self, key: ParamKey, element: &CodecElement) -> CodecResult<()> {
        self.inner.control.lock().check_usable()?;
        self.inner.params.set_parameter(key, element)
    }

    pub fn get_parameter(&self, key: ParamKey, element: &mut CodecElement) -> CodecResult<()> {
        self.inner.control.lock().check_usable()?;
        self.inner.params.get_parameter(key, element)
    }

    // ── lifecycle ──

    /// Move to `Executing` and start both ports.
    ///
    /// Idempotent: concurrent callers share one state change. Also restarts
    /// ports stopped by a flush or an output format change.
    pub fn start(&self) -> CodecResult<()> {
        let inner = &self.inner;
        let _serial = inner.command_lock.lock();
        let current = {
            let control = inner.control.lock();
            control.check_usable()?;
            control.current
        };
        if current < SessionState::Idle {
            inner.request_state(SessionState::Idle)?;
            inner.input.register_deferred()?;
            inner.wait_for_state(SessionState::Idle)?;
        }
        inner.transition(SessionState::Executing)?;

        inner.input.start()?;
        inner.output.start()?;
        {
            let mut control = inner.control.lock();
            control.started = true;
            control.format_changed = [false; 2];
        }
        info!(session = %inner.name, "Session started");
        Ok(())
    }

    /// Stop both ports, then walk back to `Idle` and request `Loaded`.
    ///
    /// The `Loaded` transition completes once the driver has no buffers
    /// left; while either port is populated it finishes in
    /// [`free_buffers`](Self::free_buffers) or [`close`](Self::close).
    pub fn stop(&self) -> CodecResult<()> {
        let _serial = self.inner.command_lock.lock();
        self.inner.stop()
    }

    /// Flush the selected ports.
    ///
    /// Blocked push and pull callers return `Flushing`. Returns once the
    /// driver completed the flush and gave back every buffer it held. The
    /// ports stay flushed until the next [`start`](Self::start).
    pub fn flush(&self, select: PortSelect) -> CodecResult<()> {
        let inner = &self.inner;
        let _serial = inner.command_lock.lock();
        let directions = select.directions();
        {
            let mut control = inner.control.lock();
            control.check_usable()?;
            if !control.started {
                debug!(session = %inner.name, "Flush before start ignored");
                return Ok(());
            }
            for &direction in directions {
                control.flush_pending[slot(direction)] = true;
            }
            control.stats.flushes += 1;
        }
        for &direction in directions {
            inner.port(direction).flush(true);
        }

        let command = match directions {
            [direction] => Command::Flush(inner.port(*direction).port_index()),
            _ => Command::Flush(ALL_PORTS),
        };
        if let Err(e) = inner.send(command) {
            {
                let mut control = inner.control.lock();
                for &direction in directions {
                    control.flush_pending[slot(direction)] = false;
                }
            }
            for &direction in directions {
                inner.port(direction).flush(false);
            }
            return Err(e);
        }

        inner.wait_until("flush completion", |c| {
            directions.iter().all(|&d| !c.flush_pending[slot(d)])
        })?;
        for &direction in directions {
            inner.port(direction).wait_flushed()?;
        }
        info!(session = %inner.name, ?select, "Flush complete");
        Ok(())
    }

    /// Enable or disable ports. Does not wait: the port state reads
    /// `Activating`/`Deactivating` until the driver completes the command.
    pub fn activate_port(&self, select: PortSelect, enable: bool) -> CodecResult<()> {
        let inner = &self.inner;
        let state = if enable {
            PortState::Activating
        } else {
            PortState::Deactivating
        };
        for &direction in select.directions() {
            let port = inner.port(direction);
            let previous = {
                let mut control = inner.control.lock();
                control.check_usable()?;
                std::mem::replace(&mut control.port_states[slot(direction)], state)
            };
            port.set_activation(state);
            let command = if enable {
                Command::PortEnable(port.port_index())
            } else {
                Command::PortDisable(port.port_index())
            };
            if let Err(e) = inner.send(command) {
                inner.control.lock().port_states[slot(direction)] = previous;
                port.set_activation(previous);
                return Err(e);
            }
        }
        Ok(())
    }

    // ── buffers ──

    /// Import pipeline-owned buffers on a port.
    pub fn use_buffers(
        &self,
        direction: PortDirection,
        buffers: Vec<ExternalBuffer>,
    ) -> CodecResult<()> {
        self.populate(direction, |port| port.use_buffers(buffers))
    }

    /// Let the driver allocate a port's buffers.
    pub fn allocate_buffers(&self, direction: PortDirection) -> CodecResult<()> {
        self.populate(direction, PortBufferManager::allocate_buffers)
    }

    fn populate(
        &self,
        direction: PortDirection,
        fill: impl FnOnce(&PortBufferManager) -> CodecResult<()>,
    ) -> CodecResult<()> {
        let inner = &self.inner;
        let (current, target, port_state) = {
            let control = inner.control.lock();
            control.check_usable()?;
            (
                control.current,
                control.target,
                control.port_states[slot(direction)],
            )
        };

        if direction == PortDirection::Input {
            fill(&inner.input)?;
            if current >= SessionState::Idle || target == SessionState::Idle {
                inner.input.register_deferred()?;
            }
            if port_state == PortState::Activating {
                inner.wait_until("input port enable", |c| {
                    c.port_states[0] == PortState::Activated
                })?;
            }
            return Ok(());
        }

        let _serial = inner.command_lock.lock();
        if current < SessionState::Idle {
            inner.request_state(SessionState::Idle)?;
            inner.input.register_deferred()?;
            fill(&inner.output)?;
            inner.wait_for_state(SessionState::Idle)
        } else if port_state == PortState::Activating {
            fill(&inner.output)?;
            inner.wait_until("output port enable", |c| {
                c.port_states[1] == PortState::Activated
            })
        } else {
            fill(&inner.output)
        }
    }

    /// Release the selected ports' buffers back to the driver.
    ///
    /// Waits for the driver to return buffers it still holds, for a pending
    /// port disable, and for a pending `Loaded` transition once no port
    /// holds buffers.
    pub fn free_buffers(&self, select: PortSelect) -> CodecResult<()> {
        let inner = &self.inner;
        let mut first_error = None;
        for &direction in select.directions() {
            if let Err(e) = inner.port(direction).free_buffers() {
                warn!(session = %inner.name, %direction, error = %e, "Freeing port buffers failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
                continue;
            }
            let deactivating =
                inner.control.lock().port_states[slot(direction)] == PortState::Deactivating;
            if deactivating {
                inner.wait_until("port disable", |c| {
                    c.port_states[slot(direction)] == PortState::Deactivated
                })?;
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let loading = {
            let control = inner.control.lock();
            control.target == SessionState::Loaded && control.current != SessionState::Loaded
        };
        if loading && !inner.is_populated() {
            inner.wait_for_state(SessionState::Loaded)?;
        }
        Ok(())
    }

    /// Hand an input buffer to the driver; `None` signals end of stream.
    /// Blocks while every input buffer is with the driver.
    ///
    /// Returns [`PushOutcome::FormatChanged`] once after the driver changed
    /// the input port definition.
    pub fn push_input_buffer(&self, buffer: Option<ExternalBuffer>) -> CodecResult<PushOutcome> {
        let outcome = self.inner.input.push_buffer(buffer)?;
        let mut control = self.inner.control.lock();
        match outcome {
            PushOutcome::Stopped | PushOutcome::Flushing if control.format_changed[0] => {
                control.format_changed[0] = false;
                Ok(PushOutcome::FormatChanged)
            }
            PushOutcome::Queued => {
                control.stats.buffers_pushed += 1;
                Ok(outcome)
            }
            other => Ok(other),
        }
    }

    /// Return a consumed output buffer for refilling.
    pub fn push_output_buffer(&self, buffer: ExternalBuffer) -> CodecResult<PushOutcome> {
        self.inner.output.push_buffer(Some(buffer))
    }

    /// Wait for the next decoded or encoded buffer.
    ///
    /// Returns [`PullOutcome::FormatChanged`] once after the driver changed
    /// the output format. Buffers the driver filled before the change are
    /// still delivered first, so the change is reported on the first pull
    /// that finds no old-format buffer rather than on the very next pull.
    pub fn pull_output_buffer(&self) -> CodecResult<PullOutcome> {
        let outcome = self.inner.output.pull_buffer()?;
        let mut control = self.inner.control.lock();
        match outcome {
            PullOutcome::Stopped | PullOutcome::Flushing if control.format_changed[1] => {
                control.format_changed[1] = false;
                Ok(PullOutcome::FormatChanged)
            }
            PullOutcome::Buffer(_) | PullOutcome::EndOfStream(_) => {
                control.stats.buffers_pulled += 1;
                Ok(outcome)
            }
            other => Ok(other),
        }
    }

    // ── teardown ──

    /// Tear the session down: stop, free every buffer, wait for `Loaded`,
    /// and destroy the component. Wakes every blocked caller. Idempotent.
    ///
    /// If another thread is inside a lifecycle call, that call is aborted
    /// with `SessionClosed` and the buffers are released without walking
    /// the component back to `Loaded`.
    pub fn close(&self) -> CodecResult<()> {
        let inner = &self.inner;
        if inner.control.lock().closed {
            return Ok(());
        }

        let (_serial, aborted) = match inner.command_lock.try_lock() {
            Some(guard) => (guard, false),
            None => {
                warn!(session = %inner.name, "Aborting in-flight lifecycle call for close");
                inner.abort_waits();
                (inner.command_lock.lock(), true)
            }
        };
        let (current, fatal) = {
            let control = inner.control.lock();
            if control.closed {
                return Ok(());
            }
            (control.current, control.fatal)
        };

        if fatal.is_none() && !aborted {
            let stopped = match inner.stop() {
                Ok(()) => true,
                Err(e) => {
                    warn!(session = %inner.name, error = %e, "Stop during close failed");
                    false
                }
            };
            if stopped {
                match self.free_buffers(PortSelect::Both) {
                    Ok(()) if current >= SessionState::Idle => {
                        if let Err(e) = inner.wait_for_state(SessionState::Loaded) {
                            warn!(session = %inner.name, error = %e, "Component did not reach Loaded");
                        }
                    }
                    Ok(()) => {}
                    Err(e) => warn!(session = %inner.name, error = %e, "Free during close failed"),
                }
            }
        } else {
            // The driver will not return anything; descriptors are released locally.
            for direction in PortDirection::ALL {
                if let Err(e) = inner.port(direction).free_buffers() {
                    warn!(
                        session = %inner.name,
                        %direction,
                        error = %e,
                        "Local buffer release reported an error"
                    );
                }
            }
        }

        inner.input.close();
        inner.output.close();
        inner.control.lock().closed = true;
        inner.control_cond.notify_all();

        inner.registry.destroy(inner.component_id)?;
        info!(session = %inner.name, "Codec session closed");
        Ok(())
    }
}

impl Drop for CodecSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(session = %self.inner.name, error = %e, "Close on drop failed");
        }
    }
}
