//! Software loopback codec component.
//!
//! A passthrough "codec" that implements the driver traits in process. Every
//! input payload is copied into the next output buffer the pipeline queued,
//! with timestamp and flags carried over. Callbacks come from a worker thread
//! fed through a crossbeam channel, the same way a vendor HAL delivers them.
//!
//! # Architecture
//!
//! ```text
//! caller thread                         worker thread
//! ─────────────                         ─────────────
//! send_command ──┐
//! empty_this_buffer ──▶ Job channel ──▶ LoopState (params, queues, pending)
//! fill_this_buffer ──┘                    │
//! free_buffer ───────── Recheck ─────────▶│
//!                                         ▼
//!                                  CodecCallbacks (lock released)
//! ```
//!
//! Lifecycle rules:
//! - `Loaded → Idle` and `Idle → Executing` complete immediately.
//! - `Executing → Idle` first hands back every buffer the component holds.
//! - `Idle → Loaded` completes once every buffer has been freed.
//! - `PortDisable` hands back the port's buffers and completes once they
//!   are freed; `PortEnable` completes immediately.
//! - `Flush` hands back the port's buffers, then completes per port.
//!
//! Test hooks: [`LoopbackComponent::inject_error`],
//! [`LoopbackComponent::port_settings_changed`],
//! [`LoopbackComponent::hold_input`], [`LoopbackComponent::stall_commands`],
//! [`LoopbackComponent::defer_flush_returns`],
//! [`LoopbackComponent::reject_next_command`], and the command log.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use hwc_common::{
    Backing, BufferFlags, CodecRole, CompressionFormat, DriverStatus, PortDirection, Resolution,
    SessionState, SharedMemory, SharedMemoryPool,
};

use crate::driver::{
    AvcParam, BitrateParam, BufferKind, CodecCallbacks, CodecComponent, CodingType, ColorFormat,
    Command, ComponentId, ComponentManager, DriverBuffer, DriverResult, ParamRecord,
    PortDefinition, PortRange, SettingsIndex, VideoPortDefinition, ALL_PORTS,
};
use crate::params::mapping;

/// Error code reported for a state transition the component cannot make.
pub const ERROR_INCORRECT_STATE_TRANSITION: u32 = 0x8000_1017;

const INPUT: usize = 0;
const OUTPUT: usize = 1;
const PORT_COUNT: u32 = 2;

/// Usage flags reported for graphic handle buffers.
const HANDLE_USAGE: u64 = 0x0000_0033;

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates loopback components by name.
pub struct LoopbackManager {
    next_id: AtomicU32,
    live: Mutex<HashMap<ComponentId, Arc<LoopbackComponent>>>,
    last: Mutex<Option<Arc<LoopbackComponent>>>,
    pool: Option<SharedMemoryPool>,
}

impl fmt::Debug for LoopbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackManager")
            .field("live_components", &self.live.lock().len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Default for LoopbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackManager {
    pub const DECODER_AVC: &'static str = "OMX.loopback.video.decoder.avc";
    pub const DECODER_HEVC: &'static str = "OMX.loopback.video.decoder.hevc";
    pub const ENCODER_AVC: &'static str = "OMX.loopback.video.encoder.avc";
    pub const ENCODER_HEVC: &'static str = "OMX.loopback.video.encoder.hevc";

    const NAMES: [&'static str; 4] = [
        Self::DECODER_AVC,
        Self::DECODER_HEVC,
        Self::ENCODER_AVC,
        Self::ENCODER_HEVC,
    ];

    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            live: Mutex::new(HashMap::new()),
            last: Mutex::new(None),
            pool: None,
        }
    }

    /// Driver-allocated buffers come from `pool` instead of the heap.
    pub fn with_pool(pool: SharedMemoryPool) -> Self {
        Self {
            pool: Some(pool),
            ..Self::new()
        }
    }

    pub fn live_components(&self) -> usize {
        self.live.lock().len()
    }

    pub fn component(&self, id: ComponentId) -> Option<Arc<LoopbackComponent>> {
        self.live.lock().get(&id).cloned()
    }

    /// Most recently created component, live or not.
    pub fn last_component(&self) -> Option<Arc<LoopbackComponent>> {
        self.last.lock().clone()
    }

    fn parse_name(name: &str) -> Option<(CodecRole, CompressionFormat)> {
        if !Self::NAMES.iter().any(|known| *known == name) {
            return None;
        }
        let role = if name.contains(".decoder.") {
            CodecRole::Decoder
        } else {
            CodecRole::Encoder
        };
        let compression = if name.ends_with(".hevc") {
            CompressionFormat::Hevc
        } else {
            CompressionFormat::Avc
        };
        Some((role, compression))
    }
}

impl ComponentManager for LoopbackManager {
    fn component_names(&self) -> Vec<String> {
        Self::NAMES.iter().map(|name| name.to_string()).collect()
    }

    fn create_component(
        &self,
        name: &str,
        callbacks: Arc<dyn CodecCallbacks>,
    ) -> DriverResult<(ComponentId, Arc<dyn CodecComponent>)> {
        let (role, compression) = Self::parse_name(name).ok_or(DriverStatus::INVALID_PARAM)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let component = Arc::new(LoopbackComponent::spawn(
            name,
            role,
            compression,
            callbacks,
            self.pool.clone(),
        )?);
        self.live.lock().insert(id, component.clone());
        *self.last.lock() = Some(component.clone());
        Ok((id, component))
    }

    fn destroy_component(&self, id: ComponentId) -> DriverResult<()> {
        let component = self
            .live
            .lock()
            .remove(&id)
            .ok_or(DriverStatus::INVALID_OBJECT)?;
        component.shutdown();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

enum Job {
    Command(Command),
    Empty(DriverBuffer),
    Fill(DriverBuffer),
    Error(u32),
    SettingsChanged(u32, SettingsIndex),
    ReleaseHeld,
    ReleaseStalled,
    ReleaseFlushed,
    Recheck,
    Shutdown,
}

enum Event {
    Complete(Command),
    Error(u32),
    Settings(u32, SettingsIndex),
    Flag(u32, BufferFlags),
    InputReturned(DriverBuffer),
    OutputFilled(DriverBuffer),
}

/// Driver-side parameter records.
struct ParamStore {
    ports: [PortDefinition; 2],
    formats: [Vec<ColorFormat>; 2],
    buffer_types: [u32; 2],
    use_buffer_type: [BufferKind; 2],
    bitrate: BitrateParam,
    quality: u32,
    avc: AvcParam,
    frame_rate_q16: u32,
    bitrate_config: u32,
    intra_refresh: bool,
}

impl ParamStore {
    fn new(role: CodecRole, compression: CompressionFormat) -> Self {
        let coding = mapping::coding_type(compression);
        let resolution = Resolution::new(320, 240);
        let raw = |port_index: u32, direction: PortDirection| PortDefinition {
            port_index,
            direction,
            enabled: true,
            buffer_count_actual: 4,
            buffer_count_min: 2,
            buffer_size: resolution.nv12_byte_size() as u32,
            video: VideoPortDefinition {
                resolution,
                stride: resolution.width,
                slice_height: resolution.height,
                frame_rate_q16: mapping::frame_rate_to_q16(30),
                compression: CodingType::Unused,
                color_format: ColorFormat::Yuv420SemiPlanar,
            },
        };
        let compressed = |port_index: u32, direction: PortDirection| PortDefinition {
            port_index,
            direction,
            enabled: true,
            buffer_count_actual: 4,
            buffer_count_min: 2,
            buffer_size: 1 << 16,
            video: VideoPortDefinition {
                resolution,
                stride: 0,
                slice_height: 0,
                frame_rate_q16: mapping::frame_rate_to_q16(30),
                compression: coding,
                color_format: ColorFormat::Unused,
            },
        };
        let raw_formats = vec![
            ColorFormat::Yuv420SemiPlanar,
            ColorFormat::Yvu420SemiPlanar,
            ColorFormat::Yuv420Planar,
            ColorFormat::Rgba8888,
        ];
        let shm = BufferKind::SharedMemory.mask_bit();
        let (ports, formats, buffer_types) = match role {
            CodecRole::Decoder => (
                [
                    compressed(0, PortDirection::Input),
                    raw(1, PortDirection::Output),
                ],
                [Vec::new(), raw_formats],
                [shm, shm | BufferKind::Handle.mask_bit()],
            ),
            CodecRole::Encoder => (
                [
                    raw(0, PortDirection::Input),
                    compressed(1, PortDirection::Output),
                ],
                [raw_formats, Vec::new()],
                [shm | BufferKind::DynamicHandle.mask_bit(), shm],
            ),
        };
        Self {
            ports,
            formats,
            buffer_types,
            use_buffer_type: [BufferKind::SharedMemory; 2],
            bitrate: BitrateParam {
                port_index: 1,
                control: Default::default(),
                target_bitrate: 4_000_000,
            },
            quality: 0,
            avc: AvcParam {
                port_index: 1,
                ..Default::default()
            },
            frame_rate_q16: mapping::frame_rate_to_q16(30),
            bitrate_config: 0,
            intra_refresh: false,
        }
    }

    fn port(index: u32) -> DriverResult<usize> {
        if index < PORT_COUNT {
            Ok(index as usize)
        } else {
            Err(DriverStatus::INVALID_PARAM)
        }
    }

    fn get(&self, record: &mut ParamRecord) -> DriverResult<()> {
        match record {
            ParamRecord::PortRange(range) => {
                *range = PortRange {
                    start_port: 0,
                    count: PORT_COUNT,
                };
            }
            ParamRecord::PortDefinition(def) => *def = self.ports[Self::port(def.port_index)?],
            ParamRecord::VideoPortFormat(format) => {
                let port = Self::port(format.port_index)?;
                let def = &self.ports[port];
                let color_format = if def.video.compression == CodingType::Unused {
                    *self.formats[port]
                        .get(format.index as usize)
                        .ok_or(DriverStatus::NO_MORE)?
                } else if format.index == 0 {
                    ColorFormat::Unused
                } else {
                    return Err(DriverStatus::NO_MORE);
                };
                format.compression = def.video.compression;
                format.color_format = color_format;
                format.frame_rate_q16 = def.video.frame_rate_q16;
            }
            ParamRecord::SupportedBufferTypes { port_index, mask } => {
                *mask = self.buffer_types[Self::port(*port_index)?];
            }
            ParamRecord::UseBufferType { port_index, kind } => {
                *kind = self.use_buffer_type[Self::port(*port_index)?];
            }
            ParamRecord::BufferHandleUsage { port_index, usage } => {
                Self::port(*port_index)?;
                *usage = HANDLE_USAGE;
            }
            ParamRecord::Bitrate(bitrate) => *bitrate = self.bitrate,
            ParamRecord::ConstantQuality { quality, .. } => *quality = self.quality,
            ParamRecord::Avc(avc) => *avc = self.avc,
            ParamRecord::FrameRate { frame_rate_q16, .. } => *frame_rate_q16 = self.frame_rate_q16,
            ParamRecord::BitrateConfig { bitrate, .. } => *bitrate = self.bitrate_config,
            ParamRecord::IntraRefresh { refresh, .. } => *refresh = self.intra_refresh,
        }
        Ok(())
    }

    fn set(&mut self, record: &ParamRecord) -> DriverResult<()> {
        match *record {
            ParamRecord::PortRange(_) => return Err(DriverStatus::NOT_SUPPORTED),
            ParamRecord::PortDefinition(def) => {
                let port = Self::port(def.port_index)?;
                let min = self.ports[port].buffer_count_min;
                if def.buffer_count_actual < min {
                    return Err(DriverStatus::INVALID_PARAM);
                }
                let mut stored = def;
                stored.buffer_count_min = min;
                stored.direction = self.ports[port].direction;
                let res = stored.video.resolution;
                if stored.video.compression == CodingType::Unused {
                    stored.video.stride = res.width;
                    stored.video.slice_height = res.height;
                    let frame = u32::try_from(res.nv12_byte_size()).unwrap_or(u32::MAX);
                    stored.buffer_size = stored.buffer_size.max(frame);
                }
                self.ports[port] = stored;
            }
            ParamRecord::VideoPortFormat(format) => {
                let port = Self::port(format.port_index)?;
                if format.color_format != ColorFormat::Unused {
                    if !self.formats[port].contains(&format.color_format) {
                        return Err(DriverStatus::NOT_SUPPORTED);
                    }
                    self.ports[port].video.color_format = format.color_format;
                }
                if format.frame_rate_q16 != 0 {
                    self.ports[port].video.frame_rate_q16 = format.frame_rate_q16;
                }
            }
            ParamRecord::SupportedBufferTypes { .. } | ParamRecord::BufferHandleUsage { .. } => {
                return Err(DriverStatus::NOT_SUPPORTED)
            }
            ParamRecord::UseBufferType { port_index, kind } => {
                let port = Self::port(port_index)?;
                if self.buffer_types[port] & kind.mask_bit() == 0 {
                    return Err(DriverStatus::NOT_SUPPORTED);
                }
                self.use_buffer_type[port] = kind;
            }
            ParamRecord::Bitrate(bitrate) => self.bitrate = bitrate,
            ParamRecord::ConstantQuality { quality, .. } => self.quality = quality,
            ParamRecord::Avc(avc) => self.avc = avc,
            ParamRecord::FrameRate { frame_rate_q16, .. } => self.frame_rate_q16 = frame_rate_q16,
            ParamRecord::BitrateConfig { bitrate, .. } => self.bitrate_config = bitrate,
            ParamRecord::IntraRefresh { refresh, .. } => self.intra_refresh = refresh,
        }
        Ok(())
    }
}

struct LoopState {
    current: SessionState,
    params: ParamStore,
    registered: [HashSet<u32>; 2],
    enabled: [bool; 2],
    next_buffer_id: u32,
    /// Input buffers waiting for an output buffer.
    waiting_input: VecDeque<DriverBuffer>,
    /// Input buffers held back by the test hook.
    held_input: VecDeque<DriverBuffer>,
    queued_output: VecDeque<DriverBuffer>,
    /// Commands that complete once buffers are freed.
    pending: Vec<Command>,
    hold_input: bool,
    /// While set, accepted commands wait in `stalled` instead of running.
    stall_commands: bool,
    stalled: VecDeque<Command>,
    /// While set, `Flush` completes before the port's buffers come back.
    defer_flush_returns: bool,
    flush_deferred: [bool; 2],
    reject_next: Option<DriverStatus>,
    commands: Vec<Command>,
    frames_processed: u64,
}

impl LoopState {
    fn return_port(&mut self, port: usize, events: &mut Vec<Event>) {
        if port == INPUT {
            for mut buffer in self.waiting_input.drain(..).chain(self.held_input.drain(..)) {
                buffer.filled_len = 0;
                buffer.offset = 0;
                events.push(Event::InputReturned(buffer));
            }
        } else {
            for mut buffer in self.queued_output.drain(..) {
                buffer.filled_len = 0;
                buffer.offset = 0;
                buffer.flags = BufferFlags::NONE;
                events.push(Event::OutputFilled(buffer));
            }
        }
    }

    /// Pair waiting inputs with queued outputs.
    fn pump(&mut self, events: &mut Vec<Event>) {
        if self.current != SessionState::Executing || !self.enabled[INPUT] || !self.enabled[OUTPUT]
        {
            return;
        }
        while !self.waiting_input.is_empty() && !self.queued_output.is_empty() {
            let (Some(mut input), Some(mut output)) =
                (self.waiting_input.pop_front(), self.queued_output.pop_front())
            else {
                break;
            };
            output.offset = 0;
            output.filled_len = copy_payload(&input, &output);
            output.pts = input.pts;
            output.flags = input.flags | BufferFlags::END_OF_FRAME;
            if input.flags.is_eos() {
                events.push(Event::Flag(OUTPUT as u32, BufferFlags::EOS));
            }
            events.push(Event::OutputFilled(output));

            input.filled_len = 0;
            input.offset = 0;
            events.push(Event::InputReturned(input));
            self.frames_processed += 1;
        }
    }

    fn recheck(&mut self, events: &mut Vec<Event>) {
        let registered = &self.registered;
        let mut completed = Vec::new();
        self.pending.retain(|command| {
            let done = match command {
                Command::StateSet(SessionState::Loaded) => registered.iter().all(HashSet::is_empty),
                Command::PortDisable(port) => registered
                    .get(*port as usize)
                    .map_or(true, HashSet::is_empty),
                _ => true,
            };
            if done {
                completed.push(*command);
            }
            !done
        });
        for command in completed {
            if command == Command::StateSet(SessionState::Loaded) {
                self.current = SessionState::Loaded;
            }
            events.push(Event::Complete(command));
        }
    }

    fn state_set(&mut self, target: SessionState, events: &mut Vec<Event>) {
        use SessionState::{Executing, Idle, Loaded};
        match (self.current, target) {
            (current, target) if current == target => {
                events.push(Event::Complete(Command::StateSet(target)));
            }
            (Loaded, Idle) => {
                self.current = Idle;
                events.push(Event::Complete(Command::StateSet(Idle)));
            }
            (Idle, Executing) => {
                self.current = Executing;
                events.push(Event::Complete(Command::StateSet(Executing)));
                self.pump(events);
            }
            (Executing, Idle) => {
                self.return_port(INPUT, events);
                self.return_port(OUTPUT, events);
                self.current = Idle;
                events.push(Event::Complete(Command::StateSet(Idle)));
            }
            (Idle, Loaded) => {
                self.pending.push(Command::StateSet(Loaded));
                self.recheck(events);
            }
            (current, target) => {
                warn!(%current, %target, "Loopback: unsupported state transition");
                events.push(Event::Error(ERROR_INCORRECT_STATE_TRANSITION));
            }
        }
    }

    fn command(&mut self, command: Command, events: &mut Vec<Event>) {
        match command {
            Command::StateSet(target) => self.state_set(target, events),
            Command::Flush(port) => {
                let ports: Vec<u32> = if port == ALL_PORTS {
                    (0..PORT_COUNT).collect()
                } else {
                    vec![port]
                };
                for port in ports {
                    if self.defer_flush_returns {
                        self.flush_deferred[port as usize] = true;
                    } else {
                        self.return_port(port as usize, events);
                    }
                    events.push(Event::Complete(Command::Flush(port)));
                }
            }
            Command::PortDisable(port) => {
                if let Some(enabled) = self.enabled.get_mut(port as usize) {
                    *enabled = false;
                    self.params.ports[port as usize].enabled = false;
                }
                self.return_port(port as usize, events);
                self.pending.push(command);
                self.recheck(events);
            }
            Command::PortEnable(port) => {
                if let Some(enabled) = self.enabled.get_mut(port as usize) {
                    *enabled = true;
                    self.params.ports[port as usize].enabled = true;
                }
                events.push(Event::Complete(command));
                self.pump(events);
            }
        }
    }
}

fn copy_payload(input: &DriverBuffer, output: &DriverBuffer) -> usize {
    match (&input.memory, &output.memory) {
        (Some(Backing::Shared(src)), Some(Backing::Shared(dst))) => {
            let bytes = src.read_at(input.offset, input.filled_len);
            dst.write_at(0, &bytes)
        }
        _ => input.filled_len.min(output.alloc_len),
    }
}

struct Shared {
    name: String,
    callbacks: Arc<dyn CodecCallbacks>,
    state: Mutex<LoopState>,
}

impl Shared {
    fn emit(&self, events: Vec<Event>) {
        for event in events {
            let result = match &event {
                Event::Complete(command) => self.callbacks.on_command_complete(*command),
                Event::Error(code) => self.callbacks.on_error(*code),
                Event::Settings(port, index) => {
                    self.callbacks.on_port_settings_changed(*port, *index)
                }
                Event::Flag(port, flags) => self.callbacks.on_buffer_flag(*port, *flags),
                Event::InputReturned(buffer) => self.callbacks.on_input_buffer_returned(buffer),
                Event::OutputFilled(buffer) => self.callbacks.on_output_buffer_filled(buffer),
            };
            if let Err(status) = result {
                debug!(component = %self.name, status = %status, "Loopback: callback refused");
            }
        }
    }

    fn run(&self, jobs: Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            let mut events = Vec::new();
            {
                let mut state = self.state.lock();
                match job {
                    Job::Shutdown => break,
                    Job::Command(command) if state.stall_commands => {
                        state.stalled.push_back(command)
                    }
                    Job::Command(command) => state.command(command, &mut events),
                    Job::Empty(buffer) => {
                        if state.hold_input {
                            state.held_input.push_back(buffer);
                        } else {
                            state.waiting_input.push_back(buffer);
                            state.pump(&mut events);
                        }
                    }
                    Job::Fill(buffer) => {
                        state.queued_output.push_back(buffer);
                        state.pump(&mut events);
                    }
                    Job::Error(code) => events.push(Event::Error(code)),
                    Job::SettingsChanged(port, index) => {
                        events.push(Event::Settings(port, index))
                    }
                    Job::ReleaseHeld => {
                        let held: Vec<_> = state.held_input.drain(..).collect();
                        state.waiting_input.extend(held);
                        state.pump(&mut events);
                    }
                    Job::ReleaseStalled => {
                        while let Some(command) = state.stalled.pop_front() {
                            state.command(command, &mut events);
                        }
                    }
                    Job::ReleaseFlushed => {
                        for port in [INPUT, OUTPUT] {
                            if std::mem::take(&mut state.flush_deferred[port]) {
                                state.return_port(port, &mut events);
                            }
                        }
                    }
                    Job::Recheck => state.recheck(&mut events),
                }
            }
            self.emit(events);
        }
        debug!(component = %self.name, "Loopback worker exiting");
    }
}

/// A loopback component instance.
pub struct LoopbackComponent {
    role: CodecRole,
    jobs: Sender<Job>,
    shared: Arc<Shared>,
    pool: Option<SharedMemoryPool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LoopbackComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("LoopbackComponent")
            .field("name", &self.shared.name)
            .field("role", &self.role)
            .field("state", &state.current)
            .field("frames_processed", &state.frames_processed)
            .finish()
    }
}

impl LoopbackComponent {
    fn spawn(
        name: &str,
        role: CodecRole,
        compression: CompressionFormat,
        callbacks: Arc<dyn CodecCallbacks>,
        pool: Option<SharedMemoryPool>,
    ) -> DriverResult<Self> {
        let (jobs, rx) = channel::unbounded();
        let shared = Arc::new(Shared {
            name: name.to_string(),
            callbacks,
            state: Mutex::new(LoopState {
                current: SessionState::Loaded,
                params: ParamStore::new(role, compression),
                registered: [HashSet::new(), HashSet::new()],
                enabled: [true; 2],
                next_buffer_id: 1,
                waiting_input: VecDeque::new(),
                held_input: VecDeque::new(),
                queued_output: VecDeque::new(),
                pending: Vec::new(),
                hold_input: false,
                stall_commands: false,
                stalled: VecDeque::new(),
                defer_flush_returns: false,
                flush_deferred: [false; 2],
                reject_next: None,
                commands: Vec::new(),
                frames_processed: 0,
            }),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("loopback-{name}"))
            .spawn(move || worker_shared.run(rx))
            .map_err(|e| {
                warn!(component = name, error = %e, "Loopback: failed to spawn worker");
                DriverStatus::NO_MEMORY
            })?;
        info!(component = name, ?role, "Loopback component created");
        Ok(Self {
            role,
            jobs,
            shared,
            pool,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn send(&self, job: Job) -> DriverResult<()> {
        self.jobs.send(job).map_err(|_| DriverStatus::INVALID_OBJECT)
    }

    fn shutdown(&self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
        info!(component = %self.shared.name, "Loopback component destroyed");
    }

    pub fn role(&self) -> CodecRole {
        self.role
    }

    // ── test hooks ──

    /// Report a driver error from the worker thread.
    pub fn inject_error(&self, code: u32) {
        let _ = self.send(Job::Error(code));
    }

    /// Report changed port settings from the worker thread.
    pub fn port_settings_changed(&self, port_index: u32, index: SettingsIndex) {
        let _ = self.send(Job::SettingsChanged(port_index, index));
    }

    /// While set, input buffers are kept by the component instead of being
    /// processed. Clearing releases them.
    pub fn hold_input(&self, hold: bool) {
        self.shared.state.lock().hold_input = hold;
        if !hold {
            let _ = self.send(Job::ReleaseHeld);
        }
    }

    /// While set, commands are accepted but not carried out. Clearing runs
    /// the stalled commands in order.
    pub fn stall_commands(&self, stall: bool) {
        self.shared.state.lock().stall_commands = stall;
        if !stall {
            let _ = self.send(Job::ReleaseStalled);
        }
    }

    /// While set, a flush completes at once but the flushed ports keep their
    /// buffers. Clearing hands them back.
    pub fn defer_flush_returns(&self, defer: bool) {
        self.shared.state.lock().defer_flush_returns = defer;
        if !defer {
            let _ = self.send(Job::ReleaseFlushed);
        }
    }

    /// Refuse the next `send_command` with `status`.
    pub fn reject_next_command(&self, status: DriverStatus) {
        self.shared.state.lock().reject_next = Some(status);
    }

    /// Every command accepted so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.shared.state.lock().commands.clone()
    }

    pub fn command_count(&self, command: Command) -> usize {
        self.shared
            .state
            .lock()
            .commands
            .iter()
            .filter(|&&c| c == command)
            .count()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.lock().current
    }

    pub fn registered_buffers(&self, port_index: u32) -> usize {
        self.shared
            .state
            .lock()
            .registered
            .get(port_index as usize)
            .map_or(0, HashSet::len)
    }

    /// Buffers the component currently holds on a port.
    pub fn held_buffers(&self, port_index: u32) -> usize {
        let state = self.shared.state.lock();
        match port_index as usize {
            INPUT => state.waiting_input.len() + state.held_input.len(),
            OUTPUT => state.queued_output.len(),
            _ => 0,
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.state.lock().frames_processed
    }

    pub fn set_supported_buffer_types(&self, port_index: u32, mask: u32) {
        if let Some(slot) = self
            .shared
            .state
            .lock()
            .params
            .buffer_types
            .get_mut(port_index as usize)
        {
            *slot = mask;
        }
    }

    fn check_registered(&self, buffer: &DriverBuffer, port: usize) -> DriverResult<()> {
        let state = self.shared.state.lock();
        if state.current < SessionState::Idle {
            return Err(DriverStatus::INCORRECT_STATE);
        }
        if buffer.port_index as usize != port || !state.registered[port].contains(&buffer.buffer_id)
        {
            return Err(DriverStatus::INVALID_PARAM);
        }
        Ok(())
    }
}

impl CodecComponent for LoopbackComponent {
    fn send_command(&self, command: Command) -> DriverResult<()> {
        {
            let mut state = self.shared.state.lock();
            if let Some(status) = state.reject_next.take() {
                debug!(%command, status = %status, "Loopback: rejecting command");
                return Err(status);
            }
            let port = match command {
                Command::StateSet(_) | Command::Flush(ALL_PORTS) => None,
                Command::Flush(port) | Command::PortDisable(port) | Command::PortEnable(port) => {
                    Some(port)
                }
            };
            if port.is_some_and(|port| port >= PORT_COUNT) {
                return Err(DriverStatus::INVALID_PARAM);
            }
            state.commands.push(command);
        }
        self.send(Job::Command(command))
    }

    fn get_parameter(&self, record: &mut ParamRecord) -> DriverResult<()> {
        self.shared.state.lock().params.get(record)
    }

    fn set_parameter(&self, record: &ParamRecord) -> DriverResult<()> {
        self.shared.state.lock().params.set(record)
    }

    fn get_config(&self, record: &mut ParamRecord) -> DriverResult<()> {
        self.shared.state.lock().params.get(record)
    }

    fn set_config(&self, record: &ParamRecord) -> DriverResult<()> {
        self.shared.state.lock().params.set(record)
    }

    fn use_buffer(&self, port_index: u32, buffer: &mut DriverBuffer) -> DriverResult<()> {
        let port = ParamStore::port(port_index)?;
        let mut state = self.shared.state.lock();
        let id = state.next_buffer_id;
        state.next_buffer_id += 1;
        state.registered[port].insert(id);
        buffer.buffer_id = id;
        buffer.port_index = port_index;
        Ok(())
    }

    fn allocate_buffer(&self, port_index: u32, size: usize) -> DriverResult<DriverBuffer> {
        let port = ParamStore::port(port_index)?;
        let memory = match &self.pool {
            Some(pool) => pool.try_acquire(size).map_err(|e| {
                debug!(error = %e, "Loopback: pool allocation failed");
                DriverStatus::NO_MEMORY
            })?,
            None => Arc::new(SharedMemory::new(size)),
        };
        let mut buffer = DriverBuffer::new(
            port_index,
            BufferKind::SharedMemory,
            Some(Backing::Shared(memory)),
            size,
        );
        let mut state = self.shared.state.lock();
        buffer.buffer_id = state.next_buffer_id;
        state.next_buffer_id += 1;
        state.registered[port].insert(buffer.buffer_id);
        Ok(buffer)
    }

    fn free_buffer(&self, port_index: u32, buffer: &DriverBuffer) -> DriverResult<()> {
        let port = ParamStore::port(port_index)?;
        if !self.shared.state.lock().registered[port].remove(&buffer.buffer_id) {
            return Err(DriverStatus::INVALID_PARAM);
        }
        self.send(Job::Recheck)
    }

    fn empty_this_buffer(&self, buffer: DriverBuffer) -> DriverResult<()> {
        self.check_registered(&buffer, INPUT)?;
        self.send(Job::Empty(buffer))
    }

    fn fill_this_buffer(&self, buffer: DriverBuffer) -> DriverResult<()> {
        self.check_registered(&buffer, OUTPUT)?;
        self.send(Job::Fill(buffer))
    }
}

impl Drop for LoopbackComponent {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
    }
}
