//! Encoder sessions: deferred input registration, zero-copy input frames,
//! and encoder-only parameters.

mod support;

use std::sync::Arc;

use hwc_codec::{LoopbackManager, PullOutcome, PushOutcome};
use hwc_common::{
    AvcLevel, AvcProfile, BitrateMode, CodecElement, CodecError, CodecRole, CompressionFormat,
    ExternalBuffer, GraphicHandle, ParamKey, PixelFormat, PortDirection, PortSelect, Resolution,
    SessionState, SharedMemory,
};

use support::{config, harness, open, Harness};

const FRAME_SIZE: usize = 64 * 48 * 3 / 2;

fn open_encoder(h: &Harness) -> (hwc_codec::CodecSession, Arc<hwc_codec::LoopbackComponent>) {
    open(h, &config(LoopbackManager::ENCODER_AVC, CodecRole::Encoder))
}

fn frame_memory() -> Vec<Arc<SharedMemory>> {
    (0..4).map(|_| Arc::new(SharedMemory::new(FRAME_SIZE))).collect()
}

#[test]
fn input_registration_waits_for_idle() {
    let h = harness();
    let (session, loopback) = open_encoder(&h);
    let memory = frame_memory();
    session
        .use_buffers(
            PortDirection::Input,
            memory.iter().cloned().map(ExternalBuffer::shared).collect(),
        )
        .unwrap();
    assert_eq!(session.port_stats(PortDirection::Input).total, 4);
    assert_eq!(loopback.registered_buffers(0), 0);

    session.allocate_buffers(PortDirection::Output).unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(loopback.registered_buffers(0), 4);
    assert_eq!(loopback.registered_buffers(1), 4);
}

#[test]
fn unregistered_input_discarded_on_free() {
    let h = harness();
    let (session, loopback) = open_encoder(&h);
    session
        .use_buffers(
            PortDirection::Input,
            frame_memory().into_iter().map(ExternalBuffer::shared).collect(),
        )
        .unwrap();
    session.free_buffers(PortSelect::Input).unwrap();
    assert_eq!(session.port_stats(PortDirection::Input).total, 0);
    assert!(loopback.commands().is_empty());
    assert_eq!(session.state(), SessionState::Loaded);
}

#[test]
fn shared_memory_frames_pass_without_copy() {
    let h = harness();
    let (session, _loopback) = open_encoder(&h);
    let memory = frame_memory();
    session
        .use_buffers(
            PortDirection::Input,
            memory.iter().cloned().map(ExternalBuffer::shared).collect(),
        )
        .unwrap();
    session.allocate_buffers(PortDirection::Output).unwrap();
    session.start().unwrap();

    for (i, mem) in memory.iter().cycle().take(6).enumerate() {
        let payload = format!("raw-frame-{i}");
        mem.write_at(0, payload.as_bytes());
        let mut frame = ExternalBuffer::shared(mem.clone());
        frame.resize(0, payload.len());
        frame.pts = 1000 * i as i64;
        assert_eq!(
            session.push_input_buffer(Some(frame)).unwrap(),
            PushOutcome::Queued
        );

        let PullOutcome::Buffer(packet) = session.pull_output_buffer().unwrap() else {
            panic!("expected an encoded packet");
        };
        assert_eq!(packet.payload(), payload.as_bytes());
        assert_eq!(packet.pts, 1000 * i as i64);
        session.push_output_buffer(packet).unwrap();
    }
    session.check_invariants().unwrap();
}

#[test]
fn foreign_input_memory_is_unknown() {
    let h = harness();
    let (session, _loopback) = open_encoder(&h);
    session
        .use_buffers(
            PortDirection::Input,
            frame_memory().into_iter().map(ExternalBuffer::shared).collect(),
        )
        .unwrap();
    session.allocate_buffers(PortDirection::Output).unwrap();
    session.start().unwrap();

    let foreign = ExternalBuffer::from_payload(b"not imported", 0);
    assert!(matches!(
        session.push_input_buffer(Some(foreign)),
        Err(CodecError::UnknownBuffer { .. })
    ));
}

#[test]
fn dynamic_handles_attach_per_frame() {
    let h = harness();
    let (session, loopback) = open_encoder(&h);
    let element = CodecElement::new(CompressionFormat::Avc, Resolution::new(64, 48), 30);
    session.set_parameter(ParamKey::SurfaceInit, &element).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| Arc::new(GraphicHandle::new(Resolution::new(64, 48), PixelFormat::Nv12)))
        .collect();
    session
        .use_buffers(
            PortDirection::Input,
            handles.iter().cloned().map(ExternalBuffer::handle).collect(),
        )
        .unwrap();
    session.allocate_buffers(PortDirection::Output).unwrap();
    assert_eq!(loopback.registered_buffers(0), 4);
    session.start().unwrap();

    // Any handle works: it is attached to whichever descriptor is idle.
    let surface = Arc::new(GraphicHandle::new(Resolution::new(64, 48), PixelFormat::Nv12));
    let mut frame = ExternalBuffer::handle(surface);
    frame.resize(0, FRAME_SIZE);
    frame.pts = 77;
    session.push_input_buffer(Some(frame)).unwrap();

    let PullOutcome::Buffer(packet) = session.pull_output_buffer().unwrap() else {
        panic!("expected an encoded packet");
    };
    assert_eq!(packet.length, FRAME_SIZE);
    assert_eq!(packet.pts, 77);
}

#[test]
fn encoder_config_round_trip() {
    let h = harness();
    let (session, _loopback) = open_encoder(&h);
    let mut element = CodecElement::new(CompressionFormat::Avc, Resolution::new(64, 48), 30);
    element.encoder.bitrate_mode = BitrateMode::Cbr;
    element.encoder.bitrate = 3_000_000;
    element.encoder.profile = AvcProfile::High;
    element.encoder.level = AvcLevel::Level41;
    element.encoder.i_frame_interval_ms = 1000;
    session
        .set_parameter(ParamKey::EncoderConfig, &element)
        .unwrap();

    let mut read = CodecElement::new(CompressionFormat::Avc, Resolution::new(64, 48), 30);
    session
        .get_parameter(ParamKey::EncoderConfig, &mut read)
        .unwrap();
    assert_eq!(read.encoder.bitrate_mode, BitrateMode::Cbr);
    assert_eq!(read.encoder.bitrate, 3_000_000);
    assert_eq!(read.encoder.profile, AvcProfile::High);
    assert_eq!(read.encoder.level, AvcLevel::Level41);

    session
        .set_parameter(ParamKey::RequestIFrame, &element)
        .unwrap();
    element.encoder.bitrate = 1_500_000;
    session
        .set_parameter(ParamKey::DynamicBitrate, &element)
        .unwrap();
}

#[test]
fn decoder_refuses_encoder_keys() {
    let h = harness();
    let (session, _loopback) = open(
        &h,
        &config(LoopbackManager::DECODER_AVC, CodecRole::Decoder),
    );
    let element = CodecElement::default();
    assert!(matches!(
        session.set_parameter(ParamKey::RequestIFrame, &element),
        Err(CodecError::Unsupported(_))
    ));
}
