//! Output format change and renegotiation.
//!
//! The driver reports a new output port definition; the pending pull returns
//! `FormatChanged`, the pipeline disables the port, frees and reallocates
//! its buffers, re-enables it, and restarts.

mod support;

use std::time::Duration;

use hwc_codec::{Command, PullOutcome, PushOutcome, SettingsIndex};
use hwc_common::{
    CodecElement, CompressionFormat, ExternalBuffer, ParamKey, PortDirection, PortSelect,
    PortState, Resolution, SessionState,
};

use support::{harness, start_decoder, wait_until};

#[test]
fn format_change_interrupts_blocked_pull() {
    let h = harness();
    let (session, loopback) = start_decoder(&h);

    std::thread::scope(|scope| {
        let puller = scope.spawn(|| session.pull_output_buffer());
        std::thread::sleep(Duration::from_millis(20));
        loopback.port_settings_changed(1, SettingsIndex::PortDefinition);
        assert!(matches!(
            puller.join().unwrap().unwrap(),
            PullOutcome::FormatChanged
        ));
    });
    assert_eq!(session.stats().format_changes, 1);

    // Reported once; afterwards the stopped port reads as stopped.
    assert!(matches!(
        session.pull_output_buffer().unwrap(),
        PullOutcome::Stopped
    ));

    session.stop().unwrap();
    session.free_buffers(PortSelect::Both).unwrap();
    assert_eq!(session.state(), SessionState::Loaded);
    let output = session.port_stats(PortDirection::Output);
    assert_eq!(output.total, 0);
    assert_eq!(output.coding, 0);
}

#[test]
fn filled_buffers_delivered_before_format_change() {
    let h = harness();
    let (session, loopback) = start_decoder(&h);
    session
        .push_input_buffer(Some(ExternalBuffer::from_payload(b"old-format", 5)))
        .unwrap();
    wait_until("output filled", || {
        session.port_stats(PortDirection::Output).filled == 1
    });

    loopback.port_settings_changed(1, SettingsIndex::PortDefinition);
    wait_until("format change seen", || session.stats().format_changes == 1);

    let PullOutcome::Buffer(frame) = session.pull_output_buffer().unwrap() else {
        panic!("filled buffer must come first");
    };
    assert_eq!(frame.payload(), b"old-format".to_vec());
    assert!(matches!(
        session.pull_output_buffer().unwrap(),
        PullOutcome::FormatChanged
    ));
}

#[test]
fn renegotiate_output_port() {
    let h = harness();
    let (session, loopback) = start_decoder(&h);

    loopback.port_settings_changed(1, SettingsIndex::PortDefinition);
    wait_until("format change seen", || session.stats().format_changes == 1);
    assert!(matches!(
        session.pull_output_buffer().unwrap(),
        PullOutcome::FormatChanged
    ));

    session.activate_port(PortSelect::Output, false).unwrap();
    assert_eq!(session.port_state(PortDirection::Output), PortState::Deactivating);
    session.free_buffers(PortSelect::Output).unwrap();
    assert_eq!(session.port_state(PortDirection::Output), PortState::Deactivated);
    assert_eq!(loopback.registered_buffers(1), 0);
    assert_eq!(session.state(), SessionState::Executing);

    let element = CodecElement::new(CompressionFormat::Avc, Resolution::new(128, 96), 30);
    session
        .set_parameter(ParamKey::OutputCommon, &element)
        .unwrap();

    session.activate_port(PortSelect::Output, true).unwrap();
    session.allocate_buffers(PortDirection::Output).unwrap();
    assert_eq!(session.port_state(PortDirection::Output), PortState::Activated);
    assert_eq!(loopback.command_count(Command::PortDisable(1)), 1);
    assert_eq!(loopback.command_count(Command::PortEnable(1)), 1);

    let mut negotiated = CodecElement::default();
    session
        .get_parameter(ParamKey::OutputCommon, &mut negotiated)
        .unwrap();
    assert_eq!(negotiated.output.resolution, Resolution::new(128, 96));
    assert_eq!(negotiated.stride, 128);

    session.start().unwrap();
    session
        .push_input_buffer(Some(ExternalBuffer::from_payload(b"new-format", 6)))
        .unwrap();
    let PullOutcome::Buffer(frame) = session.pull_output_buffer().unwrap() else {
        panic!("expected a buffer after renegotiation");
    };
    assert_eq!(frame.payload(), b"new-format".to_vec());
    assert_eq!(frame.pts, 6);
    session.push_output_buffer(frame).unwrap();
    session.check_invariants().unwrap();
}

#[test]
fn crop_change_is_flagged_once() {
    let h = harness();
    let (session, loopback) = start_decoder(&h);
    loopback.port_settings_changed(1, SettingsIndex::OutputCrop);
    wait_until("crop change seen", || session.take_crop_change());
    assert!(!session.take_crop_change());
    assert_eq!(session.stats().format_changes, 0);
}

#[test]
fn input_format_change_interrupts_blocked_push() {
    let h = harness();
    let (session, loopback) = start_decoder(&h);
    loopback.hold_input(true);
    for i in 0..4 {
        session
            .push_input_buffer(Some(ExternalBuffer::from_payload(b"au", i)))
            .unwrap();
    }
    wait_until("driver holds every input", || loopback.held_buffers(0) == 4);

    std::thread::scope(|scope| {
        let pusher = scope.spawn(|| {
            session.push_input_buffer(Some(ExternalBuffer::from_payload(b"blocked", 4)))
        });
        std::thread::sleep(Duration::from_millis(20));
        loopback.port_settings_changed(0, SettingsIndex::PortDefinition);
        assert_eq!(pusher.join().unwrap().unwrap(), PushOutcome::FormatChanged);
    });
    assert_eq!(session.stats().format_changes, 1);

    // Reported once; afterwards the stopped port reads as stopped.
    assert_eq!(
        session
            .push_input_buffer(Some(ExternalBuffer::from_payload(b"late", 5)))
            .unwrap(),
        PushOutcome::Stopped
    );
    assert!(session.port_stats(PortDirection::Input).accounted());
}
