//! Shared fixtures for the session integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use hwc_codec::{CodecSession, ComponentRegistry, LoopbackComponent, LoopbackManager};
use hwc_common::{
    CodecElement, CodecRole, CompressionFormat, PortDirection, Resolution, SessionConfig,
};

pub struct Harness {
    pub manager: Arc<LoopbackManager>,
    pub registry: Arc<ComponentRegistry>,
}

pub fn harness() -> Harness {
    let manager = Arc::new(LoopbackManager::new());
    let registry = Arc::new(ComponentRegistry::new(manager.clone()));
    Harness { manager, registry }
}

pub fn config(component: &str, role: CodecRole) -> SessionConfig {
    let mut config = SessionConfig::new(component, role);
    config.command_timeout_ms = Some(2000);
    config.element = CodecElement::new(CompressionFormat::Avc, Resolution::new(64, 48), 30);
    config
}

pub fn open(h: &Harness, config: &SessionConfig) -> (CodecSession, Arc<LoopbackComponent>) {
    let session = CodecSession::open(&h.registry, config).expect("open session");
    let loopback = h
        .manager
        .component(session.component_id())
        .expect("loopback component is live");
    (session, loopback)
}

/// Open a decoder, let the driver allocate both ports, and start it.
pub fn start_decoder(h: &Harness) -> (CodecSession, Arc<LoopbackComponent>) {
    let (session, loopback) = open(h, &config(LoopbackManager::DECODER_AVC, CodecRole::Decoder));
    session.allocate_buffers(PortDirection::Input).unwrap();
    session.allocate_buffers(PortDirection::Output).unwrap();
    session.start().unwrap();
    (session, loopback)
}

/// Poll `ready` until it holds, panicking after two seconds.
pub fn wait_until(what: &str, ready: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
