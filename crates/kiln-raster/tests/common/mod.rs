//! Shared helpers for `kiln-raster` integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use kiln_raster::backend::testing::RecordingBackend;
use kiln_raster::resource::{BindFlags, Format, Resource, ResourceDesc};
use kiln_raster::shader::key::VsKey;
use kiln_raster::shader::{Semantic, SemanticName, ShaderDescription, ShaderInfo, ShaderStage};
use kiln_raster::{EngineConfig, PassthroughCompiler, Screen};

/// Install a `tracing` subscriber driven by `RUST_LOG`. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Screen over a [`RecordingBackend`] that completes syncs inline.
pub fn recording_screen(config: EngineConfig) -> (Arc<RecordingBackend>, Screen) {
    recording_screen_with(RecordingBackend::inline(), config)
}

pub fn recording_screen_with(
    backend: RecordingBackend,
    config: EngineConfig,
) -> (Arc<RecordingBackend>, Screen) {
    init_tracing();
    let backend = Arc::new(backend);
    let screen = Screen::new(config, backend.clone(), Arc::new(PassthroughCompiler::new()))
        .expect("default config is valid");
    (backend, screen)
}

pub fn render_target(screen: &Screen, width: u32, height: u32) -> Resource {
    screen
        .create_resource(ResourceDesc::texture_2d(
            Format::Rgba8Unorm,
            width,
            height,
            BindFlags::RENDER_TARGET | BindFlags::SAMPLER_VIEW,
        ))
        .expect("RGBA8 render targets are supported")
}

pub fn vertex_shader(label: &str) -> ShaderDescription {
    let info = ShaderInfo {
        outputs: vec![
            Semantic::new(SemanticName::Position, 0),
            Semantic::new(SemanticName::Color, 0),
        ],
        ..Default::default()
    };
    ShaderDescription::new(ShaderStage::Vertex, label.as_bytes().to_vec(), info).with_label(label)
}

pub fn fragment_shader(label: &str) -> ShaderDescription {
    ShaderDescription::new(ShaderStage::Fragment, label.as_bytes().to_vec(), ShaderInfo::default())
        .with_label(label)
}

/// Vertex key bytes that differ only in the given byte.
pub fn vs_key_with_byte(index: usize, value: u8) -> VsKey {
    let mut key: VsKey = bytemuck::Zeroable::zeroed();
    let bytes = bytemuck::bytes_of_mut(&mut key);
    bytes[index % bytes.len()] = value;
    key
}
