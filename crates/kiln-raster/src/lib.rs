//! `kiln-raster` is the execution core of a software rasterizer driver.
//!
//! It sits between a graphics API state tracker and a tiled, multi-threaded
//! rasterization backend:
//! - Per-draw scratch space for small client data (see [`scratch`]).
//! - Fences that order deferred release of resources, shaders and scratch
//!   buffers behind in-flight rendering (see [`Fence`]).
//! - Lazily compiled shader variants keyed by the state they depend on (see
//!   [`shader::VariantCache`]).
//! - Dirty-flag driven derivation of backend state before every draw (see
//!   [`Context::draw`]).
//! - Store/load synchronization of hot-tile render target contents (see
//!   [`tile_sync`]).
//!
//! [`SoftwareBackend`] is a complete reference backend; tests and embedders
//! can swap in any other [`Backend`].

use std::sync::{Mutex, MutexGuard, PoisonError};

mod context;
mod draw;
mod error;
mod screen;
mod transfer;

pub mod backend;
pub mod config;
pub mod fence;
pub mod resource;
pub mod ring_arena;
pub mod scratch;
pub mod shader;
pub mod state;
pub mod stats;
pub mod tile_sync;

pub use backend::{Backend, ClearValues, SoftwareBackend};
pub use config::EngineConfig;
pub use context::Context;
pub use draw::{ClientVertexBuffer, DrawInfo, IndexBuffer, IndexSource};
pub use error::{EngineError, EngineResult};
pub use fence::{DeferredWork, Fence};
pub use resource::{BindFlags, Format, Resource, ResourceDesc, ResourceId, ResourceTarget};
pub use screen::Screen;
pub use shader::{
    CompilationService, PassthroughCompiler, ShaderDescription, ShaderObject, ShaderStage,
};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use transfer::MapFlags;

/// Lock a mutex, ignoring poisoning. A panic on a worker already tears the
/// engine down; the data behind these locks stays consistent either way.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
