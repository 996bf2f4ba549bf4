//! Draw submission.

pub use crate::backend::ClientVertexBuffer;

use crate::backend::DrawCall;
use crate::context::Context;
use crate::resource::Resource;
use crate::shader::ShaderStage;
use crate::state::{IndexSize, PrimitiveMode, ResolveMode};

#[derive(Debug, Clone, Copy)]
pub enum IndexSource<'a> {
    Resource { resource: &'a Resource, offset: u64 },
    /// Client indices. Always copied into scratch space.
    Client(&'a [u8]),
}

#[derive(Debug, Clone, Copy)]
pub struct IndexBuffer<'a> {
    pub size: IndexSize,
    pub source: IndexSource<'a>,
}

/// One draw call as issued by the API layer.
#[derive(Debug, Clone, Copy)]
pub struct DrawInfo<'a> {
    pub mode: PrimitiveMode,
    /// First vertex, or first index for indexed draws.
    pub start: u32,
    pub count: u32,
    pub index_bias: i32,
    pub start_instance: u32,
    pub instance_count: u32,
    pub index: Option<IndexBuffer<'a>>,
    /// Index value that restarts the primitive.
    pub primitive_restart: Option<u32>,
    /// Smallest and largest index the draw references, when known. Limits how
    /// much client vertex data gets copied.
    pub index_bounds: Option<(u32, u32)>,
    /// Bytes for vertex buffer slots bound as client memory.
    pub client_vertex_buffers: &'a [ClientVertexBuffer<'a>],
}

impl<'a> DrawInfo<'a> {
    pub fn arrays(mode: PrimitiveMode, start: u32, count: u32) -> Self {
        Self {
            mode,
            start,
            count,
            index_bias: 0,
            start_instance: 0,
            instance_count: 1,
            index: None,
            primitive_restart: None,
            index_bounds: None,
            client_vertex_buffers: &[],
        }
    }

    pub fn indexed(mode: PrimitiveMode, index: IndexBuffer<'a>, start: u32, count: u32) -> Self {
        Self {
            index: Some(index),
            ..Self::arrays(mode, start, count)
        }
    }

    pub fn with_instances(mut self, start_instance: u32, instance_count: u32) -> Self {
        self.start_instance = start_instance;
        self.instance_count = instance_count;
        self
    }

    pub fn with_client_vertex_buffers(mut self, buffers: &'a [ClientVertexBuffer<'a>]) -> Self {
        self.client_vertex_buffers = buffers;
        self
    }

    /// Vertex range the draw reads, `[min, max]`, when it can be known
    /// without scanning indices.
    pub(crate) fn vertex_range(&self) -> Option<(u32, u32)> {
        if self.count == 0 {
            return None;
        }
        match self.index {
            None => Some((self.start, self.start.saturating_add(self.count - 1))),
            Some(_) => self.index_bounds.map(|(min, max)| {
                let bias = |v: u32| (i64::from(v) + i64::from(self.index_bias)).max(0) as u32;
                (bias(min), bias(max))
            }),
        }
    }

    fn call(&self) -> DrawCall {
        DrawCall {
            mode: self.mode,
            start: self.start,
            count: self.count,
            index_bias: self.index_bias,
            start_instance: self.start_instance,
            instance_count: self.instance_count,
            indexed: self.index.is_some(),
            restart_index: self.primitive_restart,
        }
    }
}

impl Context {
    /// Resolve derived state and queue one draw.
    ///
    /// Never fails: a draw that cannot run is skipped with a warning and
    /// leaves every piece of state ready for the next one.
    pub fn draw(&mut self, info: &DrawInfo<'_>) {
        let ready = self.state.shader(ShaderStage::Vertex).is_some()
            && self.state.shader(ShaderStage::Fragment).is_some();
        if !ready {
            tracing::warn!(ctx = self.backend_ctx.0, "draw skipped: vertex or fragment shader unbound");
            self.stats.inc_draws_skipped();
            return;
        }
        if info.count == 0 || info.instance_count == 0 {
            tracing::trace!(ctx = self.backend_ctx.0, "empty draw skipped");
            self.stats.inc_draws_skipped();
            return;
        }

        let resolved = self.resolve(ResolveMode::Draw(info));
        let call = info.call();
        if resolved.client_bypass {
            tracing::debug!(
                ctx = self.backend_ctx.0,
                buffers = info.client_vertex_buffers.len(),
                "client vertex data above copy limit; drawing in place"
            );
            self.backend
                .draw_blocking(self.backend_ctx, &call, info.client_vertex_buffers);
            self.stats.inc_client_draw_blocks();
        } else {
            tracing::trace!(
                ctx = self.backend_ctx.0,
                mode = ?info.mode,
                count = info.count,
                instances = info.instance_count,
                "draw"
            );
            self.backend.draw(self.backend_ctx, &call);
        }
        self.stats.inc_draws_submitted();
    }
}
