//! A backend that records every call instead of rendering.
//!
//! Sync callbacks either complete immediately ([`RecordingBackend::inline`])
//! or wait until the test releases them ([`RecordingBackend::deferred`]),
//! which lets tests hold a fence pending for as long as they need.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use hashbrown::HashMap;

use super::{
    AttachmentMask, Backend, BackendBlendState, BackendContextId, BackendDepthStencil,
    BackendRasterState, ClearValues, ClientVertexBuffer, DrawCall, DrawContext, IndexBufferView,
    RenderTargets, TileState, VertexBufferView,
};
use crate::lock;
use crate::resource::{Plane, ResourceId};
use crate::shader::{ShaderEntry, VariantKind};
use crate::state::linkage::AttributeLayout;
use crate::state::viewport::{BackendViewport, Rect, ViewportMatrix};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateContext,
    DestroyContext,
    SetRenderTargets(Vec<Option<(ResourceId, Plane)>>),
    SetRasterizerState(BackendRasterState),
    SetViewports(Vec<BackendViewport>),
    SetScissorRects(Vec<Rect>),
    SetVertexBuffers(usize),
    SetIndexBuffer(bool),
    SetShader(VariantKind, bool),
    SetDepthStencilState(BackendDepthStencil),
    SetBlendState(usize),
    SetAttributeLayout(AttributeLayout),
    SetDrawContext,
    Draw(DrawCall),
    DrawBlocking(DrawCall),
    Clear(AttachmentMask),
    StoreTiles(AttachmentMask, TileState),
    InvalidateTiles(AttachmentMask),
    Sync(u64),
}

#[derive(Default)]
struct Recorder {
    calls: Vec<(BackendContextId, Call)>,
    pending: VecDeque<Box<dyn FnOnce() + Send>>,
    shaders: HashMap<(BackendContextId, VariantKind), ShaderEntry>,
    blend_targets: HashMap<BackendContextId, BackendBlendState>,
}

pub struct RecordingBackend {
    complete_inline: AtomicBool,
    next_ctx: AtomicU32,
    recorder: Mutex<Recorder>,
}

impl RecordingBackend {
    pub fn inline() -> Self {
        Self::build(true)
    }

    pub fn deferred() -> Self {
        Self::build(false)
    }

    fn build(complete_inline: bool) -> Self {
        Self {
            complete_inline: AtomicBool::new(complete_inline),
            next_ctx: AtomicU32::new(1),
            recorder: Mutex::new(Recorder::default()),
        }
    }

    fn record(&self, ctx: BackendContextId, call: Call) {
        lock(&self.recorder).calls.push((ctx, call));
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.recorder)
            .calls
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn calls_for(&self, ctx: BackendContextId) -> Vec<Call> {
        lock(&self.recorder)
            .calls
            .iter()
            .filter(|(id, _)| *id == ctx)
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        lock(&self.recorder)
            .calls
            .iter()
            .filter(|(_, call)| pred(call))
            .count()
    }

    pub fn clear_calls(&self) {
        lock(&self.recorder).calls.clear();
    }

    /// Entry point last bound for `kind`, if any.
    pub fn bound_shader(&self, ctx: BackendContextId, kind: VariantKind) -> Option<ShaderEntry> {
        lock(&self.recorder).shaders.get(&(ctx, kind)).cloned()
    }

    pub fn bound_blend(&self, ctx: BackendContextId) -> Option<BackendBlendState> {
        lock(&self.recorder).blend_targets.get(&ctx).cloned()
    }

    pub fn pending_syncs(&self) -> usize {
        lock(&self.recorder).pending.len()
    }

    /// Complete the oldest pending sync. Returns `false` when none is pending.
    pub fn complete_next(&self) -> bool {
        let next = lock(&self.recorder).pending.pop_front();
        match next {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Complete everything pending and complete later syncs inline. Lets a
    /// test that held fences open tear its context down.
    pub fn go_inline(&self) -> usize {
        self.complete_inline.store(true, Ordering::Release);
        self.complete_all()
    }

    /// Complete every pending sync in order. Returns how many ran.
    pub fn complete_all(&self) -> usize {
        let mut ran = 0;
        while self.complete_next() {
            ran += 1;
        }
        ran
    }
}

impl Backend for RecordingBackend {
    fn create_context(&self) -> BackendContextId {
        let ctx = BackendContextId(self.next_ctx.fetch_add(1, Ordering::Relaxed));
        self.record(ctx, Call::CreateContext);
        ctx
    }

    fn destroy_context(&self, ctx: BackendContextId) {
        self.record(ctx, Call::DestroyContext);
    }

    fn set_render_targets(&self, ctx: BackendContextId, targets: &RenderTargets) {
        let ids = targets
            .iter()
            .map(|t| t.as_ref().map(|t| (t.resource.id(), t.plane)))
            .collect();
        self.record(ctx, Call::SetRenderTargets(ids));
    }

    fn set_rasterizer_state(&self, ctx: BackendContextId, state: &BackendRasterState) {
        self.record(ctx, Call::SetRasterizerState(*state));
    }

    fn set_viewports(
        &self,
        ctx: BackendContextId,
        viewports: &[BackendViewport],
        _matrices: &[ViewportMatrix],
    ) {
        self.record(ctx, Call::SetViewports(viewports.to_vec()));
    }

    fn set_scissor_rects(&self, ctx: BackendContextId, rects: &[Rect]) {
        self.record(ctx, Call::SetScissorRects(rects.to_vec()));
    }

    fn set_vertex_buffers(&self, ctx: BackendContextId, views: &[VertexBufferView]) {
        self.record(ctx, Call::SetVertexBuffers(views.len()));
    }

    fn set_index_buffer(&self, ctx: BackendContextId, view: Option<&IndexBufferView>) {
        self.record(ctx, Call::SetIndexBuffer(view.is_some()));
    }

    fn set_shader(&self, ctx: BackendContextId, kind: VariantKind, entry: Option<ShaderEntry>) {
        let mut recorder = lock(&self.recorder);
        recorder.calls.push((ctx, Call::SetShader(kind, entry.is_some())));
        match entry {
            Some(entry) => {
                recorder.shaders.insert((ctx, kind), entry);
            }
            None => {
                recorder.shaders.remove(&(ctx, kind));
            }
        }
    }

    fn set_depth_stencil_state(&self, ctx: BackendContextId, state: &BackendDepthStencil) {
        self.record(ctx, Call::SetDepthStencilState(*state));
    }

    fn set_blend_state(&self, ctx: BackendContextId, state: &BackendBlendState) {
        let mut recorder = lock(&self.recorder);
        let bound = state.targets.iter().flatten().count();
        recorder.calls.push((ctx, Call::SetBlendState(bound)));
        recorder.blend_targets.insert(ctx, state.clone());
    }

    fn set_attribute_layout(&self, ctx: BackendContextId, layout: &AttributeLayout) {
        self.record(ctx, Call::SetAttributeLayout(*layout));
    }

    fn set_draw_context(&self, ctx: BackendContextId, _draw: &DrawContext) {
        self.record(ctx, Call::SetDrawContext);
    }

    fn draw(&self, ctx: BackendContextId, call: &DrawCall) {
        self.record(ctx, Call::Draw(*call));
    }

    fn draw_blocking(
        &self,
        ctx: BackendContextId,
        call: &DrawCall,
        _client: &[ClientVertexBuffer<'_>],
    ) {
        self.record(ctx, Call::DrawBlocking(*call));
    }

    fn clear(&self, ctx: BackendContextId, mask: AttachmentMask, _values: ClearValues, _rect: Rect) {
        self.record(ctx, Call::Clear(mask));
    }

    fn store_tiles(&self, ctx: BackendContextId, mask: AttachmentMask, post: TileState, _rect: Rect) {
        self.record(ctx, Call::StoreTiles(mask, post));
    }

    fn invalidate_tiles(&self, ctx: BackendContextId, mask: AttachmentMask, _rect: Rect) {
        self.record(ctx, Call::InvalidateTiles(mask));
    }

    fn sync(&self, ctx: BackendContextId, value: u64, callback: Box<dyn FnOnce() + Send>) {
        {
            let mut recorder = lock(&self.recorder);
            recorder.calls.push((ctx, Call::Sync(value)));
            if !self.complete_inline.load(Ordering::Acquire) {
                recorder.pending.push_back(callback);
                return;
            }
        }
        callback();
    }
}

impl std::fmt::Debug for RecordingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let recorder = lock(&self.recorder);
        f.debug_struct("RecordingBackend")
            .field("complete_inline", &self.complete_inline.load(Ordering::Relaxed))
            .field("calls", &recorder.calls.len())
            .field("pending", &recorder.pending.len())
            .finish()
    }
}
