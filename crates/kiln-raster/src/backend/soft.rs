//! Deterministic CPU backend.
//!
//! Setters update a per-context [`ApiState`]; every queued item carries a
//! snapshot of it, so later setter calls never affect work already queued.
//! Rasterization is a stand-in: a draw covers the scissored viewport
//! rectangle and shades it with values taken from the provoking vertex.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use rayon::prelude::*;

use super::tiles::HotTileSurface;
use super::worker::{self, ContextQueue, WorkItem};
use super::{
    AttachmentMask, AttachmentSlot, Backend, BackendBlendState, BackendContextId,
    BackendDepthStencil, BackendRasterState, BufferSource, ClearValues, ClientVertexBuffer,
    DrawCall, DrawContext, IndexBufferView, RenderTargets, TileState, VertexBufferView,
    NUM_ATTACHMENTS,
};
use crate::config::EngineConfig;
use crate::lock;
use crate::shader::{FetchBuffer, Invocation, ShaderEntry, ShaderStage, VariantKind, MAX_ATTRIBUTES};
use crate::state::linkage::AttributeLayout;
use crate::state::viewport::{BackendViewport, Rect, ViewportMatrix};
use crate::state::MAX_COLOR_BUFFERS;

const VARIANT_KINDS: usize = 7;

fn kind_slot(kind: VariantKind) -> usize {
    match kind {
        VariantKind::Vertex => 0,
        VariantKind::TessControl => 1,
        VariantKind::TessEval => 2,
        VariantKind::Geometry => 3,
        VariantKind::Fragment => 4,
        VariantKind::Fetch => 5,
        VariantKind::Blend => 6,
    }
}

/// Everything the setters have pushed for one context.
#[derive(Debug, Clone, Default)]
pub(crate) struct ApiState {
    targets: RenderTargets,
    raster: BackendRasterState,
    viewports: Vec<BackendViewport>,
    matrices: Vec<ViewportMatrix>,
    scissors: Vec<Rect>,
    vertex_buffers: Vec<VertexBufferView>,
    index_buffer: Option<IndexBufferView>,
    shaders: [Option<ShaderEntry>; VARIANT_KINDS],
    depth_stencil: BackendDepthStencil,
    blend: BackendBlendState,
    layout: AttributeLayout,
    draw: DrawContext,
}

impl ApiState {
    fn shader(&self, kind: VariantKind) -> Option<&ShaderEntry> {
        self.shaders[kind_slot(kind)].as_ref()
    }
}

type Attributes = [[f32; 4]; MAX_ATTRIBUTES];

/// Worker-side state of one context: the hot tiles of its bound targets.
pub(crate) struct Executor {
    ctx: BackendContextId,
    surfaces: [Option<HotTileSurface>; NUM_ATTACHMENTS],
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Executor {
    fn new(ctx: BackendContextId, pool: Option<Arc<rayon::ThreadPool>>) -> Self {
        Self {
            ctx,
            surfaces: Default::default(),
            pool,
        }
    }

    pub(super) fn execute(&mut self, item: WorkItem) {
        match item {
            WorkItem::Draw { state, call } => {
                self.bind_targets(&state.targets);
                self.draw(&state, &call, &[]);
            }
            WorkItem::Clear {
                state,
                mask,
                values,
                rect,
            } => {
                self.bind_targets(&state.targets);
                self.clear(mask, values, rect);
            }
            WorkItem::StoreTiles {
                state,
                mask,
                post,
                rect,
            } => {
                self.bind_targets(&state.targets);
                self.store(mask, post, rect);
            }
            WorkItem::InvalidateTiles { state, mask, rect } => {
                self.bind_targets(&state.targets);
                self.invalidate(mask, rect);
            }
            WorkItem::Sync { callback, .. } => callback(),
            WorkItem::Barrier(done) => {
                let _ = done.send(());
            }
            WorkItem::Shutdown => {}
        }
    }

    /// Point each attachment slot at its bound surface. A slot whose surface
    /// changes drops its old hot tiles.
    fn bind_targets(&mut self, targets: &RenderTargets) {
        for (slot, target) in self.surfaces.iter_mut().zip(targets) {
            let unchanged = match (slot.as_ref(), target) {
                (Some(surface), Some(binding)) => surface.is_bound_to(binding),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                continue;
            }
            if let Some(old) = slot.take() {
                let dirty = old.dirty_tiles();
                if dirty > 0 {
                    tracing::warn!(
                        ctx = self.ctx.0,
                        resource = %old.resource().id(),
                        dirty,
                        "discarding dirty hot tiles of an unbound surface"
                    );
                }
            }
            *slot = target.clone().map(HotTileSurface::new);
        }
    }

    fn bound(&mut self, slot: AttachmentSlot) -> Option<&mut HotTileSurface> {
        self.surfaces[slot.index()].as_mut()
    }

    fn clear(&mut self, mask: AttachmentMask, values: ClearValues, rect: Rect) {
        let ctx = self.ctx;
        for slot in mask.slots() {
            let value = match slot {
                AttachmentSlot::Color(_) => values.color,
                AttachmentSlot::Depth => [values.depth, 0.0, 0.0, 0.0],
                AttachmentSlot::Stencil => [f32::from(values.stencil), 0.0, 0.0, 0.0],
            };
            if let Some(surface) = self.bound(slot) {
                if let Err(err) = surface.fill(rect, value) {
                    tracing::error!(ctx = ctx.0, ?slot, error = %err, "clear hit released storage");
                }
            }
        }
    }

    fn store(&mut self, mask: AttachmentMask, post: TileState, rect: Rect) {
        let ctx = self.ctx;
        for slot in mask.slots() {
            let Some(surface) = self.bound(slot) else {
                continue;
            };
            match surface.store(rect, post) {
                Ok(report) => tracing::debug!(
                    ctx = ctx.0,
                    ?slot,
                    resource = %surface.resource().id(),
                    stored = report.tiles_stored,
                    resolved = report.tiles_resolved,
                    ?post,
                    "stored hot tiles"
                ),
                Err(err) => tracing::error!(
                    ctx = ctx.0,
                    ?slot,
                    error = %err,
                    "hot tile store found released storage; skipping"
                ),
            }
        }
    }

    fn invalidate(&mut self, mask: AttachmentMask, rect: Rect) {
        let ctx = self.ctx;
        for slot in mask.slots() {
            if let Some(surface) = self.bound(slot) {
                let discarded = surface.invalidate(rect);
                tracing::debug!(ctx = ctx.0, ?slot, discarded, "invalidated hot tiles");
            }
        }
    }

    /// Vertex ids of the draw, after index lookup, bias and restart.
    fn vertex_ids(state: &ApiState, call: &DrawCall) -> Vec<u32> {
        if !call.indexed {
            return (call.start..call.start.saturating_add(call.count)).collect();
        }
        let Some(view) = &state.index_buffer else {
            return Vec::new();
        };
        let size = view.index_size.bytes();
        let Some(bytes) = view.source.read(0, view.count as usize * size) else {
            return Vec::new();
        };
        (call.start..call.start.saturating_add(call.count))
            .filter_map(|i| view.index_size.read(&bytes, i as usize))
            .filter(|&index| call.restart_index != Some(index))
            .map(|index| (i64::from(index) + i64::from(call.index_bias)).max(0) as u32)
            .collect()
    }

    /// Owned copies of each bound vertex buffer, keyed by binding slot.
    fn vertex_bytes(
        state: &ApiState,
        client: &[ClientVertexBuffer<'_>],
    ) -> Vec<(u32, Vec<u8>, u64, u32)> {
        state
            .vertex_buffers
            .iter()
            .filter_map(|view| {
                let bytes = match &view.source {
                    BufferSource::Client => client
                        .iter()
                        .find(|buffer| buffer.index == view.index)
                        .map(|buffer| buffer.bytes.to_vec()),
                    source => source.read(0, view.size as usize),
                }?;
                Some((view.index, bytes, view.base, view.stride))
            })
            .collect()
    }

    fn constants(state: &ApiState, stage: ShaderStage) -> Vec<u8> {
        state.draw.constants[stage.index()]
            .as_ref()
            .and_then(|view| view.source.read(0, view.size as usize))
            .unwrap_or_default()
    }

    /// Run fetch and the vertex stages for one vertex.
    fn shade_vertex(
        state: &ApiState,
        buffers: &[FetchBuffer<'_>],
        constants: &[Vec<u8>; ShaderStage::COUNT],
        vertex_id: u32,
        instance_id: u32,
    ) -> Attributes {
        let mut current: Attributes = [[0.0, 0.0, 0.0, 1.0]; MAX_ATTRIBUTES];
        if let Some(fetch) = state.shader(VariantKind::Fetch) {
            let mut outputs = current;
            let mut inv = Invocation::new(&[], &mut outputs);
            inv.buffers = buffers;
            inv.vertex_id = vertex_id;
            inv.instance_id = instance_id;
            fetch.call(&mut inv);
            current = outputs;
        }

        let stages = [
            ShaderStage::Vertex,
            ShaderStage::TessControl,
            ShaderStage::TessEval,
            ShaderStage::Geometry,
        ];
        for stage in stages {
            let Some(entry) = state.shader(stage.into()) else {
                continue;
            };
            let mut outputs: Attributes = [[0.0, 0.0, 0.0, 1.0]; MAX_ATTRIBUTES];
            let mut inv = Invocation::new(&current, &mut outputs);
            inv.constants = &constants[stage.index()];
            inv.vertex_id = vertex_id;
            inv.instance_id = instance_id;
            entry.call(&mut inv);
            current = outputs;
        }
        current
    }

    /// Pixels a draw touches.
    fn covered_rect(&self, state: &ApiState) -> Rect {
        let mut rect = state
            .viewports
            .first()
            .map_or(Rect::default(), BackendViewport::pixel_rect);
        if state.raster.scissor_enable {
            if let Some(scissor) = state.scissors.first() {
                rect = rect.intersect(scissor);
            }
        }
        for surface in self.surfaces.iter().flatten() {
            rect = rect.intersect(&surface.full_rect());
        }
        rect
    }

    pub(super) fn draw(&mut self, state: &ApiState, call: &DrawCall, client: &[ClientVertexBuffer<'_>]) {
        if state.raster.rasterizer_discard || call.instance_count == 0 {
            return;
        }
        let (Some(_), Some(fs)) = (
            state.shader(VariantKind::Vertex),
            state.shader(VariantKind::Fragment),
        ) else {
            tracing::warn!(ctx = self.ctx.0, "draw without vertex and fragment functions");
            return;
        };

        let ids = Self::vertex_ids(state, call);
        let Some(&provoking_id) = (if state.raster.flatshade_first {
            ids.first()
        } else {
            ids.last()
        }) else {
            return;
        };

        let vertex_bytes = Self::vertex_bytes(state, client);
        let slots = vertex_bytes.iter().map(|(index, ..)| *index as usize + 1).max().unwrap_or(0);
        let mut buffers = vec![
            FetchBuffer {
                bytes: &[],
                base: 0,
                stride: 0,
            };
            slots
        ];
        for (index, bytes, base, stride) in &vertex_bytes {
            buffers[*index as usize] = FetchBuffer {
                bytes,
                base: *base,
                stride: *stride,
            };
        }
        let constants: [Vec<u8>; ShaderStage::COUNT] =
            ShaderStage::ALL.map(|stage| Self::constants(state, stage));

        // Every vertex of every instance is shaded; the provoking vertex of
        // the last instance feeds the fragment stage.
        let instances = call.start_instance..call.start_instance.saturating_add(call.instance_count);
        let last_instance = instances.end - 1;
        let shade = |&(id, instance): &(u32, u32)| {
            Self::shade_vertex(state, &buffers, &constants, id, instance)
        };
        let work: Vec<(u32, u32)> = instances
            .flat_map(|instance| ids.iter().map(move |&id| (id, instance)))
            .collect();
        let shaded: Vec<Attributes> = match &self.pool {
            Some(pool) => pool.install(|| work.par_iter().map(shade).collect()),
            None => work.iter().map(shade).collect(),
        };
        let Some(provoking) = work
            .iter()
            .zip(&shaded)
            .rev()
            .find(|((id, instance), _)| *id == provoking_id && *instance == last_instance)
            .map(|(_, attributes)| *attributes)
        else {
            return;
        };

        let rect = self.covered_rect(state);
        if rect.is_empty() {
            return;
        }
        self.shade_pixels(state, fs, &provoking, &constants[ShaderStage::Fragment.index()], rect);
    }

    fn shade_pixels(
        &mut self,
        state: &ApiState,
        fs: &ShaderEntry,
        provoking: &Attributes,
        constants: &[u8],
        rect: Rect,
    ) {
        let layout = &state.layout;
        let mut inputs: Attributes = [[0.0, 0.0, 0.0, 1.0]; MAX_ATTRIBUTES];
        for (i, input) in inputs.iter_mut().enumerate().take(layout.num_attributes as usize) {
            if let Some(slot) = layout.source[i] {
                *input = provoking[usize::from(slot)];
            }
        }

        let depth = layout.position_slot.map_or(0.0, |slot| {
            let position = provoking[usize::from(slot)];
            let w = if position[3] == 0.0 { 1.0 } else { position[3] };
            let ndc = [position[0] / w, position[1] / w, position[2] / w];
            state
                .matrices
                .first()
                .map_or(ndc[2], |matrix| matrix.apply(ndc)[2])
        });

        let shade_row = |y: u32| -> Vec<[[f32; 4]; MAX_COLOR_BUFFERS]> {
            (rect.x0..rect.x1)
                .map(|x| {
                    let mut outputs = [[0.0; 4]; MAX_COLOR_BUFFERS];
                    let mut inv = Invocation::new(&inputs, &mut outputs);
                    inv.constants = constants;
                    inv.position = [x as f32 + 0.5, y as f32 + 0.5];
                    fs.call(&mut inv);
                    outputs
                })
                .collect()
        };
        let rows: Vec<Vec<[[f32; 4]; MAX_COLOR_BUFFERS]>> = match &self.pool {
            Some(pool) => pool.install(|| (rect.y0..rect.y1).into_par_iter().map(shade_row).collect()),
            None => (rect.y0..rect.y1).map(shade_row).collect(),
        };

        let mut blend_constants = Vec::with_capacity(20);
        for c in state.draw.blend_color {
            blend_constants.extend_from_slice(&c.to_le_bytes());
        }
        blend_constants.extend_from_slice(&state.draw.alpha_ref.to_le_bytes());

        let ds = state.depth_stencil;
        for (row, y) in rows.iter().zip(rect.y0..rect.y1) {
            for (colors, x) in row.iter().zip(rect.x0..rect.x1) {
                if !self.depth_stencil(&ds, state.draw.stencil_ref[0], x, y, depth) {
                    continue;
                }
                for (i, src) in colors.iter().enumerate() {
                    let blend = state.blend.targets[i].clone();
                    let Some(surface) = self.bound(AttachmentSlot::Color(i as u8)) else {
                        continue;
                    };
                    let result = surface.read_sample(x, y, 0).and_then(|dst| {
                        let value = match &blend {
                            Some(entry) => {
                                let pair = [*src, dst];
                                let mut out = [dst];
                                let mut inv = Invocation::new(&pair, &mut out);
                                inv.constants = &blend_constants;
                                entry.call(&mut inv);
                                out[0]
                            }
                            None => *src,
                        };
                        surface.write_pixel(x, y, value)
                    });
                    if let Err(err) = result {
                        tracing::error!(ctx = self.ctx.0, error = %err, "draw target storage released");
                        return;
                    }
                }
            }
        }
    }

    /// Depth and stencil for one pixel. Returns whether color writes proceed.
    fn depth_stencil(&mut self, ds: &BackendDepthStencil, stencil_ref: u8, x: u32, y: u32, z: f32) -> bool {
        if ds.depth_test || ds.depth_write {
            if let Some(surface) = self.bound(AttachmentSlot::Depth) {
                let Ok(stored) = surface.read_sample(x, y, 0) else {
                    return false;
                };
                if ds.depth_test && !ds.depth_func.test(z, stored[0]) {
                    return false;
                }
                if ds.depth_write && surface.write_pixel(x, y, [z, 0.0, 0.0, 0.0]).is_err() {
                    return false;
                }
            }
        }
        if ds.stencil_test {
            if let Some(surface) = self.bound(AttachmentSlot::Stencil) {
                if surface
                    .write_pixel(x, y, [f32::from(stencil_ref), 0.0, 0.0, 0.0])
                    .is_err()
                {
                    return false;
                }
            }
        }
        true
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let dirty: usize = self.surfaces.iter().flatten().map(HotTileSurface::dirty_tiles).sum();
        if dirty > 0 {
            tracing::warn!(ctx = self.ctx.0, dirty, "context destroyed with unstored hot tiles");
        }
    }
}

struct ContextSlot {
    api: Mutex<Arc<ApiState>>,
    queue: ContextQueue,
}

impl ContextSlot {
    fn update(&self, f: impl FnOnce(&mut ApiState)) {
        let mut api = lock(&self.api);
        f(Arc::make_mut(&mut api));
    }

    fn snapshot(&self) -> Arc<ApiState> {
        Arc::clone(&lock(&self.api))
    }
}

/// CPU implementation of [`Backend`].
pub struct SoftwareBackend {
    pool: Option<Arc<rayon::ThreadPool>>,
    queue_depth: usize,
    single_threaded: bool,
    next_ctx: AtomicU32,
    contexts: Mutex<HashMap<BackendContextId, Arc<ContextSlot>>>,
}

impl SoftwareBackend {
    pub fn new(config: &EngineConfig) -> Self {
        let pool = if config.single_threaded {
            None
        } else {
            worker::build_pool(config)
        };
        Self {
            pool,
            queue_depth: config.max_draws_in_flight as usize,
            single_threaded: config.single_threaded,
            next_ctx: AtomicU32::new(1),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Everything runs inline on the calling thread.
    pub fn single_threaded() -> Self {
        Self::new(&EngineConfig {
            single_threaded: true,
            ..EngineConfig::default()
        })
    }

    pub fn is_single_threaded(&self) -> bool {
        self.single_threaded
    }

    pub fn context_count(&self) -> usize {
        lock(&self.contexts).len()
    }

    fn slot(&self, ctx: BackendContextId) -> Arc<ContextSlot> {
        match lock(&self.contexts).get(&ctx) {
            Some(slot) => Arc::clone(slot),
            None => panic!("unknown backend context {}", ctx.0),
        }
    }

    fn update(&self, ctx: BackendContextId, f: impl FnOnce(&mut ApiState)) {
        self.slot(ctx).update(f);
    }
}

impl Backend for SoftwareBackend {
    fn create_context(&self) -> BackendContextId {
        let ctx = BackendContextId(self.next_ctx.fetch_add(1, Ordering::Relaxed));
        let executor = Executor::new(ctx, self.pool.clone());
        let slot = ContextSlot {
            api: Mutex::new(Arc::new(ApiState::default())),
            queue: ContextQueue::new(ctx, executor, self.queue_depth, self.single_threaded),
        };
        lock(&self.contexts).insert(ctx, Arc::new(slot));
        tracing::debug!(ctx = ctx.0, single_threaded = self.single_threaded, "created backend context");
        ctx
    }

    fn destroy_context(&self, ctx: BackendContextId) {
        let slot = lock(&self.contexts).remove(&ctx);
        if let Some(slot) = slot {
            slot.queue.shutdown();
            tracing::debug!(ctx = ctx.0, "destroyed backend context");
        }
    }

    fn set_render_targets(&self, ctx: BackendContextId, targets: &RenderTargets) {
        self.update(ctx, |api| api.targets = targets.clone());
    }

    fn set_rasterizer_state(&self, ctx: BackendContextId, state: &BackendRasterState) {
        self.update(ctx, |api| api.raster = *state);
    }

    fn set_viewports(
        &self,
        ctx: BackendContextId,
        viewports: &[BackendViewport],
        matrices: &[ViewportMatrix],
    ) {
        self.update(ctx, |api| {
            api.viewports = viewports.to_vec();
            api.matrices = matrices.to_vec();
        });
    }

    fn set_scissor_rects(&self, ctx: BackendContextId, rects: &[Rect]) {
        self.update(ctx, |api| api.scissors = rects.to_vec());
    }

    fn set_vertex_buffers(&self, ctx: BackendContextId, views: &[VertexBufferView]) {
        self.update(ctx, |api| api.vertex_buffers = views.to_vec());
    }

    fn set_index_buffer(&self, ctx: BackendContextId, view: Option<&IndexBufferView>) {
        self.update(ctx, |api| api.index_buffer = view.cloned());
    }

    fn set_shader(&self, ctx: BackendContextId, kind: VariantKind, entry: Option<ShaderEntry>) {
        self.update(ctx, |api| api.shaders[kind_slot(kind)] = entry);
    }

    fn set_depth_stencil_state(&self, ctx: BackendContextId, state: &BackendDepthStencil) {
        self.update(ctx, |api| api.depth_stencil = *state);
    }

    fn set_blend_state(&self, ctx: BackendContextId, state: &BackendBlendState) {
        self.update(ctx, |api| api.blend = state.clone());
    }

    fn set_attribute_layout(&self, ctx: BackendContextId, layout: &AttributeLayout) {
        self.update(ctx, |api| api.layout = *layout);
    }

    fn set_draw_context(&self, ctx: BackendContextId, draw: &DrawContext) {
        self.update(ctx, |api| api.draw = draw.clone());
    }

    fn draw(&self, ctx: BackendContextId, call: &DrawCall) {
        let slot = self.slot(ctx);
        let state = slot.snapshot();
        tracing::trace!(ctx = ctx.0, count = call.count, "queue draw");
        slot.queue.push(WorkItem::Draw { state, call: *call });
    }

    fn draw_blocking(
        &self,
        ctx: BackendContextId,
        call: &DrawCall,
        client: &[ClientVertexBuffer<'_>],
    ) {
        let slot = self.slot(ctx);
        let state = slot.snapshot();
        slot.queue.barrier();
        let mut executor = lock(slot.queue.executor());
        executor.bind_targets(&state.targets);
        executor.draw(&state, call, client);
    }

    fn clear(&self, ctx: BackendContextId, mask: AttachmentMask, values: ClearValues, rect: Rect) {
        let slot = self.slot(ctx);
        let state = slot.snapshot();
        slot.queue.push(WorkItem::Clear {
            state,
            mask,
            values,
            rect,
        });
    }

    fn store_tiles(&self, ctx: BackendContextId, mask: AttachmentMask, post: TileState, rect: Rect) {
        let slot = self.slot(ctx);
        let state = slot.snapshot();
        slot.queue.push(WorkItem::StoreTiles {
            state,
            mask,
            post,
            rect,
        });
    }

    fn invalidate_tiles(&self, ctx: BackendContextId, mask: AttachmentMask, rect: Rect) {
        let slot = self.slot(ctx);
        let state = slot.snapshot();
        slot.queue.push(WorkItem::InvalidateTiles { state, mask, rect });
    }

    fn sync(&self, ctx: BackendContextId, value: u64, callback: Box<dyn FnOnce() + Send>) {
        let slot = self.slot(ctx);
        slot.queue.push(WorkItem::Sync { value, callback });
    }
}

impl Drop for SoftwareBackend {
    fn drop(&mut self) {
        let contexts: Vec<_> = lock(&self.contexts).drain().map(|(_, slot)| slot).collect();
        for slot in contexts {
            slot.queue.shutdown();
        }
    }
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("single_threaded", &self.single_threaded)
            .field("workers", &self.pool.as_ref().map(|pool| pool.current_num_threads()))
            .field("contexts", &self.context_count())
            .finish()
    }
}
