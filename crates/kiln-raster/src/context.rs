//! Per-thread rendering context.
//!
//! A context owns its pipeline state, the derived state last pushed to the
//! backend, a fence, scratch rings, the hot-tile bookkeeping and the blend
//! variant cache. It is driven from one thread; the backend does the rest.

use std::fmt;
use std::sync::Arc;

use crate::backend::{AttachmentMask, AttachmentSlot, Backend, BackendContextId, ClearValues, TileState};
use crate::config::EngineConfig;
use crate::fence::{defer, DeferredWork, Fence, FenceLink};
use crate::resource::Resource;
use crate::scratch::ScratchAllocator;
use crate::screen::Screen;
use crate::shader::{ShaderDescription, ShaderObject, ShaderStage, VariantCache};
use crate::state::derived::{Resolved, Resolver};
use crate::state::viewport::Rect;
use crate::state::{
    BlendState, ClipState, ConstantBufferBinding, DepthStencilAlphaState, DerivedState,
    DirtyFlags, FramebufferState, PipelineState, RasterizerState, ResolveMode, SamplerState,
    SamplerView, ScissorRect, VertexBufferBinding, VertexElements, Viewport,
};
use crate::stats::EngineStats;
use crate::tile_sync::{TileSynchronizer, WHOLE_SURFACE};

pub struct Context {
    pub(crate) screen: Screen,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) backend_ctx: BackendContextId,
    pub(crate) fence: Arc<Fence>,
    pub(crate) state: PipelineState,
    pub(crate) dirty: DirtyFlags,
    pub(crate) derived: DerivedState,
    pub(crate) scratch: ScratchAllocator,
    pub(crate) tiles: TileSynchronizer,
    pub(crate) blend_cache: VariantCache,
    pub(crate) stats: Arc<EngineStats>,
    destroyed: bool,
}

impl Context {
    pub(crate) fn new(screen: Screen) -> Self {
        let backend = Arc::clone(screen.backend());
        let stats = Arc::clone(screen.stats());
        let config = screen.config();
        let backend_ctx = backend.create_context();
        tracing::debug!(ctx = backend_ctx.0, "created context");
        Self {
            backend_ctx,
            fence: Fence::with_stats(Arc::clone(&stats)),
            state: PipelineState::default(),
            dirty: DirtyFlags::all(),
            derived: DerivedState::default(),
            scratch: ScratchAllocator::new(
                config.max_draws_in_flight,
                config.client_copy_limit,
                Arc::clone(&stats),
            ),
            tiles: TileSynchronizer::new(),
            blend_cache: VariantCache::new(),
            stats,
            backend,
            screen,
            destroyed: false,
        }
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn config(&self) -> &EngineConfig {
        self.screen.config()
    }

    pub fn backend_context(&self) -> BackendContextId {
        self.backend_ctx
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn derived(&self) -> &DerivedState {
        &self.derived
    }

    pub fn tiles(&self) -> &TileSynchronizer {
        &self.tiles
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn blend_variant_count(&self) -> usize {
        self.blend_cache.len()
    }

    pub(crate) fn link(&self) -> FenceLink<'_> {
        FenceLink::new(&self.fence, &*self.backend, self.backend_ctx)
    }

    pub(crate) fn resolve(&mut self, mode: ResolveMode<'_>) -> Resolved {
        let resolved = Resolver {
            state: &self.state,
            derived: &mut self.derived,
            scratch: &mut self.scratch,
            tiles: &mut self.tiles,
            blend_cache: &mut self.blend_cache,
            link: FenceLink::new(&self.fence, &*self.backend, self.backend_ctx),
            compiler: &**self.screen.compiler(),
            config: self.screen.config(),
            stats: &self.stats,
        }
        .run(self.dirty, mode);
        self.dirty = resolved.dirty;
        resolved
    }

    // State setters. Each one replaces the bound value and marks the
    // categories derived from it.

    pub fn set_rasterizer_state(&mut self, state: Arc<RasterizerState>) {
        self.state.rasterizer = state;
        self.dirty |= DirtyFlags::RASTERIZER;
    }

    pub fn set_depth_stencil_alpha_state(&mut self, state: Arc<DepthStencilAlphaState>) {
        self.state.depth_stencil_alpha = state;
        self.dirty |= DirtyFlags::DEPTH_STENCIL_ALPHA;
    }

    pub fn set_blend_state(&mut self, state: Arc<BlendState>) {
        self.state.blend = state;
        self.dirty |= DirtyFlags::BLEND;
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        self.state.blend_color = color;
        self.dirty |= DirtyFlags::BLEND_COLOR;
    }

    pub fn set_stencil_ref(&mut self, refs: [u8; 2]) {
        self.state.stencil_ref = refs;
        self.dirty |= DirtyFlags::STENCIL_REF;
    }

    pub fn set_sample_mask(&mut self, mask: u32) {
        self.state.sample_mask = mask;
        self.dirty |= DirtyFlags::SAMPLE_MASK;
    }

    pub fn set_polygon_stipple(&mut self, pattern: [u32; 32]) {
        self.state.poly_stipple = pattern;
        self.dirty |= DirtyFlags::STIPPLE;
    }

    pub fn set_clip_state(&mut self, clip: ClipState) {
        self.state.clip = clip;
        self.dirty |= DirtyFlags::CLIP;
    }

    /// # Panics
    ///
    /// If `shader` was created for a different stage.
    pub fn bind_shader(&mut self, stage: ShaderStage, shader: Option<Arc<ShaderObject>>) {
        if let Some(shader) = &shader {
            assert_eq!(
                shader.stage(),
                stage,
                "shader {} bound to the wrong stage",
                shader.label()
            );
        }
        self.state.shaders[stage.index()] = shader;
        self.dirty |= DirtyFlags::shader(stage);
    }

    pub fn set_vertex_elements(&mut self, elements: Option<Arc<VertexElements>>) {
        self.state.vertex_elements = elements;
        self.dirty |= DirtyFlags::VERTEX;
    }

    pub fn set_vertex_buffers(&mut self, start: usize, buffers: &[Option<VertexBufferBinding>]) {
        for (slot, binding) in self.state.vertex_buffers.iter_mut().skip(start).zip(buffers) {
            *slot = binding.clone();
        }
        self.dirty |= DirtyFlags::VERTEX;
    }

    pub fn set_constant_buffer(&mut self, stage: ShaderStage, binding: Option<ConstantBufferBinding>) {
        self.state.constant_buffers[stage.index()] = binding;
        self.dirty |= DirtyFlags::constants(stage);
    }

    pub fn bind_sampler_states(&mut self, stage: ShaderStage, start: usize, samplers: &[Option<SamplerState>]) {
        let slots = &mut self.state.samplers[stage.index()];
        for (slot, sampler) in slots.iter_mut().skip(start).zip(samplers) {
            *slot = *sampler;
        }
        self.dirty |= DirtyFlags::SAMPLER;
    }

    pub fn set_sampler_views(&mut self, stage: ShaderStage, start: usize, views: &[Option<SamplerView>]) {
        let slots = &mut self.state.sampler_views[stage.index()];
        for (slot, view) in slots.iter_mut().skip(start).zip(views) {
            *slot = view.clone();
        }
        self.dirty |= DirtyFlags::SAMPLER_VIEW;
    }

    pub fn set_framebuffer_state(&mut self, fb: FramebufferState) {
        self.state.framebuffer = fb;
        self.dirty |= DirtyFlags::FRAMEBUFFER;
    }

    pub fn set_viewports(&mut self, start: usize, viewports: &[Viewport]) {
        for (slot, vp) in self.state.viewports.iter_mut().skip(start).zip(viewports) {
            *slot = *vp;
        }
        self.dirty |= DirtyFlags::VIEWPORT;
    }

    pub fn set_scissors(&mut self, start: usize, scissors: &[ScissorRect]) {
        for (slot, scissor) in self.state.scissors.iter_mut().skip(start).zip(scissors) {
            *slot = *scissor;
        }
        self.dirty |= DirtyFlags::SCISSOR;
    }

    pub fn create_shader(&self, desc: ShaderDescription) -> Arc<ShaderObject> {
        self.screen.create_shader(desc)
    }

    /// Unbind `shader` and release its variants once no queued draw can
    /// still call into them.
    pub fn delete_shader(&mut self, shader: Arc<ShaderObject>) {
        let stage = shader.stage();
        if self.state.shaders[stage.index()]
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, &shader))
        {
            self.bind_shader(stage, None);
        }
        tracing::debug!(shader = %shader.label(), variants = shader.variant_count(), "deferring shader deletion");
        defer(Some(&self.fence), DeferredWork::ReleaseShader(shader));
    }

    /// Unbind `elements` and release its fetch variants behind the fence.
    pub fn delete_vertex_elements(&mut self, elements: Arc<VertexElements>) {
        if self
            .state
            .vertex_elements
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, &elements))
        {
            self.set_vertex_elements(None);
        }
        defer(
            Some(&self.fence),
            DeferredWork::ReleaseVariants(elements.take_variants()),
        );
    }

    /// Clear the attachments in `mask` over the whole framebuffer.
    pub fn clear(&mut self, mask: AttachmentMask, values: ClearValues) {
        self.resolve(ResolveMode::ClearOnly);

        let targets = self.tiles.targets();
        let bound = AttachmentSlot::all()
            .filter(|slot| targets[slot.index()].is_some())
            .fold(AttachmentMask::empty(), |acc, slot| acc | slot.mask());
        let mask = mask & bound;
        if mask.is_empty() {
            return;
        }

        let fb = &self.state.framebuffer;
        self.backend
            .clear(self.backend_ctx, mask, values, Rect::full(fb.width, fb.height));
        let submission = self.fence.write() + 1;
        for slot in mask.slots() {
            if let Some(binding) = &targets[slot.index()] {
                binding.resource.tracker().mark_written(submission);
            }
        }
        self.tiles.mark_written(mask);
        tracing::trace!(ctx = self.backend_ctx.0, ?mask, "clear");
    }

    /// Store every dirty attachment, then submit the fence. Returns the
    /// submitted fence value.
    pub fn flush(&mut self) -> u64 {
        let mask = self.tiles.store_if_dirty(AttachmentMask::all());
        if !mask.is_empty() {
            self.backend
                .store_tiles(self.backend_ctx, mask, TileState::Resolved, WHOLE_SURFACE);
            self.stats.inc_tile_stores();
        }
        self.link().submit()
    }

    /// Flush and wait for all of this context's work to complete.
    pub fn finish(&mut self) {
        let value = self.flush();
        self.fence.wait_for(value);
    }

    /// Store `resource`'s dirty hot tiles if it is attached here. With
    /// `invalidate` set, every bound slot holding it is dropped as well so
    /// later tile accesses reload from linear storage.
    pub(crate) fn sync_attachment(&mut self, resource: &Resource, invalidate: bool) -> bool {
        let bound = self.tiles.slots_bound_to(resource);
        if bound.is_empty() {
            return false;
        }
        let post = if invalidate {
            TileState::Invalid
        } else {
            TileState::Resolved
        };
        let stored = self.tiles.store_resource(resource);
        if !stored.is_empty() {
            self.backend
                .store_tiles(self.backend_ctx, stored, post, WHOLE_SURFACE);
            self.stats.inc_tile_stores();
        }
        let rest = bound - stored;
        if invalidate && !rest.is_empty() {
            self.backend
                .invalidate_tiles(self.backend_ctx, rest, WHOLE_SURFACE);
            self.stats.inc_tile_invalidates();
        }
        !stored.is_empty()
    }

    /// Release `resource` once in-flight rendering is done with it.
    ///
    /// Display targets are synchronous: everything is finished and the
    /// external memory destroyed before returning.
    pub fn destroy_resource(&mut self, resource: Resource) {
        if !self.tiles.slots_bound_to(&resource).is_empty() {
            tracing::warn!(resource = %resource.id(), "destroying a resource still bound as a render target");
        }
        if self.sync_attachment(&resource, true) {
            self.link().submit();
        }
        if self.state.framebuffer.unbind(&resource) {
            self.dirty |= DirtyFlags::FRAMEBUFFER;
        }

        if resource.is_display_target() {
            self.finish();
            resource.tracker().mark_unused();
            resource.destroy_display_target();
            return;
        }
        resource.tracker().mark_unused();
        defer(Some(&self.fence), DeferredWork::FreeResource(resource));
    }

    /// Take over a resource last rendered by another context.
    ///
    /// Waits for everything `producer` has submitted, then drops any hot tiles
    /// this context holds for the resource since they may be stale.
    pub fn acquire_shared(&mut self, resource: &Resource, producer: &Fence) {
        producer.finish();
        let bound = self.tiles.slots_bound_to(resource);
        if bound.is_empty() {
            return;
        }
        let discarded = self.tiles.discard(bound);
        if !discarded.is_empty() {
            tracing::warn!(
                resource = %resource.id(),
                mask = ?discarded,
                "discarding unstored writes to a shared resource"
            );
        }
        self.backend
            .invalidate_tiles(self.backend_ctx, bound, WHOLE_SURFACE);
        self.stats.inc_tile_invalidates();
    }

    /// Flush, wait for the backend, release every context-owned buffer and
    /// variant, and tear down the backend context. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.flush();
        let variants = self.blend_cache.drain();
        let link = FenceLink::new(&self.fence, &*self.backend, self.backend_ctx);
        self.scratch.release(link);
        defer(Some(&self.fence), DeferredWork::ReleaseVariants(variants));
        link.flush_and_finish();

        self.backend.destroy_context(self.backend_ctx);
        self.fence.run_all_deferred();
        tracing::debug!(ctx = self.backend_ctx.0, "destroyed context");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("ctx", &self.backend_ctx)
            .field("fence", &self.fence)
            .field("dirty", &self.dirty)
            .field("scratch", &self.scratch)
            .field("blend_variants", &self.blend_cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::testing::{Call, RecordingBackend};
    use crate::draw::DrawInfo;
    use crate::resource::{BindFlags, Format, ResourceDesc};
    use crate::shader::{PassthroughCompiler, ShaderInfo, VariantKind};
    use crate::state::PrimitiveMode;

    fn setup(backend: RecordingBackend) -> (Arc<RecordingBackend>, Context) {
        let backend = Arc::new(backend);
        let screen = Screen::new(
            EngineConfig::default(),
            backend.clone(),
            Arc::new(PassthroughCompiler::new()),
        )
        .unwrap();
        let ctx = screen.create_context();
        (backend, ctx)
    }

    fn render_target(ctx: &Context) -> Resource {
        ctx.screen()
            .create_resource(ResourceDesc::texture_2d(Format::Rgba8Unorm, 8, 8, BindFlags::RENDER_TARGET))
            .unwrap()
    }

    fn bind_shaders(ctx: &mut Context) {
        for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
            let shader = ctx.create_shader(ShaderDescription::new(stage, vec![0u8], ShaderInfo::default()));
            ctx.bind_shader(stage, Some(shader));
        }
    }

    const CLEAR: ClearValues = ClearValues {
        color: [0.0, 0.0, 0.0, 1.0],
        depth: 1.0,
        stencil: 0,
    };

    #[test]
    fn draw_without_shaders_is_skipped() {
        let (backend, mut ctx) = setup(RecordingBackend::inline());
        let rt = render_target(&ctx);
        ctx.set_framebuffer_state(FramebufferState::new(&[rt], None));
        ctx.draw(&DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3));
        assert_eq!(backend.count(|c| matches!(c, Call::Draw(_))), 0);
        assert_eq!(ctx.stats().snapshot().draws_skipped, 1);
        // Nothing was consumed; the next draw still sees every bit.
        assert_eq!(ctx.dirty(), DirtyFlags::all());
    }

    #[test]
    fn flush_stores_once_and_submits() {
        let (backend, mut ctx) = setup(RecordingBackend::inline());
        let rt = render_target(&ctx);
        ctx.set_framebuffer_state(FramebufferState::new(&[rt.clone()], None));
        ctx.clear(AttachmentMask::COLOR | AttachmentMask::DEPTH, CLEAR);
        assert_eq!(backend.count(|c| *c == Call::Clear(AttachmentMask::COLOR0)), 1);
        assert!(rt.tracker().has_pending_writes());

        assert_eq!(ctx.flush(), 1);
        assert_eq!(ctx.flush(), 2);
        assert_eq!(
            backend.count(|c| *c == Call::StoreTiles(AttachmentMask::COLOR0, TileState::Resolved)),
            1
        );
        assert_eq!(ctx.fence().read(), 2);
    }

    #[test]
    fn deleted_shader_outlives_pending_fence() {
        let (backend, mut ctx) = setup(RecordingBackend::deferred());
        let rt = render_target(&ctx);
        ctx.set_framebuffer_state(FramebufferState::new(&[rt], None));
        bind_shaders(&mut ctx);
        ctx.draw(&DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3));
        assert!(backend.bound_shader(ctx.backend_context(), VariantKind::Vertex).is_some());

        let vs = ctx.state().shader(ShaderStage::Vertex).cloned().unwrap();
        ctx.delete_shader(Arc::clone(&vs));
        assert!(ctx.state().shader(ShaderStage::Vertex).is_none());
        assert!(!vs.is_released());

        ctx.flush();
        assert!(!vs.is_released());
        backend.complete_all();
        assert!(vs.is_released());

        backend.go_inline();
        let fs = ctx.state().shader(ShaderStage::Fragment).cloned().unwrap();
        ctx.delete_shader(Arc::clone(&fs));
        ctx.destroy();
        assert!(fs.is_released());
        assert_eq!(backend.pending_syncs(), 0);
    }

    #[test]
    fn destroyed_resource_is_freed_behind_the_fence() {
        let (backend, mut ctx) = setup(RecordingBackend::deferred());
        let buffer = ctx
            .screen()
            .create_resource(ResourceDesc::buffer(64, BindFlags::VERTEX_BUFFER))
            .unwrap();
        let handle = buffer.clone();
        ctx.destroy_resource(buffer);
        assert!(!handle.is_released());
        ctx.flush();
        backend.go_inline();
        assert!(handle.is_released());
    }

    #[test]
    fn destroying_a_bound_target_unbinds_it() {
        let (backend, mut ctx) = setup(RecordingBackend::inline());
        let rt = render_target(&ctx);
        let handle = rt.clone();
        ctx.set_framebuffer_state(FramebufferState::new(&[rt.clone()], None));
        bind_shaders(&mut ctx);
        ctx.draw(&DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3));

        ctx.destroy_resource(rt);
        assert!(ctx.state().framebuffer.cbufs[0].is_none());
        assert!(ctx.dirty().contains(DirtyFlags::FRAMEBUFFER));

        backend.clear_calls();
        ctx.draw(&DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3));
        let targets = backend
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::SetRenderTargets(targets) => Some(targets),
                _ => None,
            })
            .expect("targets are rebound");
        assert!(targets.iter().all(Option::is_none));
        assert!(ctx.tiles().slots_bound_to(&handle).is_empty());
        assert!(!handle.tracker().has_pending_writes());

        ctx.flush();
        assert!(handle.is_released());
    }

    #[test]
    fn acquire_shared_invalidates_bound_tiles() {
        let (backend, mut ctx) = setup(RecordingBackend::inline());
        let rt = render_target(&ctx);
        ctx.set_framebuffer_state(FramebufferState::new(&[rt.clone()], None));
        ctx.clear(AttachmentMask::COLOR0, CLEAR);
        backend.clear_calls();

        let producer = Fence::new();
        ctx.acquire_shared(&rt, &producer);
        assert_eq!(backend.calls(), vec![Call::InvalidateTiles(AttachmentMask::COLOR0)]);
        assert!(ctx.tiles().dirty_mask().is_empty());
    }

    #[test]
    fn destroy_is_idempotent_and_drains_work() {
        let (backend, mut ctx) = setup(RecordingBackend::inline());
        ctx.destroy();
        ctx.destroy();
        assert_eq!(backend.count(|c| *c == Call::DestroyContext), 1);
        assert_eq!(ctx.fence().queued_work(), 0);
    }
}
