//! Derived-state resolution.
//!
//! Before a draw the dirty mask is walked in a fixed order and every affected
//! category is recomputed and pushed to the backend. The framebuffer goes
//! first because tile stores must reach the backend while the old targets are
//! still bound; shader variants come before the attribute layout that links
//! them; resource status is marked last, once every buffer is known.

use crate::backend::{
    AttachmentMask, AttachmentSlot, BackendBlendState, BackendDepthStencil, BackendRasterState,
    BufferSource, ConstantView, DrawContext, IndexBufferView, TileState, VertexBufferView,
};
use crate::config::EngineConfig;
use crate::draw::{DrawInfo, IndexSource};
use crate::fence::FenceLink;
use crate::lock;
use crate::resource::{Format, Plane, Resource};
use crate::scratch::{ClientStaging, ScratchAllocator, ScratchClass};
use crate::shader::key::{BlendKey, FsKey, GsKey, TcsKey, TesKey, VsKey};
use crate::shader::{
    compile_or_panic, CompilationService, CompileKey, CompileRequest, Semantic, SemanticName,
    ShaderEntry, ShaderStage, VariantCache, VariantKey, VariantKind,
};
use crate::stats::EngineStats;
use crate::tile_sync::{render_targets, TileSynchronizer, WHOLE_SURFACE};

use super::linkage::{derive_attribute_layout, AttributeLayout};
use super::viewport::{
    derive_scissor, derive_viewport, BackendViewport, Rect, ViewportMatrix, MAX_VIEWPORTS,
};
use super::{ConstantBufferBinding, DirtyFlags, PipelineState, VertexBufferSource};

/// How much state a resolve must bring up to date.
#[derive(Debug, Clone, Copy)]
pub enum ResolveMode<'a> {
    Draw(&'a DrawInfo<'a>),
    /// Framebuffer, rasterizer and viewport only.
    ClearOnly,
}

/// Backend state most recently pushed by a context.
#[derive(Debug, Clone, Default)]
pub struct DerivedState {
    pub raster: BackendRasterState,
    pub viewports: Vec<BackendViewport>,
    pub matrices: Vec<ViewportMatrix>,
    pub scissors: Vec<Rect>,
    pub vertex_buffers: Vec<VertexBufferView>,
    pub index_buffer: Option<IndexBufferView>,
    pub shaders: [Option<ShaderEntry>; ShaderStage::COUNT],
    pub fetch: Option<ShaderEntry>,
    pub depth_stencil: BackendDepthStencil,
    pub blend: BackendBlendState,
    pub layout: AttributeLayout,
    pub draw_context: DrawContext,
    /// Primitive class the bound fragment variant was keyed for.
    fs_polygon: Option<bool>,
}

pub(crate) struct Resolved {
    /// Dirty mask to carry into the next resolve.
    pub dirty: DirtyFlags,
    /// A client vertex buffer was too large to stage; the draw must block.
    pub client_bypass: bool,
}

/// Everything a resolve touches, borrowed from its context.
pub(crate) struct Resolver<'a> {
    pub state: &'a PipelineState,
    pub derived: &'a mut DerivedState,
    pub scratch: &'a mut ScratchAllocator,
    pub tiles: &'a mut TileSynchronizer,
    pub blend_cache: &'a mut VariantCache,
    pub link: FenceLink<'a>,
    pub compiler: &'a dyn CompilationService,
    pub config: &'a EngineConfig,
    pub stats: &'a EngineStats,
}

fn writes_viewport_index(state: &PipelineState) -> bool {
    state.last_vertex_stage().is_some_and(|shader| {
        shader
            .info()
            .output_slot(Semantic::new(SemanticName::ViewportIndex, 0))
            .is_some()
    })
}

fn viewport_count(state: &PipelineState) -> usize {
    if writes_viewport_index(state) {
        MAX_VIEWPORTS
    } else {
        1
    }
}

pub(crate) fn derive_raster(state: &PipelineState, config: &EngineConfig) -> BackendRasterState {
    let rs = &state.rasterizer;
    let samples = state.framebuffer.samples();
    let multisample = (rs.multisample || config.msaa_force_enable) && samples > 1;
    let point_size_slot = state
        .last_vertex_stage()
        .and_then(|shader| {
            shader
                .info()
                .output_slot(Semantic::new(SemanticName::PointSize, 0))
        })
        .and_then(|slot| u8::try_from(slot).ok());

    BackendRasterState {
        cull_face: rs.cull_face,
        front_ccw: rs.front_ccw,
        fill_front: rs.fill_front,
        fill_back: rs.fill_back,
        scissor_enable: rs.scissor,
        multisample,
        sample_count: if multisample { samples } else { 1 },
        point_size: rs.point_size,
        point_size_per_vertex: rs.point_size_per_vertex && point_size_slot.is_some(),
        point_sprite: rs.point_quad_rasterization,
        line_width: rs.line_width,
        depth_bias: rs.offset_units,
        slope_scaled_depth_bias: rs.offset_scale,
        depth_bias_clamp: rs.offset_clamp,
        clip_halfz: rs.clip_halfz,
        depth_clip: rs.depth_clip_near || rs.depth_clip_far,
        flatshade_first: rs.flatshade_first,
        rasterizer_discard: rs.rasterizer_discard,
        point_size_slot,
        reads_viewport_index: writes_viewport_index(state),
    }
}

fn derive_depth_stencil(state: &PipelineState) -> BackendDepthStencil {
    let dsa = &state.depth_stencil_alpha;
    let format = state.framebuffer.zsbuf.as_ref().map(Resource::format);
    let has_depth = format.is_some_and(Format::has_depth);
    let has_stencil = format.is_some_and(Format::has_stencil);
    BackendDepthStencil {
        depth_test: dsa.depth.enabled && has_depth,
        depth_write: dsa.depth.enabled && dsa.depth.write && has_depth,
        depth_func: dsa.depth.func,
        stencil_test: dsa.stencil[0].enabled && has_stencil,
        stencil: dsa.stencil,
        fused: format.is_some_and(Format::is_fused_depth_stencil),
    }
}

fn plane_size(resource: &Resource) -> u64 {
    resource.layout(Plane::Primary).size() as u64
}

impl<'a> Resolver<'a> {
    pub fn run(mut self, dirty: DirtyFlags, mode: ResolveMode<'_>) -> Resolved {
        let state = self.state;
        let backend = self.link.backend;
        let ctx = self.link.ctx;
        let shaders = DirtyFlags::any_shader();

        if dirty.contains(DirtyFlags::FRAMEBUFFER) {
            self.bind_framebuffer();
        }

        if dirty.intersects(DirtyFlags::RASTERIZER | DirtyFlags::FRAMEBUFFER | shaders) {
            self.derived.raster = derive_raster(state, self.config);
            backend.set_rasterizer_state(ctx, &self.derived.raster);
        }

        let viewport_deps = DirtyFlags::VIEWPORT | DirtyFlags::FRAMEBUFFER | DirtyFlags::RASTERIZER;
        if dirty.intersects(viewport_deps | shaders) {
            self.viewports();
        }

        let info = match mode {
            ResolveMode::Draw(info) => info,
            // Scissors, blend, depth/stencil, the fragment key and the
            // attribute layout also read the framebuffer and rasterizer, so
            // every bit stays armed for the next draw.
            ResolveMode::ClearOnly => {
                return Resolved {
                    dirty,
                    client_bypass: false,
                };
            }
        };

        let mut post_dirty = DirtyFlags::empty();

        if dirty.intersects(DirtyFlags::SCISSOR | DirtyFlags::FRAMEBUFFER | DirtyFlags::VIEWPORT | shaders) {
            let fb = &state.framebuffer;
            self.derived.scissors = state.scissors[..viewport_count(state)]
                .iter()
                .map(|scissor| derive_scissor(scissor, fb.width, fb.height))
                .collect();
            backend.set_scissor_rects(ctx, &self.derived.scissors);
        }

        let has_client_vertices = state
            .vertex_buffers
            .iter()
            .flatten()
            .any(|vb| vb.source == VertexBufferSource::Client);
        let mut client_bypass = false;
        if dirty.contains(DirtyFlags::VERTEX) || has_client_vertices {
            client_bypass = self.vertex_buffers(info);
        }
        if has_client_vertices {
            // Client bytes change with every draw.
            post_dirty |= DirtyFlags::VERTEX;
        }
        self.index_buffer(info);

        self.shaders(dirty, info);
        self.constants(dirty);
        self.samplers(dirty);

        if dirty.intersects(DirtyFlags::DEPTH_STENCIL_ALPHA | DirtyFlags::FRAMEBUFFER) {
            self.derived.depth_stencil = derive_depth_stencil(state);
            backend.set_depth_stencil_state(ctx, &self.derived.depth_stencil);
        }

        if dirty.intersects(
            DirtyFlags::BLEND
                | DirtyFlags::FRAMEBUFFER
                | DirtyFlags::DEPTH_STENCIL_ALPHA
                | DirtyFlags::SAMPLE_MASK,
        ) {
            self.blend();
        }

        if dirty.intersects(shaders | DirtyFlags::RASTERIZER) {
            let producer = state.last_vertex_stage();
            if let (Some(fs), Some(producer)) = (state.shader(ShaderStage::Fragment), producer) {
                self.derived.layout =
                    derive_attribute_layout(fs.info(), producer.info(), &state.rasterizer);
                backend.set_attribute_layout(ctx, &self.derived.layout);
            }
        }

        self.mark_resources(info);

        let dc = &mut self.derived.draw_context;
        dc.blend_color = state.blend_color;
        dc.alpha_ref = state.depth_stencil_alpha.alpha.reference;
        dc.stencil_ref = state.stencil_ref;
        dc.sample_mask = state.sample_mask;
        dc.clip_planes = state.clip.planes;
        dc.poly_stipple = state.poly_stipple;
        backend.set_draw_context(ctx, &self.derived.draw_context);

        Resolved {
            dirty: post_dirty,
            client_bypass,
        }
    }

    /// Store whatever the old targets hold, then swap in the new ones.
    fn bind_framebuffer(&mut self) {
        let backend = self.link.backend;
        let ctx = self.link.ctx;
        let targets = render_targets(&self.state.framebuffer);
        let plan = self.tiles.plan_rebind(&targets);

        if !plan.store.is_empty() {
            tracing::debug!(ctx = ctx.0, mask = ?plan.store, "storing detached render targets");
            backend.store_tiles(ctx, plan.store, TileState::Invalid, WHOLE_SURFACE);
            self.stats.inc_tile_stores();
        }
        backend.set_render_targets(ctx, &targets);
        if !plan.invalidate.is_empty() {
            backend.invalidate_tiles(ctx, plan.invalidate, WHOLE_SURFACE);
            self.stats.inc_tile_invalidates();
        }
        self.tiles.commit(&targets);

        if plan.needs_fence() {
            self.link.submit();
        }
    }

    fn viewports(&mut self) {
        let state = self.state;
        let rs = &state.rasterizer;
        let fb = &state.framebuffer;
        let count = viewport_count(state);

        self.derived.viewports.clear();
        self.derived.matrices.clear();
        for vp in &state.viewports[..count] {
            let (viewport, matrix) = derive_viewport(
                vp,
                fb.width,
                fb.height,
                rs.clip_halfz,
                rs.depth_clip_near,
                rs.depth_clip_far,
            );
            self.derived.viewports.push(viewport);
            self.derived.matrices.push(matrix);
        }
        self.derived.draw_context.num_viewports = count as u32;
        self.link
            .backend
            .set_viewports(self.link.ctx, &self.derived.viewports, &self.derived.matrices);
    }

    /// Byte range `[start, end)` of a client buffer the draw can touch.
    fn client_range(&self, index: u32, stride: u32, info: &DrawInfo<'_>, len: usize) -> (usize, usize) {
        let elements = self
            .state
            .vertex_elements
            .as_deref()
            .map(|ve| ve.elements())
            .unwrap_or_default();
        let reads = || elements.iter().filter(|el| el.vertex_buffer_index == index);
        let instanced = reads().any(|el| el.instance_divisor != 0);
        let extent = reads()
            .map(|el| (el.src_offset + el.format.size()) as usize)
            .max()
            .unwrap_or(stride as usize);

        match info.vertex_range() {
            Some((min, max)) if !instanced => {
                let stride = stride as usize;
                let start = (min as usize).saturating_mul(stride).min(len);
                let end = (max as usize)
                    .saturating_mul(stride)
                    .saturating_add(extent)
                    .min(len);
                (start, end.max(start))
            }
            _ => (0, len),
        }
    }

    /// Returns `true` when some client buffer must be read in place.
    fn vertex_buffers(&mut self, info: &DrawInfo<'_>) -> bool {
        let state = self.state;
        let mut bypass = false;
        let mut views = Vec::new();

        for (index, binding) in state.vertex_buffers.iter().enumerate() {
            let Some(binding) = binding else { continue };
            let index = index as u32;
            match &binding.source {
                VertexBufferSource::Resource(resource) => views.push(VertexBufferView {
                    index,
                    source: BufferSource::Resource {
                        resource: resource.clone(),
                        offset: binding.offset,
                    },
                    base: 0,
                    size: plane_size(resource).saturating_sub(binding.offset),
                    stride: binding.stride,
                }),
                VertexBufferSource::Client => {
                    let Some(client) = info.client_vertex_buffers.iter().find(|c| c.index == index)
                    else {
                        tracing::warn!(slot = index, "client vertex buffer bound without data");
                        continue;
                    };
                    let (start, end) = self.client_range(index, binding.stride, info, client.bytes.len());
                    if start == end {
                        continue;
                    }
                    let staged = self.scratch.stage_client(
                        ScratchClass::Vertex,
                        &client.bytes[start..end],
                        self.link,
                    );
                    match staged {
                        ClientStaging::Staged(region) => views.push(VertexBufferView {
                            index,
                            source: BufferSource::Scratch(region),
                            base: start as u64,
                            size: (end - start) as u64,
                            stride: binding.stride,
                        }),
                        ClientStaging::Bypass => {
                            bypass = true;
                            views.push(VertexBufferView {
                                index,
                                source: BufferSource::Client,
                                base: 0,
                                size: client.bytes.len() as u64,
                                stride: binding.stride,
                            });
                        }
                    }
                }
            }
        }

        self.derived.vertex_buffers = views;
        self.link
            .backend
            .set_vertex_buffers(self.link.ctx, &self.derived.vertex_buffers);
        bypass
    }

    fn index_buffer(&mut self, info: &DrawInfo<'_>) {
        let view = match info.index {
            None => None,
            Some(index) => {
                let size = index.size.bytes();
                match index.source {
                    IndexSource::Resource { resource, offset } => Some(IndexBufferView {
                        source: BufferSource::Resource {
                            resource: resource.clone(),
                            offset,
                        },
                        index_size: index.size,
                        count: (plane_size(resource).saturating_sub(offset) / size as u64) as u32,
                    }),
                    IndexSource::Client(bytes) => {
                        let len = bytes.len() - bytes.len() % size;
                        (len > 0).then(|| IndexBufferView {
                            source: BufferSource::Scratch(self.scratch.stage(
                                ScratchClass::Index,
                                Some(bytes),
                                len,
                                self.link,
                            )),
                            index_size: index.size,
                            count: (len / size) as u32,
                        })
                    }
                }
            }
        };

        if view.is_none() && self.derived.index_buffer.is_none() {
            return;
        }
        self.derived.index_buffer = view;
        self.link
            .backend
            .set_index_buffer(self.link.ctx, self.derived.index_buffer.as_ref());
    }

    fn shaders(&mut self, dirty: DirtyFlags, info: &DrawInfo<'_>) {
        let state = self.state;
        let compiler = self.compiler;
        let stats = self.stats;
        let backend = self.link.backend;
        let ctx = self.link.ctx;

        let deps = DirtyFlags::any_shader()
            | DirtyFlags::FRAMEBUFFER
            | DirtyFlags::RASTERIZER
            | DirtyFlags::SAMPLER
            | DirtyFlags::SAMPLER_VIEW
            | DirtyFlags::CLIP;

        if dirty.intersects(deps) {
            // Downstream stages first: their keys do not depend on upstream
            // variants, only on upstream reflection data.
            for stage in [
                ShaderStage::Geometry,
                ShaderStage::TessEval,
                ShaderStage::TessControl,
                ShaderStage::Vertex,
            ] {
                let entry = state.shader(stage).map(|shader| match stage {
                    ShaderStage::Vertex => {
                        shader.get_or_compile(&VsKey::generate(shader, state), compiler, stats)
                    }
                    ShaderStage::TessControl => {
                        shader.get_or_compile(&TcsKey::generate(shader, state), compiler, stats)
                    }
                    ShaderStage::TessEval => {
                        shader.get_or_compile(&TesKey::generate(shader, state), compiler, stats)
                    }
                    _ => shader.get_or_compile(&GsKey::generate(shader, state), compiler, stats),
                });
                self.derived.shaders[stage.index()] = entry.clone();
                backend.set_shader(ctx, stage.into(), entry);
            }
        }

        if dirty.intersects(DirtyFlags::VERTEX | DirtyFlags::VS) {
            let fetch = state.vertex_elements.as_ref().map(|ve| {
                let key = ve.fetch_key();
                let (entry, compiled) = lock(ve.variants()).get_or_insert_with(key.as_bytes(), || {
                    let request = CompileRequest {
                        shader: None,
                        key: CompileKey::Fetch(key),
                    };
                    compile_or_panic(compiler, &request, "vertex fetch")
                });
                if compiled {
                    stats.inc_variant_misses();
                    stats.inc_variant_compiles();
                    tracing::debug!(elements = ve.elements().len(), "compiled vertex fetch variant");
                } else {
                    stats.inc_variant_hits();
                }
                entry
            });
            self.derived.fetch = fetch.clone();
            backend.set_shader(ctx, VariantKind::Fetch, fetch);
        }

        let polygon = info.mode.is_polygon();
        if dirty.intersects(deps) || self.derived.fs_polygon != Some(polygon) {
            let entry = state.shader(ShaderStage::Fragment).map(|fs| {
                fs.get_or_compile(&FsKey::generate(fs, state, info.mode), compiler, stats)
            });
            self.derived.fs_polygon = Some(polygon);
            self.derived.shaders[ShaderStage::Fragment.index()] = entry.clone();
            backend.set_shader(ctx, VariantKind::Fragment, entry);
        }
    }

    fn constants(&mut self, dirty: DirtyFlags) {
        let state = self.state;
        for stage in ShaderStage::ALL {
            let binding = &state.constant_buffers[stage.index()];
            let user = matches!(binding, Some(ConstantBufferBinding::User(_)));
            if !user && !dirty.contains(DirtyFlags::constants(stage)) {
                continue;
            }
            let view = match binding {
                None => None,
                Some(ConstantBufferBinding::Resource {
                    resource,
                    offset,
                    size,
                }) => Some(ConstantView {
                    source: BufferSource::Resource {
                        resource: resource.clone(),
                        offset: *offset,
                    },
                    size: *size,
                }),
                Some(ConstantBufferBinding::User(bytes)) if bytes.is_empty() => None,
                Some(ConstantBufferBinding::User(bytes)) => {
                    let region = self.scratch.stage(
                        ScratchClass::Constants(stage),
                        Some(bytes),
                        bytes.len(),
                        self.link,
                    );
                    Some(ConstantView {
                        source: BufferSource::Scratch(region),
                        size: bytes.len() as u64,
                    })
                }
            };
            self.derived.draw_context.constants[stage.index()] = view;
        }
    }

    fn samplers(&mut self, dirty: DirtyFlags) {
        let state = self.state;
        // A render target sampled by this draw must reach linear storage
        // first; the sampler reads linear storage, never hot tiles.
        for view in state.sampler_views.iter().flatten().flatten() {
            let mask = self.tiles.store_resource(&view.resource);
            if !mask.is_empty() {
                tracing::debug!(resource = %view.resource.id(), ?mask, "storing sampled render target");
                self.link
                    .backend
                    .store_tiles(self.link.ctx, mask, TileState::Resolved, WHOLE_SURFACE);
                self.stats.inc_tile_stores();
            }
        }

        if dirty.contains(DirtyFlags::SAMPLER_VIEW) {
            for stage in ShaderStage::ALL {
                self.derived.draw_context.sampler_views[stage.index()] =
                    state.sampler_views[stage.index()].to_vec();
            }
        }
    }

    fn blend(&mut self) {
        let state = self.state;
        let compiler = self.compiler;
        let mut blend = BackendBlendState {
            alpha_to_coverage: state.blend.alpha_to_coverage,
            alpha_to_one: state.blend.alpha_to_one,
            targets: Default::default(),
        };
        for index in 0..state.framebuffer.nr_cbufs() {
            let Some(key) = BlendKey::generate(state, index) else {
                continue;
            };
            let (entry, compiled) = self.blend_cache.get_or_insert_with(key.as_bytes(), || {
                let request = CompileRequest {
                    shader: None,
                    key: key.compile_key(),
                };
                compile_or_panic(compiler, &request, "blend")
            });
            if compiled {
                self.stats.inc_blend_compiles();
                tracing::debug!(slot = index, variants = self.blend_cache.len(), "compiled blend variant");
            }
            blend.targets[index] = Some(entry);
        }
        self.derived.blend = blend;
        self.link
            .backend
            .set_blend_state(self.link.ctx, &self.derived.blend);
    }

    /// Flag every resource the draw reads or writes as in use.
    fn mark_resources(&mut self, info: &DrawInfo<'_>) {
        let state = self.state;
        let submission = self.link.fence.write() + 1;
        for resource in state.read_resources() {
            resource.tracker().mark_read(submission);
        }
        if let Some(index) = info.index {
            if let IndexSource::Resource { resource, .. } = index.source {
                resource.tracker().mark_read(submission);
            }
        }

        let fb = &state.framebuffer;
        let mut written = AttachmentMask::empty();
        for (i, cbuf) in fb.cbufs.iter().enumerate() {
            if let Some(cbuf) = cbuf {
                cbuf.tracker().mark_written(submission);
                written |= AttachmentSlot::Color(i as u8).mask();
            }
        }
        if let Some(zs) = &fb.zsbuf {
            let ds = &self.derived.depth_stencil;
            if ds.depth_write || ds.stencil_test {
                zs.tracker().mark_written(submission);
                written |= AttachmentMask::DEPTH | AttachmentMask::STENCIL;
            }
        }
        self.tiles.mark_written(written);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::testing::{Call, RecordingBackend};
    use crate::backend::{Backend, BackendContextId, ClientVertexBuffer};
    use crate::fence::Fence;
    use crate::resource::{BindFlags, ResourceDesc, ResourceId};
    use crate::shader::{
        PassthroughCompiler, ShaderDescription, ShaderId, ShaderInfo, ShaderObject,
    };
    use crate::state::{
        FramebufferState, PrimitiveMode, VertexBufferBinding, VertexElement, VertexElements,
        VertexFormat,
    };

    struct Harness {
        backend: RecordingBackend,
        ctx: BackendContextId,
        fence: Arc<Fence>,
        compiler: PassthroughCompiler,
        config: EngineConfig,
        stats: Arc<EngineStats>,
        derived: DerivedState,
        scratch: ScratchAllocator,
        tiles: TileSynchronizer,
        blend_cache: VariantCache,
    }

    impl Harness {
        fn new(config: EngineConfig) -> Self {
            let backend = RecordingBackend::inline();
            let ctx = backend.create_context();
            let stats = Arc::new(EngineStats::new());
            Self {
                ctx,
                fence: Fence::with_stats(Arc::clone(&stats)),
                compiler: PassthroughCompiler::new(),
                scratch: ScratchAllocator::new(
                    config.max_draws_in_flight,
                    config.client_copy_limit,
                    Arc::clone(&stats),
                ),
                config,
                stats,
                derived: DerivedState::default(),
                tiles: TileSynchronizer::new(),
                blend_cache: VariantCache::new(),
                backend,
            }
        }

        fn resolve(&mut self, state: &PipelineState, dirty: DirtyFlags, mode: ResolveMode<'_>) -> Resolved {
            Resolver {
                state,
                derived: &mut self.derived,
                scratch: &mut self.scratch,
                tiles: &mut self.tiles,
                blend_cache: &mut self.blend_cache,
                link: FenceLink::new(&self.fence, &self.backend, self.ctx),
                compiler: &self.compiler,
                config: &self.config,
                stats: &self.stats,
            }
            .run(dirty, mode)
        }
    }

    fn target(id: u32, samples: u32) -> Resource {
        Resource::new_owned(
            ResourceId(id),
            ResourceDesc::texture_2d(Format::Rgba8Unorm, 8, 8, BindFlags::RENDER_TARGET)
                .with_samples(samples),
            None,
        )
    }

    fn shader(id: u64, stage: ShaderStage, outputs: &[Semantic]) -> Arc<ShaderObject> {
        let info = ShaderInfo {
            outputs: outputs.to_vec(),
            ..Default::default()
        };
        Arc::new(ShaderObject::new(
            ShaderId(id),
            ShaderDescription::new(stage, vec![0u8; 4], info),
        ))
    }

    fn drawable_state() -> PipelineState {
        let mut state = PipelineState {
            framebuffer: FramebufferState::new(&[target(1, 1)], None),
            ..Default::default()
        };
        let position = Semantic::new(SemanticName::Position, 0);
        state.shaders[ShaderStage::Vertex.index()] = Some(shader(1, ShaderStage::Vertex, &[position]));
        state.shaders[ShaderStage::Fragment.index()] = Some(shader(2, ShaderStage::Fragment, &[]));
        state
    }

    fn release(state: &PipelineState) {
        for shader in state.shaders.iter().flatten() {
            shader.release_variants();
        }
    }

    #[test]
    fn clear_only_resolve_stops_after_viewports() {
        let mut h = Harness::new(EngineConfig::default());
        let state = drawable_state();
        let resolved = h.resolve(&state, DirtyFlags::all(), ResolveMode::ClearOnly);

        assert_eq!(resolved.dirty, DirtyFlags::all());
        assert_eq!(h.backend.count(|c| matches!(c, Call::SetShader(..))), 0);
        assert_eq!(h.backend.count(|c| matches!(c, Call::SetRenderTargets(_))), 1);
        assert_eq!(h.backend.count(|c| matches!(c, Call::SetViewports(_))), 1);
        assert_eq!(h.backend.count(|c| matches!(c, Call::SetDrawContext)), 0);
    }

    #[test]
    fn draw_resolve_binds_every_stage_once() {
        let mut h = Harness::new(EngineConfig::default());
        let state = drawable_state();
        let info = DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3);
        let resolved = h.resolve(&state, DirtyFlags::all(), ResolveMode::Draw(&info));

        assert_eq!(resolved.dirty, DirtyFlags::empty());
        assert!(!resolved.client_bypass);
        assert!(h.backend.bound_shader(h.ctx, VariantKind::Vertex).is_some());
        assert!(h.backend.bound_shader(h.ctx, VariantKind::Fragment).is_some());
        assert!(h.backend.bound_shader(h.ctx, VariantKind::Geometry).is_none());
        assert_eq!(h.backend.bound_blend(h.ctx).map(|b| b.targets.iter().flatten().count()), Some(1));
        assert_eq!(h.stats.snapshot().blend_compiles, 1);
        assert!(state.framebuffer.cbufs[0]
            .as_ref()
            .is_some_and(|rt| rt.tracker().has_pending_writes()));

        // Nothing dirty and the same primitive class: only the draw context.
        h.backend.clear_calls();
        h.resolve(&state, DirtyFlags::empty(), ResolveMode::Draw(&info));
        assert_eq!(h.backend.calls(), vec![Call::SetDrawContext]);

        // Switching to points rekeys the fragment shader alone.
        h.backend.clear_calls();
        let points = DrawInfo::arrays(PrimitiveMode::Points, 0, 3);
        h.resolve(&state, DirtyFlags::empty(), ResolveMode::Draw(&points));
        assert_eq!(
            h.backend.calls(),
            vec![Call::SetShader(VariantKind::Fragment, true), Call::SetDrawContext]
        );
        release(&state);
    }

    #[test]
    fn clear_between_draws_keeps_framebuffer_consumers_armed() {
        let mut h = Harness::new(EngineConfig::default());
        let mut state = drawable_state();
        let info = DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3);
        h.resolve(&state, DirtyFlags::all(), ResolveMode::Draw(&info));
        let one_cbuf_fs = h.backend.bound_shader(h.ctx, VariantKind::Fragment).unwrap();
        assert_eq!(h.backend.bound_blend(h.ctx).map(|b| b.targets.iter().flatten().count()), Some(1));

        state.framebuffer = FramebufferState::new(&[target(4, 1), target(5, 1)], None);
        let cleared = h.resolve(&state, DirtyFlags::FRAMEBUFFER, ResolveMode::ClearOnly);
        assert!(cleared.dirty.contains(DirtyFlags::FRAMEBUFFER));

        h.backend.clear_calls();
        h.resolve(&state, cleared.dirty, ResolveMode::Draw(&info));
        assert_eq!(h.backend.bound_blend(h.ctx).map(|b| b.targets.iter().flatten().count()), Some(2));
        let two_cbuf_fs = h.backend.bound_shader(h.ctx, VariantKind::Fragment).unwrap();
        assert!(!two_cbuf_fs.same_as(&one_cbuf_fs));
        assert_eq!(h.backend.count(|c| matches!(c, Call::SetDepthStencilState(_))), 1);
        assert_eq!(h.backend.count(|c| matches!(c, Call::SetScissorRects(_))), 1);
        // Same targets as the clear bound: no second store or invalidate.
        assert_eq!(h.backend.count(|c| matches!(c, Call::StoreTiles(..) | Call::InvalidateTiles(_))), 0);
        release(&state);
    }

    #[test]
    fn vertex_change_pushes_fetch_even_when_unchanged() {
        let mut h = Harness::new(EngineConfig::default());
        let mut state = drawable_state();
        state.vertex_elements = Some(Arc::new(VertexElements::new(&[VertexElement {
            format: VertexFormat::Float32x4,
            ..Default::default()
        }])));
        let info = DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3);
        h.resolve(&state, DirtyFlags::all(), ResolveMode::Draw(&info));

        h.backend.clear_calls();
        h.resolve(&state, DirtyFlags::VERTEX, ResolveMode::Draw(&info));
        assert_eq!(h.backend.count(|c| *c == Call::SetShader(VariantKind::Fetch, true)), 1);
        release(&state);
    }

    #[test]
    fn raster_follows_forced_msaa() {
        let config = EngineConfig {
            msaa_force_enable: true,
            ..EngineConfig::default()
        };
        let mut state = drawable_state();
        state.framebuffer = FramebufferState::new(&[target(3, 4)], None);
        let raster = derive_raster(&state, &config);
        assert!(raster.multisample);
        assert_eq!(raster.sample_count, 4);

        let raster = derive_raster(&state, &EngineConfig::default());
        assert!(!raster.multisample);
        assert_eq!(raster.sample_count, 1);
        release(&state);
    }

    #[test]
    fn viewport_index_output_widens_viewports() {
        let mut h = Harness::new(EngineConfig::default());
        let mut state = drawable_state();
        state.shaders[ShaderStage::Vertex.index()] = Some(shader(
            7,
            ShaderStage::Vertex,
            &[
                Semantic::new(SemanticName::Position, 0),
                Semantic::new(SemanticName::ViewportIndex, 0),
            ],
        ));
        let info = DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3);
        h.resolve(&state, DirtyFlags::all(), ResolveMode::Draw(&info));
        assert_eq!(h.derived.viewports.len(), MAX_VIEWPORTS);
        assert_eq!(h.derived.scissors.len(), MAX_VIEWPORTS);
        assert!(h.derived.raster.reads_viewport_index);
        release(&state);
    }

    #[test]
    fn small_client_vertices_are_staged_and_large_ones_bypass() {
        let mut h = Harness::new(EngineConfig {
            client_copy_limit: 64,
            ..EngineConfig::default()
        });
        let mut state = drawable_state();
        state.vertex_elements = Some(Arc::new(VertexElements::new(&[VertexElement {
            format: VertexFormat::Float32x4,
            ..Default::default()
        }])));
        state.vertex_buffers[0] = Some(VertexBufferBinding::client(16));

        let bytes = vec![0u8; 16 * 8];
        let client = [ClientVertexBuffer { index: 0, bytes: &bytes }];
        let small = DrawInfo::arrays(PrimitiveMode::Triangles, 1, 3).with_client_vertex_buffers(&client);
        let resolved = h.resolve(&state, DirtyFlags::all(), ResolveMode::Draw(&small));
        assert!(!resolved.client_bypass);
        assert_eq!(resolved.dirty, DirtyFlags::VERTEX);
        let view = &h.derived.vertex_buffers[0];
        assert!(matches!(view.source, BufferSource::Scratch(_)));
        assert_eq!((view.base, view.size), (16, 48));

        let large = DrawInfo::arrays(PrimitiveMode::Triangles, 0, 8).with_client_vertex_buffers(&client);
        let resolved = h.resolve(&state, resolved.dirty, ResolveMode::Draw(&large));
        assert!(resolved.client_bypass);
        assert!(matches!(h.derived.vertex_buffers[0].source, BufferSource::Client));
        release(&state);
    }

    #[test]
    fn framebuffer_change_stores_dirty_targets_before_rebinding() {
        let mut h = Harness::new(EngineConfig::default());
        let mut state = drawable_state();
        let info = DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3);
        h.resolve(&state, DirtyFlags::all(), ResolveMode::Draw(&info));

        state.framebuffer = FramebufferState::new(&[target(9, 1)], None);
        h.backend.clear_calls();
        h.resolve(&state, DirtyFlags::FRAMEBUFFER, ResolveMode::ClearOnly);
        let calls = h.backend.calls();
        assert_eq!(calls[0], Call::StoreTiles(AttachmentMask::COLOR0, TileState::Invalid));
        assert!(matches!(calls[1], Call::SetRenderTargets(_)));
        assert_eq!(calls[2], Call::InvalidateTiles(AttachmentMask::COLOR0));
        assert!(calls.contains(&Call::Sync(1)));
        assert_eq!(h.fence.read(), 1);
        release(&state);
    }
}
