//! Execution backend abstraction.
//!
//! The frontend resolves pipeline state into the flattened structures below
//! and pushes each category through one setter. A setter replaces the whole
//! category; there are no partial updates. Every entry point names the
//! backend context it applies to.
//!
//! Work is queued in call order per context. `sync` asks the backend to run a
//! callback once everything queued before it has finished; that is the only
//! completion signal the frontend relies on.

mod soft;
pub mod testing;
mod tiles;
mod worker;

pub use soft::SoftwareBackend;
pub use tiles::{HotTileSurface, HOT_TILE_DIM};

use bitflags::bitflags;

use crate::resource::{Plane, Resource};
use crate::scratch::ScratchRegion;
use crate::shader::{ShaderEntry, ShaderStage, VariantKind};
use crate::state::linkage::AttributeLayout;
use crate::state::viewport::{BackendViewport, Rect, ViewportMatrix};
use crate::state::{
    CompareFunc, CullFace, FillMode, IndexSize, PrimitiveMode, SamplerView, StencilState,
    MAX_CLIP_PLANES, MAX_COLOR_BUFFERS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendContextId(pub u32);

pub const NUM_ATTACHMENTS: usize = MAX_COLOR_BUFFERS + 2;

/// One render-target slot of a backend context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentSlot {
    Color(u8),
    Depth,
    Stencil,
}

impl AttachmentSlot {
    pub fn index(self) -> usize {
        match self {
            AttachmentSlot::Color(i) => usize::from(i),
            AttachmentSlot::Depth => MAX_COLOR_BUFFERS,
            AttachmentSlot::Stencil => MAX_COLOR_BUFFERS + 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            i if i < MAX_COLOR_BUFFERS => Some(AttachmentSlot::Color(i as u8)),
            i if i == MAX_COLOR_BUFFERS => Some(AttachmentSlot::Depth),
            i if i == MAX_COLOR_BUFFERS + 1 => Some(AttachmentSlot::Stencil),
            _ => None,
        }
    }

    pub fn all() -> impl Iterator<Item = AttachmentSlot> {
        (0..NUM_ATTACHMENTS).filter_map(AttachmentSlot::from_index)
    }

    pub fn mask(self) -> AttachmentMask {
        AttachmentMask::from_bits_truncate(1 << self.index())
    }

    /// The other half of a fused depth/stencil surface.
    pub fn depth_stencil_partner(self) -> Option<Self> {
        match self {
            AttachmentSlot::Depth => Some(AttachmentSlot::Stencil),
            AttachmentSlot::Stencil => Some(AttachmentSlot::Depth),
            AttachmentSlot::Color(_) => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttachmentMask: u16 {
        const COLOR0 = 1 << 0;
        const COLOR1 = 1 << 1;
        const COLOR2 = 1 << 2;
        const COLOR3 = 1 << 3;
        const COLOR4 = 1 << 4;
        const COLOR5 = 1 << 5;
        const COLOR6 = 1 << 6;
        const COLOR7 = 1 << 7;
        const DEPTH = 1 << 8;
        const STENCIL = 1 << 9;
        const COLOR = 0xff;
    }
}

impl AttachmentMask {
    pub fn slots(self) -> impl Iterator<Item = AttachmentSlot> {
        AttachmentSlot::all().filter(move |slot| self.contains(slot.mask()))
    }
}

/// State of a hot tile relative to the resource's linear storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    /// Contents are stale; the next access reloads from linear storage.
    Invalid,
    /// Written since the last store.
    Dirty,
    /// Matches linear storage.
    Resolved,
}

/// A resource plane bound to an attachment slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceBinding {
    pub resource: Resource,
    pub plane: Plane,
}

impl SurfaceBinding {
    pub fn new(resource: Resource, plane: Plane) -> Self {
        Self { resource, plane }
    }
}

pub type RenderTargets = [Option<SurfaceBinding>; NUM_ATTACHMENTS];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendRasterState {
    pub cull_face: CullFace,
    pub front_ccw: bool,
    pub fill_front: FillMode,
    pub fill_back: FillMode,
    pub scissor_enable: bool,
    pub multisample: bool,
    pub sample_count: u32,
    pub point_size: f32,
    pub point_size_per_vertex: bool,
    pub point_sprite: bool,
    pub line_width: f32,
    pub depth_bias: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_bias_clamp: f32,
    pub clip_halfz: bool,
    pub depth_clip: bool,
    pub flatshade_first: bool,
    pub rasterizer_discard: bool,
    /// Output slot of the last vertex stage carrying the point size.
    pub point_size_slot: Option<u8>,
    pub reads_viewport_index: bool,
}

impl Default for BackendRasterState {
    fn default() -> Self {
        Self {
            cull_face: CullFace::None,
            front_ccw: true,
            fill_front: FillMode::Fill,
            fill_back: FillMode::Fill,
            scissor_enable: false,
            multisample: false,
            sample_count: 1,
            point_size: 1.0,
            point_size_per_vertex: false,
            point_sprite: false,
            line_width: 1.0,
            depth_bias: 0.0,
            slope_scaled_depth_bias: 0.0,
            depth_bias_clamp: 0.0,
            clip_halfz: false,
            depth_clip: true,
            flatshade_first: false,
            rasterizer_discard: false,
            point_size_slot: None,
            reads_viewport_index: false,
        }
    }
}

/// Where the bytes behind a buffer view live.
#[derive(Debug, Clone)]
pub enum BufferSource {
    /// Linear storage of a resource starting at `offset`.
    Resource { resource: Resource, offset: u64 },
    /// A staged copy in scratch space.
    Scratch(ScratchRegion),
    /// Client memory supplied with a blocking draw.
    Client,
}

impl BufferSource {
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            BufferSource::Resource { resource, .. } => Some(resource),
            BufferSource::Scratch(_) | BufferSource::Client => None,
        }
    }

    /// Copy `len` bytes starting `skip` bytes into the source.
    pub(crate) fn read(&self, skip: u64, len: usize) -> Option<Vec<u8>> {
        match self {
            BufferSource::Resource { resource, offset } => {
                resource.read_bytes(offset + skip, len).ok()
            }
            BufferSource::Scratch(region) => region.with_bytes(|bytes| {
                let start = usize::try_from(skip).ok()?;
                bytes.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
            }),
            BufferSource::Client => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexBufferView {
    pub index: u32,
    pub source: BufferSource,
    /// Binding-relative address of the first byte in `source`.
    pub base: u64,
    pub size: u64,
    pub stride: u32,
}

#[derive(Debug, Clone)]
pub struct IndexBufferView {
    pub source: BufferSource,
    pub index_size: IndexSize,
    /// Number of indices readable from `source`.
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct ConstantView {
    pub source: BufferSource,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BackendDepthStencil {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunc,
    pub stencil_test: bool,
    pub stencil: [StencilState; 2],
    /// Depth and stencil live in one fused surface.
    pub fused: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BackendBlendState {
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
    /// Blend function per bound color buffer.
    pub targets: [Option<ShaderEntry>; MAX_COLOR_BUFFERS],
}

/// Per-draw values snapshotted into each queued draw.
#[derive(Debug, Clone)]
pub struct DrawContext {
    pub constants: [Option<ConstantView>; ShaderStage::COUNT],
    pub sampler_views: [Vec<Option<SamplerView>>; ShaderStage::COUNT],
    pub blend_color: [f32; 4],
    pub alpha_ref: f32,
    pub stencil_ref: [u8; 2],
    pub sample_mask: u32,
    pub clip_planes: [[f32; 4]; MAX_CLIP_PLANES],
    pub poly_stipple: [u32; 32],
    pub num_viewports: u32,
}

impl Default for DrawContext {
    fn default() -> Self {
        Self {
            constants: Default::default(),
            sampler_views: Default::default(),
            blend_color: [0.0; 4],
            alpha_ref: 0.0,
            stencil_ref: [0; 2],
            sample_mask: u32::MAX,
            clip_planes: [[0.0; 4]; MAX_CLIP_PLANES],
            poly_stipple: [u32::MAX; 32],
            num_viewports: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub mode: PrimitiveMode,
    /// First vertex, or first index for indexed draws.
    pub start: u32,
    pub count: u32,
    pub index_bias: i32,
    pub start_instance: u32,
    pub instance_count: u32,
    pub indexed: bool,
    /// Index value that restarts the primitive.
    pub restart_index: Option<u32>,
}

/// Client vertex data lent to a blocking draw.
#[derive(Debug, Clone, Copy)]
pub struct ClientVertexBuffer<'a> {
    pub index: u32,
    pub bytes: &'a [u8],
}

/// Clear values for [`Backend::clear`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u8,
}

pub trait Backend: Send + Sync {
    fn create_context(&self) -> BackendContextId;
    /// Drains queued work for `ctx`, then drops its state.
    fn destroy_context(&self, ctx: BackendContextId);

    fn set_render_targets(&self, ctx: BackendContextId, targets: &RenderTargets);
    fn set_rasterizer_state(&self, ctx: BackendContextId, state: &BackendRasterState);
    fn set_viewports(
        &self,
        ctx: BackendContextId,
        viewports: &[BackendViewport],
        matrices: &[ViewportMatrix],
    );
    fn set_scissor_rects(&self, ctx: BackendContextId, rects: &[Rect]);
    fn set_vertex_buffers(&self, ctx: BackendContextId, views: &[VertexBufferView]);
    fn set_index_buffer(&self, ctx: BackendContextId, view: Option<&IndexBufferView>);
    fn set_shader(&self, ctx: BackendContextId, kind: VariantKind, entry: Option<ShaderEntry>);
    fn set_depth_stencil_state(&self, ctx: BackendContextId, state: &BackendDepthStencil);
    fn set_blend_state(&self, ctx: BackendContextId, state: &BackendBlendState);
    fn set_attribute_layout(&self, ctx: BackendContextId, layout: &AttributeLayout);
    fn set_draw_context(&self, ctx: BackendContextId, draw: &DrawContext);

    fn draw(&self, ctx: BackendContextId, call: &DrawCall);
    /// Draw reading `client` in place. Returns once the draw has finished.
    fn draw_blocking(
        &self,
        ctx: BackendContextId,
        call: &DrawCall,
        client: &[ClientVertexBuffer<'_>],
    );
    fn clear(&self, ctx: BackendContextId, mask: AttachmentMask, values: ClearValues, rect: Rect);

    /// Write hot tiles of the bound `mask` attachments back to linear storage
    /// and leave them in `post`.
    fn store_tiles(&self, ctx: BackendContextId, mask: AttachmentMask, post: TileState, rect: Rect);
    /// Drop hot tiles of the bound `mask` attachments without storing them.
    fn invalidate_tiles(&self, ctx: BackendContextId, mask: AttachmentMask, rect: Rect);

    /// Run `callback` once all work queued on `ctx` before this call is done.
    /// May run it before returning.
    fn sync(&self, ctx: BackendContextId, value: u64, callback: Box<dyn FnOnce() + Send>);
}
