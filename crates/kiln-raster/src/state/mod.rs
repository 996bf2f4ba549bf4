//! Raw pipeline state as set by the frontend, and the dirty mask that tracks
//! which derived structures need recomputing.

pub(crate) mod derived;
pub mod linkage;
mod objects;
mod vertex;
pub mod viewport;

pub use derived::{DerivedState, ResolveMode};
pub use objects::{
    AlphaTestState, BlendFactor, BlendFunc, BlendState, ClipState, ColorMask, CompareFunc,
    CullFace, DepthState, DepthStencilAlphaState, FillMode, Filter, LogicOp, MipFilter,
    PrimitiveMode, RasterizerState, RenderTargetBlend, SamplerState, SamplerView, StencilOp,
    StencilState, Swizzle, WrapMode, MAX_CLIP_PLANES, MAX_COLOR_BUFFERS,
};
pub use vertex::{
    ConstantBufferBinding, IndexSize, VertexBufferBinding, VertexBufferSource, VertexElement,
    VertexElements, VertexFormat, MAX_VERTEX_BUFFERS, MAX_VERTEX_ELEMENTS,
};
pub use viewport::{ScissorRect, Viewport, MAX_VIEWPORTS};

use std::sync::Arc;

use bitflags::bitflags;

use crate::resource::Resource;
use crate::shader::key::MAX_SAMPLERS;
use crate::shader::{ShaderObject, ShaderStage};

bitflags! {
    /// State categories whose derived form is out of date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u32 {
        const BLEND = 1 << 0;
        const RASTERIZER = 1 << 1;
        const DEPTH_STENCIL_ALPHA = 1 << 2;
        const SAMPLE_MASK = 1 << 3;
        const VS = 1 << 4;
        const TCS = 1 << 5;
        const TES = 1 << 6;
        const GS = 1 << 7;
        const FS = 1 << 8;
        const VERTEX = 1 << 9;
        const FRAMEBUFFER = 1 << 10;
        const SCISSOR = 1 << 11;
        const VIEWPORT = 1 << 12;
        const BLEND_COLOR = 1 << 13;
        const STENCIL_REF = 1 << 14;
        const SAMPLER = 1 << 15;
        const SAMPLER_VIEW = 1 << 16;
        const CLIP = 1 << 17;
        const STIPPLE = 1 << 18;
        const VS_CONSTANTS = 1 << 19;
        const TCS_CONSTANTS = 1 << 20;
        const TES_CONSTANTS = 1 << 21;
        const GS_CONSTANTS = 1 << 22;
        const FS_CONSTANTS = 1 << 23;
    }
}

impl DirtyFlags {
    pub fn shader(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => DirtyFlags::VS,
            ShaderStage::TessControl => DirtyFlags::TCS,
            ShaderStage::TessEval => DirtyFlags::TES,
            ShaderStage::Geometry => DirtyFlags::GS,
            ShaderStage::Fragment => DirtyFlags::FS,
        }
    }

    pub fn constants(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => DirtyFlags::VS_CONSTANTS,
            ShaderStage::TessControl => DirtyFlags::TCS_CONSTANTS,
            ShaderStage::TessEval => DirtyFlags::TES_CONSTANTS,
            ShaderStage::Geometry => DirtyFlags::GS_CONSTANTS,
            ShaderStage::Fragment => DirtyFlags::FS_CONSTANTS,
        }
    }

    pub fn any_shader() -> Self {
        DirtyFlags::VS | DirtyFlags::TCS | DirtyFlags::TES | DirtyFlags::GS | DirtyFlags::FS
    }
}

/// Color and depth/stencil attachments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FramebufferState {
    pub width: u32,
    pub height: u32,
    pub cbufs: [Option<Resource>; MAX_COLOR_BUFFERS],
    pub zsbuf: Option<Resource>,
}

impl FramebufferState {
    /// Framebuffer sized to its first attachment.
    pub fn new(cbufs: &[Resource], zsbuf: Option<Resource>) -> Self {
        let mut fb = FramebufferState {
            zsbuf,
            ..Default::default()
        };
        for (slot, cbuf) in fb.cbufs.iter_mut().zip(cbufs) {
            *slot = Some(cbuf.clone());
        }
        let size = fb
            .cbufs
            .iter()
            .flatten()
            .next()
            .or(fb.zsbuf.as_ref())
            .map(|first| (first.width(), first.height()));
        if let Some((width, height)) = size {
            fb.width = width;
            fb.height = height;
        }
        fb
    }

    /// Drop every attachment backed by `resource`. Returns whether any was.
    pub fn unbind(&mut self, resource: &Resource) -> bool {
        let mut found = false;
        for slot in self.cbufs.iter_mut().chain(std::iter::once(&mut self.zsbuf)) {
            if slot.as_ref().is_some_and(|bound| bound.ptr_eq(resource)) {
                *slot = None;
                found = true;
            }
        }
        found
    }

    /// Color slots up to and including the last bound one.
    pub fn nr_cbufs(&self) -> usize {
        self.cbufs
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1)
    }

    pub fn samples(&self) -> u32 {
        self.cbufs
            .iter()
            .flatten()
            .chain(self.zsbuf.as_ref())
            .map(Resource::samples)
            .max()
            .unwrap_or(1)
    }
}

/// Everything the frontend has bound, exactly as bound.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub rasterizer: Arc<RasterizerState>,
    pub depth_stencil_alpha: Arc<DepthStencilAlphaState>,
    pub blend: Arc<BlendState>,
    pub blend_color: [f32; 4],
    pub stencil_ref: [u8; 2],
    pub sample_mask: u32,
    pub poly_stipple: [u32; 32],
    pub clip: ClipState,
    pub shaders: [Option<Arc<ShaderObject>>; ShaderStage::COUNT],
    pub vertex_elements: Option<Arc<VertexElements>>,
    pub vertex_buffers: [Option<VertexBufferBinding>; MAX_VERTEX_BUFFERS],
    pub constant_buffers: [Option<ConstantBufferBinding>; ShaderStage::COUNT],
    pub samplers: [[Option<SamplerState>; MAX_SAMPLERS]; ShaderStage::COUNT],
    pub sampler_views: [[Option<SamplerView>; MAX_SAMPLERS]; ShaderStage::COUNT],
    pub framebuffer: FramebufferState,
    pub viewports: [Viewport; MAX_VIEWPORTS],
    pub scissors: [ScissorRect; MAX_VIEWPORTS],
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            rasterizer: Arc::default(),
            depth_stencil_alpha: Arc::default(),
            blend: Arc::default(),
            blend_color: [0.0; 4],
            stencil_ref: [0; 2],
            sample_mask: u32::MAX,
            poly_stipple: [u32::MAX; 32],
            clip: ClipState::default(),
            shaders: Default::default(),
            vertex_elements: None,
            vertex_buffers: Default::default(),
            constant_buffers: Default::default(),
            samplers: Default::default(),
            sampler_views: Default::default(),
            framebuffer: FramebufferState::default(),
            viewports: [Viewport::default(); MAX_VIEWPORTS],
            scissors: [ScissorRect::default(); MAX_VIEWPORTS],
        }
    }
}

impl PipelineState {
    pub fn shader(&self, stage: ShaderStage) -> Option<&Arc<ShaderObject>> {
        self.shaders[stage.index()].as_ref()
    }

    /// The stage whose outputs feed `stage`'s inputs.
    pub fn producer_of(&self, stage: ShaderStage) -> Option<&Arc<ShaderObject>> {
        let candidates: &[ShaderStage] = match stage {
            ShaderStage::Vertex => &[],
            ShaderStage::TessControl => &[ShaderStage::Vertex],
            ShaderStage::TessEval => &[ShaderStage::TessControl, ShaderStage::Vertex],
            ShaderStage::Geometry => &[ShaderStage::TessEval, ShaderStage::Vertex],
            ShaderStage::Fragment => &[
                ShaderStage::Geometry,
                ShaderStage::TessEval,
                ShaderStage::Vertex,
            ],
        };
        candidates.iter().find_map(|s| self.shader(*s))
    }

    /// Last stage before rasterization.
    pub fn last_vertex_stage(&self) -> Option<&Arc<ShaderObject>> {
        self.producer_of(ShaderStage::Fragment)
    }

    /// Every resource a draw with this state may read.
    pub fn read_resources(&self) -> impl Iterator<Item = &Resource> {
        let vertex = self
            .vertex_buffers
            .iter()
            .flatten()
            .filter_map(|vb| match &vb.source {
                VertexBufferSource::Resource(resource) => Some(resource),
                VertexBufferSource::Client => None,
            });
        let constants = self
            .constant_buffers
            .iter()
            .flatten()
            .filter_map(|cb| match cb {
                ConstantBufferBinding::Resource { resource, .. } => Some(resource),
                ConstantBufferBinding::User(_) => None,
            });
        let views = self
            .sampler_views
            .iter()
            .flatten()
            .flatten()
            .map(|view| &view.resource);
        vertex.chain(constants).chain(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{BindFlags, Format, ResourceDesc, ResourceId};

    fn target(id: u32, w: u32, h: u32) -> Resource {
        Resource::new_owned(
            ResourceId(id),
            ResourceDesc::texture_2d(Format::Rgba8Unorm, w, h, BindFlags::RENDER_TARGET),
            None,
        )
    }

    #[test]
    fn nr_cbufs_counts_through_holes() {
        let mut fb = FramebufferState::new(&[target(1, 8, 4)], None);
        assert_eq!((fb.width, fb.height), (8, 4));
        assert_eq!(fb.nr_cbufs(), 1);
        fb.cbufs[0] = None;
        fb.cbufs[2] = Some(target(2, 8, 4));
        assert_eq!(fb.nr_cbufs(), 3);
        fb.cbufs[2] = None;
        assert_eq!(fb.nr_cbufs(), 0);
    }

    #[test]
    fn dirty_flags_map_stages() {
        assert_eq!(DirtyFlags::shader(ShaderStage::Geometry), DirtyFlags::GS);
        assert_eq!(
            DirtyFlags::constants(ShaderStage::Fragment),
            DirtyFlags::FS_CONSTANTS
        );
        assert!(DirtyFlags::any_shader().contains(DirtyFlags::TES));
    }
}
