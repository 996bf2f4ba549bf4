//! Fixed-layout variant keys.
//!
//! Every key is plain old data built from a zeroed value, so two keys compare
//! equal exactly when their bytes do. Padding is explicit and always zero.

use bytemuck::{Pod, Zeroable};

use super::compiler::CompileKey;
use super::{ShaderInfo, ShaderObject, ShaderStage, VariantKind};
use crate::resource::{Format, ResourceTarget};
use crate::state::{
    PipelineState, PrimitiveMode, SamplerState, SamplerView, VertexElement, MAX_VERTEX_ELEMENTS,
};

pub const MAX_SAMPLERS: usize = 16;
/// Output slots recorded for stage linkage.
pub const MAX_SHADER_OUTPUTS: usize = 32;

/// A key the variant caches can store.
pub trait VariantKey: Pod {
    const KIND: VariantKind;

    fn compile_key(&self) -> CompileKey<'_>;

    fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Sampler state that changes generated code.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct StaticSamplerKey {
    /// s, t, r; the fourth byte is padding.
    pub wrap: [u8; 4],
    pub min_filter: u8,
    pub mag_filter: u8,
    pub mip_filter: u8,
    pub compare_enable: u8,
    pub compare_func: u8,
    pub normalized_coords: u8,
    pub seamless_cube_map: u8,
    pub _pad: u8,
}

impl StaticSamplerKey {
    pub fn from_state(state: &SamplerState) -> Self {
        let mut key = Self::zeroed();
        for (dst, wrap) in key.wrap.iter_mut().zip(state.wrap) {
            *dst = wrap as u8;
        }
        key.min_filter = state.min_filter as u8;
        key.mag_filter = state.mag_filter as u8;
        key.mip_filter = state.mip_filter as u8;
        key.compare_enable = u8::from(state.compare_enable);
        if state.compare_enable {
            key.compare_func = state.compare_func as u8;
        }
        key.normalized_coords = u8::from(state.normalized_coords);
        key.seamless_cube_map = u8::from(state.seamless_cube_map);
        key
    }
}

/// Texture state that changes generated code.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct StaticTextureKey {
    /// `Format` discriminant plus one; zero means no view.
    pub format: u32,
    pub swizzle: [u8; 4],
    pub target: u8,
    pub pot_width: u8,
    pub pot_height: u8,
    pub level_zero_only: u8,
}

impl StaticTextureKey {
    pub fn from_view(view: &SamplerView) -> Self {
        let resource = &view.resource;
        // A stencil-only view of a fused depth/stencil resource samples the
        // stencil plane.
        let format = if resource.format().is_fused_depth_stencil() && !view.format.has_depth() {
            Format::S8Uint
        } else {
            view.format
        };

        let mut key = Self::zeroed();
        key.format = format as u32 + 1;
        for (dst, swizzle) in key.swizzle.iter_mut().zip(view.swizzle) {
            *dst = swizzle as u8;
        }
        key.target = match resource.desc().target {
            ResourceTarget::Buffer => 1,
            ResourceTarget::Texture2D => 2,
        };
        key.pot_width = u8::from(resource.width().is_power_of_two());
        key.pot_height = u8::from(resource.height().is_power_of_two());
        key.level_zero_only = u8::from(view.first_level == 0 && view.last_level == 0);
        key
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SamplerSlotKey {
    pub sampler: StaticSamplerKey,
    pub texture: StaticTextureKey,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SamplerKeys {
    pub nr_samplers: u32,
    pub nr_sampler_views: u32,
    pub slots: [SamplerSlotKey; MAX_SAMPLERS],
}

fn slot_count(mask: u32) -> u32 {
    let mask = mask & ((1 << MAX_SAMPLERS) - 1);
    32 - mask.leading_zeros()
}

impl SamplerKeys {
    /// Static state of every sampler and sampler view `info` declares.
    ///
    /// Shaders that declare sampler views separately index views by their own
    /// mask; otherwise each sampler slot implies a view in the same slot.
    pub fn generate(info: &ShaderInfo, stage: ShaderStage, state: &PipelineState) -> Self {
        let mut key = Self::zeroed();
        let samplers = &state.samplers[stage.index()];
        let views = &state.sampler_views[stage.index()];

        key.nr_samplers = slot_count(info.sampler_mask);
        for i in 0..key.nr_samplers as usize {
            if info.sampler_mask & (1 << i) == 0 {
                continue;
            }
            if let Some(sampler) = &samplers[i] {
                key.slots[i].sampler = StaticSamplerKey::from_state(sampler);
            }
        }

        let view_mask = info.sampler_view_mask.unwrap_or(info.sampler_mask);
        key.nr_sampler_views = slot_count(view_mask);
        for i in 0..key.nr_sampler_views as usize {
            if view_mask & (1 << i) == 0 {
                continue;
            }
            if let Some(view) = &views[i] {
                key.slots[i].texture = StaticTextureKey::from_view(view);
            }
        }
        key
    }
}

/// Output semantics of the stage feeding the keyed one.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct LinkageKey {
    pub num_outputs: u32,
    pub semantic_name: [u8; MAX_SHADER_OUTPUTS],
    pub semantic_index: [u8; MAX_SHADER_OUTPUTS],
}

impl LinkageKey {
    pub fn from_producer(producer: Option<&ShaderObject>) -> Self {
        let mut key = Self::zeroed();
        let Some(producer) = producer else {
            return key;
        };
        let outputs = &producer.info().outputs;
        let n = outputs.len().min(MAX_SHADER_OUTPUTS);
        key.num_outputs = n as u32;
        for (i, semantic) in outputs.iter().take(n).enumerate() {
            key.semantic_name[i] = semantic.name as u8;
            key.semantic_index[i] = semantic.index;
        }
        key
    }
}

fn clip_plane_mask(info: &ShaderInfo, state: &PipelineState) -> u32 {
    let enabled = state.rasterizer.clip_plane_enable;
    if info.clip_distance_writemask != 0 {
        info.clip_distance_writemask & enabled
    } else {
        enabled
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct VsKey {
    pub clip_plane_mask: u32,
    pub samplers: SamplerKeys,
}

impl VsKey {
    pub fn generate(vs: &ShaderObject, state: &PipelineState) -> Self {
        let mut key = Self::zeroed();
        key.clip_plane_mask = clip_plane_mask(vs.info(), state);
        key.samplers = SamplerKeys::generate(vs.info(), ShaderStage::Vertex, state);
        key
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TcsKey {
    pub clip_plane_mask: u32,
    pub prev: LinkageKey,
    pub samplers: SamplerKeys,
}

impl TcsKey {
    pub fn generate(tcs: &ShaderObject, state: &PipelineState) -> Self {
        let mut key = Self::zeroed();
        key.clip_plane_mask = clip_plane_mask(tcs.info(), state);
        key.prev =
            LinkageKey::from_producer(state.producer_of(ShaderStage::TessControl).map(|s| &**s));
        key.samplers = SamplerKeys::generate(tcs.info(), ShaderStage::TessControl, state);
        key
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TesKey {
    pub clip_plane_mask: u32,
    pub prev: LinkageKey,
    pub samplers: SamplerKeys,
}

impl TesKey {
    pub fn generate(tes: &ShaderObject, state: &PipelineState) -> Self {
        let mut key = Self::zeroed();
        key.clip_plane_mask = clip_plane_mask(tes.info(), state);
        key.prev =
            LinkageKey::from_producer(state.producer_of(ShaderStage::TessEval).map(|s| &**s));
        key.samplers = SamplerKeys::generate(tes.info(), ShaderStage::TessEval, state);
        key
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GsKey {
    pub prev: LinkageKey,
    pub samplers: SamplerKeys,
}

impl GsKey {
    pub fn generate(gs: &ShaderObject, state: &PipelineState) -> Self {
        let mut key = Self::zeroed();
        key.prev =
            LinkageKey::from_producer(state.producer_of(ShaderStage::Geometry).map(|s| &**s));
        key.samplers = SamplerKeys::generate(gs.info(), ShaderStage::Geometry, state);
        key
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FsKey {
    pub nr_cbufs: u32,
    pub sprite_coord_enable: u32,
    pub light_twoside: u8,
    pub poly_stipple_enable: u8,
    pub _pad: [u8; 2],
    pub prev: LinkageKey,
    pub samplers: SamplerKeys,
}

impl FsKey {
    /// Polygon stipple only counts when `mode` draws filled primitives.
    pub fn generate(fs: &ShaderObject, state: &PipelineState, mode: PrimitiveMode) -> Self {
        let rasterizer = &state.rasterizer;
        let mut key = Self::zeroed();
        key.nr_cbufs = state.framebuffer.nr_cbufs() as u32;
        key.light_twoside = u8::from(rasterizer.light_twoside);
        key.sprite_coord_enable = rasterizer.sprite_coord_enable;
        key.prev =
            LinkageKey::from_producer(state.producer_of(ShaderStage::Fragment).map(|s| &**s));
        key.samplers = SamplerKeys::generate(fs.info(), ShaderStage::Fragment, state);
        key.poly_stipple_enable = u8::from(rasterizer.poly_stipple_enable && mode.is_polygon());
        key
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FetchElementKey {
    pub offset: u32,
    pub buffer_index: u32,
    pub instance_divisor: u32,
    pub format: u8,
    pub _pad: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FetchKey {
    pub num_elements: u32,
    pub elements: [FetchElementKey; MAX_VERTEX_ELEMENTS],
}

impl FetchKey {
    pub fn from_elements(elements: &[VertexElement]) -> Self {
        let mut key = Self::zeroed();
        let n = elements.len().min(MAX_VERTEX_ELEMENTS);
        key.num_elements = n as u32;
        for (dst, element) in key.elements.iter_mut().zip(&elements[..n]) {
            dst.offset = element.src_offset;
            dst.buffer_index = element.vertex_buffer_index;
            dst.instance_divisor = element.instance_divisor;
            dst.format = element.format as u8;
        }
        key
    }
}

/// Blend configuration of one render target.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BlendKey {
    /// `Format` discriminant plus one.
    pub format: u32,
    pub sample_count: u32,
    pub blend_enable: u8,
    pub rgb_func: u8,
    pub rgb_src_factor: u8,
    pub rgb_dst_factor: u8,
    pub alpha_func: u8,
    pub alpha_src_factor: u8,
    pub alpha_dst_factor: u8,
    pub color_mask: u8,
    pub logicop_enable: u8,
    pub logicop_func: u8,
    pub alpha_test_enable: u8,
    pub alpha_test_func: u8,
    pub alpha_to_coverage: u8,
    pub _pad: [u8; 3],
}

impl BlendKey {
    /// Key for color buffer `index`, or `None` when nothing is bound there.
    pub fn generate(state: &PipelineState, index: usize) -> Option<Self> {
        let target = state.framebuffer.cbufs.get(index)?.as_ref()?;
        let blend = &state.blend;
        let rt = blend.for_target(index);
        let alpha = &state.depth_stencil_alpha.alpha;

        let mut key = Self::zeroed();
        key.format = target.format() as u32 + 1;
        key.sample_count = target.samples();
        key.blend_enable = u8::from(rt.blend_enable);
        if rt.blend_enable {
            key.rgb_func = rt.rgb_func as u8;
            key.rgb_src_factor = rt.rgb_src_factor as u8;
            key.rgb_dst_factor = rt.rgb_dst_factor as u8;
            key.alpha_func = rt.alpha_func as u8;
            key.alpha_src_factor = rt.alpha_src_factor as u8;
            key.alpha_dst_factor = rt.alpha_dst_factor as u8;
        }
        key.color_mask = rt.color_mask.bits();
        key.logicop_enable = u8::from(blend.logicop_enable);
        if blend.logicop_enable {
            key.logicop_func = blend.logicop_func as u8;
        }
        key.alpha_test_enable = u8::from(alpha.enabled);
        if alpha.enabled {
            key.alpha_test_func = alpha.func as u8;
        }
        key.alpha_to_coverage = u8::from(blend.alpha_to_coverage);
        Some(key)
    }
}

macro_rules! variant_key {
    ($key:ty, $kind:ident) => {
        impl VariantKey for $key {
            const KIND: VariantKind = VariantKind::$kind;

            fn compile_key(&self) -> CompileKey<'_> {
                CompileKey::$kind(self)
            }
        }
    };
}

variant_key!(VsKey, Vertex);
variant_key!(TcsKey, TessControl);
variant_key!(TesKey, TessEval);
variant_key!(GsKey, Geometry);
variant_key!(FsKey, Fragment);
variant_key!(FetchKey, Fetch);
variant_key!(BlendKey, Blend);
