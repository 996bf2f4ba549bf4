//! Immutable pipeline state objects bound by the frontend.

use bitflags::bitflags;

use crate::resource::{Format, Resource};

pub const MAX_COLOR_BUFFERS: usize = 8;
pub const MAX_CLIP_PLANES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveMode {
    Points,
    Lines,
    LineStrip,
    #[default]
    Triangles,
    TriangleStrip,
    TriangleFan,
    Patches,
}

impl PrimitiveMode {
    /// Filled primitives, the only ones polygon stipple applies to.
    pub fn is_polygon(self) -> bool {
        matches!(
            self,
            PrimitiveMode::Triangles | PrimitiveMode::TriangleStrip | PrimitiveMode::TriangleFan
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CompareFunc {
    Never = 0,
    Less = 1,
    Equal = 2,
    LessEqual = 3,
    Greater = 4,
    NotEqual = 5,
    GreaterEqual = 6,
    #[default]
    Always = 7,
}

impl CompareFunc {
    pub fn test(self, value: f32, reference: f32) -> bool {
        match self {
            CompareFunc::Never => false,
            CompareFunc::Less => value < reference,
            CompareFunc::Equal => value == reference,
            CompareFunc::LessEqual => value <= reference,
            CompareFunc::Greater => value > reference,
            CompareFunc::NotEqual => value != reference,
            CompareFunc::GreaterEqual => value >= reference,
            CompareFunc::Always => true,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CompareFunc::Never,
            1 => CompareFunc::Less,
            2 => CompareFunc::Equal,
            3 => CompareFunc::LessEqual,
            4 => CompareFunc::Greater,
            5 => CompareFunc::NotEqual,
            6 => CompareFunc::GreaterEqual,
            _ => CompareFunc::Always,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullFace {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterizerState {
    pub flatshade: bool,
    pub flatshade_first: bool,
    pub light_twoside: bool,
    pub front_ccw: bool,
    pub cull_face: CullFace,
    pub fill_front: FillMode,
    pub fill_back: FillMode,
    pub scissor: bool,
    pub multisample: bool,
    pub point_size: f32,
    pub point_size_per_vertex: bool,
    pub point_quad_rasterization: bool,
    /// Bit `i` replaces texcoord `i` with the point-sprite coordinate.
    pub sprite_coord_enable: u32,
    pub line_width: f32,
    pub poly_stipple_enable: bool,
    pub offset_units: f32,
    pub offset_scale: f32,
    pub offset_clamp: f32,
    pub clip_plane_enable: u32,
    /// Clip space depth is `[0, 1]` instead of `[-1, 1]`.
    pub clip_halfz: bool,
    pub depth_clip_near: bool,
    pub depth_clip_far: bool,
    pub rasterizer_discard: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            flatshade: false,
            flatshade_first: false,
            light_twoside: false,
            front_ccw: true,
            cull_face: CullFace::None,
            fill_front: FillMode::Fill,
            fill_back: FillMode::Fill,
            scissor: false,
            multisample: false,
            point_size: 1.0,
            point_size_per_vertex: false,
            point_quad_rasterization: false,
            sprite_coord_enable: 0,
            line_width: 1.0,
            poly_stipple_enable: false,
            offset_units: 0.0,
            offset_scale: 0.0,
            offset_clamp: 0.0,
            clip_plane_enable: 0,
            clip_halfz: false,
            depth_clip_near: true,
            depth_clip_far: true,
            rasterizer_discard: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthState {
    pub enabled: bool,
    pub write: bool,
    pub func: CompareFunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilState {
    pub enabled: bool,
    pub func: CompareFunc,
    pub fail_op: StencilOp,
    pub zfail_op: StencilOp,
    pub zpass_op: StencilOp,
    pub value_mask: u8,
    pub write_mask: u8,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            enabled: false,
            func: CompareFunc::Always,
            fail_op: StencilOp::Keep,
            zfail_op: StencilOp::Keep,
            zpass_op: StencilOp::Keep,
            value_mask: 0xff,
            write_mask: 0xff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AlphaTestState {
    pub enabled: bool,
    pub func: CompareFunc,
    pub reference: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DepthStencilAlphaState {
    pub depth: DepthState,
    /// Front and back faces.
    pub stencil: [StencilState; 2],
    pub alpha: AlphaTestState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BlendFactor {
    #[default]
    One = 0,
    Zero = 1,
    SrcColor = 2,
    SrcAlpha = 3,
    DstColor = 4,
    DstAlpha = 5,
    InvSrcColor = 6,
    InvSrcAlpha = 7,
    InvDstColor = 8,
    InvDstAlpha = 9,
    ConstColor = 10,
    ConstAlpha = 11,
    InvConstColor = 12,
    InvConstAlpha = 13,
    SrcAlphaSaturate = 14,
}

impl BlendFactor {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BlendFactor::Zero,
            2 => BlendFactor::SrcColor,
            3 => BlendFactor::SrcAlpha,
            4 => BlendFactor::DstColor,
            5 => BlendFactor::DstAlpha,
            6 => BlendFactor::InvSrcColor,
            7 => BlendFactor::InvSrcAlpha,
            8 => BlendFactor::InvDstColor,
            9 => BlendFactor::InvDstAlpha,
            10 => BlendFactor::ConstColor,
            11 => BlendFactor::ConstAlpha,
            12 => BlendFactor::InvConstColor,
            13 => BlendFactor::InvConstAlpha,
            14 => BlendFactor::SrcAlphaSaturate,
            _ => BlendFactor::One,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BlendFunc {
    #[default]
    Add = 0,
    Subtract = 1,
    ReverseSubtract = 2,
    Min = 3,
    Max = 4,
}

impl BlendFunc {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BlendFunc::Subtract,
            2 => BlendFunc::ReverseSubtract,
            3 => BlendFunc::Min,
            4 => BlendFunc::Max,
            _ => BlendFunc::Add,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum LogicOp {
    Clear = 0,
    Nor = 1,
    AndInverted = 2,
    CopyInverted = 3,
    AndReverse = 4,
    Invert = 5,
    Xor = 6,
    Nand = 7,
    And = 8,
    Equiv = 9,
    Noop = 10,
    OrInverted = 11,
    #[default]
    Copy = 12,
    OrReverse = 13,
    Or = 14,
    Set = 15,
}

impl LogicOp {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LogicOp::Clear,
            1 => LogicOp::Nor,
            2 => LogicOp::AndInverted,
            3 => LogicOp::CopyInverted,
            4 => LogicOp::AndReverse,
            5 => LogicOp::Invert,
            6 => LogicOp::Xor,
            7 => LogicOp::Nand,
            8 => LogicOp::And,
            9 => LogicOp::Equiv,
            10 => LogicOp::Noop,
            11 => LogicOp::OrInverted,
            13 => LogicOp::OrReverse,
            14 => LogicOp::Or,
            15 => LogicOp::Set,
            _ => LogicOp::Copy,
        }
    }

    pub fn apply(self, src: u8, dst: u8) -> u8 {
        match self {
            LogicOp::Clear => 0,
            LogicOp::Nor => !(src | dst),
            LogicOp::AndInverted => !src & dst,
            LogicOp::CopyInverted => !src,
            LogicOp::AndReverse => src & !dst,
            LogicOp::Invert => !dst,
            LogicOp::Xor => src ^ dst,
            LogicOp::Nand => !(src & dst),
            LogicOp::And => src & dst,
            LogicOp::Equiv => !(src ^ dst),
            LogicOp::Noop => dst,
            LogicOp::OrInverted => !src | dst,
            LogicOp::Copy => src,
            LogicOp::OrReverse => src | !dst,
            LogicOp::Or => src | dst,
            LogicOp::Set => 0xff,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

impl Default for ColorMask {
    fn default() -> Self {
        ColorMask::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderTargetBlend {
    pub blend_enable: bool,
    pub rgb_func: BlendFunc,
    pub rgb_src_factor: BlendFactor,
    pub rgb_dst_factor: BlendFactor,
    pub alpha_func: BlendFunc,
    pub alpha_src_factor: BlendFactor,
    pub alpha_dst_factor: BlendFactor,
    pub color_mask: ColorMask,
}

impl RenderTargetBlend {
    /// Classic `src * a + dst * (1 - a)`.
    pub fn source_over() -> Self {
        Self {
            blend_enable: true,
            rgb_func: BlendFunc::Add,
            rgb_src_factor: BlendFactor::SrcAlpha,
            rgb_dst_factor: BlendFactor::InvSrcAlpha,
            alpha_func: BlendFunc::Add,
            alpha_src_factor: BlendFactor::One,
            alpha_dst_factor: BlendFactor::InvSrcAlpha,
            color_mask: ColorMask::all(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlendState {
    /// When false, `rt[0]` applies to every color buffer.
    pub independent_blend_enable: bool,
    pub logicop_enable: bool,
    pub logicop_func: LogicOp,
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
    pub rt: [RenderTargetBlend; MAX_COLOR_BUFFERS],
}

impl BlendState {
    pub fn for_target(&self, index: usize) -> &RenderTargetBlend {
        if self.independent_blend_enable {
            &self.rt[index]
        } else {
            &self.rt[0]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClipState {
    pub planes: [[f32; 4]; MAX_CLIP_PLANES],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum WrapMode {
    #[default]
    Repeat = 0,
    ClampToEdge = 1,
    ClampToBorder = 2,
    MirrorRepeat = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Filter {
    #[default]
    Nearest = 0,
    Linear = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MipFilter {
    #[default]
    None = 0,
    Nearest = 1,
    Linear = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplerState {
    pub wrap: [WrapMode; 3],
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: MipFilter,
    pub compare_enable: bool,
    pub compare_func: CompareFunc,
    pub normalized_coords: bool,
    pub seamless_cube_map: bool,
    pub lod_bias: f32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Swizzle {
    #[default]
    X = 0,
    Y = 1,
    Z = 2,
    W = 3,
    Zero = 4,
    One = 5,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerView {
    pub resource: Resource,
    pub format: Format,
    pub swizzle: [Swizzle; 4],
    pub first_level: u32,
    pub last_level: u32,
}

impl SamplerView {
    pub fn new(resource: Resource) -> Self {
        Self {
            format: resource.format(),
            resource,
            swizzle: [Swizzle::X, Swizzle::Y, Swizzle::Z, Swizzle::W],
            first_level: 0,
            last_level: 0,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }
}
