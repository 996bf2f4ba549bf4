//! Reference compilation service.
//!
//! Produces closures instead of machine code. Vertex-like stages copy their
//! inputs through, fetch decodes the vertex layout in its key, fragment
//! shaders emit a constant or interpolated color, and blend variants evaluate
//! the fixed-function equation described by their key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::compiler::{
    CompilationService, CompileError, CompileKey, CompileRequest, CompiledModule,
    CompiledVariant, Invocation, ShaderEntry, ShaderFn,
};
use super::key::{BlendKey, FetchKey, FsKey};
use super::{SemanticName, ShaderDescription};
use crate::state::{BlendFactor, BlendFunc, ColorMask, CompareFunc, LogicOp, VertexFormat};

/// Owner of a passthrough closure. Holds nothing but a label.
#[derive(Debug)]
pub struct PassthroughModule {
    pub label: String,
}

impl CompiledModule for PassthroughModule {}

#[derive(Debug, Default)]
pub struct PassthroughCompiler {
    compiles: AtomicU64,
}

impl PassthroughCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful compilations so far.
    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }
}

impl CompilationService for PassthroughCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<CompiledVariant, CompileError> {
        let kind = request.kind();
        let func: ShaderFn = match request.key {
            CompileKey::Vertex(_)
            | CompileKey::TessControl(_)
            | CompileKey::TessEval(_)
            | CompileKey::Geometry(_) => {
                shader_of(request)?;
                Arc::new(copy_through)
            }
            CompileKey::Fragment(key) => fragment(key, shader_of(request)?),
            CompileKey::Fetch(key) => fetch(*key),
            CompileKey::Blend(key) => blend(*key),
        };

        let label = match request.shader.and_then(|shader| shader.label.as_deref()) {
            Some(label) => format!("{kind:?}:{label}"),
            None => format!("{kind:?}"),
        };
        self.compiles.fetch_add(1, Ordering::Relaxed);
        Ok(CompiledVariant {
            entry: ShaderEntry::new(kind, func),
            module: Box::new(PassthroughModule { label }),
        })
    }
}

fn shader_of<'a>(request: &CompileRequest<'a>) -> Result<&'a ShaderDescription, CompileError> {
    request.shader.ok_or_else(|| CompileError {
        kind: request.kind(),
        reason: "no shader description supplied".into(),
    })
}

fn copy_through(inv: &mut Invocation<'_>) {
    for (dst, src) in inv.outputs.iter_mut().zip(inv.inputs) {
        *dst = *src;
    }
}

fn read_vec4(bytes: &[u8]) -> Option<[f32; 4]> {
    let bytes = bytes.get(..16)?;
    let mut out = [0.0; 4];
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(out)
}

fn fragment(key: &FsKey, shader: &ShaderDescription) -> ShaderFn {
    let nr_cbufs = key.nr_cbufs as usize;
    let color_input = shader
        .info
        .inputs
        .iter()
        .position(|input| input.semantic.name == SemanticName::Color);

    Arc::new(move |inv: &mut Invocation<'_>| {
        let color = read_vec4(inv.constants)
            .or_else(|| color_input.and_then(|i| inv.inputs.get(i).copied()))
            .unwrap_or([1.0; 4]);
        for out in inv.outputs.iter_mut().take(nr_cbufs) {
            *out = color;
        }
    })
}

fn fetch(key: FetchKey) -> ShaderFn {
    Arc::new(move |inv: &mut Invocation<'_>| {
        let n = key.num_elements as usize;
        for (i, element) in key.elements.iter().take(n).enumerate() {
            let Some(out) = inv.outputs.get_mut(i) else {
                break;
            };
            let format = VertexFormat::from_u8(element.format);
            let value = inv
                .buffers
                .get(element.buffer_index as usize)
                .and_then(|buffer| {
                    let index = match element.instance_divisor {
                        0 => inv.vertex_id,
                        divisor => inv.instance_id / divisor,
                    };
                    let addr = u64::from(index) * u64::from(buffer.stride)
                        + u64::from(element.offset);
                    buffer.read(addr, format.size() as usize)
                })
                .map(|bytes| format.decode(bytes));
            *out = value.unwrap_or([0.0, 0.0, 0.0, 1.0]);
        }
    })
}

fn factor(f: BlendFactor, src: &[f32; 4], dst: &[f32; 4], constant: &[f32; 4], c: usize) -> f32 {
    let alpha = c == 3;
    match f {
        BlendFactor::One => 1.0,
        BlendFactor::Zero => 0.0,
        BlendFactor::SrcColor => src[c],
        BlendFactor::SrcAlpha => src[3],
        BlendFactor::DstColor => dst[c],
        BlendFactor::DstAlpha => dst[3],
        BlendFactor::InvSrcColor => 1.0 - src[c],
        BlendFactor::InvSrcAlpha => 1.0 - src[3],
        BlendFactor::InvDstColor => 1.0 - dst[c],
        BlendFactor::InvDstAlpha => 1.0 - dst[3],
        BlendFactor::ConstColor => constant[c],
        BlendFactor::ConstAlpha => constant[3],
        BlendFactor::InvConstColor => 1.0 - constant[c],
        BlendFactor::InvConstAlpha => 1.0 - constant[3],
        BlendFactor::SrcAlphaSaturate if alpha => 1.0,
        BlendFactor::SrcAlphaSaturate => src[3].min(1.0 - dst[3]),
    }
}

fn combine(func: BlendFunc, s: f32, sf: f32, d: f32, df: f32) -> f32 {
    match func {
        BlendFunc::Add => s * sf + d * df,
        BlendFunc::Subtract => s * sf - d * df,
        BlendFunc::ReverseSubtract => d * df - s * sf,
        BlendFunc::Min => s.min(d),
        BlendFunc::Max => s.max(d),
    }
}

fn to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Blend variants read `[src, dst]` from the inputs and `[blend color,
/// alpha reference]` from the constants.
fn blend(key: BlendKey) -> ShaderFn {
    let color_mask = ColorMask::from_bits_truncate(key.color_mask);
    let logicop = (key.logicop_enable != 0).then(|| LogicOp::from_u8(key.logicop_func));
    let alpha_test = (key.alpha_test_enable != 0).then(|| CompareFunc::from_u8(key.alpha_test_func));
    let funcs = (key.blend_enable != 0).then(|| {
        (
            BlendFunc::from_u8(key.rgb_func),
            BlendFactor::from_u8(key.rgb_src_factor),
            BlendFactor::from_u8(key.rgb_dst_factor),
            BlendFunc::from_u8(key.alpha_func),
            BlendFactor::from_u8(key.alpha_src_factor),
            BlendFactor::from_u8(key.alpha_dst_factor),
        )
    });

    Arc::new(move |inv: &mut Invocation<'_>| {
        let src = inv.inputs.first().copied().unwrap_or([0.0; 4]);
        let dst = inv.inputs.get(1).copied().unwrap_or([0.0; 4]);
        let constant = read_vec4(inv.constants).unwrap_or([0.0; 4]);
        let alpha_ref = inv
            .constants
            .get(16..20)
            .map_or(0.0, |b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        let Some(out) = inv.outputs.first_mut() else {
            return;
        };

        if alpha_test.is_some_and(|func| !func.test(src[3], alpha_ref)) {
            *out = dst;
            return;
        }

        let mut result = src;
        if let Some((rgb_func, rgb_sf, rgb_df, a_func, a_sf, a_df)) = funcs {
            for c in 0..4 {
                let (func, sf, df) = if c == 3 {
                    (a_func, a_sf, a_df)
                } else {
                    (rgb_func, rgb_sf, rgb_df)
                };
                result[c] = combine(
                    func,
                    src[c],
                    factor(sf, &src, &dst, &constant, c),
                    dst[c],
                    factor(df, &src, &dst, &constant, c),
                );
            }
        }
        if let Some(op) = logicop {
            for c in 0..4 {
                result[c] = f32::from(op.apply(to_unorm8(result[c]), to_unorm8(dst[c]))) / 255.0;
            }
        }

        let channels = [ColorMask::R, ColorMask::G, ColorMask::B, ColorMask::A];
        for (c, bit) in channels.into_iter().enumerate() {
            out[c] = if color_mask.contains(bit) { result[c] } else { dst[c] };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::key::FetchElementKey;
    use crate::shader::{FetchBuffer, Semantic, ShaderInfo, ShaderInput, ShaderStage, VariantKind};
    use bytemuck::Zeroable;

    fn blend_key(enable: bool) -> BlendKey {
        let mut key = BlendKey::zeroed();
        key.color_mask = ColorMask::all().bits();
        if enable {
            key.blend_enable = 1;
            key.rgb_src_factor = BlendFactor::SrcAlpha as u8;
            key.rgb_dst_factor = BlendFactor::InvSrcAlpha as u8;
            key.alpha_src_factor = BlendFactor::One as u8;
            key.alpha_dst_factor = BlendFactor::InvSrcAlpha as u8;
        }
        key
    }

    fn run_blend(key: BlendKey, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
        let compiler = PassthroughCompiler::new();
        let variant = compiler
            .compile(&CompileRequest {
                shader: None,
                key: CompileKey::Blend(&key),
            })
            .unwrap();
        let inputs = [src, dst];
        let mut outputs = [[0.0; 4]];
        variant.entry.call(&mut Invocation::new(&inputs, &mut outputs));
        outputs[0]
    }

    #[test]
    fn disabled_blend_replaces() {
        let out = run_blend(blend_key(false), [0.25, 0.5, 0.75, 0.5], [1.0; 4]);
        assert_eq!(out, [0.25, 0.5, 0.75, 0.5]);
    }

    #[test]
    fn source_over_mixes_by_source_alpha() {
        let out = run_blend(blend_key(true), [1.0, 0.0, 0.0, 0.5], [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(out, [0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn color_mask_keeps_destination_channels() {
        let mut key = blend_key(false);
        key.color_mask = (ColorMask::R | ColorMask::A).bits();
        let out = run_blend(key, [0.1, 0.2, 0.3, 0.4], [0.9, 0.8, 0.7, 0.6]);
        assert_eq!(out, [0.1, 0.8, 0.7, 0.4]);
    }

    #[test]
    fn fetch_decodes_per_vertex_and_per_instance_elements() {
        let mut key = FetchKey::zeroed();
        key.num_elements = 2;
        key.elements[0] = FetchElementKey {
            offset: 0,
            buffer_index: 0,
            instance_divisor: 0,
            format: VertexFormat::Float32x2 as u8,
            _pad: [0; 3],
        };
        key.elements[1] = FetchElementKey {
            offset: 0,
            buffer_index: 1,
            instance_divisor: 2,
            format: VertexFormat::Float32 as u8,
            _pad: [0; 3],
        };

        let per_vertex: Vec<u8> = [0.0f32, 1.0, 2.0, 3.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let per_instance: Vec<u8> = [10.0f32, 20.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let buffers = [
            FetchBuffer {
                bytes: &per_vertex,
                base: 0,
                stride: 8,
            },
            FetchBuffer {
                bytes: &per_instance,
                base: 0,
                stride: 4,
            },
        ];

        let compiler = PassthroughCompiler::new();
        let variant = compiler
            .compile(&CompileRequest {
                shader: None,
                key: CompileKey::Fetch(&key),
            })
            .unwrap();
        let mut outputs = [[0.0; 4]; 2];
        let mut inv = Invocation::new(&[], &mut outputs);
        inv.buffers = &buffers;
        inv.vertex_id = 1;
        inv.instance_id = 3;
        variant.entry.call(&mut inv);
        assert_eq!(outputs, [[2.0, 3.0, 0.0, 1.0], [20.0, 0.0, 0.0, 1.0]]);
    }

    #[test]
    fn fragment_prefers_constants_then_linked_color() {
        let desc = ShaderDescription::new(
            ShaderStage::Fragment,
            vec![1u8],
            ShaderInfo {
                inputs: vec![ShaderInput {
                    semantic: Semantic::new(SemanticName::Color, 0),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let mut key = FsKey::zeroed();
        key.nr_cbufs = 2;

        let compiler = PassthroughCompiler::new();
        let variant = compiler
            .compile(&CompileRequest {
                shader: Some(&desc),
                key: CompileKey::Fragment(&key),
            })
            .unwrap();
        assert_eq!(compiler.compile_count(), 1);

        let inputs = [[0.0, 1.0, 0.0, 1.0]];
        let mut outputs = [[0.0; 4]; 3];
        variant.entry.call(&mut Invocation::new(&inputs, &mut outputs));
        assert_eq!(outputs[1], [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(outputs[2], [0.0; 4]);

        let constants: Vec<u8> = [0.5f32, 0.5, 0.5, 1.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut inv = Invocation::new(&inputs, &mut outputs);
        inv.constants = &constants;
        variant.entry.call(&mut inv);
        assert_eq!(outputs[0], [0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn stage_variants_need_a_shader() {
        let key = crate::shader::key::VsKey::zeroed();
        let err = PassthroughCompiler::new()
            .compile(&CompileRequest {
                shader: None,
                key: CompileKey::Vertex(&key),
            })
            .unwrap_err();
        assert_eq!(err.kind, VariantKind::Vertex);
    }
}
