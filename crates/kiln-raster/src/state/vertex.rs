use std::fmt;
use std::sync::Mutex;

use crate::lock;
use crate::resource::Resource;
use crate::shader::key::FetchKey;
use crate::shader::{CompiledVariant, VariantCache};

pub const MAX_VERTEX_BUFFERS: usize = 16;
pub const MAX_VERTEX_ELEMENTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum VertexFormat {
    Float32 = 0,
    Float32x2 = 1,
    Float32x3 = 2,
    #[default]
    Float32x4 = 3,
    Unorm8x4 = 4,
    Uint32 = 5,
    Uint32x2 = 6,
}

impl VertexFormat {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => VertexFormat::Float32,
            1 => VertexFormat::Float32x2,
            2 => VertexFormat::Float32x3,
            4 => VertexFormat::Unorm8x4,
            5 => VertexFormat::Uint32,
            6 => VertexFormat::Uint32x2,
            _ => VertexFormat::Float32x4,
        }
    }

    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Unorm8x4 => 4,
            VertexFormat::Float32x2 | VertexFormat::Uint32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }

    /// Expand one element to a vec4, filling missing components with
    /// `(0, 0, 0, 1)`.
    pub fn decode(self, bytes: &[u8]) -> [f32; 4] {
        let mut out = [0.0, 0.0, 0.0, 1.0];
        let word = |i: usize| -> [u8; 4] {
            let mut w = [0u8; 4];
            w.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            w
        };
        match self {
            VertexFormat::Float32
            | VertexFormat::Float32x2
            | VertexFormat::Float32x3
            | VertexFormat::Float32x4 => {
                let n = self.size() as usize / 4;
                for (i, slot) in out.iter_mut().take(n).enumerate() {
                    *slot = f32::from_le_bytes(word(i));
                }
            }
            VertexFormat::Unorm8x4 => {
                for (slot, byte) in out.iter_mut().zip(&bytes[..4]) {
                    *slot = f32::from(*byte) / 255.0;
                }
            }
            VertexFormat::Uint32 | VertexFormat::Uint32x2 => {
                let n = self.size() as usize / 4;
                for (i, slot) in out.iter_mut().take(n).enumerate() {
                    *slot = u32::from_le_bytes(word(i)) as f32;
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VertexElement {
    pub src_offset: u32,
    pub vertex_buffer_index: u32,
    /// Zero for per-vertex data, otherwise instances per element step.
    pub instance_divisor: u32,
    pub format: VertexFormat,
}

/// A vertex layout plus the fetch variants compiled for it.
pub struct VertexElements {
    elements: Vec<VertexElement>,
    fetch_key: FetchKey,
    variants: Mutex<VariantCache>,
}

impl VertexElements {
    /// # Panics
    ///
    /// If more than [`MAX_VERTEX_ELEMENTS`] elements are given or one refers
    /// to a buffer slot past [`MAX_VERTEX_BUFFERS`].
    pub fn new(elements: &[VertexElement]) -> Self {
        assert!(
            elements.len() <= MAX_VERTEX_ELEMENTS,
            "{} vertex elements exceed the limit of {MAX_VERTEX_ELEMENTS}",
            elements.len()
        );
        for element in elements {
            assert!(
                (element.vertex_buffer_index as usize) < MAX_VERTEX_BUFFERS,
                "vertex element reads buffer slot {}",
                element.vertex_buffer_index
            );
        }
        Self {
            elements: elements.to_vec(),
            fetch_key: FetchKey::from_elements(elements),
            variants: Mutex::new(VariantCache::new()),
        }
    }

    pub fn elements(&self) -> &[VertexElement] {
        &self.elements
    }

    pub fn fetch_key(&self) -> &FetchKey {
        &self.fetch_key
    }

    pub fn is_instanced(&self, index: usize) -> bool {
        self.elements
            .get(index)
            .is_some_and(|element| element.instance_divisor != 0)
    }

    pub(crate) fn variants(&self) -> &Mutex<VariantCache> {
        &self.variants
    }

    pub fn variant_count(&self) -> usize {
        lock(&self.variants).len()
    }

    pub(crate) fn take_variants(&self) -> Vec<CompiledVariant> {
        lock(&self.variants).drain()
    }
}

impl fmt::Debug for VertexElements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VertexElements")
            .field("elements", &self.elements)
            .field("variants", &self.variant_count())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VertexBufferSource {
    Resource(Resource),
    /// Bytes supplied with each draw, see `DrawInfo::client_vertex_buffers`.
    Client,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexBufferBinding {
    pub source: VertexBufferSource,
    pub offset: u64,
    pub stride: u32,
}

impl VertexBufferBinding {
    pub fn resource(resource: Resource, offset: u64, stride: u32) -> Self {
        Self {
            source: VertexBufferSource::Resource(resource),
            offset,
            stride,
        }
    }

    pub fn client(stride: u32) -> Self {
        Self {
            source: VertexBufferSource::Client,
            offset: 0,
            stride,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstantBufferBinding {
    Resource {
        resource: Resource,
        offset: u64,
        size: u64,
    },
    /// Client constants, copied when bound and staged on every draw.
    User(Box<[u8]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexSize {
    U8,
    U16,
    U32,
}

impl IndexSize {
    pub fn bytes(self) -> usize {
        match self {
            IndexSize::U8 => 1,
            IndexSize::U16 => 2,
            IndexSize::U32 => 4,
        }
    }

    pub fn read(self, bytes: &[u8], index: usize) -> Option<u32> {
        let size = self.bytes();
        let raw = bytes.get(index * size..index * size + size)?;
        Some(match self {
            IndexSize::U8 => u32::from(raw[0]),
            IndexSize::U16 => u32::from(u16::from_le_bytes([raw[0], raw[1]])),
            IndexSize::U32 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        })
    }

    /// Restart index implied by the index size.
    pub fn max_value(self) -> u32 {
        match self {
            IndexSize::U8 => u32::from(u8::MAX),
            IndexSize::U16 => u32::from(u16::MAX),
            IndexSize::U32 => u32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fills_missing_components() {
        let bytes: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(VertexFormat::Float32x2.decode(&bytes), [1.5, -2.0, 0.0, 1.0]);
        assert_eq!(
            VertexFormat::Unorm8x4.decode(&[255, 0, 51, 255]),
            [1.0, 0.0, 0.2, 1.0]
        );
    }

    #[test]
    fn index_reads_are_little_endian_and_bounded() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(IndexSize::U16.read(&bytes, 1), Some(0x0403));
        assert_eq!(IndexSize::U32.read(&bytes, 0), Some(0x0403_0201));
        assert_eq!(IndexSize::U32.read(&bytes, 1), None);
        assert_eq!(IndexSize::U8.max_value(), 255);
    }

    #[test]
    #[should_panic(expected = "buffer slot")]
    fn elements_past_the_buffer_limit_are_rejected() {
        VertexElements::new(&[VertexElement {
            vertex_buffer_index: MAX_VERTEX_BUFFERS as u32,
            ..Default::default()
        }]);
    }
}
