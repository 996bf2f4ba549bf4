/// Surface formats understood by the tile load/store paths.
///
/// Fused depth/stencil formats are split into a depth plane (described by the
/// format itself) and a separate `S8Uint` stencil plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
    R8Unorm,
    R32Uint,
    R32Float,
    Rg32Float,
    Rgba32Float,
    Z16Unorm,
    Z24UnormS8Uint,
    Z32Float,
    Z32FloatS8X24Uint,
    S8Uint,
}

impl Format {
    /// Bytes per pixel (per sample) of the primary plane.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::R8Unorm | Format::S8Uint => 1,
            Format::Z16Unorm => 2,
            Format::Rgba8Unorm
            | Format::Bgra8Unorm
            | Format::R32Uint
            | Format::R32Float
            | Format::Z24UnormS8Uint
            | Format::Z32Float
            | Format::Z32FloatS8X24Uint => 4,
            Format::Rg32Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    pub fn has_depth(self) -> bool {
        matches!(
            self,
            Format::Z16Unorm | Format::Z24UnormS8Uint | Format::Z32Float | Format::Z32FloatS8X24Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            Format::Z24UnormS8Uint | Format::Z32FloatS8X24Uint | Format::S8Uint
        )
    }

    pub fn is_depth_stencil(self) -> bool {
        self.has_depth() || self.has_stencil()
    }

    /// Depth and stencil share one resource but live in separate planes.
    pub fn is_fused_depth_stencil(self) -> bool {
        self.has_depth() && self.has_stencil()
    }

    pub fn is_color(self) -> bool {
        !self.is_depth_stencil()
    }

    /// Encode one pixel. Color formats take RGBA, depth formats read `value[0]`
    /// as depth and `S8Uint` reads `value[0]` as the stencil value.
    pub fn pack(self, value: [f32; 4], out: &mut [u8]) {
        let bpp = self.bytes_per_pixel() as usize;
        let out = &mut out[..bpp];
        match self {
            Format::Rgba8Unorm => {
                for (dst, v) in out.iter_mut().zip(value) {
                    *dst = unorm8(v);
                }
            }
            Format::Bgra8Unorm => {
                out[0] = unorm8(value[2]);
                out[1] = unorm8(value[1]);
                out[2] = unorm8(value[0]);
                out[3] = unorm8(value[3]);
            }
            Format::R8Unorm => out[0] = unorm8(value[0]),
            Format::R32Uint => out.copy_from_slice(&(value[0].max(0.0) as u32).to_le_bytes()),
            Format::R32Float | Format::Z32Float | Format::Z32FloatS8X24Uint => {
                out.copy_from_slice(&value[0].to_le_bytes())
            }
            Format::Rg32Float | Format::Rgba32Float => {
                for (chunk, v) in out.chunks_exact_mut(4).zip(value) {
                    chunk.copy_from_slice(&v.to_le_bytes());
                }
            }
            Format::Z16Unorm => {
                let d = (value[0].clamp(0.0, 1.0) * u16::MAX as f32).round() as u16;
                out.copy_from_slice(&d.to_le_bytes());
            }
            Format::Z24UnormS8Uint => {
                let d = (value[0].clamp(0.0, 1.0) * 0x00ff_ffff as f32).round() as u32;
                out.copy_from_slice(&d.to_le_bytes());
            }
            Format::S8Uint => out[0] = value[0].clamp(0.0, 255.0) as u8,
        }
    }

    pub fn unpack(self, bytes: &[u8]) -> [f32; 4] {
        let bpp = self.bytes_per_pixel() as usize;
        let bytes = &bytes[..bpp];
        match self {
            Format::Rgba8Unorm => [
                from_unorm8(bytes[0]),
                from_unorm8(bytes[1]),
                from_unorm8(bytes[2]),
                from_unorm8(bytes[3]),
            ],
            Format::Bgra8Unorm => [
                from_unorm8(bytes[2]),
                from_unorm8(bytes[1]),
                from_unorm8(bytes[0]),
                from_unorm8(bytes[3]),
            ],
            Format::R8Unorm => [from_unorm8(bytes[0]), 0.0, 0.0, 1.0],
            Format::R32Uint => [u32_at(bytes, 0) as f32, 0.0, 0.0, 1.0],
            Format::R32Float | Format::Z32Float | Format::Z32FloatS8X24Uint => {
                [f32_at(bytes, 0), 0.0, 0.0, 1.0]
            }
            Format::Rg32Float => [f32_at(bytes, 0), f32_at(bytes, 4), 0.0, 1.0],
            Format::Rgba32Float => [
                f32_at(bytes, 0),
                f32_at(bytes, 4),
                f32_at(bytes, 8),
                f32_at(bytes, 12),
            ],
            Format::Z16Unorm => {
                let d = u16::from_le_bytes([bytes[0], bytes[1]]);
                [d as f32 / u16::MAX as f32, 0.0, 0.0, 1.0]
            }
            Format::Z24UnormS8Uint => {
                let d = u32_at(bytes, 0) & 0x00ff_ffff;
                [d as f32 / 0x00ff_ffff as f32, 0.0, 0.0, 1.0]
            }
            Format::S8Uint => [bytes[0] as f32, 0.0, 0.0, 1.0],
        }
    }
}

fn unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn from_unorm8(v: u8) -> f32 {
    v as f32 / 255.0
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn f32_at(bytes: &[u8], at: usize) -> f32 {
    f32::from_bits(u32_at(bytes, at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_swaps_red_and_blue() {
        let mut px = [0u8; 4];
        Format::Bgra8Unorm.pack([1.0, 0.5, 0.0, 1.0], &mut px);
        assert_eq!(px, [0, 128, 255, 255]);
        let back = Format::Bgra8Unorm.unpack(&px);
        assert_eq!(back[0], 1.0);
        assert_eq!(back[2], 0.0);
    }

    #[test]
    fn depth_formats_clamp() {
        let mut px = [0u8; 4];
        Format::Z24UnormS8Uint.pack([2.0, 0.0, 0.0, 0.0], &mut px);
        assert_eq!(u32::from_le_bytes(px), 0x00ff_ffff);

        let mut px = [0u8; 2];
        Format::Z16Unorm.pack([-1.0, 0.0, 0.0, 0.0], &mut px);
        assert_eq!(px, [0, 0]);
    }

    #[test]
    fn classification() {
        assert!(Format::Z24UnormS8Uint.is_fused_depth_stencil());
        assert!(!Format::Z32Float.is_fused_depth_stencil());
        assert!(Format::S8Uint.has_stencil() && !Format::S8Uint.has_depth());
        assert!(Format::Rgba32Float.is_color());
    }
}
