//! Viewport and scissor conversion from frontend form to backend form.

pub const MAX_VIEWPORTS: usize = 16;

/// Viewport transform as bound: `window = ndc * scale + translate`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub scale: [f32; 3],
    pub translate: [f32; 3],
}

impl Viewport {
    /// Transform covering `width` x `height` pixels with depth in `[0, 1]`.
    pub fn from_rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            scale: [width * 0.5, height * 0.5, 0.5],
            translate: [x + width * 0.5, y + height * 0.5, 0.5],
        }
    }

    /// Depth range produced by this transform.
    pub fn depth_range(&self, clip_halfz: bool) -> (f32, f32) {
        let (a, b) = if clip_halfz {
            (self.translate[2], self.translate[2] + self.scale[2])
        } else {
            (
                self.translate[2] - self.scale[2],
                self.translate[2] + self.scale[2],
            )
        };
        (a.min(b), a.max(b))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScissorRect {
    pub minx: u32,
    pub miny: u32,
    pub maxx: u32,
    pub maxy: u32,
}

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }
}

/// Viewport rectangle and depth clamp range in window space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BackendViewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_z: f32,
    pub max_z: f32,
}

impl BackendViewport {
    /// Pixels covered by the viewport, rounded outwards.
    pub fn pixel_rect(&self) -> Rect {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = (self.x + self.width).max(0.0).ceil() as u32;
        let y1 = (self.y + self.height).max(0.0).ceil() as u32;
        Rect::new(x0, y0, x1, y1)
    }
}

/// Diagonal and translation of the viewport matrix.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportMatrix {
    pub m00: f32,
    pub m11: f32,
    pub m22: f32,
    pub m30: f32,
    pub m31: f32,
    pub m32: f32,
}

impl ViewportMatrix {
    pub fn apply(&self, ndc: [f32; 3]) -> [f32; 3] {
        [
            ndc[0] * self.m00 + self.m30,
            ndc[1] * self.m11 + self.m31,
            ndc[2] * self.m22 + self.m32,
        ]
    }
}

/// Derive the backend viewport for one bound viewport.
///
/// The rectangle is clipped to the framebuffer. With depth clipping enabled
/// the clamp range opens to the full `[0, 1]` on that side.
pub fn derive_viewport(
    vp: &Viewport,
    fb_width: u32,
    fb_height: u32,
    clip_halfz: bool,
    depth_clip_near: bool,
    depth_clip_far: bool,
) -> (BackendViewport, ViewportMatrix) {
    let mut out = BackendViewport {
        x: vp.translate[0] - vp.scale[0],
        width: 2.0 * vp.scale[0],
        y: vp.translate[1] - vp.scale[1].abs(),
        height: 2.0 * vp.scale[1].abs(),
        ..Default::default()
    };
    let (min_z, max_z) = vp.depth_range(clip_halfz);
    out.min_z = if depth_clip_near { 0.0 } else { min_z };
    out.max_z = if depth_clip_far { 1.0 } else { max_z };

    let fb_width = fb_width as f32;
    let fb_height = fb_height as f32;
    out.x = out.x.clamp(0.0, fb_width);
    out.y = out.y.clamp(0.0, fb_height);
    out.width = out.width.min(fb_width - out.x).max(0.0);
    out.height = out.height.min(fb_height - out.y).max(0.0);

    let matrix = ViewportMatrix {
        m00: vp.scale[0],
        m11: vp.scale[1],
        m22: vp.scale[2],
        m30: vp.translate[0],
        m31: vp.translate[1],
        m32: vp.translate[2],
    };
    (out, matrix)
}

/// Backend scissor rectangle clipped to the framebuffer.
pub fn derive_scissor(scissor: &ScissorRect, fb_width: u32, fb_height: u32) -> Rect {
    Rect::new(
        scissor.minx.min(fb_width),
        scissor.miny.min(fb_height),
        scissor.maxx.min(fb_width),
        scissor.maxy.min(fb_height),
    )
}
