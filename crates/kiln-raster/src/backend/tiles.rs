//! Hot tiles: the backend's working copy of a render target.
//!
//! A surface is split into `HOT_TILE_DIM` square tiles stored tile-major.
//! Tiles load lazily from linear storage on first touch and only go back on
//! an explicit store.

use crate::error::EngineResult;
use crate::resource::{Format, Plane, PlaneLayout, Resource};
use crate::state::viewport::Rect;

use super::{SurfaceBinding, TileState};

pub const HOT_TILE_DIM: u32 = 16;

struct HotTile {
    state: TileState,
    /// Row-major inside the tile, samples of a pixel adjacent. Empty while
    /// the tile is invalid.
    data: Box<[u8]>,
}

/// Outcome of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreReport {
    pub tiles_stored: usize,
    pub tiles_resolved: usize,
}

pub struct HotTileSurface {
    binding: SurfaceBinding,
    layout: PlaneLayout,
    tiles_x: u32,
    tiles_y: u32,
    tiles: Vec<HotTile>,
}

impl HotTileSurface {
    pub fn new(binding: SurfaceBinding) -> Self {
        let layout = binding.resource.layout(binding.plane);
        let tiles_x = layout.width.div_ceil(HOT_TILE_DIM);
        let tiles_y = layout.height.div_ceil(HOT_TILE_DIM);
        let tiles = (0..tiles_x * tiles_y)
            .map(|_| HotTile {
                state: TileState::Invalid,
                data: Box::default(),
            })
            .collect();
        Self {
            binding,
            layout,
            tiles_x,
            tiles_y,
            tiles,
        }
    }

    pub fn binding(&self) -> &SurfaceBinding {
        &self.binding
    }

    pub fn resource(&self) -> &Resource {
        &self.binding.resource
    }

    pub fn plane(&self) -> Plane {
        self.binding.plane
    }

    pub fn format(&self) -> Format {
        self.layout.format
    }

    pub fn samples(&self) -> u32 {
        self.layout.samples
    }

    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    pub fn is_bound_to(&self, binding: &SurfaceBinding) -> bool {
        self.binding.resource.ptr_eq(&binding.resource) && self.binding.plane == binding.plane
    }

    pub fn tile_state(&self, x: u32, y: u32) -> TileState {
        self.tiles[self.tile_index(x, y)].state
    }

    pub fn dirty_tiles(&self) -> usize {
        self.tiles
            .iter()
            .filter(|tile| tile.state == TileState::Dirty)
            .count()
    }

    fn tile_index(&self, x: u32, y: u32) -> usize {
        ((y / HOT_TILE_DIM) * self.tiles_x + x / HOT_TILE_DIM) as usize
    }

    fn tile_bytes(&self) -> usize {
        (HOT_TILE_DIM * HOT_TILE_DIM * self.layout.samples * self.layout.bytes_per_pixel) as usize
    }

    fn offset_in_tile(&self, x: u32, y: u32, sample: u32) -> usize {
        let lx = x % HOT_TILE_DIM;
        let ly = y % HOT_TILE_DIM;
        (((ly * HOT_TILE_DIM + lx) * self.layout.samples + sample) * self.layout.bytes_per_pixel)
            as usize
    }

    /// Pixel rectangle of tile `(tx, ty)`, clipped to the surface.
    fn tile_rect(&self, tx: u32, ty: u32) -> Rect {
        Rect::new(
            tx * HOT_TILE_DIM,
            ty * HOT_TILE_DIM,
            ((tx + 1) * HOT_TILE_DIM).min(self.layout.width),
            ((ty + 1) * HOT_TILE_DIM).min(self.layout.height),
        )
    }

    /// Tiles whose pixels intersect `rect`.
    fn tiles_in(&self, rect: Rect) -> impl Iterator<Item = (u32, u32)> {
        let rect = rect.intersect(&Rect::full(self.layout.width, self.layout.height));
        let (tx0, ty0) = (rect.x0 / HOT_TILE_DIM, rect.y0 / HOT_TILE_DIM);
        let (tx1, ty1) = if rect.is_empty() {
            (tx0, ty0)
        } else {
            (
                rect.x1.div_ceil(HOT_TILE_DIM),
                rect.y1.div_ceil(HOT_TILE_DIM),
            )
        };
        (ty0..ty1).flat_map(move |ty| (tx0..tx1).map(move |tx| (tx, ty)))
    }

    /// Make sure tile `(tx, ty)` holds valid contents.
    fn ensure_loaded(&mut self, tx: u32, ty: u32) -> EngineResult<()> {
        let index = (ty * self.tiles_x + tx) as usize;
        if self.tiles[index].state != TileState::Invalid {
            return Ok(());
        }

        let mut data = vec![0u8; self.tile_bytes()].into_boxed_slice();
        let rect = self.tile_rect(tx, ty);
        let row_bytes = (rect.width() * self.layout.samples * self.layout.bytes_per_pixel) as usize;
        let layout = self.layout;
        self.binding.resource.read_plane(self.binding.plane, |linear| {
            for y in rect.y0..rect.y1 {
                let src = layout.offset(rect.x0, y, 0);
                let dst = (((y - rect.y0) * HOT_TILE_DIM) * layout.samples * layout.bytes_per_pixel)
                    as usize;
                if let Some(src) = linear.get(src..src + row_bytes) {
                    data[dst..dst + row_bytes].copy_from_slice(src);
                }
            }
        })?;

        let tile = &mut self.tiles[index];
        tile.data = data;
        tile.state = TileState::Resolved;
        Ok(())
    }

    pub fn read_sample(&mut self, x: u32, y: u32, sample: u32) -> EngineResult<[f32; 4]> {
        self.ensure_loaded(x / HOT_TILE_DIM, y / HOT_TILE_DIM)?;
        let offset = self.offset_in_tile(x, y, sample);
        let bpp = self.layout.bytes_per_pixel as usize;
        let tile = &self.tiles[self.tile_index(x, y)];
        Ok(self.layout.format.unpack(&tile.data[offset..offset + bpp]))
    }

    /// Write every sample of pixel `(x, y)`.
    pub fn write_pixel(&mut self, x: u32, y: u32, value: [f32; 4]) -> EngineResult<()> {
        self.ensure_loaded(x / HOT_TILE_DIM, y / HOT_TILE_DIM)?;
        let bpp = self.layout.bytes_per_pixel as usize;
        let format = self.layout.format;
        let first = self.offset_in_tile(x, y, 0);
        let samples = self.layout.samples as usize;
        let index = self.tile_index(x, y);
        let tile = &mut self.tiles[index];
        for s in 0..samples {
            let offset = first + s * bpp;
            format.pack(value, &mut tile.data[offset..offset + bpp]);
        }
        tile.state = TileState::Dirty;
        Ok(())
    }

    pub fn fill(&mut self, rect: Rect, value: [f32; 4]) -> EngineResult<()> {
        let rect = rect.intersect(&Rect::full(self.layout.width, self.layout.height));
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                self.write_pixel(x, y, value)?;
            }
        }
        Ok(())
    }

    /// Write dirty tiles inside `rect` to linear storage and move every tile
    /// inside `rect` to `post`. Multisampled surfaces also resolve sample zero
    /// of each stored tile into the resource's resolve target.
    pub fn store(&mut self, rect: Rect, post: TileState) -> EngineResult<StoreReport> {
        let tiles: Vec<(u32, u32)> = self.tiles_in(rect).collect();
        let dirty: Vec<(u32, u32)> = tiles
            .iter()
            .copied()
            .filter(|&(tx, ty)| self.tiles[(ty * self.tiles_x + tx) as usize].state == TileState::Dirty)
            .collect();

        let mut report = StoreReport::default();
        if !dirty.is_empty() {
            let layout = self.layout;
            let this = &*self;
            this.binding.resource.write_plane(this.binding.plane, |linear| {
                for &(tx, ty) in &dirty {
                    this.copy_tile_out(tx, ty, linear, &layout, None);
                }
            })?;
            report.tiles_stored = dirty.len();

            if self.layout.samples > 1 {
                if let Some(resolve) = self.binding.resource.resolve_target().cloned() {
                    let resolve_layout = resolve.layout(Plane::Primary);
                    let this = &*self;
                    resolve.write_plane(Plane::Primary, |linear| {
                        for &(tx, ty) in &dirty {
                            this.copy_tile_out(tx, ty, linear, &resolve_layout, Some(0));
                        }
                    })?;
                    report.tiles_resolved = dirty.len();
                }
            }
        }

        for (tx, ty) in tiles {
            let tile = &mut self.tiles[(ty * self.tiles_x + tx) as usize];
            match post {
                TileState::Invalid => {
                    tile.state = TileState::Invalid;
                    tile.data = Box::default();
                }
                TileState::Resolved if tile.state == TileState::Dirty => {
                    tile.state = TileState::Resolved;
                }
                TileState::Resolved | TileState::Dirty => {}
            }
        }
        Ok(report)
    }

    /// Copy one tile into `linear` laid out as `dst`. With `sample` set only
    /// that sample is written, as a single-sample pixel.
    fn copy_tile_out(&self, tx: u32, ty: u32, linear: &mut [u8], dst: &PlaneLayout, sample: Option<u32>) {
        let tile = &self.tiles[(ty * self.tiles_x + tx) as usize];
        let rect = self.tile_rect(tx, ty);
        let bpp = self.layout.bytes_per_pixel as usize;
        match sample {
            None => {
                let row_bytes = rect.width() as usize * self.layout.samples as usize * bpp;
                for y in rect.y0..rect.y1 {
                    let src = self.offset_in_tile(rect.x0, y, 0);
                    let at = dst.offset(rect.x0, y, 0);
                    if let Some(out) = linear.get_mut(at..at + row_bytes) {
                        out.copy_from_slice(&tile.data[src..src + row_bytes]);
                    }
                }
            }
            Some(sample) => {
                for y in rect.y0..rect.y1 {
                    for x in rect.x0..rect.x1 {
                        let src = self.offset_in_tile(x, y, sample);
                        let at = dst.offset(x, y, 0);
                        if let Some(out) = linear.get_mut(at..at + bpp) {
                            out.copy_from_slice(&tile.data[src..src + bpp]);
                        }
                    }
                }
            }
        }
    }

    /// Drop tiles inside `rect` without storing. Returns how many dirty tiles
    /// were discarded.
    pub fn invalidate(&mut self, rect: Rect) -> usize {
        let tiles: Vec<(u32, u32)> = self.tiles_in(rect).collect();
        let mut discarded = 0;
        for (tx, ty) in tiles {
            let tile = &mut self.tiles[(ty * self.tiles_x + tx) as usize];
            if tile.state == TileState::Dirty {
                discarded += 1;
            }
            tile.state = TileState::Invalid;
            tile.data = Box::default();
        }
        discarded
    }

    pub fn full_rect(&self) -> Rect {
        Rect::full(self.layout.width, self.layout.height)
    }

    pub fn tile_count(&self) -> usize {
        (self.tiles_x * self.tiles_y) as usize
    }
}

impl std::fmt::Debug for HotTileSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotTileSurface")
            .field("resource", &self.binding.resource.id())
            .field("plane", &self.binding.plane)
            .field("tiles", &(self.tiles_x, self.tiles_y))
            .field("dirty", &self.dirty_tiles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{BindFlags, ResourceDesc, ResourceId};

    fn surface(width: u32, height: u32) -> (Resource, HotTileSurface) {
        let resource = Resource::new_owned(
            ResourceId(1),
            ResourceDesc::texture_2d(Format::Rgba8Unorm, width, height, BindFlags::RENDER_TARGET),
            None,
        );
        let hot = HotTileSurface::new(SurfaceBinding::new(resource.clone(), Plane::Primary));
        (resource, hot)
    }

    #[test]
    fn writes_stay_in_tiles_until_stored() {
        let (resource, mut hot) = surface(20, 20);
        assert_eq!(hot.tile_count(), 4);
        hot.write_pixel(17, 3, [1.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(hot.dirty_tiles(), 1);
        assert_eq!(hot.tile_state(17, 3), TileState::Dirty);

        let at = resource.layout(Plane::Primary).offset(17, 3, 0) as u64;
        assert_eq!(resource.read_bytes(at, 4).unwrap(), vec![0, 0, 0, 0]);

        let report = hot.store(hot.full_rect(), TileState::Resolved).unwrap();
        assert_eq!(report.tiles_stored, 1);
        assert_eq!(resource.read_bytes(at, 4).unwrap(), vec![255, 0, 0, 255]);
        assert_eq!(hot.tile_state(17, 3), TileState::Resolved);

        // Nothing dirty left: a second store writes nothing.
        let again = hot.store(hot.full_rect(), TileState::Resolved).unwrap();
        assert_eq!(again.tiles_stored, 0);
    }

    #[test]
    fn tiles_load_from_linear_storage_on_first_touch() {
        let (resource, mut hot) = surface(8, 8);
        let at = resource.layout(Plane::Primary).offset(2, 5, 0) as u64;
        resource.write_bytes(at, &[0, 255, 0, 255]).unwrap();
        assert_eq!(hot.read_sample(2, 5, 0).unwrap(), [0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn invalidate_discards_unstored_writes() {
        let (resource, mut hot) = surface(8, 8);
        hot.fill(Rect::full(8, 8), [1.0; 4]).unwrap();
        assert_eq!(hot.invalidate(Rect::full(8, 8)), 1);
        assert_eq!(hot.tile_state(0, 0), TileState::Invalid);
        assert_eq!(resource.read_bytes(0, 4).unwrap(), vec![0, 0, 0, 0]);
        assert_eq!(hot.read_sample(0, 0, 0).unwrap(), [0.0; 4]);
    }

    #[test]
    fn multisampled_store_resolves_sample_zero() {
        let resolve = Resource::new_owned(
            ResourceId(2),
            ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4, BindFlags::RENDER_TARGET),
            None,
        );
        let msaa = Resource::new_owned(
            ResourceId(3),
            ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4, BindFlags::RENDER_TARGET)
                .with_samples(4),
            Some(resolve.clone()),
        );
        let mut hot = HotTileSurface::new(SurfaceBinding::new(msaa.clone(), Plane::Primary));
        hot.write_pixel(1, 1, [0.0, 0.0, 1.0, 1.0]).unwrap();
        let report = hot.store(hot.full_rect(), TileState::Invalid).unwrap();
        assert_eq!(report, StoreReport { tiles_stored: 1, tiles_resolved: 1 });

        let at = resolve.layout(Plane::Primary).offset(1, 1, 0) as u64;
        assert_eq!(resolve.read_bytes(at, 4).unwrap(), vec![0, 0, 255, 255]);
        let sample3 = msaa.layout(Plane::Primary).offset(1, 1, 3) as u64;
        assert_eq!(msaa.read_bytes(sample3, 4).unwrap(), vec![0, 0, 255, 255]);
    }

    #[test]
    fn released_storage_is_reported() {
        let (resource, mut hot) = surface(4, 4);
        hot.write_pixel(0, 0, [1.0; 4]).unwrap();
        resource.release_storage();
        assert!(hot.store(hot.full_rect(), TileState::Resolved).is_err());
    }
}
