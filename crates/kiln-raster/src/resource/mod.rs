//! Textures and buffers shared between the frontend and backend workers.
//!
//! A [`Resource`] is a cheap handle. Its linear storage is either owned by the
//! engine or provided by an external [`DisplayTarget`]. Render-target capable
//! resources also have hot-tile copies inside the backend; those are kept
//! coherent with the linear storage by [`crate::tile_sync`].

mod format;
mod status;

pub use format::Format;
pub use status::{ResourceStatus, StatusTracker};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::{EngineError, EngineResult};
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const SAMPLER_VIEW = 1 << 2;
        const VERTEX_BUFFER = 1 << 3;
        const INDEX_BUFFER = 1 << 4;
        const CONSTANT_BUFFER = 1 << 5;
        const DISPLAY_TARGET = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceTarget {
    /// `width` is the size in bytes, `height` is 1.
    Buffer,
    Texture2D,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub target: ResourceTarget,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub bind: BindFlags,
}

impl ResourceDesc {
    pub fn buffer(size: u32, bind: BindFlags) -> Self {
        Self {
            target: ResourceTarget::Buffer,
            format: Format::R8Unorm,
            width: size,
            height: 1,
            samples: 1,
            bind,
        }
    }

    pub fn texture_2d(format: Format, width: u32, height: u32, bind: BindFlags) -> Self {
        Self {
            target: ResourceTarget::Texture2D,
            format,
            width,
            height,
            samples: 1,
            bind,
        }
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples.max(1);
        self
    }

    pub fn is_render_target(&self) -> bool {
        self.bind
            .intersects(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL)
    }
}

/// Which storage plane of a resource an attachment refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    Primary,
    /// Stencil bits of a fused depth/stencil resource.
    Stencil,
}

/// Byte layout of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    /// Bytes per sample.
    pub bytes_per_pixel: u32,
    /// Bytes between rows; samples of a pixel are stored adjacently.
    pub pitch: usize,
}

impl PlaneLayout {
    pub fn size(&self) -> usize {
        self.pitch * self.height as usize
    }

    /// Byte offset of sample `sample` at (`x`, `y`).
    pub fn offset(&self, x: u32, y: u32, sample: u32) -> usize {
        y as usize * self.pitch
            + (x as usize * self.samples as usize + sample as usize) * self.bytes_per_pixel as usize
    }
}

/// Externally managed memory backing a resource (e.g. a window-system buffer).
///
/// The engine never frees display memory; it calls [`DisplayTarget::destroy`]
/// once nothing in flight can still reference it.
pub trait DisplayTarget: Send + Sync {
    /// Row pitch of the target in bytes.
    fn stride(&self) -> usize;

    /// Run `f` over the target's pixel memory.
    fn map(&self, f: &mut dyn FnMut(&mut [u8]));

    fn destroy(&self);
}

enum Storage {
    Owned(Mutex<Vec<u8>>),
    Display(Arc<dyn DisplayTarget>),
}

impl Storage {
    fn owned(size: usize) -> Self {
        Storage::Owned(Mutex::new(vec![0; size]))
    }
}

struct ResourceInner {
    id: ResourceId,
    desc: ResourceDesc,
    status: StatusTracker,
    primary: Storage,
    stencil: Option<Storage>,
    resolve_target: Option<Resource>,
    released: AtomicBool,
}

/// Shared handle to a texture or buffer. Equality is identity.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    pub(crate) fn new_owned(
        id: ResourceId,
        desc: ResourceDesc,
        resolve_target: Option<Resource>,
    ) -> Self {
        let bpp = match desc.target {
            ResourceTarget::Buffer => 1,
            ResourceTarget::Texture2D => desc.format.bytes_per_pixel() as usize,
        };
        let size =
            desc.width as usize * desc.height as usize * desc.samples.max(1) as usize * bpp;
        Self::build(id, desc, Storage::owned(size), resolve_target)
    }

    pub(crate) fn new_display(
        id: ResourceId,
        desc: ResourceDesc,
        target: Arc<dyn DisplayTarget>,
    ) -> Self {
        Self::build(id, desc, Storage::Display(target), None)
    }

    fn build(
        id: ResourceId,
        desc: ResourceDesc,
        primary: Storage,
        resolve_target: Option<Resource>,
    ) -> Self {
        let stencil = desc.format.is_fused_depth_stencil().then(|| {
            let size = desc.width as usize * desc.height as usize * desc.samples.max(1) as usize;
            Storage::owned(size)
        });
        Self {
            inner: Arc::new(ResourceInner {
                id,
                desc,
                status: StatusTracker::new(),
                primary,
                stencil,
                resolve_target,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.inner.desc
    }

    pub fn format(&self) -> Format {
        self.inner.desc.format
    }

    pub fn width(&self) -> u32 {
        self.inner.desc.width
    }

    pub fn height(&self) -> u32 {
        self.inner.desc.height
    }

    pub fn samples(&self) -> u32 {
        self.inner.desc.samples
    }

    pub fn status(&self) -> ResourceStatus {
        self.inner.status.get()
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.inner.status
    }

    /// Single-sample companion of a multisampled resource.
    pub fn resolve_target(&self) -> Option<&Resource> {
        self.inner.resolve_target.as_ref()
    }

    pub fn is_display_target(&self) -> bool {
        matches!(self.inner.primary, Storage::Display(_))
    }

    pub fn has_stencil_plane(&self) -> bool {
        self.inner.stencil.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn layout(&self, plane: Plane) -> PlaneLayout {
        let desc = &self.inner.desc;
        let samples = desc.samples.max(1);
        let (format, bpp) = match (plane, desc.target) {
            (_, ResourceTarget::Buffer) => (desc.format, 1),
            (Plane::Stencil, _) => (Format::S8Uint, 1),
            (Plane::Primary, _) => (desc.format, desc.format.bytes_per_pixel()),
        };
        let pitch = match (&self.inner.primary, plane) {
            (Storage::Display(target), Plane::Primary) => target.stride(),
            _ => desc.width as usize * samples as usize * bpp as usize,
        };
        PlaneLayout {
            format,
            width: desc.width,
            height: desc.height,
            samples,
            bytes_per_pixel: bpp,
            pitch,
        }
    }

    fn storage(&self, plane: Plane) -> Option<&Storage> {
        match plane {
            Plane::Primary => Some(&self.inner.primary),
            Plane::Stencil => self.inner.stencil.as_ref(),
        }
    }

    /// Read a plane's linear bytes.
    pub fn read_plane<R>(&self, plane: Plane, f: impl FnOnce(&[u8]) -> R) -> EngineResult<R> {
        self.write_plane(plane, |bytes| f(bytes))
    }

    /// Mutate a plane's linear bytes.
    pub fn write_plane<R>(&self, plane: Plane, f: impl FnOnce(&mut [u8]) -> R) -> EngineResult<R> {
        if self.is_released() {
            return Err(EngineError::Released(self.id()));
        }
        let storage = self.storage(plane).ok_or(EngineError::UnsupportedFormat {
            format: self.format(),
            usage: "stencil plane access",
        })?;
        match storage {
            Storage::Owned(bytes) => Ok(f(&mut lock(bytes))),
            Storage::Display(target) => {
                let mut f = Some(f);
                let mut out = None;
                target.map(&mut |bytes| {
                    if let Some(f) = f.take() {
                        out = Some(f(bytes));
                    }
                });
                out.ok_or(EngineError::Released(self.id()))
            }
        }
    }

    /// Copy `data` into the primary plane at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> EngineResult<()> {
        let id = self.id();
        self.write_plane(Plane::Primary, |bytes| {
            let range = checked_range(id, offset, data.len() as u64, bytes.len())?;
            bytes[range].copy_from_slice(data);
            Ok(())
        })?
    }

    /// Copy `len` bytes out of the primary plane at `offset`.
    pub fn read_bytes(&self, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
        let id = self.id();
        self.read_plane(Plane::Primary, |bytes| {
            let range = checked_range(id, offset, len as u64, bytes.len())?;
            Ok(bytes[range].to_vec())
        })?
    }

    /// Drop engine-owned storage. Display memory is left to
    /// [`Resource::destroy_display_target`].
    pub(crate) fn release_storage(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Storage::Owned(bytes) = &self.inner.primary {
            *lock(bytes) = Vec::new();
        }
        if let Some(Storage::Owned(bytes)) = &self.inner.stencil {
            *lock(bytes) = Vec::new();
        }
        if let Some(resolve) = &self.inner.resolve_target {
            resolve.release_storage();
        }
        tracing::debug!(resource = %self.id(), "released resource storage");
    }

    pub(crate) fn destroy_display_target(&self) {
        if let Storage::Display(target) = &self.inner.primary {
            if !self.inner.released.swap(true, Ordering::AcqRel) {
                target.destroy();
            }
        }
    }
}

pub(crate) fn checked_range(
    id: ResourceId,
    offset: u64,
    len: u64,
    size: usize,
) -> EngineResult<std::ops::Range<usize>> {
    let end = offset.checked_add(len).unwrap_or(u64::MAX);
    if end > size as u64 {
        return Err(EngineError::OutOfBounds {
            id,
            offset,
            end,
            size: size as u64,
        });
    }
    Ok(offset as usize..end as usize)
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.inner.id)
            .field("format", &self.inner.desc.format)
            .field("width", &self.inner.desc.width)
            .field("height", &self.inner.desc.height)
            .field("samples", &self.inner.desc.samples)
            .field("status", &self.status())
            .finish()
    }
}
