//! CPU access to resources: maps, copies and blits.
//!
//! All of these read or write linear storage directly, so each first pulls
//! hot-tile writes out of the backend and waits for in-flight rendering that
//! references the resource.

use bitflags::bitflags;

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::resource::{Plane, Resource};
use crate::state::viewport::Rect;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Fail with [`EngineError::NotReady`] instead of waiting.
        const DONT_BLOCK = 1 << 2;
        /// Skip all synchronization; the caller guarantees no overlap with
        /// in-flight rendering.
        const UNSYNCHRONIZED = 1 << 3;
    }
}

impl Context {
    /// Bring `resource`'s linear storage up to date and wait until no queued
    /// work reads it (for `write`) or writes it.
    ///
    /// With `dont_block`, only submits when the work covering the resource
    /// has not been submitted yet, so polling converges once the backend
    /// catches up.
    fn sync_for_cpu(&mut self, resource: &Resource, write: bool, dont_block: bool) -> EngineResult<()> {
        if resource.is_released() {
            return Err(EngineError::Released(resource.id()));
        }
        let stored = self.sync_attachment(resource, write);

        let tracker = resource.tracker();
        let busy = if write {
            !tracker.is_unused()
        } else {
            tracker.has_pending_writes()
        };
        if !busy && !stored {
            return Ok(());
        }

        let mut target = tracker.last_use();
        if stored {
            // The tile store itself rides on the next submission.
            target = target.max(self.fence.write() + 1);
        }
        if target > self.fence.write() {
            self.link().submit();
        }
        if self.fence.read() < target {
            if dont_block {
                tracing::trace!(resource = %resource.id(), target, "map would block");
                return Err(EngineError::NotReady(resource.id()));
            }
            self.fence.wait_for(target);
        }
        tracker.mark_unused();
        Ok(())
    }

    /// Run `f` over the primary plane of `resource`.
    pub fn map<R>(
        &mut self,
        resource: &Resource,
        flags: MapFlags,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> EngineResult<R> {
        if !flags.contains(MapFlags::UNSYNCHRONIZED) {
            self.sync_for_cpu(
                resource,
                flags.contains(MapFlags::WRITE),
                flags.contains(MapFlags::DONT_BLOCK),
            )?;
        }
        resource.write_plane(Plane::Primary, f)
    }

    /// Copy `src_rect` of `src` to (`dst_x`, `dst_y`) in `dst`. Formats must
    /// have the same pixel size and sample counts must match. Buffers are
    /// addressed as one row of bytes.
    pub fn copy_region(
        &mut self,
        dst: &Resource,
        dst_x: u32,
        dst_y: u32,
        src: &Resource,
        src_rect: Rect,
    ) -> EngineResult<()> {
        let src_bpp = src.layout(Plane::Primary).bytes_per_pixel;
        if src_bpp != dst.layout(Plane::Primary).bytes_per_pixel {
            return Err(EngineError::UnsupportedFormat {
                format: dst.format(),
                usage: "copies from a format of a different size",
            });
        }
        if src.samples() != dst.samples() {
            return Err(EngineError::UnsupportedBlit {
                src: src.format(),
                dst: dst.format(),
            });
        }
        self.transfer(dst, dst_x, dst_y, src, src_rect, false)
    }

    /// Byte copy between two buffers.
    pub fn copy_buffer(
        &mut self,
        dst: &Resource,
        dst_offset: u32,
        src: &Resource,
        src_offset: u32,
        len: u32,
    ) -> EngineResult<()> {
        let end = src_offset.saturating_add(len);
        self.copy_region(dst, dst_offset, 0, src, Rect::new(src_offset, 0, end, 1))
    }

    /// Same-size blit. Only plain copies and multisample resolves between
    /// identical formats are supported; everything else reports
    /// [`EngineError::UnsupportedBlit`] so the caller can fall back.
    pub fn blit(&mut self, dst: &Resource, dst_rect: Rect, src: &Resource, src_rect: Rect) -> EngineResult<()> {
        let unsupported = EngineError::UnsupportedBlit {
            src: src.format(),
            dst: dst.format(),
        };
        if src.format() != dst.format()
            || src_rect.width() != dst_rect.width()
            || src_rect.height() != dst_rect.height()
        {
            return Err(unsupported);
        }
        match (src.samples(), dst.samples()) {
            (s, d) if s == d => self.transfer(dst, dst_rect.x0, dst_rect.y0, src, src_rect, false),
            (_, 1) => self.transfer(dst, dst_rect.x0, dst_rect.y0, src, src_rect, true),
            _ => Err(unsupported),
        }
    }

    fn transfer(
        &mut self,
        dst: &Resource,
        dst_x: u32,
        dst_y: u32,
        src: &Resource,
        src_rect: Rect,
        resolve: bool,
    ) -> EngineResult<()> {
        let src_rect = src_rect.intersect(&Rect::full(src.width(), src.height()));
        if src_rect.is_empty() || dst_x >= dst.width() || dst_y >= dst.height() {
            return Ok(());
        }
        let width = src_rect.width().min(dst.width() - dst_x);
        let height = src_rect.height().min(dst.height() - dst_y);
        let src_rect = Rect::new(src_rect.x0, src_rect.y0, src_rect.x0 + width, src_rect.y0 + height);

        self.sync_for_cpu(src, false, false)?;
        self.sync_for_cpu(dst, true, false)?;
        copy_pixels(dst, dst_x, dst_y, src, src_rect, resolve)?;
        tracing::trace!(
            src = %src.id(),
            dst = %dst.id(),
            width,
            height,
            resolve,
            "copied region"
        );
        Ok(())
    }
}

/// Copy every plane both resources have. `resolve` takes sample 0 of each
/// source pixel.
fn copy_pixels(
    dst: &Resource,
    dst_x: u32,
    dst_y: u32,
    src: &Resource,
    rect: Rect,
    resolve: bool,
) -> EngineResult<()> {
    let mut planes = vec![Plane::Primary];
    if src.has_stencil_plane() && dst.has_stencil_plane() {
        planes.push(Plane::Stencil);
    }

    for plane in planes {
        let src_layout = src.layout(plane);
        let dst_layout = dst.layout(plane);
        let bpp = src_layout.bytes_per_pixel as usize;
        let samples = if resolve { 1 } else { src_layout.samples as usize };
        let row_len = rect.width() as usize * samples * bpp;

        let rows = src.read_plane(plane, |bytes| {
            let mut out = Vec::with_capacity(row_len * rect.height() as usize);
            for y in rect.y0..rect.y1 {
                if resolve {
                    for x in rect.x0..rect.x1 {
                        let at = src_layout.offset(x, y, 0);
                        out.extend_from_slice(&bytes[at..at + bpp]);
                    }
                } else {
                    let at = src_layout.offset(rect.x0, y, 0);
                    out.extend_from_slice(&bytes[at..at + row_len]);
                }
            }
            out
        })?;

        dst.write_plane(plane, |bytes| {
            for (i, row) in rows.chunks(row_len).enumerate() {
                let at = dst_layout.offset(dst_x, dst_y + i as u32, 0);
                bytes[at..at + row.len()].copy_from_slice(row);
            }
        })?;
    }
    Ok(())
}
