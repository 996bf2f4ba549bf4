//! Frontend bookkeeping of which attachments hold unstored hot-tile writes.
//!
//! The backend keeps the tiles; this module only decides when they must be
//! stored to linear storage or thrown away. A fused depth/stencil surface
//! occupies both the depth and the stencil slot, and every decision made for
//! one of them is mirrored to the other.

use crate::backend::{AttachmentMask, AttachmentSlot, RenderTargets, SurfaceBinding, NUM_ATTACHMENTS};
use crate::resource::{Plane, Resource};
use crate::state::viewport::Rect;
use crate::state::FramebufferState;

/// Rectangle covering any surface.
pub const WHOLE_SURFACE: Rect = Rect {
    x0: 0,
    y0: 0,
    x1: u32::MAX,
    y1: u32::MAX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    NoTarget,
    AttachedDirty,
    AttachedClean,
}

/// Tile operations needed to switch from the current targets to new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebindPlan {
    /// Slots whose old target must be stored before the switch.
    pub store: AttachmentMask,
    /// Slots whose new target must be reloaded from linear storage.
    pub invalidate: AttachmentMask,
}

impl RebindPlan {
    /// A store of a detaching target must be covered by a fence submission.
    pub fn needs_fence(&self) -> bool {
        !self.store.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    binding: Option<SurfaceBinding>,
    dirty: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TileSynchronizer {
    slots: [Slot; NUM_ATTACHMENTS],
}

fn same_binding(a: Option<&SurfaceBinding>, b: Option<&SurfaceBinding>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.resource.ptr_eq(&b.resource) && a.plane == b.plane,
        (None, None) => true,
        _ => false,
    }
}

/// Attachment bindings for a framebuffer. Depth formats occupy the depth
/// slot; a stencil plane, fused or standalone, occupies the stencil slot.
pub fn render_targets(fb: &FramebufferState) -> RenderTargets {
    let mut targets: RenderTargets = Default::default();
    for (i, cbuf) in fb.cbufs.iter().enumerate() {
        if let Some(resource) = cbuf {
            targets[AttachmentSlot::Color(i as u8).index()] =
                Some(SurfaceBinding::new(resource.clone(), Plane::Primary));
        }
    }
    if let Some(zs) = &fb.zsbuf {
        let format = zs.format();
        if format.has_depth() {
            targets[AttachmentSlot::Depth.index()] =
                Some(SurfaceBinding::new(zs.clone(), Plane::Primary));
        }
        if format.has_stencil() {
            let plane = if format.is_fused_depth_stencil() {
                Plane::Stencil
            } else {
                Plane::Primary
            };
            targets[AttachmentSlot::Stencil.index()] = Some(SurfaceBinding::new(zs.clone(), plane));
        }
    }
    targets
}

impl TileSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, slot: AttachmentSlot) -> AttachmentState {
        let slot = &self.slots[slot.index()];
        match (&slot.binding, slot.dirty) {
            (None, _) => AttachmentState::NoTarget,
            (Some(_), true) => AttachmentState::AttachedDirty,
            (Some(_), false) => AttachmentState::AttachedClean,
        }
    }

    pub fn targets(&self) -> RenderTargets {
        std::array::from_fn(|i| self.slots[i].binding.clone())
    }

    /// Depth and stencil slots hold planes of one fused resource.
    fn depth_stencil_fused(&self) -> bool {
        let depth = &self.slots[AttachmentSlot::Depth.index()].binding;
        let stencil = &self.slots[AttachmentSlot::Stencil.index()].binding;
        match (depth, stencil) {
            (Some(d), Some(s)) => d.resource.ptr_eq(&s.resource),
            _ => false,
        }
    }

    /// Extend `mask` so depth and stencil of a fused surface move together.
    fn mirror(&self, mut mask: AttachmentMask) -> AttachmentMask {
        if self.depth_stencil_fused() && mask.intersects(AttachmentMask::DEPTH | AttachmentMask::STENCIL) {
            mask |= AttachmentMask::DEPTH | AttachmentMask::STENCIL;
        }
        mask
    }

    /// Work needed to bind `new`. Does not change any state; call
    /// [`Self::commit`] once the plan has been pushed to the backend.
    pub fn plan_rebind(&self, new: &RenderTargets) -> RebindPlan {
        let mut plan = RebindPlan::default();
        for slot in AttachmentSlot::all() {
            let old = &self.slots[slot.index()];
            let next = new[slot.index()].as_ref();
            if same_binding(old.binding.as_ref(), next) {
                continue;
            }
            if old.binding.is_some() && old.dirty {
                plan.store |= slot.mask();
            }
            if next.is_some() {
                plan.invalidate |= slot.mask();
            }
        }
        plan.store = self.mirror(plan.store);

        let fused_next = match (
            &new[AttachmentSlot::Depth.index()],
            &new[AttachmentSlot::Stencil.index()],
        ) {
            (Some(d), Some(s)) => d.resource.ptr_eq(&s.resource),
            _ => false,
        };
        if fused_next && plan.invalidate.intersects(AttachmentMask::DEPTH | AttachmentMask::STENCIL) {
            plan.invalidate |= AttachmentMask::DEPTH | AttachmentMask::STENCIL;
        }
        plan
    }

    /// Adopt `new` as the bound targets. Slots that keep their target keep
    /// their dirty bit; everything else starts clean.
    pub fn commit(&mut self, new: &RenderTargets) {
        for (slot, next) in self.slots.iter_mut().zip(new) {
            if !same_binding(slot.binding.as_ref(), next.as_ref()) {
                slot.binding = next.clone();
                slot.dirty = false;
            }
        }
    }

    /// Record that the backend has been asked to write `mask`.
    pub fn mark_written(&mut self, mask: AttachmentMask) {
        let mask = self.mirror(mask);
        for slot in mask.slots() {
            let slot = &mut self.slots[slot.index()];
            if slot.binding.is_some() {
                slot.dirty = true;
            }
        }
    }

    pub fn dirty_mask(&self) -> AttachmentMask {
        AttachmentSlot::all()
            .filter(|slot| self.slots[slot.index()].dirty)
            .fold(AttachmentMask::empty(), |mask, slot| mask | slot.mask())
    }

    /// Slots of `mask` that need a store, now marked clean. A second call
    /// without intervening writes returns an empty mask.
    pub fn store_if_dirty(&mut self, mask: AttachmentMask) -> AttachmentMask {
        let mask = self.mirror(mask) & self.dirty_mask();
        let mask = self.mirror(mask);
        for slot in mask.slots() {
            self.slots[slot.index()].dirty = false;
        }
        mask
    }

    /// Forget unstored writes in `mask`. Returns the slots that were dirty.
    pub fn discard(&mut self, mask: AttachmentMask) -> AttachmentMask {
        let dirty = self.mirror(mask) & self.dirty_mask();
        for slot in dirty.slots() {
            self.slots[slot.index()].dirty = false;
        }
        dirty
    }

    /// Every slot `resource` is bound to.
    pub fn slots_bound_to(&self, resource: &Resource) -> AttachmentMask {
        AttachmentSlot::all()
            .filter(|slot| {
                self.slots[slot.index()]
                    .binding
                    .as_ref()
                    .is_some_and(|binding| binding.resource.ptr_eq(resource))
            })
            .fold(AttachmentMask::empty(), |mask, slot| mask | slot.mask())
    }

    /// Store-if-dirty restricted to the slots holding `resource`.
    pub fn store_resource(&mut self, resource: &Resource) -> AttachmentMask {
        let mask = self.slots_bound_to(resource);
        if mask.is_empty() {
            return mask;
        }
        self.store_if_dirty(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{BindFlags, Format, ResourceDesc, ResourceId};

    fn color(id: u32) -> Resource {
        Resource::new_owned(
            ResourceId(id),
            ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4, BindFlags::RENDER_TARGET),
            None,
        )
    }

    fn depth_stencil(id: u32) -> Resource {
        Resource::new_owned(
            ResourceId(id),
            ResourceDesc::texture_2d(Format::Z24UnormS8Uint, 4, 4, BindFlags::DEPTH_STENCIL),
            None,
        )
    }

    fn bind(sync: &mut TileSynchronizer, fb: &FramebufferState) -> RebindPlan {
        let targets = render_targets(fb);
        let plan = sync.plan_rebind(&targets);
        sync.commit(&targets);
        plan
    }

    #[test]
    fn first_attach_invalidates_without_store() {
        let mut sync = TileSynchronizer::new();
        let plan = bind(&mut sync, &FramebufferState::new(&[color(1)], None));
        assert_eq!(plan.store, AttachmentMask::empty());
        assert_eq!(plan.invalidate, AttachmentMask::COLOR0);
        assert!(!plan.needs_fence());
        assert_eq!(sync.state(AttachmentSlot::Color(0)), AttachmentState::AttachedClean);
        assert_eq!(sync.state(AttachmentSlot::Color(1)), AttachmentState::NoTarget);
    }

    #[test]
    fn replacing_a_dirty_target_stores_it() {
        let mut sync = TileSynchronizer::new();
        bind(&mut sync, &FramebufferState::new(&[color(1)], None));
        sync.mark_written(AttachmentMask::COLOR0);
        assert_eq!(sync.state(AttachmentSlot::Color(0)), AttachmentState::AttachedDirty);

        let plan = bind(&mut sync, &FramebufferState::new(&[color(2)], None));
        assert_eq!(plan.store, AttachmentMask::COLOR0);
        assert_eq!(plan.invalidate, AttachmentMask::COLOR0);
        assert!(plan.needs_fence());
        assert_eq!(sync.state(AttachmentSlot::Color(0)), AttachmentState::AttachedClean);
    }

    #[test]
    fn rebinding_the_same_target_is_a_no_op() {
        let mut sync = TileSynchronizer::new();
        let rt = color(1);
        bind(&mut sync, &FramebufferState::new(&[rt.clone()], None));
        sync.mark_written(AttachmentMask::COLOR0);
        let plan = bind(&mut sync, &FramebufferState::new(&[rt], None));
        assert_eq!(plan, RebindPlan::default());
        assert_eq!(sync.state(AttachmentSlot::Color(0)), AttachmentState::AttachedDirty);
    }

    #[test]
    fn store_if_dirty_is_idempotent() {
        let mut sync = TileSynchronizer::new();
        let rt = color(1);
        bind(&mut sync, &FramebufferState::new(&[rt.clone()], None));
        sync.mark_written(AttachmentMask::COLOR);
        assert_eq!(sync.store_resource(&rt), AttachmentMask::COLOR0);
        assert_eq!(sync.store_resource(&rt), AttachmentMask::empty());
        assert_eq!(sync.store_if_dirty(AttachmentMask::all()), AttachmentMask::empty());
    }

    #[test]
    fn fused_depth_stencil_moves_together() {
        let mut sync = TileSynchronizer::new();
        let zs = depth_stencil(3);
        let plan = bind(&mut sync, &FramebufferState::new(&[], Some(zs.clone())));
        assert_eq!(plan.invalidate, AttachmentMask::DEPTH | AttachmentMask::STENCIL);
        assert_eq!(
            sync.targets()[AttachmentSlot::Stencil.index()]
                .as_ref()
                .map(|b| b.plane),
            Some(Plane::Stencil)
        );

        sync.mark_written(AttachmentMask::DEPTH);
        assert_eq!(sync.state(AttachmentSlot::Stencil), AttachmentState::AttachedDirty);
        assert_eq!(
            sync.store_if_dirty(AttachmentMask::STENCIL),
            AttachmentMask::DEPTH | AttachmentMask::STENCIL
        );
        assert_eq!(sync.slots_bound_to(&zs), AttachmentMask::DEPTH | AttachmentMask::STENCIL);
    }
}
