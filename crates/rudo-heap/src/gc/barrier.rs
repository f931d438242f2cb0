//! Write barriers.
//!
//! Every reference store goes through two barriers:
//!
//! * the generational barrier records old-to-young slots in the host page's
//!   remembered set, whatever the marking state;
//! * the marking barrier shades a white value stored into a black host
//!   (Dijkstra insertion) while major marking runs.
//!
//! Each thread context owns one [`MarkingBarrier`], holding its worklist view
//! and an on-hold buffer for shaded objects that still lie in the thread's
//! current allocation buffer.

use std::fmt;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::address::{ObjectRef, Slot};
use crate::gc::incremental::MarkingController;
use crate::gc::worklist::{Local, Worklist};
use crate::heap::page::{PageFlags, PageTable};
use crate::heap::space::LinearAllocationArea;

/// Records `slot` of `host` when an old host starts pointing at a young
/// value. Returns `true` if the slot was newly recorded.
pub(crate) fn generational_barrier(
    pages: &PageTable,
    host: ObjectRef,
    slot: Slot,
    value: ObjectRef,
) -> bool {
    let Some(value_page) = pages.lookup(value.to_address()) else {
        return false;
    };
    if !value_page.is_young() {
        return false;
    }
    match pages.lookup(host.to_address()) {
        Some(host_page) if !host_page.is_young() => host_page.record_slot(slot),
        _ => false,
    }
}

/// Per-thread marking barrier state.
#[derive(Default)]
pub struct MarkingBarrier {
    local: Option<Local<ObjectRef>>,
    on_hold: Vec<ObjectRef>,
}

impl MarkingBarrier {
    /// Creates an inactive barrier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while bound to a marking cycle.
    #[must_use]
    pub const fn is_activated(&self) -> bool {
        self.local.is_some()
    }

    /// Binds the barrier to the worklist of a starting cycle.
    pub fn activate(&mut self, worklist: &Arc<Worklist<ObjectRef>>) {
        debug_assert!(self.on_hold.is_empty());
        self.local = Some(worklist.local());
    }

    /// Unbinds the barrier. Pending entries are published first.
    pub fn deactivate(&mut self, pages: &PageTable, controller: &MarkingController) {
        self.publish(pages, controller);
        self.local = None;
    }

    /// Returns `true` if neither the view nor the on-hold buffer holds
    /// entries. The global pool is not consulted.
    #[must_use]
    pub fn is_local_empty(&self) -> bool {
        self.on_hold.is_empty() && self.local.as_ref().is_none_or(Local::is_local_empty)
    }

    /// Number of objects waiting in the on-hold buffer.
    #[must_use]
    pub fn on_hold_len(&self) -> usize {
        self.on_hold.len()
    }

    /// Moves on-hold objects to the view and publishes the view.
    pub fn publish(&mut self, pages: &PageTable, controller: &MarkingController) {
        self.publish_outside(pages, controller, &[]);
    }

    /// Publishes the view and every on-hold object outside `labs`. Objects
    /// still inside one of `labs` stay on hold. Returns `true` if the
    /// barrier held any entries.
    pub fn publish_outside(
        &mut self,
        pages: &PageTable,
        controller: &MarkingController,
        labs: &[&LinearAllocationArea],
    ) -> bool {
        let pending = !self.is_local_empty();
        if self.local.is_none() {
            self.on_hold.clear();
            return pending;
        }
        let held = std::mem::take(&mut self.on_hold);
        for object in held {
            let lab = labs.iter().copied().find(|lab| lab.contains(object.to_address()));
            self.push(pages, controller, object, lab);
        }
        if let Some(local) = self.local.as_mut() {
            local.publish();
        }
        pending
    }

    /// Releases on-hold objects that no longer lie in `lab`.
    pub fn release_on_hold(&mut self, pages: &PageTable, controller: &MarkingController, lab: Option<&LinearAllocationArea>) {
        if self.on_hold.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.on_hold);
        for object in held {
            self.push(pages, controller, object, lab);
        }
    }

    fn push(
        &mut self,
        pages: &PageTable,
        controller: &MarkingController,
        object: ObjectRef,
        lab: Option<&LinearAllocationArea>,
    ) {
        if lab.is_some_and(|lab| lab.contains(object.to_address())) {
            self.on_hold.push(object);
            return;
        }
        let Some(local) = self.local.as_mut() else {
            return;
        };
        if let Err(dropped) = local.push(object) {
            crate::tracing::log_worklist_overflow(dropped.len());
            for object in dropped {
                if let Some(page) = pages.lookup(object.to_address()) {
                    page.set_flag(PageFlags::OVERFLOWED);
                }
            }
            controller.record_overflow();
        }
    }

    /// Shades `value` if it was stored into a black `host`. The store must
    /// already have happened. Returns `true` if `value` was greyed by this
    /// call.
    pub fn write_barrier(
        &mut self,
        pages: &PageTable,
        controller: &MarkingController,
        host: ObjectRef,
        value: ObjectRef,
        lab: Option<&LinearAllocationArea>,
    ) -> bool {
        if !self.is_activated() {
            return false;
        }
        fence(Ordering::SeqCst);
        let Some((host_page, host_index)) = pages.locate(host.to_address()) else {
            return false;
        };
        if !host_page.major_bitmap().is_black(host_index) {
            return false;
        }
        let Some((value_page, value_index)) = pages.locate(value.to_address()) else {
            return false;
        };
        let mode = controller.mode();
        value_page.note_marking_mode(controller.epoch(), mode);
        if !mode.white_to_grey(value_page.major_bitmap(), value_index) {
            return false;
        }
        self.push(pages, controller, value, lab);
        if controller.restart() {
            // The cycle was complete; make the new work visible at once.
            self.publish(pages, controller);
        }
        true
    }

    /// Turns a black `host` grey again and queues it, for stores that
    /// bypassed the per-field barrier. Returns `true` if the host was black.
    pub fn revisit(
        &mut self,
        pages: &PageTable,
        controller: &MarkingController,
        host: ObjectRef,
    ) -> bool {
        if !self.is_activated() {
            return false;
        }
        fence(Ordering::SeqCst);
        let Some((page, index)) = pages.locate(host.to_address()) else {
            return false;
        };
        let mode = controller.mode();
        if !page.major_bitmap().is_black(index) || !mode.black_to_grey(page.major_bitmap(), index) {
            return false;
        }
        self.push(pages, controller, host, None);
        if controller.restart() {
            self.publish(pages, controller);
        }
        true
    }
}

impl fmt::Debug for MarkingBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkingBarrier")
            .field("activated", &self.is_activated())
            .field("on_hold", &self.on_hold.len())
            .field("local", &self.local)
            .finish()
    }
}
