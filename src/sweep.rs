use crate::{
    extra_object::{ExtraObjectData, ExtraObjectDataFactory},
    object_factory::{FinalizerQueue, NodeRef, ObjectFactoryIterable},
};

/// Sweep-side contract: how to read an object's mark through its extra-object
/// record, and how to consume the mark during the main sweep.
pub trait SweepTraits {
    /// Whether the record's base object survived marking. Non-heap base
    /// objects are never swept and always count as marked.
    fn is_marked_by_extra_object(extra: &ExtraObjectData) -> bool;

    /// True iff the object was Black; a Black mark is reset to White.
    fn try_reset_mark(node: NodeRef) -> bool;
}

/// First sweep sub-phase, run while the world is still stopped: drop
/// extra-object records whose base object died. A dead base with an
/// associated native object keeps its record, flagged, until the finalizer
/// thread releases the native side.
pub fn sweep_extra_objects<T: SweepTraits>(factory: &ExtraObjectDataFactory) {
    factory.process_deletions();
    let mut iter = factory.lock_for_iter();
    let mut cursor = iter.cursor();
    while let Some(extra) = cursor.record() {
        if !extra.in_finalizer_queue() && !T::is_marked_by_extra_object(extra) {
            extra.clear_weak_reference_counter();
            if extra.has_associated_object() {
                extra.detach_associated_object();
                extra.set_in_finalizer_queue();
                cursor.advance();
            } else {
                extra.uninstall();
                cursor.erase_and_advance();
            }
        } else {
            cursor.advance();
        }
    }
}

/// Main sweep over the object factory, caller holding the iteration lock.
/// Black objects survive with their mark reset; dead objects with finalizers
/// move to the returned queue, the rest are freed in place.
pub fn sweep<T: SweepTraits>(iter: &mut ObjectFactoryIterable<'_>) -> FinalizerQueue {
    let mut finalizer_queue = FinalizerQueue::new();
    let mut cursor = iter.cursor();
    while let Some(node) = cursor.node() {
        if T::try_reset_mark(node) {
            cursor.advance();
            continue;
        }
        let object = node.object();
        if unsafe { (*object).has_finalizer() } {
            cursor.move_and_advance(&mut finalizer_queue);
        } else {
            cursor.erase_and_advance();
        }
    }
    finalizer_queue
}
