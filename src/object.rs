use std::{
    alloc::{alloc_zeroed, Layout},
    mem::size_of,
    sync::atomic::{AtomicPtr, Ordering},
};

use bitflags::bitflags;

use crate::extra_object::ExtraObjectData;

bitflags! {
    /// Classification bits for a managed object. Exactly one of `HEAP`,
    /// `PERMANENT` and `STACK_LOCAL` is set; the collector only ever sweeps
    /// `HEAP` objects.
    pub struct ObjectFlags: u32 {
        const HEAP = 1 << 0;
        const PERMANENT = 1 << 1;
        const STACK_LOCAL = 1 << 2;
        const HAS_FINALIZER = 1 << 3;
    }
}

/// Header of every managed object. Reference fields are laid out right after
/// the header as pointer-sized slots; the runtime knows their count from the
/// header, so traversal needs no per-type metadata.
#[repr(C)]
pub struct ObjectHeader {
    flags: ObjectFlags,
    field_count: u32,
    extra: AtomicPtr<ExtraObjectData>,
}

impl ObjectHeader {
    pub(crate) fn new(flags: ObjectFlags, field_count: u32) -> Self {
        Self {
            flags,
            field_count,
            extra: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn heap(&self) -> bool {
        self.flags.contains(ObjectFlags::HEAP)
    }

    #[inline]
    pub fn permanent(&self) -> bool {
        self.flags.contains(ObjectFlags::PERMANENT)
    }

    #[inline]
    pub fn local(&self) -> bool {
        self.flags.contains(ObjectFlags::STACK_LOCAL)
    }

    #[inline]
    pub fn has_finalizer(&self) -> bool {
        self.flags.contains(ObjectFlags::HAS_FINALIZER)
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.field_count as usize
    }

    #[inline]
    fn field_slots(&self) -> &[AtomicPtr<ObjectHeader>] {
        unsafe {
            let first = (self as *const Self).add(1) as *const AtomicPtr<ObjectHeader>;
            std::slice::from_raw_parts(first, self.field_count as usize)
        }
    }

    #[inline]
    pub fn field(&self, index: usize) -> *mut ObjectHeader {
        self.field_slots()[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_field(&self, index: usize, value: *mut ObjectHeader) {
        self.field_slots()[index].store(value, Ordering::Relaxed);
    }

    /// Extra-object data attached to this object, if any. Attachment is
    /// discoverable from the header alone.
    #[inline]
    pub fn extra_object_data(&self) -> Option<&ExtraObjectData> {
        unsafe { self.extra.load(Ordering::Acquire).as_ref() }
    }

    pub(crate) fn extra_slot(&self) -> &AtomicPtr<ExtraObjectData> {
        &self.extra
    }

    /// Allocate a permanent object outside the object factory. Permanent
    /// objects have no color slot and are never swept; they live until the
    /// process exits.
    pub fn create_permanent(field_count: u32) -> *mut ObjectHeader {
        let size = size_of::<ObjectHeader>() + field_count as usize * size_of::<*mut ObjectHeader>();
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, size_of::<usize>());
            let object = alloc_zeroed(layout) as *mut ObjectHeader;
            assert!(!object.is_null(), "permanent object allocation failed");
            object.write(ObjectHeader::new(ObjectFlags::PERMANENT, field_count));
            object
        }
    }
}

/// Sentinel reference used by the runtime for not-yet-initialized slots. It is
/// never dereferenced and must be filtered out wherever references are chased.
#[inline]
pub fn ref_marker() -> *mut ObjectHeader {
    usize::MAX as *mut ObjectHeader
}

#[inline]
pub fn is_null_or_marker(object: *mut ObjectHeader) -> bool {
    object.is_null() || object == ref_marker()
}

/// Visit every reference field of `object`. Null and marker slots are yielded
/// as-is; the caller filters.
pub fn traverse_referred_objects(object: &ObjectHeader, mut f: impl FnMut(*mut ObjectHeader)) {
    for slot in object.field_slots() {
        f(slot.load(Ordering::Relaxed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_object_classification() {
        let object = ObjectHeader::create_permanent(2);
        unsafe {
            assert!((*object).permanent());
            assert!(!(*object).heap());
            assert!(!(*object).has_finalizer());
            assert_eq!((*object).field_count(), 2);
            assert!((*object).field(0).is_null());
            assert!((*object).field(1).is_null());
        }
    }

    #[test]
    fn field_traversal_yields_every_slot() {
        let object = ObjectHeader::create_permanent(3);
        let other = ObjectHeader::create_permanent(0);
        unsafe {
            (*object).set_field(1, other);
            (*object).set_field(2, ref_marker());
            let mut seen = Vec::new();
            traverse_referred_objects(&*object, |field| seen.push(field));
            assert_eq!(seen.len(), 3);
            assert!(seen[0].is_null());
            assert_eq!(seen[1], other);
            assert!(is_null_or_marker(seen[2]));
        }
    }
}
