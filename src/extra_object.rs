use std::{
    cell::UnsafeCell,
    mem::size_of,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use parking_lot::{Mutex, MutexGuard};

use crate::object::ObjectHeader;

pub const FLAGS_IN_FINALIZER_QUEUE: u32 = 1 << 0;

/// Side record attached to select objects: the weak-reference counter object,
/// an associated native object, and lifecycle flags. Attachment is published
/// through the header's extra slot; the factory owns the record itself.
pub struct ExtraObjectData {
    next: UnsafeCell<*mut ExtraObjectData>,
    base_object: *mut ObjectHeader,
    weak_reference_counter: AtomicPtr<ObjectHeader>,
    associated_object: AtomicPtr<u8>,
    flags: AtomicU32,
}

unsafe impl Send for ExtraObjectData {}
unsafe impl Sync for ExtraObjectData {}

impl ExtraObjectData {
    /// Attach a fresh record to `object` and register it with the factory.
    /// At most one record per object; a lost install race hands back the
    /// winner's record.
    pub fn install<'a>(
        object: *mut ObjectHeader,
        factory: &'a ExtraObjectDataFactory,
    ) -> &'a ExtraObjectData {
        let record = Box::into_raw(Box::new(ExtraObjectData {
            next: UnsafeCell::new(null_mut()),
            base_object: object,
            weak_reference_counter: AtomicPtr::new(null_mut()),
            associated_object: AtomicPtr::new(null_mut()),
            flags: AtomicU32::new(0),
        }));
        unsafe {
            match (*object).extra_slot().compare_exchange(
                null_mut(),
                record,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    factory.insert(record);
                    &*record
                }
                Err(existing) => {
                    drop(Box::from_raw(record));
                    &*existing
                }
            }
        }
    }

    /// Detach the record from its base object. The record stays in the
    /// factory until erased or scheduled for destruction.
    pub fn uninstall(&self) {
        unsafe {
            (*self.base_object)
                .extra_slot()
                .store(null_mut(), Ordering::Release);
        }
    }

    #[inline]
    pub fn base_object(&self) -> *mut ObjectHeader {
        self.base_object
    }

    #[inline]
    pub fn weak_reference_counter(&self) -> *mut ObjectHeader {
        self.weak_reference_counter.load(Ordering::Acquire)
    }

    pub fn set_weak_reference_counter(&self, counter: *mut ObjectHeader) {
        self.weak_reference_counter.store(counter, Ordering::Release);
    }

    pub fn clear_weak_reference_counter(&self) {
        self.weak_reference_counter
            .store(null_mut(), Ordering::Release);
    }

    #[inline]
    pub fn has_associated_object(&self) -> bool {
        !self.associated_object.load(Ordering::Acquire).is_null()
    }

    pub fn set_associated_object(&self, native: *mut u8) {
        self.associated_object.store(native, Ordering::Release);
    }

    /// Take the associated native object out of the record. Its release
    /// happens on the finalizer thread.
    pub fn detach_associated_object(&self) -> *mut u8 {
        self.associated_object.swap(null_mut(), Ordering::AcqRel)
    }

    #[inline]
    pub fn in_finalizer_queue(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAGS_IN_FINALIZER_QUEUE != 0
    }

    pub fn set_in_finalizer_queue(&self) {
        self.flags
            .fetch_or(FLAGS_IN_FINALIZER_QUEUE, Ordering::AcqRel);
    }
}

/// Registry of every live extra-object record. Destruction requests are
/// deferred and applied by `process_deletions` at the start of each sweep.
pub struct ExtraObjectDataFactory {
    mutex: Mutex<()>,
    head: UnsafeCell<*mut ExtraObjectData>,
    count: AtomicUsize,
    to_delete: Mutex<Vec<*mut ExtraObjectData>>,
}

unsafe impl Send for ExtraObjectDataFactory {}
unsafe impl Sync for ExtraObjectDataFactory {}

impl ExtraObjectDataFactory {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            head: UnsafeCell::new(null_mut()),
            count: AtomicUsize::new(0),
            to_delete: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, record: *mut ExtraObjectData) {
        let _guard = self.mutex.lock();
        unsafe {
            *(*record).next.get() = *self.head.get();
            *self.head.get() = record;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue a detached record for destruction at the next sweep.
    pub fn schedule_destroy(&self, record: *mut ExtraObjectData) {
        self.to_delete.lock().push(record);
    }

    /// Apply every pending destruction request.
    pub fn process_deletions(&self) {
        let pending = std::mem::take(&mut *self.to_delete.lock());
        if pending.is_empty() {
            return;
        }
        let _guard = self.mutex.lock();
        for record in pending {
            unsafe {
                let mut link = self.head.get();
                while !(*link).is_null() {
                    if *link == record {
                        *link = *(**link).next.get();
                        drop(Box::from_raw(record));
                        self.count.fetch_sub(1, Ordering::Relaxed);
                        break;
                    }
                    link = (**link).next.get();
                }
            }
        }
    }

    pub fn size_unsafe(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total_objects_size_unsafe(&self) -> usize {
        self.count.load(Ordering::Relaxed) * size_of::<ExtraObjectData>()
    }

    pub fn lock_for_iter(&self) -> ExtraObjectsIterable<'_> {
        ExtraObjectsIterable {
            guard: self.mutex.lock(),
            factory: self,
        }
    }
}

impl Drop for ExtraObjectDataFactory {
    fn drop(&mut self) {
        unsafe {
            let mut record = *self.head.get();
            while !record.is_null() {
                let next = *(*record).next.get();
                drop(Box::from_raw(record));
                record = next;
            }
        }
    }
}

pub struct ExtraObjectsIterable<'a> {
    factory: &'a ExtraObjectDataFactory,
    #[allow(dead_code)]
    guard: MutexGuard<'a, ()>,
}

impl ExtraObjectsIterable<'_> {
    pub fn cursor(&mut self) -> ExtraObjectsCursor<'_> {
        ExtraObjectsCursor {
            factory: self.factory,
            link: self.factory.head.get(),
        }
    }
}

pub struct ExtraObjectsCursor<'a> {
    factory: &'a ExtraObjectDataFactory,
    link: *mut *mut ExtraObjectData,
}

impl ExtraObjectsCursor<'_> {
    pub fn record(&self) -> Option<&ExtraObjectData> {
        unsafe { (*self.link).as_ref() }
    }

    pub fn advance(&mut self) {
        unsafe {
            debug_assert!(!(*self.link).is_null());
            self.link = (**self.link).next.get();
        }
    }

    /// Remove the current record and free it.
    pub fn erase_and_advance(&mut self) {
        unsafe {
            let record = *self.link;
            debug_assert!(!record.is_null());
            *self.link = *(*record).next.get();
            drop(Box::from_raw(record));
            self.factory.count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
