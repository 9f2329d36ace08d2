use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    cell::UnsafeCell,
    mem::{offset_of, size_of},
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use atomic::Atomic;
use parking_lot::{Mutex, MutexGuard};

use crate::object::{ObjectFlags, ObjectHeader};

/// Mark state of a heap object. White at allocation, Black once reached
/// during marking, reset back to White by sweep.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Color {
    White = 0,
    Black = 1,
}

/// Per-object collector slot, stored in the factory node in front of the
/// object header.
pub struct ObjectData {
    color: Atomic<Color>,
}

impl ObjectData {
    fn new() -> Self {
        Self {
            color: Atomic::new(Color::White),
        }
    }

    #[inline]
    pub fn color(&self) -> Color {
        self.color.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_color(&self, color: Color) {
        self.color.store(color, Ordering::Release);
    }

    /// The one synchronization primitive of parallel marking: the White→Black
    /// transition happens at most once per object per epoch, no matter how
    /// many threads discover the object.
    #[inline]
    pub fn atomic_set_to_black(&self) -> bool {
        self.color
            .compare_exchange(
                Color::White,
                Color::Black,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

const NODE_ALIGN: usize = 8;

/// Factory node: intrusive list link, allocation bookkeeping, the collector
/// slot, then the object itself with its field slots.
#[repr(C)]
struct Node {
    next: *mut Node,
    alloc_size: usize,
    data: ObjectData,
    object: ObjectHeader,
    // reference field slots follow the header
}

const OBJECT_OFFSET: usize = offset_of!(Node, object);

impl Node {
    fn allocation_size(field_count: u32) -> usize {
        OBJECT_OFFSET
            + size_of::<ObjectHeader>()
            + field_count as usize * size_of::<*mut ObjectHeader>()
    }
}

/// Full allocation size of an object with `field_count` reference slots, as
/// the allocation slow path reports it to the scheduler.
pub(crate) fn object_allocation_size(field_count: u32) -> usize {
    Node::allocation_size(field_count)
}

/// Stable reference to a factory node. The factory owns the memory; this is
/// an opaque pointer-sized handle.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct NodeRef(NonNull<Node>);

unsafe impl Send for NodeRef {}

impl NodeRef {
    /// Recover the node from an object header.
    ///
    /// # Safety
    /// `object` must be a heap object allocated by an [`ObjectFactory`].
    #[inline]
    pub unsafe fn from_object(object: *mut ObjectHeader) -> NodeRef {
        debug_assert!((*object).heap());
        NodeRef(NonNull::new_unchecked(
            object.cast::<u8>().sub(OBJECT_OFFSET).cast::<Node>(),
        ))
    }

    #[inline]
    pub fn object_data(&self) -> &ObjectData {
        unsafe { &(*self.0.as_ptr()).data }
    }

    #[inline]
    pub fn object(&self) -> *mut ObjectHeader {
        unsafe { &mut (*self.0.as_ptr()).object }
    }

    /// Full allocation size of the node as reported to heap statistics.
    #[inline]
    pub fn allocation_size(&self) -> usize {
        unsafe { (*self.0.as_ptr()).alloc_size }
    }
}

/// Thread-local allocation buffer: a private list of freshly allocated nodes,
/// spliced into the global factory list by `publish`.
pub struct ThreadQueue {
    head: *mut Node,
    tail: *mut Node,
    count: usize,
    total_size: usize,
}

impl ThreadQueue {
    pub fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            count: 0,
            total_size: 0,
        }
    }

    pub fn alloc_object(&mut self, field_count: u32, flags: ObjectFlags) -> *mut ObjectHeader {
        let size = Node::allocation_size(field_count);
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, NODE_ALIGN);
            let node = alloc_zeroed(layout) as *mut Node;
            assert!(!node.is_null(), "object allocation failed");
            (*node).next = null_mut();
            (*node).alloc_size = size;
            std::ptr::write(&mut (*node).data, ObjectData::new());
            std::ptr::write(
                &mut (*node).object,
                ObjectHeader::new(flags | ObjectFlags::HEAP, field_count),
            );
            if self.head.is_null() {
                self.head = node;
            } else {
                (*self.tail).next = node;
            }
            self.tail = node;
            self.count += 1;
            self.total_size += size;
            &mut (*node).object
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

/// Global registry of every published heap object. Iteration and removal are
/// only possible while holding the factory lock; allocation never takes it.
pub struct ObjectFactory {
    mutex: Mutex<()>,
    head: UnsafeCell<*mut Node>,
    objects_count: AtomicUsize,
    total_objects_size: AtomicUsize,
}

unsafe impl Send for ObjectFactory {}
unsafe impl Sync for ObjectFactory {}

impl ObjectFactory {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            head: UnsafeCell::new(null_mut()),
            objects_count: AtomicUsize::new(0),
            total_objects_size: AtomicUsize::new(0),
        }
    }

    /// Splice a thread's allocation buffer into the global list.
    pub fn publish(&self, queue: &mut ThreadQueue) {
        if queue.head.is_null() {
            return;
        }
        let _guard = self.mutex.lock();
        unsafe {
            (*queue.tail).next = *self.head.get();
            *self.head.get() = queue.head;
        }
        self.objects_count.fetch_add(queue.count, Ordering::Relaxed);
        self.total_objects_size
            .fetch_add(queue.total_size, Ordering::Relaxed);
        *queue = ThreadQueue::new();
    }

    /// Count of published objects. "Unsafe" in the sense that the value is a
    /// snapshot taken without the factory lock.
    pub fn objects_count_unsafe(&self) -> usize {
        self.objects_count.load(Ordering::Relaxed)
    }

    pub fn total_objects_size_unsafe(&self) -> usize {
        self.total_objects_size.load(Ordering::Relaxed)
    }

    pub fn lock_for_iter(&self) -> ObjectFactoryIterable<'_> {
        ObjectFactoryIterable {
            guard: self.mutex.lock(),
            factory: self,
        }
    }

    pub(crate) unsafe fn destroy_node(node: NodeRef) {
        let raw = node.0.as_ptr();
        let layout = Layout::from_size_align_unchecked((*raw).alloc_size, NODE_ALIGN);
        dealloc(raw as *mut u8, layout);
    }
}

impl Drop for ObjectFactory {
    fn drop(&mut self) {
        unsafe {
            let mut node = *self.head.get();
            while !node.is_null() {
                let next = (*node).next;
                ObjectFactory::destroy_node(NodeRef(NonNull::new_unchecked(node)));
                node = next;
            }
        }
    }
}

/// Holds the factory lock for the duration of an iteration.
pub struct ObjectFactoryIterable<'a> {
    factory: &'a ObjectFactory,
    #[allow(dead_code)]
    guard: MutexGuard<'a, ()>,
}

impl<'a> ObjectFactoryIterable<'a> {
    pub fn cursor(&mut self) -> SweepCursor<'_> {
        SweepCursor {
            factory: self.factory,
            link: self.factory.head.get(),
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        let mut n = 0;
        unsafe {
            let mut node = *self.factory.head.get();
            while !node.is_null() {
                n += 1;
                node = (*node).next;
            }
        }
        n
    }
}

/// Link-chasing cursor over the factory list, supporting in-place removal.
pub struct SweepCursor<'a> {
    factory: &'a ObjectFactory,
    link: *mut *mut Node,
}

impl SweepCursor<'_> {
    pub fn node(&self) -> Option<NodeRef> {
        NonNull::new(unsafe { *self.link }).map(NodeRef)
    }

    pub fn advance(&mut self) {
        unsafe {
            debug_assert!(!(*self.link).is_null());
            self.link = &mut (**self.link).next;
        }
    }

    fn unlink(&mut self) -> NodeRef {
        unsafe {
            let node = *self.link;
            debug_assert!(!node.is_null());
            *self.link = (*node).next;
            self.factory.objects_count.fetch_sub(1, Ordering::Relaxed);
            self.factory
                .total_objects_size
                .fetch_sub((*node).alloc_size, Ordering::Relaxed);
            NodeRef(NonNull::new_unchecked(node))
        }
    }

    /// Remove the current node and free it.
    pub fn erase_and_advance(&mut self) {
        let node = self.unlink();
        unsafe { ObjectFactory::destroy_node(node) };
    }

    /// Remove the current node and hand it to the finalizer queue.
    pub fn move_and_advance(&mut self, queue: &mut FinalizerQueue) {
        let node = self.unlink();
        queue.push(node);
    }
}

/// Dead objects with finalizers, detached from the factory and handed to the
/// finalizer worker in sweep order.
pub struct FinalizerQueue {
    head: *mut Node,
    tail: *mut Node,
    count: usize,
}

unsafe impl Send for FinalizerQueue {}

impl FinalizerQueue {
    pub fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            count: 0,
        }
    }

    fn push(&mut self, node: NodeRef) {
        unsafe {
            let raw = node.0.as_ptr();
            (*raw).next = null_mut();
            if self.head.is_null() {
                self.head = raw;
            } else {
                (*self.tail).next = raw;
            }
            self.tail = raw;
            self.count += 1;
        }
    }

    pub fn pop(&mut self) -> Option<NodeRef> {
        NonNull::new(self.head).map(|node| {
            unsafe {
                self.head = (*node.as_ptr()).next;
            }
            if self.head.is_null() {
                self.tail = null_mut();
            }
            self.count -= 1;
            NodeRef(node)
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
