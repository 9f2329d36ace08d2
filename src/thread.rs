use std::{
    cell::{Cell, UnsafeCell},
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use atomic::Atomic;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    object::{ObjectFlags, ObjectHeader},
    object_factory::{ObjectFactory, ThreadQueue},
    root_set::ThreadRootSource,
    runtime::Runtime,
};

/// Coarse mutator state. `Runnable` threads touch the managed heap and poll
/// safepoints; `Native` threads do neither and count as suspended for the
/// stop-the-world protocol.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    Runnable = 0,
    Native = 1,
}

thread_local! {
    static CURRENT_THREAD: Cell<*mut ThreadData> = Cell::new(null_mut());
}

pub(crate) fn current_thread_data() -> *mut ThreadData {
    CURRENT_THREAD.with(|current| current.get())
}

/// Per-mutator state: allocation buffer, root slots, suspension flags and the
/// cooperative-marking flag. Created on attach, destroyed on detach; the
/// registry hands out raw references while the world is stopped.
pub struct ThreadData {
    id: u32,
    runtime: *const Runtime,
    queue: UnsafeCell<ThreadQueue>,
    stack_roots: UnsafeCell<Vec<*mut ObjectHeader>>,
    tls_roots: UnsafeCell<Vec<*mut ObjectHeader>>,
    marking: AtomicBool,
    state: Atomic<ThreadState>,
    suspended: AtomicBool,
}

unsafe impl Send for ThreadData {}
unsafe impl Sync for ThreadData {}

impl ThreadData {
    fn new(id: u32, runtime: *const Runtime) -> Self {
        Self {
            id,
            runtime,
            queue: UnsafeCell::new(ThreadQueue::new()),
            stack_roots: UnsafeCell::new(Vec::new()),
            tls_roots: UnsafeCell::new(Vec::new()),
            marking: AtomicBool::new(false),
            state: Atomic::new(ThreadState::Runnable),
            suspended: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    fn runtime(&self) -> &Runtime {
        unsafe { &*self.runtime }
    }

    fn registry(&self) -> &ThreadRegistry {
        self.runtime().threads()
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    pub(crate) fn marking_flag(&self) -> &AtomicBool {
        &self.marking
    }

    /// Switch the thread state. Entering `Native` wakes a waiting GC thread;
    /// returning to `Runnable` takes the suspend path if a stop-the-world is
    /// in progress.
    pub fn set_state(&self, state: ThreadState) -> ThreadState {
        let old = self.state.swap(state, Ordering::AcqRel);
        match state {
            ThreadState::Native => {
                if self.registry().is_suspension_requested() {
                    self.registry().notify_observer();
                }
            }
            ThreadState::Runnable => {
                self.suspend_if_requested();
            }
        }
        old
    }

    /// Safepoint poll: cheap check on the fast path, cooperative suspension
    /// on the slow one.
    #[inline]
    pub fn safe_point(&self) {
        if self.registry().is_suspension_requested() {
            self.suspend_if_requested();
        }
    }

    pub(crate) fn suspend_if_requested(&self) {
        let registry = self.registry();
        if !registry.is_suspension_requested() {
            return;
        }
        let runtime = self.runtime();
        runtime.gc().on_suspend_for_gc(runtime, self);
        registry.park(self);
    }

    /// Flush this thread's allocation buffer into the global factory.
    pub(crate) fn publish(&self, factory: &ObjectFactory) {
        unsafe { factory.publish(&mut *self.queue.get()) }
    }

    pub(crate) fn alloc_object(
        &self,
        field_count: u32,
        flags: ObjectFlags,
    ) -> *mut ObjectHeader {
        debug_assert_eq!(
            self.state(),
            ThreadState::Runnable,
            "allocation requires the runnable state"
        );
        unsafe { (*self.queue.get()).alloc_object(field_count, flags) }
    }

    pub(crate) fn visit_roots(&self, mut f: impl FnMut(ThreadRootSource, *mut ObjectHeader)) {
        unsafe {
            for &object in (*self.stack_roots.get()).iter() {
                f(ThreadRootSource::Stack, object);
            }
            for &object in (*self.tls_roots.get()).iter() {
                f(ThreadRootSource::Tls, object);
            }
        }
    }

    pub(crate) fn push_stack_root(&self, object: *mut ObjectHeader) -> usize {
        unsafe {
            let roots = &mut *self.stack_roots.get();
            roots.push(object);
            roots.len() - 1
        }
    }

    pub(crate) fn pop_stack_root(&self, index: usize) {
        unsafe {
            let roots = &mut *self.stack_roots.get();
            assert_eq!(index, roots.len() - 1, "stack roots must unwind in order");
            roots.pop();
        }
    }

    pub(crate) fn set_stack_root(&self, index: usize, object: *mut ObjectHeader) {
        unsafe { (&mut (*self.stack_roots.get()))[index] = object }
    }

    pub(crate) fn stack_root(&self, index: usize) -> *mut ObjectHeader {
        unsafe { (&(*self.stack_roots.get()))[index] }
    }

    pub(crate) fn add_tls_root(&self, object: *mut ObjectHeader) {
        unsafe { (*self.tls_roots.get()).push(object) }
    }
}

/// RAII state switch; restores the previous state (and polls the safepoint)
/// on drop.
pub struct ThreadStateGuard<'a> {
    thread: &'a ThreadData,
    old_state: ThreadState,
}

impl<'a> ThreadStateGuard<'a> {
    pub fn native(thread: &'a ThreadData) -> Self {
        let old_state = thread.set_state(ThreadState::Native);
        Self { thread, old_state }
    }
}

impl Drop for ThreadStateGuard<'_> {
    fn drop(&mut self) {
        self.thread.set_state(self.old_state);
    }
}

/// Registry of every attached mutator plus the global suspension protocol.
pub struct ThreadRegistry {
    threads: Mutex<Vec<*mut ThreadData>>,
    next_thread_id: AtomicU32,
    suspension_requested: AtomicBool,
    suspension_mutex: Mutex<()>,
    // parked mutators wait here for resume
    park_cond: Condvar,
    // the GC thread waits here for everyone to park or go native
    observer_cond: Condvar,
}

unsafe impl Send for ThreadRegistry {}
unsafe impl Sync for ThreadRegistry {}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_thread_id: AtomicU32::new(0),
            suspension_requested: AtomicBool::new(false),
            suspension_mutex: Mutex::new(()),
            park_cond: Condvar::new(),
            observer_cond: Condvar::new(),
        }
    }

    pub(crate) fn register(&self, runtime: *const Runtime) -> NonNull<ThreadData> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = Box::into_raw(Box::new(ThreadData::new(id, runtime)));
        CURRENT_THREAD.with(|current| {
            assert!(current.get().is_null(), "thread is already registered");
            current.set(thread);
        });
        self.threads.lock().push(thread);
        unsafe { NonNull::new_unchecked(thread) }
    }

    pub(crate) fn unregister(&self, thread: NonNull<ThreadData>) {
        self.threads.lock().retain(|&t| t != thread.as_ptr());
        CURRENT_THREAD.with(|current| current.set(null_mut()));
        unsafe { drop(Box::from_raw(thread.as_ptr())) }
        // a detaching thread can be the last one a suspension waiter is
        // blocked on
        self.notify_observer();
    }

    pub fn is_current_thread_registered() -> bool {
        CURRENT_THREAD.with(|current| !current.get().is_null())
    }

    pub fn lock_for_iter(&self) -> ThreadsIterable<'_> {
        ThreadsIterable {
            guard: self.threads.lock(),
        }
    }

    #[inline]
    pub fn is_suspension_requested(&self) -> bool {
        self.suspension_requested.load(Ordering::Acquire)
    }

    /// Begin a stop-the-world pause. Fails if a pause is already in progress;
    /// with a single GC thread it never does.
    pub fn request_threads_suspension(&self) -> bool {
        self.suspension_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Block until every registered thread is parked or native.
    pub fn wait_for_threads_suspension(&self) {
        let mut guard = self.suspension_mutex.lock();
        while !self.all_suspended_or_native() {
            self.observer_cond.wait(&mut guard);
        }
    }

    pub fn resume_threads(&self) {
        let _guard = self.suspension_mutex.lock();
        self.suspension_requested.store(false, Ordering::Release);
        self.park_cond.notify_all();
    }

    fn all_suspended_or_native(&self) -> bool {
        self.lock_for_iter()
            .iter()
            .all(|thread| thread.suspended() || thread.state() == ThreadState::Native)
    }

    fn notify_observer(&self) {
        let _guard = self.suspension_mutex.lock();
        self.observer_cond.notify_all();
    }

    fn park(&self, thread: &ThreadData) {
        let mut guard = self.suspension_mutex.lock();
        thread.suspended.store(true, Ordering::Release);
        self.observer_cond.notify_all();
        while self.suspension_requested.load(Ordering::Acquire) {
            self.park_cond.wait(&mut guard);
        }
        thread.suspended.store(false, Ordering::Release);
    }
}

pub struct ThreadsIterable<'a> {
    guard: MutexGuard<'a, Vec<*mut ThreadData>>,
}

impl ThreadsIterable<'_> {
    pub fn iter(&self) -> impl Iterator<Item = &ThreadData> + '_ {
        self.guard.iter().map(|&thread| unsafe { &*thread })
    }
}
