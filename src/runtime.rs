use std::{marker::PhantomData, ptr::NonNull, sync::Arc, thread::JoinHandle};

use once_cell::sync::OnceCell;

use crate::{
    extra_object::{ExtraObjectData, ExtraObjectDataFactory},
    gc::MarkAndSweep,
    object::{ObjectFlags, ObjectHeader},
    object_factory::{object_allocation_size, ObjectFactory},
    root_set::{GlobalRoot, GlobalRootRegistry, StableRef, StableRefRegistry},
    scheduler::{GcScheduler, GcSchedulerConfig},
    statistics::{fill_gc_info, GcInfoBuilder, GcStats},
    thread::{current_thread_data, ThreadData, ThreadRegistry, ThreadStateGuard},
};

/// Finalizer invoked on the finalizer thread, once per dead finalizable
/// object, before its memory is released.
pub type FinalizerHook = Box<dyn Fn(*mut ObjectHeader) + Send + Sync>;

#[derive(Default)]
pub struct RuntimeConfig {
    pub scheduler: GcSchedulerConfig,
}

/// Everything one managed heap needs: the factories, the thread registry,
/// the root registries, the scheduler and the collector itself. Shared via
/// `Arc`; torn down by an explicit [`Runtime::shutdown`], never by drop
/// order.
pub struct Runtime {
    object_factory: ObjectFactory,
    extra_object_factory: ExtraObjectDataFactory,
    threads: ThreadRegistry,
    globals: GlobalRootRegistry,
    stable_refs: StableRefRegistry,
    scheduler: GcScheduler,
    gc_stats: GcStats,
    gc: MarkAndSweep,
    finalizer_hook: OnceCell<FinalizerHook>,
}

impl Runtime {
    pub fn create(config: RuntimeConfig) -> Arc<Runtime> {
        let runtime = Arc::new(Runtime {
            object_factory: ObjectFactory::new(),
            extra_object_factory: ExtraObjectDataFactory::new(),
            threads: ThreadRegistry::new(),
            globals: GlobalRootRegistry::new(),
            stable_refs: StableRefRegistry::new(),
            scheduler: GcScheduler::new(config.scheduler),
            gc_stats: GcStats::new(),
            gc: MarkAndSweep::new(),
            finalizer_hook: OnceCell::new(),
        });
        let scheduler_target = Arc::downgrade(&runtime);
        runtime.scheduler.set_schedule_gc(Box::new(move || {
            if let Some(runtime) = scheduler_target.upgrade() {
                runtime.gc().state().schedule();
            }
        }));
        MarkAndSweep::start_gc_thread(&runtime);
        log::debug!(target: "gc", "Mark & sweep GC initialized");
        runtime
    }

    pub fn object_factory(&self) -> &ObjectFactory {
        &self.object_factory
    }

    pub fn extra_object_factory(&self) -> &ExtraObjectDataFactory {
        &self.extra_object_factory
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn globals(&self) -> &GlobalRootRegistry {
        &self.globals
    }

    pub fn stable_refs(&self) -> &StableRefRegistry {
        &self.stable_refs
    }

    pub fn scheduler(&self) -> &GcScheduler {
        &self.scheduler
    }

    pub fn gc(&self) -> &MarkAndSweep {
        &self.gc
    }

    pub fn gc_stats(&self) -> &GcStats {
        &self.gc_stats
    }

    pub fn set_finalizer_hook(&self, hook: FinalizerHook) {
        assert!(
            self.finalizer_hook.set(hook).is_ok(),
            "finalizer hook already installed"
        );
    }

    pub(crate) fn finalizer_hook(&self) -> Option<&FinalizerHook> {
        self.finalizer_hook.get()
    }

    /// Copy the last-completed (`id` 0) or current (`id` 1) epoch record into
    /// the builder.
    pub fn fill_gc_info(&self, builder: &mut dyn GcInfoBuilder, id: i32) {
        fill_gc_info(&self.gc_stats, builder, id);
    }

    pub fn start_finalizer_thread_if_needed(self: &Arc<Self>) {
        with_native_state_if_registered(|| {
            self.gc
                .finalizer_processor()
                .start_finalizer_thread_if_none(self)
        });
    }

    pub fn stop_finalizer_thread_if_running(&self) {
        with_native_state_if_registered(|| self.gc.finalizer_processor().stop_finalizer_thread());
    }

    pub fn finalizers_thread_is_running(&self) -> bool {
        self.gc.finalizer_processor().is_running()
    }

    /// Stop the GC driver (after any in-flight epoch) and the finalizer
    /// worker. New collections can no longer be scheduled afterwards.
    pub fn shutdown(&self) {
        with_native_state_if_registered(|| {
            self.gc.stop();
            self.gc.finalizer_processor().stop_finalizer_thread();
        });
    }

    /// Attach the calling thread as a mutator. The handle is thread-bound
    /// and detaches on drop.
    pub fn attach_current_thread(self: &Arc<Self>) -> Mutator {
        let thread = self.threads.register(Arc::as_ptr(self));
        Mutator {
            runtime: self.clone(),
            thread,
            _not_send: PhantomData,
        }
    }

    /// Spawn a mutator thread attached to this runtime.
    pub fn spawn_mutator<F>(self: &Arc<Self>, f: F) -> JoinHandle<()>
    where
        F: FnOnce(&mut Mutator) + Send + 'static,
    {
        let runtime = self.clone();
        std::thread::spawn(move || {
            let mut mutator = runtime.attach_current_thread();
            f(&mut mutator);
        })
    }

    pub fn register_global(&self, initial: *mut ObjectHeader) -> GlobalRoot {
        self.globals.register(initial)
    }

    pub fn register_stable_ref(&self, object: *mut ObjectHeader) -> StableRef {
        self.stable_refs.register(object)
    }

    pub fn create_permanent_object(&self, field_count: u32) -> *mut ObjectHeader {
        ObjectHeader::create_permanent(field_count)
    }
}

/// Run `f` with the calling thread in the native state, so a concurrent
/// stop-the-world does not wait on it. Unregistered threads run `f` as-is.
fn with_native_state_if_registered<R>(f: impl FnOnce() -> R) -> R {
    let current = current_thread_data();
    if current.is_null() {
        f()
    } else {
        let _guard = ThreadStateGuard::native(unsafe { &*current });
        f()
    }
}

/// Per-thread handle to the runtime: allocation, roots, safepoints and the
/// synchronous GC entry points.
pub struct Mutator {
    runtime: Arc<Runtime>,
    thread: NonNull<ThreadData>,
    // thread-bound: the registry tracks the handle by OS thread
    _not_send: PhantomData<*mut ()>,
}

impl Mutator {
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub(crate) fn thread(&self) -> &ThreadData {
        unsafe { self.thread.as_ref() }
    }

    pub fn thread_id(&self) -> u32 {
        self.thread().id()
    }

    /// Allocate a heap object with `field_count` reference slots, all null.
    pub fn allocate(&self, field_count: u32) -> *mut ObjectHeader {
        self.allocate_with_flags(field_count, ObjectFlags::empty())
    }

    /// Allocate a heap object that must be finalized before its memory is
    /// released.
    pub fn allocate_with_finalizer(&self, field_count: u32) -> *mut ObjectHeader {
        self.allocate_with_flags(field_count, ObjectFlags::HAS_FINALIZER)
    }

    fn allocate_with_flags(&self, field_count: u32, flags: ObjectFlags) -> *mut ObjectHeader {
        self.safe_point_allocation(object_allocation_size(field_count));
        self.thread().alloc_object(field_count, flags)
    }

    /// Attach extra-object data to `object` (or fetch the existing record).
    pub fn install_extra_object_data(&self, object: *mut ObjectHeader) -> &ExtraObjectData {
        ExtraObjectData::install(object, self.runtime.extra_object_factory())
    }

    /// Explicit safepoint poll.
    #[inline]
    pub fn safe_point(&self) {
        self.thread().safe_point();
    }

    /// Allocation slow-path safepoint: feeds the scheduler, then polls.
    pub fn safe_point_allocation(&self, size: usize) {
        self.runtime.scheduler().on_safe_point_allocation(size);
        self.thread().suspend_if_requested();
    }

    /// Request a collection and return once its sweep has finished.
    pub fn schedule_and_wait_full_gc(&self) {
        let _guard = ThreadStateGuard::native(self.thread());
        let scheduled_epoch = self.runtime.gc().state().schedule();
        self.runtime.gc().state().wait_epoch_finished(scheduled_epoch);
    }

    /// Request a collection and return once its finalizers have run.
    pub fn schedule_and_wait_full_gc_with_finalizers(&self) {
        let _guard = ThreadStateGuard::native(self.thread());
        let scheduled_epoch = self.runtime.gc().state().schedule();
        self.runtime
            .gc()
            .state()
            .wait_epoch_finalized(scheduled_epoch);
    }

    /// Allocation failed upstream: collect and let the caller retry.
    pub fn on_oom(&self, size: usize) {
        log::debug!(target: "gc", "Attempt to GC on OOM at size={}", size);
        self.schedule_and_wait_full_gc();
    }

    /// Pin `object` into this thread's stack root set for the guard's
    /// lifetime.
    pub fn stack_root(&self, object: *mut ObjectHeader) -> StackRoot<'_> {
        let index = self.thread().push_stack_root(object);
        StackRoot {
            thread: self.thread(),
            index,
        }
    }

    /// Add a thread-local root that lives until the thread detaches.
    pub fn add_tls_root(&self, object: *mut ObjectHeader) {
        self.thread().add_tls_root(object);
    }

    /// Run `f` in the native state: no heap access, no safepoint polls, and
    /// a concurrent stop-the-world proceeds without this thread.
    pub fn run_native<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = ThreadStateGuard::native(self.thread());
        f()
    }

    /// Join another thread without blocking a stop-the-world.
    pub fn join<T>(&self, handle: JoinHandle<T>) -> T {
        self.run_native(|| handle.join()).expect("mutator thread panicked")
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.thread().publish(self.runtime.object_factory());
        self.runtime.threads().unregister(self.thread);
    }
}

/// Stack root slot, unwound in LIFO order on drop.
pub struct StackRoot<'a> {
    thread: &'a ThreadData,
    index: usize,
}

impl StackRoot<'_> {
    pub fn get(&self) -> *mut ObjectHeader {
        self.thread.stack_root(self.index)
    }

    pub fn set(&self, object: *mut ObjectHeader) {
        self.thread.set_stack_root(self.index, object);
    }

    pub fn clear(&self) {
        self.set(std::ptr::null_mut());
    }
}

impl Drop for StackRoot<'_> {
    fn drop(&mut self) {
        self.thread.pop_stack_root(self.index);
    }
}
