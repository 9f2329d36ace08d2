use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use atomic::Atomic;
use parking_lot::{Condvar, Mutex};

use crate::{
    extra_object::ExtraObjectData,
    finalizer::FinalizerProcessor,
    mark::{collect_root_set, collect_root_set_for_thread, mark, MarkStats, MarkTraits},
    object::ObjectHeader,
    object_factory::{Color, NodeRef},
    runtime::Runtime,
    state::GcState,
    statistics::GcHandle,
    sweep::{sweep, sweep_extra_objects, SweepTraits},
    thread::{ThreadData, ThreadRegistry, ThreadState},
    utils::time_micros,
};

/// Who performs marking while the world is stopped.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MarkingBehavior {
    /// The GC thread marks everything itself.
    DoNotMark,
    /// Each suspending mutator marks its own thread root set in parallel.
    MarkOwnStack,
}

#[cfg(feature = "serial-mark")]
const DEFAULT_MARKING_BEHAVIOR: MarkingBehavior = MarkingBehavior::DoNotMark;
#[cfg(not(feature = "serial-mark"))]
const DEFAULT_MARKING_BEHAVIOR: MarkingBehavior = MarkingBehavior::MarkOwnStack;

pub(crate) struct GcMarkTraits;

impl MarkTraits for GcMarkTraits {
    // LIFO for locality; ordering carries no meaning.
    type MarkQueue = Vec<NodeRef>;

    fn is_empty(queue: &Self::MarkQueue) -> bool {
        queue.is_empty()
    }

    fn clear(queue: &mut Self::MarkQueue) {
        queue.clear();
    }

    fn dequeue(queue: &mut Self::MarkQueue) -> Option<NodeRef> {
        queue.pop()
    }

    fn enqueue(queue: &mut Self::MarkQueue, object: *mut ObjectHeader) {
        let node = unsafe { NodeRef::from_object(object) };
        if !node.object_data().atomic_set_to_black() {
            return;
        }
        queue.push(node);
    }
}

pub(crate) struct GcSweepTraits;

impl SweepTraits for GcSweepTraits {
    fn is_marked_by_extra_object(extra: &ExtraObjectData) -> bool {
        let base_object = extra.base_object();
        if unsafe { !(*base_object).heap() } {
            return true;
        }
        let node = unsafe { NodeRef::from_object(base_object) };
        node.object_data().color() == Color::Black
    }

    fn try_reset_mark(node: NodeRef) -> bool {
        if node.object_data().color() == Color::White {
            return false;
        }
        node.object_data().set_color(Color::White);
        true
    }
}

/// Clears the thread's marking flag once its mark drain is over, which is the
/// completion signal `wait_for_threads_suspension` relies on.
struct MarkingFlagReset<'a>(&'a AtomicBool);

impl<'a> MarkingFlagReset<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for MarkingFlagReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The stop-the-world mark & sweep collector. One driver thread per runtime;
/// mutators enter through [`MarkAndSweep::on_suspend_for_gc`] when they hit a
/// safepoint during a pause.
pub struct MarkAndSweep {
    state: GcState,
    // Handshake for cooperative marking. The mutex also guards the merged
    // mark statistics, which is why it owns them.
    marking_mutex: Mutex<MarkStats>,
    marking_cond: Condvar,
    marking_requested: AtomicBool,
    marking_epoch: AtomicU64,
    marking_behavior: Atomic<MarkingBehavior>,
    finalizer_processor: FinalizerProcessor,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MarkAndSweep {
    pub fn new() -> Self {
        Self {
            state: GcState::new(),
            marking_mutex: Mutex::new(MarkStats::default()),
            marking_cond: Condvar::new(),
            marking_requested: AtomicBool::new(false),
            marking_epoch: AtomicU64::new(0),
            marking_behavior: Atomic::new(DEFAULT_MARKING_BEHAVIOR),
            finalizer_processor: FinalizerProcessor::new(),
            gc_thread: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &GcState {
        &self.state
    }

    pub fn finalizer_processor(&self) -> &FinalizerProcessor {
        &self.finalizer_processor
    }

    #[cfg(test)]
    pub(crate) fn set_marking_behavior_for_tests(&self, behavior: MarkingBehavior) {
        self.marking_behavior.store(behavior, Ordering::Release);
    }

    /// Spawn the driver thread. It exits once shutdown is requested and no
    /// epoch is pending.
    pub(crate) fn start_gc_thread(runtime: &Arc<Runtime>) {
        let worker = runtime.clone();
        let handle = std::thread::Builder::new()
            .name("GC thread".to_string())
            .spawn(move || {
                while let Some(epoch) = worker.gc().state.wait_scheduled() {
                    worker.gc().perform_full_gc(&worker, epoch);
                }
                log::debug!(target: "gc", "GC thread exiting");
            })
            .expect("failed to spawn the GC thread");
        *runtime.gc().gc_thread.lock() = Some(handle);
    }

    /// Stop the driver after the in-flight epoch (if any) completes.
    pub(crate) fn stop(&self) {
        self.state.shutdown();
        if let Some(handle) = self.gc_thread.lock().take() {
            handle.join().expect("GC thread panicked");
        }
    }

    fn set_marking_requested(&self, epoch: u64) {
        let parallel =
            self.marking_behavior.load(Ordering::Acquire) == MarkingBehavior::MarkOwnStack;
        self.marking_requested.store(parallel, Ordering::Release);
        self.marking_epoch.store(epoch, Ordering::Release);
    }

    /// Spin until every mutator is suspended, native, or has entered the
    /// cooperative-mark path. The window is short and the predicate depends
    /// on mutator state flips with no condition-variable path, so this yields
    /// instead of blocking.
    fn wait_for_threads_ready_to_mark(&self, runtime: &Runtime) {
        loop {
            let ready = runtime.threads().lock_for_iter().iter().all(|thread| {
                thread.suspended()
                    || thread.state() == ThreadState::Native
                    || thread.is_marking()
            });
            if ready {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Take a coherent snapshot of which threads will mark themselves,
    /// collect everyone else's roots plus the globals, then release the
    /// self-marking threads all at once.
    fn collect_root_set_and_start_marking(
        &self,
        runtime: &Runtime,
        handle: GcHandle<'_>,
        queue: &mut Vec<NodeRef>,
    ) {
        let guard = self.marking_mutex.lock();
        self.marking_requested.store(false, Ordering::Release);
        collect_root_set::<GcMarkTraits>(handle, queue, runtime, |thread| !thread.is_marking());
        log::debug!(target: "gc", "Requesting marking in threads");
        self.marking_cond.notify_all();
        drop(guard);
    }

    /// Cooperative-mark entry, called from the safepoint suspend hook before
    /// the thread parks. Under `DoNotMark` (or when the GC thread has already
    /// collected the root set) this is a no-op and the thread parks directly.
    pub(crate) fn on_suspend_for_gc(&self, runtime: &Runtime, thread: &ThreadData) {
        let mut guard = self.marking_mutex.lock();
        if !self.marking_requested.load(Ordering::Acquire) {
            return;
        }
        let _reset = MarkingFlagReset::raise(thread.marking_flag());
        thread.publish(runtime.object_factory());
        while self.marking_requested.load(Ordering::Acquire) {
            self.marking_cond.wait(&mut guard);
        }
        // Unlock while marking to let multiple threads mark in parallel.
        drop(guard);

        let epoch = self.marking_epoch.load(Ordering::Acquire);
        gc_log!(epoch, "Parallel marking in thread {}", thread.id());
        let mut queue: Vec<NodeRef> = Vec::new();
        let handle = GcHandle::get_by_epoch(runtime.gc_stats(), epoch);
        collect_root_set_for_thread::<GcMarkTraits>(handle, &mut queue, thread);
        let stats = mark::<GcMarkTraits>(&mut queue);
        self.merge_mark_stats(stats);
    }

    fn merge_mark_stats(&self, stats: MarkStats) {
        self.marking_mutex.lock().merge(stats);
    }

    fn last_mark_stats(&self) -> MarkStats {
        *self.marking_mutex.lock()
    }

    pub(crate) fn perform_full_gc(&self, runtime: &Arc<Runtime>, epoch: u64) {
        assert!(
            !ThreadRegistry::is_current_thread_registered(),
            "the GC must run on an unregistered thread"
        );
        let gc_handle = GcHandle::create(runtime.gc_stats(), epoch);
        self.set_marking_requested(epoch);
        let did_suspend = runtime.threads().request_threads_suspension();
        assert!(did_suspend, "only the GC thread requests suspension");
        gc_handle.suspension_requested();

        self.wait_for_threads_ready_to_mark(runtime);
        gc_handle.threads_are_suspended();
        *self.marking_mutex.lock() = MarkStats::default();

        runtime.scheduler().on_perform_full_gc();
        self.state.start(epoch);

        let mut mark_queue: Vec<NodeRef> = Vec::new();
        self.collect_root_set_and_start_marking(runtime, gc_handle, &mut mark_queue);

        // Safe to mark without the handshake lock: the world is stopped.
        let mark_stats = mark::<GcMarkTraits>(&mut mark_queue);
        self.merge_mark_stats(mark_stats);

        runtime.threads().wait_for_threads_suspension();

        let object_factory = runtime.object_factory();
        let extra_object_factory = runtime.extra_object_factory();
        gc_handle.heap_usage_before(
            object_factory.objects_count_unsafe() as u64,
            object_factory.total_objects_size_unsafe() as u64,
        );
        gc_handle.extra_objects_usage_before(
            extra_object_factory.size_unsafe() as u64,
            extra_object_factory.total_objects_size_unsafe() as u64,
        );
        let merged = self.last_mark_stats();
        runtime
            .scheduler()
            .update_alive_set_bytes(merged.alive_heap_set_bytes);

        let time_sweep_extra_start = time_micros();
        sweep_extra_objects::<GcSweepTraits>(extra_object_factory);
        gc_log!(
            epoch,
            "Swept extra objects in {} microseconds",
            time_micros() - time_sweep_extra_start
        );

        let mut factory_iter = object_factory.lock_for_iter();
        gc_handle.heap_usage_after(
            merged.alive_heap_set as u64,
            merged.alive_heap_set_bytes as u64,
        );
        gc_handle.extra_objects_usage_after(
            extra_object_factory.size_unsafe() as u64,
            extra_object_factory.total_objects_size_unsafe() as u64,
        );

        runtime.threads().resume_threads();
        gc_handle.threads_are_resumed();

        let time_sweep_start = time_micros();
        let finalizer_queue = sweep::<GcSweepTraits>(&mut factory_iter);
        gc_log!(
            epoch,
            "Swept in {} microseconds",
            time_micros() - time_sweep_start
        );
        drop(factory_iter);

        self.state.finish(epoch);
        gc_handle.finalizers_scheduled(finalizer_queue.len() as u64);
        gc_handle.finish();
        self.finalizer_processor
            .schedule_tasks(runtime, finalizer_queue, epoch);
    }
}
