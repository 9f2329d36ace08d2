use crate::{
    object::{is_null_or_marker, traverse_referred_objects, ObjectHeader},
    object_factory::NodeRef,
    root_set::{GlobalRootSource, ThreadRootSource},
    runtime::Runtime,
    statistics::GcHandle,
    thread::ThreadData,
    utils::time_micros,
};

/// Counters accumulated by one mark drain. Merged across every thread that
/// took part in marking.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct MarkStats {
    /// How many objects are alive.
    pub alive_heap_set: usize,
    /// How many bytes those objects occupy. Allocator overhead is not
    /// included.
    pub alive_heap_set_bytes: usize,
}

impl MarkStats {
    pub fn merge(&mut self, other: MarkStats) {
        self.alive_heap_set += other.alive_heap_set;
        self.alive_heap_set_bytes += other.alive_heap_set_bytes;
    }
}

/// Contract between the generic mark/root-set algorithms and a concrete
/// queue. `enqueue` performs the atomic White→Black transition and pushes the
/// object only when the transition succeeded, which is what makes marking
/// from several threads at once correct: each object is drained exactly once
/// no matter how many threads discover it.
pub trait MarkTraits {
    type MarkQueue;

    fn is_empty(queue: &Self::MarkQueue) -> bool;
    fn clear(queue: &mut Self::MarkQueue);
    fn dequeue(queue: &mut Self::MarkQueue) -> Option<NodeRef>;
    fn enqueue(queue: &mut Self::MarkQueue, object: *mut ObjectHeader);
}

/// Drain the queue, coloring the reachable heap black.
pub fn mark<T: MarkTraits>(queue: &mut T::MarkQueue) -> MarkStats {
    let mut stats = MarkStats::default();
    let time_start = time_micros();
    while let Some(node) = T::dequeue(queue) {
        let top = node.object();
        assert!(
            !is_null_or_marker(top),
            "invalid reference {:p} in mark queue",
            top
        );
        assert!(
            unsafe { (*top).heap() },
            "non-heap reference {:p} in mark queue, permanent={} local={}",
            top,
            unsafe { (*top).permanent() },
            unsafe { (*top).local() }
        );

        stats.alive_heap_set += 1;
        stats.alive_heap_set_bytes += node.allocation_size();

        traverse_referred_objects(unsafe { &*top }, |field| {
            if !is_null_or_marker(field) && unsafe { (*field).heap() } {
                T::enqueue(queue, field);
            }
        });

        if let Some(extra) = unsafe { (*top).extra_object_data() } {
            let weak_counter = extra.weak_reference_counter();
            if !is_null_or_marker(weak_counter) {
                assert!(
                    unsafe { (*weak_counter).heap() },
                    "weak counter must be a heap object. object={:p} counter={:p}",
                    top,
                    weak_counter
                );
                T::enqueue(queue, weak_counter);
            }
        }
    }
    log::debug!(
        target: "gc",
        "Marked {} objects in {} microseconds",
        stats.alive_heap_set,
        time_micros() - time_start
    );
    stats
}

/// Enqueue one root. Heap objects go into the queue directly; permanent and
/// stack objects are traversed in place, enqueueing only their heap fields,
/// since each non-heap object has its own entry in the root set.
fn process_root<T: MarkTraits>(queue: &mut T::MarkQueue, object: *mut ObjectHeader) {
    if unsafe { (*object).heap() } {
        T::enqueue(queue, object);
    } else {
        traverse_referred_objects(unsafe { &*object }, |field| {
            if !is_null_or_marker(field) && unsafe { (*field).heap() } {
                T::enqueue(queue, field);
            }
        });
        assert!(
            unsafe { (*object).extra_object_data().is_none() },
            "non-heap object {:p} may not have extra object data",
            object
        );
    }
}

/// Collect one thread's stack and TLS roots into the queue.
pub fn collect_root_set_for_thread<T: MarkTraits>(
    handle: GcHandle<'_>,
    queue: &mut T::MarkQueue,
    thread: &ThreadData,
) {
    let mut stack_roots = 0u64;
    let mut thread_local_roots = 0u64;
    thread.visit_roots(|source, object| {
        if is_null_or_marker(object) {
            return;
        }
        process_root::<T>(queue, object);
        match source {
            ThreadRootSource::Stack => stack_roots += 1,
            ThreadRootSource::Tls => thread_local_roots += 1,
        }
    });
    handle.thread_root_set(thread.id(), thread_local_roots, stack_roots);
}

/// Collect globals and stable references, applying pending stable-ref
/// deletions first.
pub fn collect_root_set_globals<T: MarkTraits>(
    handle: GcHandle<'_>,
    queue: &mut T::MarkQueue,
    runtime: &Runtime,
) {
    runtime.stable_refs().process_deletions();
    let mut global_roots = 0u64;
    let mut stable_roots = 0u64;
    {
        let mut visit = |source: GlobalRootSource, object: *mut ObjectHeader| {
            if is_null_or_marker(object) {
                return;
            }
            process_root::<T>(queue, object);
            match source {
                GlobalRootSource::Global => global_roots += 1,
                GlobalRootSource::StableRef => stable_roots += 1,
            }
        };
        runtime
            .globals()
            .visit(|object| visit(GlobalRootSource::Global, object));
        runtime
            .stable_refs()
            .visit(|object| visit(GlobalRootSource::StableRef, object));
    }
    handle.global_root_set(global_roots, stable_roots);
}

/// Collect the full root set: every registered thread passing `filter` (its
/// allocation buffer published first), then the globals. Threads that mark
/// their own stacks are filtered out; they collect themselves in parallel.
pub fn collect_root_set<T: MarkTraits>(
    handle: GcHandle<'_>,
    queue: &mut T::MarkQueue,
    runtime: &Runtime,
    filter: impl Fn(&ThreadData) -> bool,
) {
    T::clear(queue);
    for thread in runtime.threads().lock_for_iter().iter() {
        if !filter(thread) {
            continue;
        }
        thread.publish(runtime.object_factory());
        collect_root_set_for_thread::<T>(handle, queue, thread);
    }
    collect_root_set_globals::<T>(handle, queue, runtime);
}
