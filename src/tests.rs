use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use crate::{
    gc::MarkingBehavior,
    object_factory::{Color, NodeRef},
    runtime::{Runtime, RuntimeConfig},
    scheduler::GcSchedulerConfig,
    statistics::GcInfoBuilder,
};

fn test_runtime() -> Arc<Runtime> {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::create(RuntimeConfig::default())
}

#[derive(Default, Clone)]
struct GcInfoRecord {
    epoch: Option<u64>,
    start_time: Option<u64>,
    end_time: Option<u64>,
    pause_start_time: Option<u64>,
    pause_end_time: Option<u64>,
    finalizers_done_time: Option<u64>,
    root_set: Option<(u64, u64, u64, u64)>,
    heap_before: Option<(u64, u64)>,
    heap_after: Option<(u64, u64)>,
    meta_before: Option<(u64, u64)>,
    meta_after: Option<(u64, u64)>,
}

impl GcInfoBuilder for GcInfoRecord {
    fn set_epoch(&mut self, epoch: u64) {
        self.epoch = Some(epoch);
    }
    fn set_start_time(&mut self, time_ns: u64) {
        self.start_time = Some(time_ns);
    }
    fn set_end_time(&mut self, time_ns: u64) {
        self.end_time = Some(time_ns);
    }
    fn set_pause_start_time(&mut self, time_ns: u64) {
        self.pause_start_time = Some(time_ns);
    }
    fn set_pause_end_time(&mut self, time_ns: u64) {
        self.pause_end_time = Some(time_ns);
    }
    fn set_finalizers_done_time(&mut self, time_ns: u64) {
        self.finalizers_done_time = Some(time_ns);
    }
    fn set_root_set(&mut self, tls: u64, stack: u64, global: u64, stable: u64) {
        self.root_set = Some((tls, stack, global, stable));
    }
    fn set_memory_usage_before(&mut self, pool: &str, count: u64, size: u64) {
        match pool {
            "heap" => self.heap_before = Some((count, size)),
            "meta" => self.meta_before = Some((count, size)),
            _ => {}
        }
    }
    fn set_memory_usage_after(&mut self, pool: &str, count: u64, size: u64) {
        match pool {
            "heap" => self.heap_after = Some((count, size)),
            "meta" => self.meta_after = Some((count, size)),
            _ => {}
        }
    }
}

fn last_gc_info(runtime: &Runtime) -> GcInfoRecord {
    let mut record = GcInfoRecord::default();
    runtime.fill_gc_info(&mut record, 0);
    record
}

#[test]
fn unreachable_cycle_is_collected() {
    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    let a = mutator.allocate(1);
    let b = mutator.allocate(1);
    let c = mutator.allocate(1);
    unsafe {
        (*a).set_field(0, b);
        (*b).set_field(0, c);
        (*c).set_field(0, a);
    }

    mutator.schedule_and_wait_full_gc();

    assert_eq!(runtime.object_factory().objects_count_unsafe(), 0);
    let info = last_gc_info(&runtime);
    assert_eq!(info.heap_before.map(|(count, _)| count), Some(3));
    assert_eq!(info.heap_after, Some((0, 0)));

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn live_root_keeps_chain() {
    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    let r = mutator.allocate(1);
    let a = mutator.allocate(1);
    let b = mutator.allocate(1);
    let c = mutator.allocate(0);
    unsafe {
        (*r).set_field(0, a);
        (*a).set_field(0, b);
        (*b).set_field(0, c);
    }
    let root = mutator.stack_root(r);

    mutator.schedule_and_wait_full_gc();

    assert_eq!(runtime.object_factory().objects_count_unsafe(), 4);
    let info = last_gc_info(&runtime);
    assert!(info.heap_after.map(|(count, _)| count) >= Some(4));
    assert_eq!(info.root_set, Some((0, 1, 0, 0)));

    // surviving objects are white again, ready for the next epoch
    for object in [r, a, b, c] {
        let node = unsafe { NodeRef::from_object(object) };
        assert_eq!(node.object_data().color(), Color::White);
    }

    drop(root);
    drop(mutator);
    runtime.shutdown();
}

#[test]
fn weak_counter_follows_object() {
    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    let x = mutator.allocate(0);
    let w = mutator.allocate(0);
    let extra = mutator.install_extra_object_data(x);
    extra.set_weak_reference_counter(w);
    let root = mutator.stack_root(x);

    mutator.schedule_and_wait_full_gc();

    // the counter is reachable only through the extra-object record
    assert_eq!(runtime.object_factory().objects_count_unsafe(), 2);
    assert_eq!(runtime.extra_object_factory().size_unsafe(), 1);
    unsafe {
        let extra = (*x).extra_object_data().expect("record must survive");
        assert_eq!(extra.weak_reference_counter(), w);
    }

    drop(root);
    mutator.schedule_and_wait_full_gc();

    assert_eq!(runtime.object_factory().objects_count_unsafe(), 0);
    assert_eq!(runtime.extra_object_factory().size_unsafe(), 0);

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn finalized_before_synchronous_return() {
    let runtime = test_runtime();
    let finalized = Arc::new(AtomicUsize::new(0));
    let observed = finalized.clone();
    runtime.set_finalizer_hook(Box::new(move |_| {
        observed.fetch_add(1, Ordering::SeqCst);
    }));
    let mutator = runtime.attach_current_thread();

    let object = mutator.allocate_with_finalizer(0);
    {
        let _root = mutator.stack_root(object);
        mutator.schedule_and_wait_full_gc();
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
    }

    mutator.schedule_and_wait_full_gc_with_finalizers();

    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.object_factory().objects_count_unsafe(), 0);
    let info = last_gc_info(&runtime);
    assert!(info.finalizers_done_time.is_some());

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn finalizer_runs_exactly_once() {
    let runtime = test_runtime();
    let finalized = Arc::new(AtomicUsize::new(0));
    let observed = finalized.clone();
    runtime.set_finalizer_hook(Box::new(move |_| {
        observed.fetch_add(1, Ordering::SeqCst);
    }));
    let mutator = runtime.attach_current_thread();

    mutator.allocate_with_finalizer(0);
    mutator.schedule_and_wait_full_gc_with_finalizers();
    mutator.schedule_and_wait_full_gc_with_finalizers();

    assert_eq!(finalized.load(Ordering::SeqCst), 1);

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn concurrent_schedule_coalesces() {
    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    const CALLERS: usize = 10;
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| runtime.spawn_mutator(|m| m.schedule_and_wait_full_gc()))
        .collect();
    for handle in handles {
        mutator.join(handle);
    }

    let info = last_gc_info(&runtime);
    let epochs = info.epoch.expect("at least one collection ran");
    assert!(epochs >= 1);
    assert!(epochs <= CALLERS as u64);

    drop(mutator);
    runtime.shutdown();
}

fn marking_scenario(behavior: MarkingBehavior) -> (u64, u64) {
    const WORKERS: usize = 4;
    const CHAIN: usize = 25;

    let runtime = test_runtime();
    runtime.gc().set_marking_behavior_for_tests(behavior);
    let mutator = runtime.attach_current_thread();

    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let stop = stop.clone();
            let ready = ready.clone();
            runtime.spawn_mutator(move |m| {
                let head = m.allocate(1);
                let root = m.stack_root(head);
                let mut tail = head;
                for _ in 1..CHAIN {
                    let next = m.allocate(1);
                    unsafe { (*tail).set_field(0, next) };
                    tail = next;
                }
                ready.fetch_add(1, Ordering::SeqCst);
                // spin at safepoints so the pause catches us runnable and,
                // under MarkOwnStack, we mark our own chain
                while !stop.load(Ordering::SeqCst) {
                    m.safe_point();
                    std::hint::spin_loop();
                }
                drop(root);
            })
        })
        .collect();

    mutator.run_native(|| {
        while ready.load(Ordering::SeqCst) < WORKERS {
            std::thread::yield_now();
        }
    });

    // garbage on the triggering thread must not survive either
    mutator.allocate(2);
    mutator.schedule_and_wait_full_gc();
    let info = last_gc_info(&runtime);

    stop.store(true, Ordering::SeqCst);
    for handle in handles {
        mutator.join(handle);
    }

    let (alive, alive_bytes) = info.heap_after.expect("mark stats recorded");
    assert_eq!(alive as usize, WORKERS * CHAIN);
    assert_eq!(
        runtime.object_factory().objects_count_unsafe(),
        WORKERS * CHAIN
    );

    drop(mutator);
    runtime.shutdown();
    (alive, alive_bytes)
}

#[test]
fn parallel_marking_matches_serial() {
    let parallel = marking_scenario(MarkingBehavior::MarkOwnStack);
    let serial = marking_scenario(MarkingBehavior::DoNotMark);
    assert_eq!(parallel, serial);
}

#[test]
fn permanent_root_fields_are_traversed() {
    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    let permanent = runtime.create_permanent_object(1);
    let heap_field = mutator.allocate(0);
    unsafe { (*permanent).set_field(0, heap_field) };
    let _global = runtime.register_global(permanent);

    mutator.schedule_and_wait_full_gc();

    // the permanent object is not part of the heap count; its field is
    assert_eq!(runtime.object_factory().objects_count_unsafe(), 1);
    let info = last_gc_info(&runtime);
    assert_eq!(info.root_set, Some((0, 0, 1, 0)));

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn stable_ref_roots_until_disposed() {
    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    let object = mutator.allocate(0);
    let stable = runtime.register_stable_ref(object);

    mutator.schedule_and_wait_full_gc();
    assert_eq!(runtime.object_factory().objects_count_unsafe(), 1);
    let info = last_gc_info(&runtime);
    assert_eq!(info.root_set, Some((0, 0, 0, 1)));

    stable.dispose();
    mutator.schedule_and_wait_full_gc();
    assert_eq!(runtime.object_factory().objects_count_unsafe(), 0);

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn tls_roots_die_with_their_thread() {
    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicBool::new(false));
    let handle = {
        let stop = stop.clone();
        let ready = ready.clone();
        runtime.spawn_mutator(move |m| {
            let object = m.allocate(0);
            m.add_tls_root(object);
            ready.store(true, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                m.safe_point();
                std::hint::spin_loop();
            }
        })
    };

    mutator.run_native(|| {
        while !ready.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
    });

    mutator.schedule_and_wait_full_gc();
    assert_eq!(runtime.object_factory().objects_count_unsafe(), 1);
    let info = last_gc_info(&runtime);
    assert_eq!(info.root_set, Some((1, 0, 0, 0)));

    stop.store(true, Ordering::SeqCst);
    mutator.join(handle);

    mutator.schedule_and_wait_full_gc();
    assert_eq!(runtime.object_factory().objects_count_unsafe(), 0);

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn associated_object_detached_and_record_reclaimed() {
    let runtime = test_runtime();
    runtime.set_finalizer_hook(Box::new(|_| {}));
    let mutator = runtime.attach_current_thread();

    let mut native = 0u8;
    let object = mutator.allocate_with_finalizer(0);
    let extra = mutator.install_extra_object_data(object);
    extra.set_associated_object(&mut native as *mut u8);

    mutator.schedule_and_wait_full_gc_with_finalizers();
    // the finalizer thread has uninstalled the record; the next sweep's
    // pending-deletion pass frees it
    mutator.schedule_and_wait_full_gc();

    assert_eq!(runtime.object_factory().objects_count_unsafe(), 0);
    assert_eq!(runtime.extra_object_factory().size_unsafe(), 0);

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn allocation_pressure_schedules_collection() {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = Runtime::create(RuntimeConfig {
        scheduler: GcSchedulerConfig {
            allocation_threshold_bytes: 4 * 1024,
            heap_growth_ratio: 1.75,
        },
    });
    let mutator = runtime.attach_current_thread();

    for _ in 0..1000 {
        mutator.allocate(1);
    }
    let mut tries = 0;
    while last_gc_info(&runtime).epoch.is_none() {
        mutator.safe_point();
        mutator.run_native(|| std::thread::sleep(std::time::Duration::from_millis(1)));
        tries += 1;
        assert!(tries < 5000, "allocation pressure never triggered a GC");
    }

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn on_oom_performs_a_collection() {
    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    mutator.allocate(0);
    mutator.on_oom(4096);

    assert_eq!(runtime.object_factory().objects_count_unsafe(), 0);
    assert!(last_gc_info(&runtime).epoch.is_some());

    drop(mutator);
    runtime.shutdown();
}

#[test]
fn finalizer_thread_lifecycle() {
    let runtime = test_runtime();
    assert!(!runtime.finalizers_thread_is_running());
    runtime.start_finalizer_thread_if_needed();
    assert!(runtime.finalizers_thread_is_running());
    runtime.start_finalizer_thread_if_needed();
    assert!(runtime.finalizers_thread_is_running());
    runtime.stop_finalizer_thread_if_running();
    assert!(!runtime.finalizers_thread_is_running());
    runtime.shutdown();
}

#[test]
fn pauses_stop_running_mutators() {
    const THREADS: usize = 10;
    const ITERATIONS: usize = 10000;
    const COLLECTIONS: usize = 3;

    let runtime = test_runtime();
    let mutator = runtime.attach_current_thread();

    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = counter.clone();
            runtime.spawn_mutator(move |m| {
                for i in 0..ITERATIONS {
                    counter.fetch_add(1, Ordering::AcqRel);
                    if i % 100 == 0 {
                        m.safe_point();
                    }
                }
            })
        })
        .collect();

    for _ in 0..COLLECTIONS {
        mutator.schedule_and_wait_full_gc();
    }

    for handle in handles {
        mutator.join(handle);
    }
    assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERATIONS);

    let info = last_gc_info(&runtime);
    assert!(info.pause_start_time.is_some());
    assert!(info.pause_end_time <= info.end_time);

    drop(mutator);
    runtime.shutdown();
}
