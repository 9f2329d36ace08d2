use std::{collections::VecDeque, sync::Arc, thread::JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::{
    object_factory::{FinalizerQueue, NodeRef, ObjectFactory},
    runtime::Runtime,
    statistics::GcHandle,
};

struct Tasks {
    queue: VecDeque<(FinalizerQueue, u64)>,
    shutdown: bool,
}

/// Runs finalizers on a dedicated worker thread. Each task is the finalizer
/// queue of one epoch; the epoch is reported finalized once its queue has
/// been fully processed, so `finalized` milestones stay monotone.
pub struct FinalizerProcessor {
    tasks: Mutex<Tasks>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizerProcessor {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Tasks {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn start_finalizer_thread_if_none(&self, runtime: &Arc<Runtime>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let runtime = runtime.clone();
        let handle = std::thread::Builder::new()
            .name("GC finalizer processor".to_string())
            .spawn(move || runtime.gc().finalizer_processor().run_loop(&runtime))
            .expect("failed to spawn the finalizer thread");
        *worker = Some(handle);
    }

    /// Drain remaining tasks and stop the worker. The processor can be
    /// started again afterwards.
    pub fn stop_finalizer_thread(&self) {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            self.tasks.lock().shutdown = true;
            self.cond.notify_all();
            handle.join().expect("finalizer thread panicked");
            self.tasks.lock().shutdown = false;
        }
    }

    /// Hand one epoch's finalizer queue to the worker, starting it if needed.
    /// An empty queue with no worker running is finalized on the spot.
    pub fn schedule_tasks(&self, runtime: &Arc<Runtime>, queue: FinalizerQueue, epoch: u64) {
        if queue.is_empty() && !self.is_running() {
            GcHandle::get_by_epoch(runtime.gc_stats(), epoch).finalizers_done();
            runtime.gc().state().finalized(epoch);
            return;
        }
        self.tasks.lock().queue.push_back((queue, epoch));
        self.start_finalizer_thread_if_none(runtime);
        self.cond.notify_all();
    }

    fn run_loop(&self, runtime: &Arc<Runtime>) {
        log::debug!(target: "gc", "Initializing finalizer processor");
        loop {
            let (mut queue, epoch) = {
                let mut tasks = self.tasks.lock();
                loop {
                    if let Some(task) = tasks.queue.pop_front() {
                        break task;
                    }
                    if tasks.shutdown {
                        return;
                    }
                    self.cond.wait(&mut tasks);
                }
            };
            while let Some(node) = queue.pop() {
                run_finalizer(runtime, node);
            }
            // record the timestamp before waking epoch waiters, so a
            // synchronous caller observes it on return
            GcHandle::get_by_epoch(runtime.gc_stats(), epoch).finalizers_done();
            runtime.gc().state().finalized(epoch);
        }
    }
}

fn run_finalizer(runtime: &Runtime, node: NodeRef) {
    let object = node.object();
    if let Some(hook) = runtime.finalizer_hook() {
        hook(object);
    }
    unsafe {
        if let Some(extra) = (*object).extra_object_data() {
            extra.uninstall();
            runtime
                .extra_object_factory()
                .schedule_destroy(extra as *const _ as *mut _);
        }
        ObjectFactory::destroy_node(node);
    }
}
