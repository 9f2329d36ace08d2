use parking_lot::{Condvar, Mutex};

/// Epoch milestones of the collector. Epoch numbers only grow and every
/// milestone counter is monotone, so waits are plain predicate loops with no
/// lost-wakeup window.
#[derive(Default)]
struct Epochs {
    scheduled: u64,
    started: u64,
    finished: u64,
    finalized: u64,
    shutdown: bool,
}

/// Coalesces GC requests and lets callers await the `finished` or `finalized`
/// milestone of an epoch. All operations are thread-safe.
pub struct GcState {
    mutex: Mutex<Epochs>,
    cond: Condvar,
}

impl GcState {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(Epochs::default()),
            cond: Condvar::new(),
        }
    }

    /// Request a collection. Concurrent requests arriving before the GC
    /// thread wakes coalesce onto the same epoch.
    pub fn schedule(&self) -> u64 {
        let mut epochs = self.mutex.lock();
        if epochs.scheduled > epochs.started {
            epochs.scheduled
        } else {
            epochs.scheduled = epochs.started + 1;
            self.cond.notify_all();
            epochs.scheduled
        }
    }

    /// GC thread only: block until an epoch is scheduled, or `None` once
    /// shutdown is requested and nothing is pending.
    pub fn wait_scheduled(&self) -> Option<u64> {
        let mut epochs = self.mutex.lock();
        loop {
            if epochs.scheduled > epochs.started {
                return Some(epochs.scheduled);
            }
            if epochs.shutdown {
                return None;
            }
            self.cond.wait(&mut epochs);
        }
    }

    pub fn start(&self, epoch: u64) {
        let mut epochs = self.mutex.lock();
        assert!(
            epochs.started < epoch && epoch <= epochs.scheduled,
            "epoch {} started out of order",
            epoch
        );
        epochs.started = epoch;
    }

    pub fn finish(&self, epoch: u64) {
        let mut epochs = self.mutex.lock();
        epochs.finished = epoch;
        self.cond.notify_all();
    }

    pub fn finalized(&self, epoch: u64) {
        let mut epochs = self.mutex.lock();
        epochs.finalized = epoch;
        self.cond.notify_all();
    }

    /// Block until the given (or any later) epoch has finished its sweep.
    pub fn wait_epoch_finished(&self, epoch: u64) {
        let mut epochs = self.mutex.lock();
        while epochs.finished < epoch {
            self.cond.wait(&mut epochs);
        }
    }

    /// Block until the given (or any later) epoch has run its finalizers.
    pub fn wait_epoch_finalized(&self, epoch: u64) {
        let mut epochs = self.mutex.lock();
        while epochs.finalized < epoch {
            self.cond.wait(&mut epochs);
        }
    }

    /// Refuse new epochs. An in-flight epoch still runs to completion.
    pub fn shutdown(&self) {
        let mut epochs = self.mutex.lock();
        epochs.shutdown = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn schedule_coalesces_until_started() {
        let state = GcState::new();
        let first = state.schedule();
        let second = state.schedule();
        assert_eq!(first, second);

        state.start(first);
        let third = state.schedule();
        assert_eq!(third, first + 1);
    }

    #[test]
    fn wait_scheduled_returns_pending_epoch() {
        let state = GcState::new();
        let epoch = state.schedule();
        assert_eq!(state.wait_scheduled(), Some(epoch));
    }

    #[test]
    fn shutdown_unblocks_wait_scheduled() {
        let state = Arc::new(GcState::new());
        let waiter = {
            let state = state.clone();
            std::thread::spawn(move || state.wait_scheduled())
        };
        state.shutdown();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn pending_epoch_drains_before_shutdown() {
        let state = GcState::new();
        let epoch = state.schedule();
        state.shutdown();
        assert_eq!(state.wait_scheduled(), Some(epoch));
        state.start(epoch);
        state.finish(epoch);
        assert_eq!(state.wait_scheduled(), None);
    }

    #[test]
    fn waiters_observe_milestones() {
        let state = Arc::new(GcState::new());
        let epoch = state.schedule();
        let finished = {
            let state = state.clone();
            std::thread::spawn(move || state.wait_epoch_finished(epoch))
        };
        let finalized = {
            let state = state.clone();
            std::thread::spawn(move || state.wait_epoch_finalized(epoch))
        };
        state.start(epoch);
        state.finish(epoch);
        finished.join().unwrap();
        state.finalized(epoch);
        finalized.join().unwrap();
    }

    #[test]
    fn later_epoch_satisfies_earlier_waiter() {
        let state = GcState::new();
        let first = state.schedule();
        state.start(first);
        state.finish(first);
        let second = state.schedule();
        state.start(second);
        state.finish(second);
        // waiting on the first epoch after the second finished returns at once
        state.wait_epoch_finished(first);
    }
}
