use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use once_cell::sync::Lazy;

/// Log line tagged with the GC epoch it belongs to.
macro_rules! gc_log {
    ($epoch:expr, $($arg:tt)+) => {
        log::info!(target: "gc", "Epoch #{}: {}", $epoch, format_args!($($arg)+))
    };
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic time since process start, in microseconds.
pub fn time_micros() -> u64 {
    PROCESS_START.elapsed().as_micros() as u64
}

/// Monotonic time since process start, in nanoseconds.
pub fn time_nanos() -> u64 {
    PROCESS_START.elapsed().as_nanos() as u64
}

/// Minimal test-and-set spin lock.
///
/// Unlike a blocking mutex this can be taken from a thread in the runnable
/// state: parallel-marking mutators report statistics while the world is
/// stopped, so the statistics lock must never interact with thread states.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn spin_lock_excludes() {
        let lock = Arc::new(SpinLock::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40000);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = time_nanos();
        let b = time_nanos();
        assert!(b >= a);
        assert!(time_micros() <= time_nanos());
    }
}
