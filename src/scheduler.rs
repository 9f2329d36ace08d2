use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

/// Tuning knobs for allocation-pressure scheduling.
#[derive(Copy, Clone, Debug)]
pub struct GcSchedulerConfig {
    /// Allocated bytes since the last collection that trigger a new one.
    pub allocation_threshold_bytes: usize,
    /// Target heap factor applied to the alive set after each collection.
    pub heap_growth_ratio: f64,
}

impl Default for GcSchedulerConfig {
    fn default() -> Self {
        Self {
            allocation_threshold_bytes: 8 * 1024 * 1024,
            heap_growth_ratio: 1.75,
        }
    }
}

/// Decides when to request a collection: counts bytes allocated at safepoints
/// and fires the schedule callback once the target is crossed. The target
/// regrows from the alive set reported by marking.
pub struct GcScheduler {
    config: GcSchedulerConfig,
    allocated_since_gc: AtomicUsize,
    target_bytes: AtomicUsize,
    schedule_gc: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl GcScheduler {
    pub fn new(config: GcSchedulerConfig) -> Self {
        Self {
            allocated_since_gc: AtomicUsize::new(0),
            target_bytes: AtomicUsize::new(config.allocation_threshold_bytes),
            schedule_gc: OnceCell::new(),
            config,
        }
    }

    pub(crate) fn set_schedule_gc(&self, f: Box<dyn Fn() + Send + Sync>) {
        assert!(self.schedule_gc.set(f).is_ok(), "schedule callback already set");
    }

    /// Called from the allocation slow path. Fires the callback exactly once
    /// per threshold crossing.
    pub fn on_safe_point_allocation(&self, size: usize) {
        let old = self.allocated_since_gc.fetch_add(size, Ordering::Relaxed);
        let target = self.target_bytes.load(Ordering::Relaxed);
        if old < target && old + size >= target {
            log::debug!(target: "gc", "Scheduling GC by allocation pressure");
            if let Some(schedule) = self.schedule_gc.get() {
                schedule();
            }
        }
    }

    /// A collection is underway; restart the allocation counter.
    pub fn on_perform_full_gc(&self) {
        self.allocated_since_gc.store(0, Ordering::Relaxed);
    }

    /// Regrow the target from the size of the surviving set.
    pub fn update_alive_set_bytes(&self, bytes: usize) {
        let grown = (bytes as f64 * self.config.heap_growth_ratio) as usize;
        let target = grown.max(self.config.allocation_threshold_bytes);
        self.target_bytes.store(target, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn target_bytes(&self) -> usize {
        self.target_bytes.load(Ordering::Relaxed)
    }
}
