use crate::utils::{time_nanos, SpinLock};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryUsage {
    pub objects_count: u64,
    pub total_objects_size: u64,
}

#[derive(Copy, Clone, Default, Debug)]
pub struct MemoryUsageMap {
    pub heap: Option<MemoryUsage>,
    pub meta: Option<MemoryUsage>,
}

#[derive(Copy, Clone, Default, Debug)]
pub struct RootSetStatistics {
    pub thread_local_references: u64,
    pub stack_references: u64,
    pub global_references: u64,
    pub stable_references: u64,
}

impl RootSetStatistics {
    pub fn total(&self) -> u64 {
        self.thread_local_references
            + self.stack_references
            + self.global_references
            + self.stable_references
    }
}

/// Everything recorded about one GC epoch. Times are nanoseconds since
/// process start; fields stay `None` until the epoch reaches them.
#[derive(Clone, Default, Debug)]
pub struct GcInfo {
    pub epoch: Option<u64>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub pause_start_time: Option<u64>,
    pub pause_end_time: Option<u64>,
    pub finalizers_done_time: Option<u64>,
    pub root_set: Option<RootSetStatistics>,
    pub memory_usage_before: MemoryUsageMap,
    pub memory_usage_after: MemoryUsageMap,
}

#[derive(Default)]
struct Snapshots {
    last: GcInfo,
    current: GcInfo,
}

/// Last-completed and current-in-flight epoch records. The lock is a spin
/// lock: parallel-marking mutators report root-set counts while in the
/// runnable state, so it must not interact with thread states.
pub struct GcStats {
    lock: SpinLock<Snapshots>,
}

impl GcStats {
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(Snapshots::default()),
        }
    }
}

/// Cheap per-epoch recorder handed around the collection; every method is a
/// locked update of the matching snapshot plus a log line.
#[derive(Copy, Clone)]
pub struct GcHandle<'a> {
    stats: &'a GcStats,
    epoch: u64,
}

impl<'a> GcHandle<'a> {
    pub fn create(stats: &'a GcStats, epoch: u64) -> GcHandle<'a> {
        let mut guard = stats.lock.lock();
        let start = time_nanos();
        guard.current = GcInfo {
            epoch: Some(epoch),
            start_time: Some(start),
            ..GcInfo::default()
        };
        match guard.last.end_time {
            Some(last_end) => {
                gc_log!(
                    epoch,
                    "Started. Time since last GC {} microseconds.",
                    (start - last_end) / 1000
                );
            }
            None => gc_log!(epoch, "Started."),
        }
        drop(guard);
        Self::get_by_epoch(stats, epoch)
    }

    pub fn get_by_epoch(stats: &'a GcStats, epoch: u64) -> GcHandle<'a> {
        GcHandle { stats, epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn update(&self, f: impl FnOnce(u64, &mut GcInfo)) {
        let mut guard = self.stats.lock.lock();
        let epoch = Some(self.epoch);
        let stat = if guard.current.epoch == epoch {
            &mut guard.current
        } else if guard.last.epoch == epoch {
            &mut guard.last
        } else {
            return;
        };
        f(self.epoch, stat);
    }

    /// Seal the record and demote it to "last" if it is the current one.
    pub fn finish(&self) {
        let mut guard = self.stats.lock.lock();
        let epoch = Some(self.epoch);
        let end = time_nanos();
        let is_current = guard.current.epoch == epoch;
        let stat = if is_current {
            &mut guard.current
        } else if guard.last.epoch == epoch {
            &mut guard.last
        } else {
            return;
        };
        stat.end_time = Some(end);
        if let Some(start) = stat.start_time {
            gc_log!(
                self.epoch,
                "Finished. Total GC epoch time is {} microseconds.",
                (end - start) / 1000
            );
        }
        if is_current {
            guard.last = std::mem::take(&mut guard.current);
        }
    }

    pub fn suspension_requested(&self) {
        self.update(|epoch, stat| {
            gc_log!(epoch, "Requested thread suspension");
            stat.pause_start_time = Some(time_nanos());
        });
    }

    pub fn threads_are_suspended(&self) {
        self.update(|epoch, stat| {
            if let Some(pause_start) = stat.pause_start_time {
                gc_log!(
                    epoch,
                    "Suspended all threads in {} microseconds",
                    (time_nanos() - pause_start) / 1000
                );
            }
        });
    }

    pub fn threads_are_resumed(&self) {
        self.update(|epoch, stat| {
            let pause_end = time_nanos();
            stat.pause_end_time = Some(pause_end);
            if let Some(pause_start) = stat.pause_start_time {
                gc_log!(
                    epoch,
                    "Resume all threads. Total pause time is {} microseconds.",
                    (pause_end - pause_start) / 1000
                );
            }
        });
    }

    pub fn finalizers_done(&self) {
        self.update(|epoch, stat| {
            let done = time_nanos();
            stat.finalizers_done_time = Some(done);
            match stat.end_time {
                Some(end) => gc_log!(
                    epoch,
                    "Finalization is done in {} microseconds after epoch end.",
                    (done - end) / 1000
                ),
                None => gc_log!(epoch, "Finalization is done."),
            }
        });
    }

    pub fn finalizers_scheduled(&self, finalizers_count: u64) {
        gc_log!(
            self.epoch,
            "Finalization is scheduled for {} objects.",
            finalizers_count
        );
    }

    pub fn thread_root_set(
        &self,
        thread_id: u32,
        thread_local_references: u64,
        stack_references: u64,
    ) {
        self.update(|epoch, stat| {
            let root_set = stat.root_set.get_or_insert_with(RootSetStatistics::default);
            root_set.stack_references += stack_references;
            root_set.thread_local_references += thread_local_references;
            gc_log!(
                epoch,
                "Collected root set for thread #{}: stack={} tls={}. Total root set size is {}",
                thread_id,
                stack_references,
                thread_local_references,
                root_set.total()
            );
        });
    }

    pub fn global_root_set(&self, global_references: u64, stable_references: u64) {
        self.update(|epoch, stat| {
            let root_set = stat.root_set.get_or_insert_with(RootSetStatistics::default);
            root_set.global_references += global_references;
            root_set.stable_references += stable_references;
            gc_log!(
                epoch,
                "Collected global root set global={} stableRef={}. Total root set size is {}",
                global_references,
                stable_references,
                root_set.total()
            );
        });
    }

    pub fn heap_usage_before(&self, objects_count: u64, total_objects_size: u64) {
        self.update(|_, stat| {
            stat.memory_usage_before.heap = Some(MemoryUsage {
                objects_count,
                total_objects_size,
            });
        });
    }

    pub fn heap_usage_after(&self, objects_count: u64, total_objects_size: u64) {
        self.update(|epoch, stat| {
            stat.memory_usage_after.heap = Some(MemoryUsage {
                objects_count,
                total_objects_size,
            });
            if let Some(before) = stat.memory_usage_before.heap {
                gc_log!(
                    epoch,
                    "Collected {} heap objects of total size {}.",
                    before.objects_count as i64 - objects_count as i64,
                    before.total_objects_size as i64 - total_objects_size as i64
                );
            }
            gc_log!(
                epoch,
                "{} heap objects of total size {} are still alive.",
                objects_count,
                total_objects_size
            );
        });
    }

    pub fn extra_objects_usage_before(&self, objects_count: u64, total_objects_size: u64) {
        self.update(|_, stat| {
            stat.memory_usage_before.meta = Some(MemoryUsage {
                objects_count,
                total_objects_size,
            });
        });
    }

    pub fn extra_objects_usage_after(&self, objects_count: u64, total_objects_size: u64) {
        self.update(|epoch, stat| {
            stat.memory_usage_after.meta = Some(MemoryUsage {
                objects_count,
                total_objects_size,
            });
            if let Some(before) = stat.memory_usage_before.meta {
                gc_log!(
                    epoch,
                    "Collected {} meta objects of total size {}.",
                    before.objects_count as i64 - objects_count as i64,
                    before.total_objects_size as i64 - total_objects_size as i64
                );
            }
        });
    }
}

/// Setter callbacks invoked by [`fill_gc_info`] for each populated field of
/// the chosen record.
pub trait GcInfoBuilder {
    fn set_epoch(&mut self, epoch: u64);
    fn set_start_time(&mut self, time_ns: u64);
    fn set_end_time(&mut self, time_ns: u64);
    fn set_pause_start_time(&mut self, time_ns: u64);
    fn set_pause_end_time(&mut self, time_ns: u64);
    fn set_finalizers_done_time(&mut self, time_ns: u64);
    fn set_root_set(
        &mut self,
        thread_local_references: u64,
        stack_references: u64,
        global_references: u64,
        stable_references: u64,
    );
    fn set_memory_usage_before(&mut self, pool: &str, objects_count: u64, total_objects_size: u64);
    fn set_memory_usage_after(&mut self, pool: &str, objects_count: u64, total_objects_size: u64);
}

/// Copy the requested record under the stats lock, then hand each populated
/// field to the builder. `id` 0 is the last completed epoch, 1 the current
/// in-flight one; anything else is a no-op.
pub fn fill_gc_info(stats: &GcStats, builder: &mut dyn GcInfoBuilder, id: i32) {
    let copy = {
        let guard = stats.lock.lock();
        match id {
            0 => guard.last.clone(),
            1 => guard.current.clone(),
            _ => return,
        }
    };
    let epoch = match copy.epoch {
        Some(epoch) => epoch,
        None => return,
    };
    builder.set_epoch(epoch);
    if let Some(time) = copy.start_time {
        builder.set_start_time(time);
    }
    if let Some(time) = copy.end_time {
        builder.set_end_time(time);
    }
    if let Some(time) = copy.pause_start_time {
        builder.set_pause_start_time(time);
    }
    if let Some(time) = copy.pause_end_time {
        builder.set_pause_end_time(time);
    }
    if let Some(time) = copy.finalizers_done_time {
        builder.set_finalizers_done_time(time);
    }
    if let Some(root_set) = copy.root_set {
        builder.set_root_set(
            root_set.thread_local_references,
            root_set.stack_references,
            root_set.global_references,
            root_set.stable_references,
        );
    }
    if let Some(usage) = copy.memory_usage_before.heap {
        builder.set_memory_usage_before("heap", usage.objects_count, usage.total_objects_size);
    }
    if let Some(usage) = copy.memory_usage_before.meta {
        builder.set_memory_usage_before("meta", usage.objects_count, usage.total_objects_size);
    }
    if let Some(usage) = copy.memory_usage_after.heap {
        builder.set_memory_usage_after("heap", usage.objects_count, usage.total_objects_size);
    }
    if let Some(usage) = copy.memory_usage_after.meta {
        builder.set_memory_usage_after("meta", usage.objects_count, usage.total_objects_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingBuilder {
        epoch: Option<u64>,
        start_time: Option<u64>,
        end_time: Option<u64>,
        root_set: Option<(u64, u64, u64, u64)>,
        before: Vec<(String, u64, u64)>,
        after: Vec<(String, u64, u64)>,
    }

    impl GcInfoBuilder for RecordingBuilder {
        fn set_epoch(&mut self, epoch: u64) {
            self.epoch = Some(epoch);
        }
        fn set_start_time(&mut self, time_ns: u64) {
            self.start_time = Some(time_ns);
        }
        fn set_end_time(&mut self, time_ns: u64) {
            self.end_time = Some(time_ns);
        }
        fn set_pause_start_time(&mut self, _time_ns: u64) {}
        fn set_pause_end_time(&mut self, _time_ns: u64) {}
        fn set_finalizers_done_time(&mut self, _time_ns: u64) {}
        fn set_root_set(&mut self, tls: u64, stack: u64, global: u64, stable: u64) {
            self.root_set = Some((tls, stack, global, stable));
        }
        fn set_memory_usage_before(&mut self, pool: &str, count: u64, size: u64) {
            self.before.push((pool.to_string(), count, size));
        }
        fn set_memory_usage_after(&mut self, pool: &str, count: u64, size: u64) {
            self.after.push((pool.to_string(), count, size));
        }
    }

    #[test]
    fn total_counts_each_source_once() {
        let stats = RootSetStatistics {
            thread_local_references: 1,
            stack_references: 2,
            global_references: 3,
            stable_references: 4,
        };
        assert_eq!(stats.total(), 10);
    }

    #[test]
    fn finish_demotes_current_to_last() {
        let stats = GcStats::new();
        let handle = GcHandle::create(&stats, 1);
        handle.thread_root_set(0, 2, 3);
        handle.global_root_set(5, 7);
        handle.heap_usage_before(10, 100);
        handle.heap_usage_after(4, 40);
        handle.finish();

        let mut builder = RecordingBuilder::default();
        fill_gc_info(&stats, &mut builder, 0);
        assert_eq!(builder.epoch, Some(1));
        assert!(builder.start_time.is_some());
        assert!(builder.end_time.is_some());
        assert_eq!(builder.root_set, Some((2, 3, 5, 7)));
        assert_eq!(builder.before, vec![("heap".to_string(), 10, 100)]);
        assert_eq!(builder.after, vec![("heap".to_string(), 4, 40)]);

        // the current slot is empty again
        let mut builder = RecordingBuilder::default();
        fill_gc_info(&stats, &mut builder, 1);
        assert_eq!(builder.epoch, None);
    }

    #[test]
    fn late_updates_reach_the_demoted_record() {
        let stats = GcStats::new();
        let handle = GcHandle::create(&stats, 3);
        handle.finish();
        // finalizers complete after the epoch was demoted to "last"
        GcHandle::get_by_epoch(&stats, 3).finalizers_done();

        let mut builder = RecordingBuilder::default();
        fill_gc_info(&stats, &mut builder, 0);
        assert_eq!(builder.epoch, Some(3));
    }

    #[test]
    fn unknown_id_is_a_no_op() {
        let stats = GcStats::new();
        GcHandle::create(&stats, 1);
        let mut builder = RecordingBuilder::default();
        fill_gc_info(&stats, &mut builder, 7);
        assert_eq!(builder.epoch, None);
    }
}
