use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::object::ObjectHeader;

/// Where a per-thread root came from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadRootSource {
    Stack,
    Tls,
}

/// Where a process-wide root came from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GlobalRootSource {
    Global,
    StableRef,
}

/// Registry of global variable slots. Slots live as long as the runtime; the
/// handle only reads and writes its slot.
pub struct GlobalRootRegistry {
    slots: Mutex<Vec<Box<AtomicPtr<ObjectHeader>>>>,
}

impl GlobalRootRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, initial: *mut ObjectHeader) -> GlobalRoot {
        let slot = Box::new(AtomicPtr::new(initial));
        let raw = &*slot as *const AtomicPtr<ObjectHeader>;
        self.slots.lock().push(slot);
        GlobalRoot { slot: raw }
    }

    pub fn visit(&self, mut f: impl FnMut(*mut ObjectHeader)) {
        for slot in self.slots.lock().iter() {
            f(slot.load(Ordering::Acquire));
        }
    }
}

/// Handle to a registered global variable slot.
#[derive(Copy, Clone)]
pub struct GlobalRoot {
    slot: *const AtomicPtr<ObjectHeader>,
}

unsafe impl Send for GlobalRoot {}

impl GlobalRoot {
    pub fn get(&self) -> *mut ObjectHeader {
        unsafe { (*self.slot).load(Ordering::Acquire) }
    }

    pub fn set(&self, object: *mut ObjectHeader) {
        unsafe { (*self.slot).store(object, Ordering::Release) }
    }

    pub fn clear(&self) {
        self.set(std::ptr::null_mut());
    }
}

struct StableRefSlot {
    object: AtomicPtr<ObjectHeader>,
    disposed: AtomicBool,
}

/// External references pinned into the root set. Disposal is deferred: a
/// disposed reference keeps its object alive until `process_deletions` runs
/// at the start of the next root-set collection.
pub struct StableRefRegistry {
    refs: Mutex<Vec<Box<StableRefSlot>>>,
}

impl StableRefRegistry {
    pub fn new() -> Self {
        Self {
            refs: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, object: *mut ObjectHeader) -> StableRef {
        let slot = Box::new(StableRefSlot {
            object: AtomicPtr::new(object),
            disposed: AtomicBool::new(false),
        });
        let raw = &*slot as *const StableRefSlot;
        self.refs.lock().push(slot);
        StableRef { slot: raw }
    }

    /// Drop every reference disposed since the previous call.
    pub fn process_deletions(&self) {
        self.refs
            .lock()
            .retain(|slot| !slot.disposed.load(Ordering::Acquire));
    }

    pub fn visit(&self, mut f: impl FnMut(*mut ObjectHeader)) {
        for slot in self.refs.lock().iter() {
            f(slot.object.load(Ordering::Acquire));
        }
    }
}

/// Handle to a stable reference. `dispose` is safe to call from any thread.
/// Not copyable: the slot is freed by the deletion pass after disposal, so
/// exactly one handle may exist per live slot.
pub struct StableRef {
    slot: *const StableRefSlot,
}

unsafe impl Send for StableRef {}

impl StableRef {
    pub fn get(&self) -> *mut ObjectHeader {
        unsafe { (*self.slot).object.load(Ordering::Acquire) }
    }

    pub fn dispose(self) {
        unsafe { (*self.slot).disposed.store(true, Ordering::Release) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectHeader;

    #[test]
    fn global_roots_are_visited() {
        let registry = GlobalRootRegistry::new();
        let object = ObjectHeader::create_permanent(0);
        let root = registry.register(std::ptr::null_mut());
        root.set(object);

        let mut seen = Vec::new();
        registry.visit(|obj| seen.push(obj));
        assert_eq!(seen, vec![object]);

        root.clear();
        let mut seen = Vec::new();
        registry.visit(|obj| seen.push(obj));
        assert_eq!(seen, vec![std::ptr::null_mut()]);
    }

    #[test]
    fn stable_ref_disposal_is_deferred() {
        let registry = StableRefRegistry::new();
        let object = ObjectHeader::create_permanent(0);
        let stable = registry.register(object);

        stable.dispose();
        let mut seen = Vec::new();
        registry.visit(|obj| seen.push(obj));
        assert_eq!(seen, vec![object], "disposed ref still roots until deletions run");

        registry.process_deletions();
        let mut seen = Vec::new();
        registry.visit(|obj| seen.push(obj));
        assert!(seen.is_empty());
    }
}
