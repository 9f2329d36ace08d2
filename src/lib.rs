//! Stop-the-world mark & sweep garbage collector with cooperative parallel
//! marking.
//!
//! One dedicated GC thread drives each collection epoch; mutator threads are
//! suspended at polled safepoints and, under the default
//! [`gc::MarkingBehavior::MarkOwnStack`], mark their own stack and TLS roots
//! in parallel while the world is stopped. Sweep runs in two phases,
//! extra-object records first and then the object factory, and hands dead
//! finalizable objects to a finalizer worker thread.
//!
//! ```no_run
//! use meteor::runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::create(RuntimeConfig::default());
//! let mutator = runtime.attach_current_thread();
//!
//! let object = mutator.allocate(2);
//! let root = mutator.stack_root(object);
//! mutator.schedule_and_wait_full_gc();
//!
//! drop(root);
//! drop(mutator);
//! runtime.shutdown();
//! ```

#[macro_use]
pub mod utils;

pub mod extra_object;
pub mod finalizer;
pub mod gc;
pub mod mark;
pub mod object;
pub mod object_factory;
pub mod root_set;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod statistics;
pub mod sweep;
pub mod thread;

#[cfg(test)]
mod tests;
