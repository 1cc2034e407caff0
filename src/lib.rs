//! Tracing, mark-and-sweep garbage-collected smart pointers.
//!
//! [`Handle<T>`] allocates heap blocks holding one `T` or an array of `T`
//! and behaves like a pointer: checked dereference and indexing, unchecked
//! arithmetic, casts and member projection. The collector tracks every live
//! handle. Handles outside managed memory are *roots*; handles embedded in
//! a managed payload are *members* of their block, discovered through the
//! [`Trace`] trait when the block finishes construction. A collection marks
//! every block transitively reachable from the roots and reclaims the rest,
//! so arbitrary cyclic object graphs are collected once no root reaches
//! them. Collections run when allocation since the last cycle crosses a
//! configurable byte threshold, or on an explicit [`collect()`] call.
//!
//! ```
//! use gcptr::{collect, Handle, InitSpec};
//!
//! let mut nums: Handle<u32> = Handle::new();
//! nums.alloc_array(8, InitSpec::Zero).unwrap();
//! nums[0] = 7;
//! assert_eq!(nums[0], 7);
//!
//! let iter = &nums + 7;
//! nums.detach();
//! collect(); // frees nothing: iter still roots the array
//! assert_eq!(*iter, 0);
//! ```
//!
//! Allocation nests: an element constructor may itself allocate. Blocks
//! only become visible to the collector when the outermost allocation
//! completes, so a partially constructed graph is never observed, marked,
//! or swept.

mod block;
mod collect;
mod error;
mod handle;
mod trace;

pub use collect::{collect, collect_threshold, live_bytes};
pub use error::{AllocError, PtrError};
pub use handle::{Handle, InitSpec};
pub use trace::{HandleVisitor, Trace};

#[cfg(test)]
pub(crate) mod testutil {
    use parking_lot::{Mutex, MutexGuard};
    use std::panic;

    static SCENARIOS: Mutex<()> = Mutex::new(());

    /// Collector state is process-global, so tests that allocate or assert
    /// on freed-byte counts serialize here and drain pending garbage first.
    pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
        let guard = SCENARIOS.lock();
        crate::collect();
        guard
    }

    /// Run `f` with panic output suppressed; the previous hook is restored.
    pub(crate) fn quiet_panics<R>(f: impl FnOnce() -> R) -> R {
        let hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let result = f();
        panic::set_hook(hook);
        result
    }
}
