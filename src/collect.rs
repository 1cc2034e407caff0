//! The global collector: handle bookkeeping, allocation pressure, and the
//! stop-the-world mark/sweep cycle.
//!
//! Lock order is fixed. Any path that needs more than one lock acquires in
//! this sequence: collection lock, active-list mutex, roots-list mutex.
//! The collection lock is re-entrant so that an allocation made by a
//! destructor running under sweep degrades to a no-op instead of
//! deadlocking.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::debug;

use crate::block::{self, Block};
use crate::handle::Anchor;

/// Payload bytes allocated since the last collection before the allocators
/// force one.
const DEFAULT_THRESHOLD: usize = 100 * 1024;

struct GcFlags {
    /// True while a collection runs. Re-entrant callers observe it and
    /// return instead of collecting again.
    busy: Cell<bool>,
}

/// Serializes collections; also covers byte-counter and threshold updates.
static GC_LOCK: ReentrantMutex<GcFlags> = ReentrantMutex::new(GcFlags {
    busy: Cell::new(false),
});

/// Payload bytes allocated since the last collection.
static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static THRESHOLD: AtomicUsize = AtomicUsize::new(DEFAULT_THRESHOLD);

struct RootList {
    head: *mut Anchor,
}

// SAFETY: the list is only touched under the enclosing mutex.
unsafe impl Send for RootList {}

struct BlockList {
    head: *mut Block,
}

// SAFETY: the list is only touched under the enclosing mutex.
unsafe impl Send for BlockList {}

/// Anchors of every live root handle, doubly linked.
static ROOTS: Mutex<RootList> = Mutex::new(RootList {
    head: ptr::null_mut(),
});

/// Every promoted, not-yet-collected block, singly linked.
static ACTIVE: Mutex<BlockList> = Mutex::new(BlockList {
    head: ptr::null_mut(),
});

thread_local! {
    /// Blocks currently running element constructors, innermost first.
    static CONSTRUCTION: Cell<*mut Block> = const { Cell::new(ptr::null_mut()) };
    /// Completed blocks waiting for the outermost allocation to finish.
    static NEW_BLOCKS: Cell<*mut Block> = const { Cell::new(ptr::null_mut()) };
}

// ── Roots list ────────────────────────────────────────────────────────

/// Insert a fresh anchor at the head of the roots list.
pub(crate) fn link_root(anchor: NonNull<Anchor>) {
    let mut roots = ROOTS.lock();
    let a = anchor.as_ptr();
    // SAFETY: the anchor is fresh and the list is stable under the mutex.
    unsafe {
        (*a).prev.store(ptr::null_mut(), Ordering::Relaxed);
        (*a).next.store(roots.head, Ordering::Relaxed);
        if let Some(head) = NonNull::new(roots.head) {
            head.as_ref().prev.store(a, Ordering::Relaxed);
        }
    }
    roots.head = a;
}

/// Remove a root anchor from the roots list. The caller frees it.
pub(crate) fn unlink_root(anchor: NonNull<Anchor>) {
    let mut roots = ROOTS.lock();
    // SAFETY: root anchors are always on the roots list.
    unsafe { unlink_root_locked(&mut roots, anchor.as_ptr()) };
}

unsafe fn unlink_root_locked(roots: &mut RootList, a: *mut Anchor) {
    unsafe {
        let prev = (*a).prev.load(Ordering::Relaxed);
        let next = (*a).next.load(Ordering::Relaxed);
        if !next.is_null() {
            (*next).prev.store(prev, Ordering::Relaxed);
        }
        if !prev.is_null() {
            (*prev).next.store(next, Ordering::Relaxed);
        } else {
            roots.head = next;
        }
    }
}

/// Move a root anchor onto a block's member list. The block is still under
/// construction on the calling thread, so the member insert itself needs
/// no lock; member anchors are never unlinked individually.
pub(crate) fn adopt(anchor: NonNull<Anchor>, block: *mut Block) {
    let a = anchor.as_ptr();
    // A repeated report must not corrupt the member list.
    // SAFETY: the anchor is live; its handle is inside the payload.
    if unsafe { anchor.as_ref() }.is_member() {
        return;
    }
    {
        let mut roots = ROOTS.lock();
        // SAFETY: non-member anchors are on the roots list.
        unsafe { unlink_root_locked(&mut roots, a) };
    }
    // SAFETY: the block is invisible to other threads until promotion.
    unsafe {
        (*a).next.store((*block).members.load(Ordering::Relaxed), Ordering::Relaxed);
        (*block).members.store(a, Ordering::Relaxed);
        // Member sentinel.
        (*a).prev.store(a, Ordering::Relaxed);
    }
}

// ── Thread-local construction state ───────────────────────────────────

pub(crate) fn push_construction(block: *mut Block) {
    CONSTRUCTION.with(|stack| {
        // SAFETY: the block is owned by this thread during construction.
        unsafe { (*block).next.store(stack.get(), Ordering::Relaxed) };
        stack.set(block);
    });
}

pub(crate) fn pop_construction() -> *mut Block {
    CONSTRUCTION.with(|stack| {
        let top = stack.get();
        debug_assert!(!top.is_null(), "construction stack underflow");
        // SAFETY: pushed by this thread in push_construction.
        stack.set(unsafe { (*top).next.load(Ordering::Relaxed) });
        top
    })
}

/// Innermost block under construction on this thread, or null.
pub(crate) fn construction_top() -> *mut Block {
    CONSTRUCTION.with(Cell::get)
}

pub(crate) fn in_construction() -> bool {
    !construction_top().is_null()
}

/// Queue a completed block until the outermost allocation finishes.
pub(crate) fn queue_new_block(block: *mut Block) {
    NEW_BLOCKS.with(|list| {
        let mut head = list.get();
        // SAFETY: the block is owned by this thread until promotion.
        unsafe { block::push(block, &mut head) };
        list.set(head);
    });
}

/// Splice this thread's completed blocks onto the active list, making them
/// visible to the collector.
pub(crate) fn promote_new_blocks() {
    let pending = NEW_BLOCKS.with(|list| list.replace(ptr::null_mut()));
    if pending.is_null() {
        return;
    }
    let mut active = ACTIVE.lock();
    let mut cur = pending;
    while !cur.is_null() {
        // SAFETY: queued blocks are live and owned by this thread.
        unsafe {
            let next = (*cur).next.load(Ordering::Relaxed);
            (*cur).active.store(true, Ordering::Relaxed);
            block::push(cur, &mut active.head);
            cur = next;
        }
    }
}

/// Tear this thread's completed blocks down instead of promoting them: the
/// outermost allocation failed, so none of them may become visible to the
/// collector.
pub(crate) fn discard_new_blocks() {
    let mut cur = NEW_BLOCKS.with(|list| list.replace(ptr::null_mut()));
    while !cur.is_null() {
        // SAFETY: queued blocks are live and owned by this thread.
        unsafe {
            let next = (*cur).next.load(Ordering::Relaxed);
            reclaim(cur);
            cur = next;
        }
    }
}

/// Account freshly constructed payload bytes toward the threshold.
pub(crate) fn note_allocated(bytes: usize) {
    let _gc = GC_LOCK.lock();
    ALLOCATED.fetch_add(bytes, Ordering::Relaxed);
}

// ── Reclamation ───────────────────────────────────────────────────────

/// Destroy a block's payload, free its member anchors, release the buffer.
/// Returns the number of buffer bytes released.
///
/// # Safety
///
/// The block must be unreachable by every other thread: freshly failed or
/// discarded construction, or swept off the active list.
pub(crate) unsafe fn reclaim(block: *mut Block) -> usize {
    unsafe {
        if let Some(destroy) = (*block).destroy {
            destroy((*block).payload(), (*block).nelems);
        }
        // Member anchors outlive the payload destructors above, which may
        // drop the embedded handles that point at them.
        let mut member = (*block).members.load(Ordering::Relaxed);
        while !member.is_null() {
            let next = (*member).next.load(Ordering::Relaxed);
            drop(Box::from_raw(member));
            member = next;
        }
        let layout = (*block).layout();
        std::alloc::dealloc(block.cast(), layout);
        layout.size()
    }
}

// ── Mark and sweep ────────────────────────────────────────────────────

/// Reachability flood-fill over a list of anchors. An attached, active,
/// unmarked block is marked and its member handles followed. Each block is
/// marked at most once, which bounds the recursion.
unsafe fn mark(list: *mut Anchor) {
    let mut anchor = list;
    while !anchor.is_null() {
        // SAFETY: both anchor lists are stable while the collector holds
        // the active and roots mutexes.
        unsafe {
            let block = (*anchor).mem.load(Ordering::Relaxed);
            if !block.is_null()
                && (*block).active.load(Ordering::Relaxed)
                && !(*block).marked.load(Ordering::Relaxed)
            {
                (*block).marked.store(true, Ordering::Relaxed);
                mark((*block).members.load(Ordering::Relaxed));
            }
            anchor = (*anchor).next.load(Ordering::Relaxed);
        }
    }
}

/// Collect garbage if the threshold was reached, or unconditionally.
/// Returns the number of bytes freed. Callable from any thread; re-entrant
/// calls (alloc inside a sweeping destructor) return 0.
pub(crate) fn gc(unconditional: bool) -> usize {
    let flags = GC_LOCK.lock();
    if flags.busy.get()
        || (!unconditional && ALLOCATED.load(Ordering::Relaxed) < THRESHOLD.load(Ordering::Relaxed))
    {
        return 0;
    }
    flags.busy.set(true);
    ALLOCATED.store(0, Ordering::Relaxed);

    let mut garbage = {
        let mut active = ACTIVE.lock();
        {
            let roots = ROOTS.lock();
            // SAFETY: lists are stable under the held mutexes.
            unsafe { mark(roots.head) };
        }

        // Partition the active list: marked blocks stay, the rest is
        // garbage. Marks are consumed here, so they are always clear
        // outside a collection.
        let mut live: *mut Block = ptr::null_mut();
        let mut garbage: *mut Block = ptr::null_mut();
        while !active.head.is_null() {
            // SAFETY: active blocks are live; the list is non-empty here.
            unsafe {
                let block = block::pop(&mut active.head);
                if (*block).marked.swap(false, Ordering::Relaxed) {
                    block::push(block, &mut live);
                } else {
                    block::push(block, &mut garbage);
                }
            }
        }
        active.head = live;
        garbage
    };

    // The list mutexes are released: destructors below may allocate, drop
    // handles, or re-enter gc (which no-ops on the busy flag).
    let mut freed = 0;
    while !garbage.is_null() {
        // SAFETY: garbage blocks are unreachable by any handle list.
        unsafe {
            let block = block::pop(&mut garbage);
            freed += reclaim(block);
        }
    }
    debug!(bytes = freed, "collection finished");

    flags.busy.set(false);
    freed
}

// ── Public interface ──────────────────────────────────────────────────

/// Force a collection. Returns the number of bytes freed.
pub fn collect() -> usize {
    gc(true)
}

/// Read or replace the allocation threshold that arms opportunistic
/// collection. A zero argument only reads. Returns the previous value.
pub fn collect_threshold(new_threshold: usize) -> usize {
    let _gc = GC_LOCK.lock();
    let old = THRESHOLD.load(Ordering::Relaxed);
    if new_threshold != 0 {
        THRESHOLD.store(new_threshold, Ordering::Relaxed);
    }
    old
}

/// Payload bytes currently held by blocks on the active list.
pub fn live_bytes() -> usize {
    let active = ACTIVE.lock();
    let mut total = 0;
    let mut cur = active.head;
    while !cur.is_null() {
        // SAFETY: the active list is stable under its mutex.
        unsafe {
            total += (*cur).objsize;
            cur = (*cur).next.load(Ordering::Relaxed);
        }
    }
    total
}

// ── Tests ─────────────────────────────────────────────────────────────
