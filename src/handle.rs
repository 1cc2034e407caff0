//! The garbage-collected smart pointer.
//!
//! [`Handle<T>`] is a two-word pointer-like value: `pval`, the raw pointer it
//! dereferences to, and a pointer to its *anchor*, the heap node that carries
//! the collector-visible state (the attached block and the intrusive list
//! links). Handle values move freely; anchors never move, so the global
//! roots list and the per-block member lists stay valid.
//!
//! Every new handle starts life on the roots list. When an allocation
//! finishes constructing its payload, handles that physically ended up
//! inside the payload are adopted onto the block's member list (see
//! [`Trace`]); member anchors are reclaimed wholesale with their
//! block. Assignment (`clone_from`, [`Handle::set_ptr`]) copies the pointer
//! state only and never moves a handle between lists.

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::mem::needs_drop;
use std::ops::{Add, AddAssign, Deref, DerefMut, Index, IndexMut, Sub, SubAssign};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use tracing::warn;

use crate::block::{Block, DestroyFn};
use crate::collect;
use crate::error::{AllocError, PtrError};
use crate::trace::{HandleVisitor, Trace};

/// Zeroing policy for the no-argument allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitSpec {
    /// Leave the payload as the raw allocator returned it.
    #[default]
    Undefined,
    /// Zero the payload before element construction.
    Zero,
}

// ── Anchors ───────────────────────────────────────────────────────────

/// List node carrying a handle's collector-visible state.
///
/// `prev == self` is the member sentinel: the anchor sits on some block's
/// member list and is reclaimed together with that block. Otherwise the
/// anchor is on the global roots list, with ordinary prev/next wiring.
pub(crate) struct Anchor {
    /// Attached block, null when detached. Read by the mark phase.
    pub(crate) mem: AtomicPtr<Block>,
    pub(crate) prev: AtomicPtr<Anchor>,
    pub(crate) next: AtomicPtr<Anchor>,
}

impl Anchor {
    fn boxed(mem: *mut Block) -> NonNull<Anchor> {
        let anchor = Box::new(Anchor {
            mem: AtomicPtr::new(mem),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        });
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(anchor)) }
    }

    pub(crate) fn is_member(&self) -> bool {
        ptr::eq(self.prev.load(Ordering::Relaxed), self)
    }
}

// ── Untyped core ──────────────────────────────────────────────────────

/// Untyped half of a handle: anchor pointer plus raw pointer value.
pub(crate) struct RawHandle {
    pub(crate) anchor: NonNull<Anchor>,
    pub(crate) pval: *mut u8,
}

impl RawHandle {
    /// The link step: every new handle gets a fresh anchor on the roots
    /// list, whatever its pointer state.
    fn link(mem: *mut Block, pval: *mut u8) -> Self {
        let anchor = Anchor::boxed(mem);
        collect::link_root(anchor);
        Self { anchor, pval }
    }

    #[inline]
    fn mem(&self) -> *mut Block {
        // SAFETY: the anchor lives until this handle drops.
        unsafe { self.anchor.as_ref() }.mem.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_mem(&self, mem: *mut Block) {
        // SAFETY: the anchor lives until this handle drops.
        unsafe { self.anchor.as_ref() }.mem.store(mem, Ordering::Relaxed);
    }

    /// Dereference precondition for `addr`: non-null, and inside the
    /// attached block's payload when attached.
    fn check(&self, addr: *const u8) -> Result<(), PtrError> {
        if addr.is_null() {
            return Err(PtrError::NULL);
        }
        let mem = self.mem();
        if !mem.is_null() {
            // SAFETY: an attached block is kept alive by this anchor.
            if !unsafe { &*mem }.contains(addr) {
                return Err(PtrError::OUT_OF_BOUNDS);
            }
        }
        Ok(())
    }

    /// Allocate a block and enter construction: the block goes onto the
    /// calling thread's construction stack and this handle attaches to it.
    fn alloc_begin(
        &mut self,
        nelems: usize,
        elem_size: usize,
        elem_align: usize,
        destroy: Option<DestroyFn>,
        zero: bool,
    ) -> Result<*mut u8, AllocError> {
        collect::gc(false);

        let objsize = nelems
            .checked_mul(elem_size)
            .ok_or_else(|| AllocError::new(usize::MAX))?;
        let payload_offset = Block::payload_offset_for(elem_align);
        let align = Block::buffer_align(elem_align);
        let total = payload_offset
            .checked_add(objsize)
            .ok_or_else(|| AllocError::new(usize::MAX))?;
        let layout = Layout::from_size_align(total, align).map_err(|_| AllocError::new(total))?;

        // SAFETY: the layout has nonzero size; the header precedes the payload.
        let base = unsafe { std::alloc::alloc(layout) }.cast::<Block>();
        if base.is_null() {
            self.set_mem(ptr::null_mut());
            return Err(AllocError::new(total));
        }
        // SAFETY: freshly allocated and aligned for Block.
        unsafe {
            base.write(Block {
                destroy,
                members: AtomicPtr::new(ptr::null_mut()),
                next: AtomicPtr::new(ptr::null_mut()),
                nelems,
                objsize,
                payload_offset,
                align,
                active: AtomicBool::new(false),
                marked: AtomicBool::new(false),
            });
        }
        // SAFETY: header was just written.
        let payload = unsafe { (*base).payload() };
        if zero {
            // SAFETY: the payload spans objsize bytes of the fresh buffer.
            unsafe { ptr::write_bytes(payload, 0, objsize) };
        }
        collect::push_construction(base);
        self.set_mem(base);
        self.pval = payload;
        Ok(payload)
    }

    /// Leave construction. `nconstructed` is the number of elements whose
    /// constructors completed; a short count tears the block down again.
    /// Finishing the outermost allocation promotes (or, on failure,
    /// discards) every block queued by this thread.
    fn alloc_end(&mut self, nconstructed: usize) {
        let block = collect::pop_construction();
        debug_assert_eq!(block, self.mem());

        // SAFETY: the block came off this thread's construction stack and
        // is not yet visible to any other thread.
        let failed = nconstructed < unsafe { (*block).nelems };
        if failed {
            unsafe {
                (*block).nelems = nconstructed;
                collect::reclaim(block);
            }
            self.set_mem(ptr::null_mut());
        } else {
            // SAFETY: as above.
            collect::note_allocated(unsafe { (*block).objsize });
            collect::queue_new_block(block);
        }

        if collect::in_construction() {
            return;
        }
        if failed {
            collect::discard_new_blocks();
        } else {
            collect::promote_new_blocks();
        }
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        // Member anchors die with their block; unlinking them here would
        // need the owning block's lock for no benefit.
        // SAFETY: the anchor is live until this drop completes.
        if unsafe { self.anchor.as_ref() }.is_member() {
            return;
        }
        collect::unlink_root(self.anchor);
        // SAFETY: root anchors are owned by their handle.
        unsafe { drop(Box::from_raw(self.anchor.as_ptr())) };
    }
}

/// Runs element destructors over a payload. Panics are swallowed so that
/// every element is destroyed exactly once and no partial sweep remains.
unsafe fn drop_payload<T>(payload: *mut u8, nelems: usize) {
    let mut elem = payload.cast::<T>();
    for _ in 0..nelems {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: the caller passes the count of constructed elements.
            unsafe { ptr::drop_in_place(elem) };
        }));
        if outcome.is_err() {
            warn!("element destructor panicked during reclamation");
        }
        elem = elem.wrapping_add(1);
    }
}

// ── Typed handle ──────────────────────────────────────────────────────

/// Garbage-collected smart pointer to one `T` or an array of `T`.
///
/// Dereference, indexing and the `try_` accessors are checked: they require
/// a non-null pointer value and, when the handle is attached, a pointer
/// inside the attached payload. Pointer arithmetic and [`Handle::as_ptr`]
/// are deliberately unchecked, so iteration can hold one-past-the-end
/// values; only dereference validates.
pub struct Handle<T> {
    raw: RawHandle,
    _marker: PhantomData<*mut T>,
}

impl<T> Handle<T> {
    /// Unattached null handle.
    pub fn new() -> Self {
        Self {
            raw: RawHandle::link(ptr::null_mut(), ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Unattached handle over a raw pointer, e.g. to an object still under
    /// construction; attach it explicitly afterwards.
    pub fn from_ptr(p: *mut T) -> Self {
        Self {
            raw: RawHandle::link(ptr::null_mut(), p.cast()),
            _marker: PhantomData,
        }
    }

    /// Explicit cross-type handle: same attachment, reinterpreted pointee.
    pub fn cast<U>(&self) -> Handle<U> {
        Handle {
            raw: RawHandle::link(self.raw.mem(), self.raw.pval),
            _marker: PhantomData,
        }
    }

    /// Handle to `inner`, sharing this handle's attachment.
    pub fn alias<U>(&self, inner: *mut U) -> Handle<U> {
        Handle {
            raw: RawHandle::link(self.raw.mem(), inner.cast()),
            _marker: PhantomData,
        }
    }

    /// Member-pointer construction: checked dereference of this handle,
    /// then a handle to the addressed member sharing this attachment.
    pub fn project<U>(&self, member: impl FnOnce(*mut T) -> *mut U) -> Result<Handle<U>, PtrError> {
        self.raw.check(self.raw.pval)?;
        Ok(self.alias(member(self.as_ptr())))
    }

    /// Raw pointer value, no checks.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.raw.pval.cast()
    }

    /// Assignment from a raw pointer: replaces the pointer value only.
    #[inline]
    pub fn set_ptr(&mut self, p: *mut T) {
        self.raw.pval = p.cast();
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.raw.pval.is_null()
    }

    /// Adopt another handle's attachment. True iff now attached.
    pub fn attach_to<U>(&mut self, other: &Handle<U>) -> bool {
        self.raw.set_mem(other.raw.mem());
        self.is_attached()
    }

    /// Adopt the innermost block under construction on this thread, if
    /// any, as the attachment. True iff now attached.
    pub fn attach_top(&mut self) -> bool {
        self.raw.set_mem(collect::construction_top());
        self.is_attached()
    }

    /// Drop the attachment. The handle no longer keeps any block alive;
    /// the pointer value is untouched.
    pub fn detach(&mut self) {
        self.raw.set_mem(ptr::null_mut());
    }

    pub fn is_attached(&self) -> bool {
        !self.raw.mem().is_null()
    }

    // ── Checked access ────────────────────────────────────────────────

    pub fn try_ref(&self) -> Result<&T, PtrError> {
        self.raw.check(self.raw.pval)?;
        // SAFETY: non-null and, when attached, inside the live payload.
        Ok(unsafe { &*self.as_ptr() })
    }

    pub fn try_mut(&mut self) -> Result<&mut T, PtrError> {
        self.raw.check(self.raw.pval)?;
        // SAFETY: as in try_ref.
        Ok(unsafe { &mut *self.as_ptr() })
    }

    pub fn try_index(&self, index: usize) -> Result<&T, PtrError> {
        if self.raw.pval.is_null() {
            return Err(PtrError::NULL);
        }
        let elem = self.as_ptr().wrapping_add(index);
        self.raw.check(elem.cast())?;
        // SAFETY: as in try_ref, for the indexed element.
        Ok(unsafe { &*elem })
    }

    pub fn try_index_mut(&mut self, index: usize) -> Result<&mut T, PtrError> {
        if self.raw.pval.is_null() {
            return Err(PtrError::NULL);
        }
        let elem = self.as_ptr().wrapping_add(index);
        self.raw.check(elem.cast())?;
        // SAFETY: as in try_ref, for the indexed element.
        Ok(unsafe { &mut *elem })
    }

    // ── Pointer arithmetic (unchecked) ────────────────────────────────

    /// Step to the next element.
    #[inline]
    pub fn inc(&mut self) {
        self.raw.pval = self.as_ptr().wrapping_add(1).cast();
    }

    /// Step to the previous element.
    #[inline]
    pub fn dec(&mut self) {
        self.raw.pval = self.as_ptr().wrapping_sub(1).cast();
    }

    /// Handle `n` elements away, sharing this handle's attachment.
    #[inline]
    pub fn offset(&self, n: isize) -> Handle<T> {
        self.alias(self.as_ptr().wrapping_offset(n))
    }

    pub(crate) fn anchor(&self) -> NonNull<Anchor> {
        self.raw.anchor
    }

    #[cfg(test)]
    pub(crate) fn is_root(&self) -> bool {
        // SAFETY: the anchor lives until this handle drops.
        !unsafe { self.raw.anchor.as_ref() }.is_member()
    }
}

// ── Allocation ────────────────────────────────────────────────────────

impl<T: Trace> Handle<T> {
    const DESTROY: Option<DestroyFn> = if needs_drop::<T>() {
        Some(drop_payload::<T>)
    } else {
        None
    };

    fn alloc_impl(
        &mut self,
        nelems: usize,
        zero: bool,
        mut ctor: impl FnMut(usize, *mut T) -> T,
    ) -> Result<(), AllocError> {
        let payload = self
            .raw
            .alloc_begin(nelems, size_of::<T>(), align_of::<T>(), Self::DESTROY, zero)?
            .cast::<T>();

        let mut constructed = 0;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            while constructed < nelems {
                let value = ctor(constructed, payload.wrapping_add(constructed));
                // SAFETY: in-bounds slot of the fresh payload.
                unsafe { payload.add(constructed).write(value) };
                constructed += 1;
            }
        }));

        if outcome.is_ok() {
            // Handles that ended up inside the payload become members of
            // the block while it is still invisible to the collector.
            let mut visitor = HandleVisitor::new(self.raw.mem());
            for i in 0..nelems {
                // SAFETY: element i was fully constructed above.
                unsafe { (*payload.add(i)).trace(&mut visitor) };
            }
        }

        self.raw.alloc_end(constructed);
        if let Err(payload_panic) = outcome {
            panic::resume_unwind(payload_panic);
        }
        Ok(())
    }

    /// Allocate a single `T` from a value; the handle attaches to it.
    pub fn alloc(&mut self, value: T) -> Result<(), AllocError> {
        let mut value = Some(value);
        self.alloc_impl(1, false, |_, _| {
            value.take().expect("single constructor runs once")
        })
    }

    /// Allocate a single `T` built by `ctor`, which runs with the new block
    /// on the construction stack and receives the element's final (still
    /// uninitialized) address, so a constructor can hand out handles to the
    /// object being built.
    pub fn alloc_with(&mut self, ctor: impl FnOnce(*mut T) -> T) -> Result<(), AllocError> {
        let mut ctor = Some(ctor);
        self.alloc_impl(1, false, |_, this| {
            (ctor.take().expect("single constructor runs once"))(this)
        })
    }

    /// Allocate a single default-constructed `T`, zeroing the payload
    /// first when `init` is [`InitSpec::Zero`].
    pub fn alloc_init(&mut self, init: InitSpec) -> Result<(), AllocError>
    where
        T: Default,
    {
        self.alloc_impl(1, init == InitSpec::Zero, |_, _| T::default())
    }

    /// Allocate an array of `nelems` default-constructed elements.
    pub fn alloc_array(&mut self, nelems: usize, init: InitSpec) -> Result<(), AllocError>
    where
        T: Default,
    {
        self.alloc_impl(nelems, init == InitSpec::Zero, |_, _| T::default())
    }

    /// Allocate an array of `nelems` elements, each built by
    /// `ctor(index, element_address)` in index order. A panicking
    /// constructor destroys the already-built prefix, frees the block, and
    /// resumes the panic with the handle left detached.
    pub fn alloc_array_with(
        &mut self,
        nelems: usize,
        ctor: impl FnMut(usize, *mut T) -> T,
    ) -> Result<(), AllocError> {
        self.alloc_impl(nelems, false, ctor)
    }
}

// ── Pointer-like trait impls ──────────────────────────────────────────

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.try_ref() {
            Ok(r) => r,
            Err(e) => panic!("{e}"),
        }
    }
}

impl<T> DerefMut for Handle<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.try_mut() {
            Ok(r) => r,
            Err(e) => panic!("{e}"),
        }
    }
}

impl<T> Index<usize> for Handle<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.try_index(index) {
            Ok(r) => r,
            Err(e) => panic!("{e}"),
        }
    }
}

impl<T> IndexMut<usize> for Handle<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        match self.try_index_mut(index) {
            Ok(r) => r,
            Err(e) => panic!("{e}"),
        }
    }
}

impl<T> Add<isize> for &Handle<T> {
    type Output = Handle<T>;

    fn add(self, n: isize) -> Handle<T> {
        self.offset(n)
    }
}

impl<T> Sub<isize> for &Handle<T> {
    type Output = Handle<T>;

    fn sub(self, n: isize) -> Handle<T> {
        self.offset(-n)
    }
}

impl<T> Sub<&Handle<T>> for &Handle<T> {
    type Output = isize;

    /// Signed element-index difference between two pointer values.
    fn sub(self, rhs: &Handle<T>) -> isize {
        let elem = size_of::<T>().max(1) as isize;
        (self.as_ptr() as isize - rhs.as_ptr() as isize) / elem
    }
}

impl<T> AddAssign<isize> for Handle<T> {
    fn add_assign(&mut self, n: isize) {
        self.raw.pval = self.as_ptr().wrapping_offset(n).cast();
    }
}

impl<T> SubAssign<isize> for Handle<T> {
    fn sub_assign(&mut self, n: isize) {
        self.raw.pval = self.as_ptr().wrapping_offset(-n).cast();
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.as_ptr(), other.as_ptr())
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some((self.as_ptr() as usize).cmp(&(other.as_ptr() as usize)))
    }
}

impl<T> Clone for Handle<T> {
    /// The link step runs for the copy: it gets its own root anchor with
    /// the source's `(mem, pval)`. Classification depends on where the
    /// copy ends up, not on the source.
    fn clone(&self) -> Self {
        Handle {
            raw: RawHandle::link(self.raw.mem(), self.raw.pval),
            _marker: PhantomData,
        }
    }

    /// Assignment semantics: copies `(mem, pval)` in place and never
    /// relinks, so the handle stays in the list it was born on.
    fn clone_from(&mut self, source: &Self) {
        self.raw.set_mem(source.raw.mem());
        self.raw.pval = source.raw.pval;
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("ptr", &self.raw.pval)
            .field("attached", &self.is_attached())
            .finish()
    }
}

// SAFETY: the pointer state is owned per-handle; all shared bookkeeping
// (anchors, global lists) is synchronized inside the collector.
unsafe impl<T: Send + Sync> Send for Handle<T> {}
// SAFETY: shared references only permit reads of T and relinking clones.
unsafe impl<T: Sync> Sync for Handle<T> {}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn new_handle_is_null_and_unattached() {
        let h: Handle<u32> = Handle::new();
        assert!(h.is_null());
        assert!(!h.is_attached());
        assert_eq!(h.try_ref().unwrap_err(), PtrError::NULL);
    }

    #[test]
    fn from_ptr_keeps_value_unattached() {
        let mut n = 7u32;
        let h = Handle::from_ptr(&raw mut n);
        assert!(!h.is_attached());
        assert_eq!(*h.try_ref().unwrap(), 7);
    }

    #[test]
    fn alloc_single_and_deref() {
        let _guard = testutil::exclusive();
        let mut h: Handle<u64> = Handle::new();
        h.alloc(41).unwrap();
        assert!(h.is_attached());
        *h.try_mut().unwrap() += 1;
        assert_eq!(*h, 42);
    }

    #[test]
    fn alloc_array_zeroed_reads_back() {
        let _guard = testutil::exclusive();
        let mut h: Handle<i32> = Handle::new();
        h.alloc_array(4, InitSpec::Zero).unwrap();
        for i in 0..4 {
            assert_eq!(h[i], 0);
        }
        for i in 0..4 {
            h[i] = (i + 1) as i32;
        }
        assert_eq!((h[0], h[1], h[2], h[3]), (1, 2, 3, 4));
    }

    #[test]
    fn attached_out_of_bounds_is_caught() {
        let _guard = testutil::exclusive();
        let mut h: Handle<i32> = Handle::new();
        h.alloc_array(2, InitSpec::Zero).unwrap();
        assert_eq!(h.try_index(2).unwrap_err(), PtrError::OUT_OF_BOUNDS);
        let past = h.offset(2);
        assert_eq!(past.try_ref().unwrap_err(), PtrError::OUT_OF_BOUNDS);
        let back = &past - 2;
        assert_eq!(*back.try_ref().unwrap(), 0);
    }

    #[test]
    #[should_panic(expected = "dereference of null handle")]
    fn deref_null_panics() {
        let h: Handle<u8> = Handle::new();
        let _ = *h;
    }

    #[test]
    fn arithmetic_and_ordering() {
        let _guard = testutil::exclusive();
        let mut h: Handle<u16> = Handle::new();
        h.alloc_array(8, InitSpec::Zero).unwrap();
        let mut iter = h.clone();
        iter += 3;
        assert_eq!(&iter - &h, 3);
        assert_eq!(&h - &iter, -3);
        assert!(h < iter);
        iter.dec();
        assert_eq!(&iter - &h, 2);
        iter.inc();
        iter -= 1;
        assert_eq!(&iter - &h, 2);
        let end = &h + 8;
        assert!(iter < end);
        assert_eq!(&end - &h, 8);
    }

    #[test]
    fn aliases_share_attachment() {
        let _guard = testutil::exclusive();
        let mut h: Handle<u32> = Handle::new();
        h.alloc_array(3, InitSpec::Zero).unwrap();
        let alias = h.offset(1);
        assert!(alias.is_attached());
        let cast: Handle<[u8; 4]> = h.cast();
        assert!(cast.is_attached());
        assert_eq!(cast.as_ptr().cast::<u32>(), h.as_ptr());
    }

    #[test]
    fn project_checks_the_source() {
        let _guard = testutil::exclusive();
        let mut h: Handle<(u32, u8)> = Handle::new();
        h.alloc((9, 3)).unwrap();
        let second = h.project(|p| unsafe { &raw mut (*p).1 }).unwrap();
        assert_eq!(*second.try_ref().unwrap(), 3);
        assert!(second.is_attached());

        let null: Handle<(u32, u8)> = Handle::new();
        assert_eq!(
            null.project(|p| unsafe { &raw mut (*p).1 }).unwrap_err(),
            PtrError::NULL
        );
    }

    #[test]
    fn assignment_copies_pointer_state_only() {
        let _guard = testutil::exclusive();
        let mut a: Handle<u32> = Handle::new();
        a.alloc(5).unwrap();
        let mut b: Handle<u32> = Handle::new();
        assert!(b.is_root());
        b.clone_from(&a);
        assert!(b.is_root());
        assert!(b.is_attached());
        assert_eq!(*b, 5);
        b.set_ptr(ptr::null_mut());
        assert!(b.is_attached());
        assert!(b.is_root());
    }

    #[test]
    fn attach_detach_round_trip() {
        let _guard = testutil::exclusive();
        let mut a: Handle<u8> = Handle::new();
        a.alloc(1).unwrap();
        let mut b: Handle<u8> = Handle::new();
        assert!(!b.attach_top()); // no construction in progress here
        assert!(b.attach_to(&a));
        assert!(b.is_attached());
        b.detach();
        assert!(!b.is_attached());
        let mut detached = a.clone();
        detached.detach();
        assert!(!b.attach_to(&detached));
    }

    #[test]
    fn attach_top_inside_constructor() {
        let _guard = testutil::exclusive();
        struct SelfRef {
            me: Handle<SelfRef>,
        }
        impl Trace for SelfRef {
            fn trace(&self, visitor: &mut HandleVisitor) {
                self.me.trace(visitor);
            }
        }
        let mut h: Handle<SelfRef> = Handle::new();
        h.alloc_with(|this| {
            let mut me = Handle::from_ptr(this);
            assert!(me.attach_top());
            SelfRef { me }
        })
        .unwrap();
        assert!(h.try_ref().unwrap().me.is_attached());
        assert_eq!(h.try_ref().unwrap().me.as_ptr(), h.as_ptr());
        // The embedded self-handle was adopted as a member.
        assert!(!h.try_ref().unwrap().me.is_root());
        assert!(h.is_root());
    }

    #[test]
    fn oversized_request_reports_alloc_error() {
        let _guard = testutil::exclusive();
        let mut h: Handle<u64> = Handle::new();
        let err = h.alloc_array(usize::MAX, InitSpec::Undefined).unwrap_err();
        assert_eq!(err.size(), usize::MAX);
        assert!(!h.is_attached());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// h + k - k dereferences to the same element as h.
            #[test]
            fn arithmetic_round_trips(len in 1usize..32, step in 0usize..32) {
                let _guard = testutil::exclusive();
                let mut h: Handle<u32> = Handle::new();
                h.alloc_array_with(len, |i, _| i as u32).unwrap();
                let k = (step % len) as isize;
                let there = &h + k;
                let back = &there - k;
                prop_assert_eq!(*back.try_ref().unwrap(), *h.try_ref().unwrap());
                prop_assert_eq!(&back - &h, 0);
            }

            /// Root classification survives any interleaving of assignments
            /// and attachment changes.
            #[test]
            fn classification_is_stable(ops in proptest::collection::vec(0u8..4, 0..16)) {
                let _guard = testutil::exclusive();
                let mut src: Handle<u32> = Handle::new();
                src.alloc(11).unwrap();
                let mut h: Handle<u32> = Handle::new();
                for op in ops {
                    match op {
                        0 => h.clone_from(&src),
                        1 => { h.detach(); }
                        2 => { h.attach_to(&src); }
                        _ => h.set_ptr(src.as_ptr()),
                    }
                    prop_assert!(h.is_root());
                }
            }
        }
    }
}
