use std::{fmt, mem::ManuallyDrop, ptr::addr_of, vec};

use crate::{
    arena::{Arena, LocalRef, ObjectData},
    limits::{LimitError, LimitTracker},
};

/// A runtime context that can release handles it previously produced.
///
/// This is the seam between the scoped guards and the facility that owns the
/// referenced objects: a handle type, and an operation to release such a
/// handle given the context. [`Arena`] implements it; embedding hosts that
/// wrap an arena in a larger environment can implement it for that
/// environment instead.
pub trait ReleaseContext {
    /// Opaque handle to an object owned by this context.
    type Handle: Copy + Eq + fmt::Debug;

    /// Releases one reference to the given handle.
    ///
    /// Infallible from the caller's perspective; failures are the context's
    /// concern.
    fn release_handle(&mut self, handle: Self::Handle);
}

impl<T: LimitTracker> ReleaseContext for Arena<T> {
    type Handle = LocalRef;

    #[inline]
    fn release_handle(&mut self, handle: LocalRef) {
        self.release(handle);
    }
}

/// A scoped reference: releases its handle through the owning context when
/// it goes out of scope.
///
/// The guard holds at most one live handle and guarantees that handle is
/// released exactly once, whether the scope exits normally, via `?`, or any
/// other branch. Ownership can be transferred out with [`take`](Self::take)
/// (disarming the automatic release), and the held handle can be swapped
/// with [`reset`](Self::reset) (releasing the previous one first, unless the
/// new handle is identical).
///
/// The guard is move-only: assigning it transfers the single owner, so two
/// guards can never release the same handle. Duplicating the underlying
/// object requires an explicit [`Arena::dup_ref`], which takes its own
/// reference:
///
/// ```compile_fail
/// use localref::{Arena, NoLimitTracker, ObjectData, ScopedRef};
///
/// let mut arena = Arena::new(4, NoLimitTracker);
/// let handle = arena.alloc(ObjectData::Str("x".to_owned())).unwrap();
/// let guard = ScopedRef::new(&mut arena, handle);
/// let moved = guard; // moves: there is no Clone impl
/// guard.get(); // error: `guard` no longer owns anything
/// ```
pub struct ScopedRef<'a, C: ReleaseContext> {
    ctx: &'a mut C,
    handle: Option<C::Handle>,
}

impl<'a, C: ReleaseContext> ScopedRef<'a, C> {
    /// Creates a guard owning the given handle.
    ///
    /// The context must be the one that produced (or will be used to release)
    /// the handle. No side effects beyond storage.
    #[inline]
    pub fn new(ctx: &'a mut C, handle: C::Handle) -> Self {
        Self {
            ctx,
            handle: Some(handle),
        }
    }

    /// Creates an empty guard; dropping it releases nothing.
    #[inline]
    pub fn empty(ctx: &'a mut C) -> Self {
        Self { ctx, handle: None }
    }

    /// Replaces the held handle, releasing the previous one first.
    ///
    /// If `new` is identical to the currently held handle (including both
    /// being empty), nothing is released and nothing changes; the guard never
    /// double-releases a handle it still holds.
    pub fn reset(&mut self, new: Option<C::Handle>) {
        if new == self.handle {
            return;
        }
        if let Some(old) = self.handle.take() {
            self.ctx.release_handle(old);
        }
        self.handle = new;
    }

    /// Transfers ownership of the held handle to the caller.
    ///
    /// Clears internal storage without releasing, so a subsequent drop (or
    /// [`reset`](Self::reset)) performs no release for this handle. Returns
    /// `None` if the guard was already empty. No context call is made.
    #[inline]
    pub fn take(&mut self) -> Option<C::Handle> {
        self.handle.take()
    }

    /// Returns the held handle without transferring ownership.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<C::Handle> {
        self.handle
    }

    /// Returns `true` if the guard currently holds no handle.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handle.is_none()
    }

    /// Borrows the context for further work while the guard is armed.
    #[inline]
    pub fn ctx(&mut self) -> &mut C {
        self.ctx
    }

    /// Consumes the guard, returning the held handle and the context borrow
    /// without releasing anything.
    ///
    /// Use this when the handle should survive the guard's scope and the
    /// caller also needs the context back (e.g. to store the handle in a
    /// longer-lived structure).
    #[must_use]
    pub fn into_parts(self) -> (Option<C::Handle>, &'a mut C) {
        let mut this = ManuallyDrop::new(self);
        let handle = this.handle.take();
        // SAFETY: `ManuallyDrop::new(self)` prevents `Drop` on self, so the
        // context borrow can be moved out
        let ctx = unsafe { addr_of!(this.ctx).read() };
        (handle, ctx)
    }
}

impl<C: ReleaseContext> Drop for ScopedRef<'_, C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.ctx.release_handle(handle);
        }
    }
}

impl<C: ReleaseContext> fmt::Debug for ScopedRef<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedRef").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl<T: LimitTracker> Arena<T> {
    /// Allocates an object and immediately wraps the new handle in a
    /// [`ScopedRef`], so it is released when the guard goes out of scope.
    pub fn scoped(&mut self, data: ObjectData) -> Result<ScopedRef<'_, Self>, LimitError> {
        let handle = self.alloc(data)?;
        Ok(ScopedRef::new(self, handle))
    }
}

/// Trait for values that require context access for proper cleanup.
///
/// Rust's standard `Drop` trait cannot release handles because it has no
/// access to the owning context. This trait provides an explicit
/// release-with-context method so handles (and containers of them) can be
/// released when they are no longer needed.
///
/// **All values implementing this trait must be cleaned up on every code
/// path**, not just the happy path. A missed call on any branch leaks a
/// reference. Prefer [`defer_release!`] or [`ReleaseGuard`] to guarantee
/// cleanup automatically rather than inserting manual calls in every branch.
pub trait ReleaseWith<C> {
    /// Consume `self` and release any handles contained within.
    fn release_with(self, ctx: &mut C);
}

impl<T: LimitTracker> ReleaseWith<Arena<T>> for LocalRef {
    #[inline]
    fn release_with(self, ctx: &mut Arena<T>) {
        ctx.release(self);
    }
}

impl<C, U: ReleaseWith<C>> ReleaseWith<C> for Option<U> {
    #[inline]
    fn release_with(self, ctx: &mut C) {
        if let Some(value) = self {
            value.release_with(ctx);
        }
    }
}

impl<C, U: ReleaseWith<C>> ReleaseWith<C> for Vec<U> {
    fn release_with(self, ctx: &mut C) {
        for value in self {
            value.release_with(ctx);
        }
    }
}

impl<C, U: ReleaseWith<C>> ReleaseWith<C> for vec::IntoIter<U> {
    fn release_with(self, ctx: &mut C) {
        for value in self {
            value.release_with(ctx);
        }
    }
}

impl<C, U: ReleaseWith<C>, V: ReleaseWith<C>> ReleaseWith<C> for (U, V) {
    fn release_with(self, ctx: &mut C) {
        let (first, second) = self;
        first.release_with(ctx);
        second.release_with(ctx);
    }
}

/// RAII guard that ensures a [`ReleaseWith`] value is cleaned up on every
/// code path.
///
/// The guard's `Drop` impl calls [`ReleaseWith::release_with`] automatically,
/// so cleanup happens whether the scope exits normally, via `?`, `continue`,
/// early return, or any other branch.
///
/// On the normal path, the guarded value can be borrowed via
/// [`as_parts`](Self::as_parts) / [`as_parts_mut`](Self::as_parts_mut), or
/// reclaimed via [`into_inner`](Self::into_inner) /
/// [`into_parts`](Self::into_parts) (which consume the guard without
/// releasing the value).
///
/// Prefer the [`defer_release!`] macro for the common case where you just
/// need to ensure a value is released at scope exit. Use `ReleaseGuard`
/// directly when you need to conditionally reclaim the value (e.g. hand it
/// to a successfully allocated container) or need mutable access to both the
/// value and the context.
pub struct ReleaseGuard<'a, C, V: ReleaseWith<C>> {
    // manually dropped because it needs to be dropped by move.
    value: ManuallyDrop<V>,
    ctx: &'a mut C,
}

impl<'a, C, V: ReleaseWith<C>> ReleaseGuard<'a, C, V> {
    /// Creates a new `ReleaseGuard` for the given value and context.
    #[inline]
    pub fn new(value: V, ctx: &'a mut C) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            ctx,
        }
    }

    /// Consumes the guard and returns the contained value without releasing it.
    ///
    /// Use this when the value should survive beyond the guard's scope (e.g.
    /// returning a computed result from a function that used the guard for
    /// error-path safety).
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> V {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `ManuallyDrop::new(self)` prevents `Drop` on self, so we can take the value out
        unsafe { ManuallyDrop::take(&mut this.value) }
    }

    /// Borrows the value (immutably) and context (mutably) out of the guard.
    ///
    /// This is what [`defer_release!`] calls internally. The returned
    /// references are tied to the guard's lifetime, so the value cannot
    /// escape.
    #[inline]
    pub fn as_parts(&mut self) -> (&V, &mut C) {
        (&self.value, self.ctx)
    }

    /// Borrows the value (mutably) and context (mutably) out of the guard.
    ///
    /// This is what [`defer_release_mut!`] calls internally. Use this when
    /// the value needs to be mutated in place.
    #[inline]
    pub fn as_parts_mut(&mut self) -> (&mut V, &mut C) {
        (&mut self.value, self.ctx)
    }

    /// Consumes the guard and returns the value and context separately,
    /// without releasing.
    ///
    /// Use this when you need to reclaim both the value *and* the context
    /// borrow, for example to store the value through the context owner.
    #[inline]
    pub fn into_parts(self) -> (V, &'a mut C) {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `ManuallyDrop` prevents `Drop` on self, so we can recover the parts
        unsafe { (ManuallyDrop::take(&mut this.value), addr_of!(this.ctx).read()) }
    }

    /// Borrows just the context out of the guard.
    #[inline]
    pub fn ctx(&mut self) -> &mut C {
        self.ctx
    }
}

impl<C, V: ReleaseWith<C>> Drop for ReleaseGuard<'_, C, V> {
    fn drop(&mut self) {
        // SAFETY: value is never manually dropped until this point
        unsafe { ManuallyDrop::take(&mut self.value) }.release_with(self.ctx);
    }
}

/// The preferred way to ensure a [`ReleaseWith`] value is cleaned up on every
/// code path.
///
/// Creates a [`ReleaseGuard`] and immediately rebinds `$value` as `&V` and
/// `$ctx` as `&mut C` via [`ReleaseGuard::as_parts`]. The original owned
/// value is moved into the guard, which will call
/// [`ReleaseWith::release_with`] when scope exits, whether that's normal
/// completion, early return via `?`, `continue`, or any other branch.
///
/// # Limitation
///
/// The macro rebinds `$ctx` as a new `let` binding, so it cannot be used when
/// `$ctx` is `self`. In `&mut self` methods, first assign `let this = self;`
/// and pass `this`.
#[macro_export]
macro_rules! defer_release {
    ($value:ident, $ctx:ident) => {
        let mut _guard = $crate::ReleaseGuard::new($value, $ctx);
        #[allow(
            clippy::allow_attributes,
            reason = "the reborrowed parts may not both be used in every case, so allow unused vars to avoid warnings"
        )]
        #[allow(unused_variables)]
        let ($value, $ctx) = _guard.as_parts();
    };
}

/// Like [`defer_release!`], but rebinds `$value` as `&mut V` via
/// [`ReleaseGuard::as_parts_mut`].
///
/// Use this when the value needs to be mutated in place, for example
/// draining handles out of a collection as they are consumed.
#[macro_export]
macro_rules! defer_release_mut {
    ($value:ident, $ctx:ident) => {
        let mut _guard = $crate::ReleaseGuard::new($value, $ctx);
        #[allow(
            clippy::allow_attributes,
            reason = "the reborrowed parts may not both be used in every case, so allow unused vars to avoid warnings"
        )]
        #[allow(unused_variables)]
        let ($value, $ctx) = _guard.as_parts_mut();
    };
}
