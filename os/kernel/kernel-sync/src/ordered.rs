//! # Statically ordered locks
//!
//! A lock hierarchy is a total order over *levels*. Each [`OrderedLock`] is
//! tagged with a level `L`; locking it requires a [`LockToken`] for some level
//! `P` with `L: LockAfter<P>`. Tokens are only handed out by
//! [`LockToken::root`] (nothing held) and by an [`OrderedGuard`] (its level is
//! held), so acquiring locks against the declared order is a type error
//! instead of a latent deadlock.
//!
//! ```text
//!   LockToken<Unlocked> ──lock──▶ OrderedGuard<A> ──split──▶ LockToken<A>
//!                                                              │
//!                                              lock (B: LockAfter<A>)
//!                                                              ▼
//!                                                     OrderedGuard<B> ...
//! ```
//!
//! Sibling locks of the same level may be taken one after the other under one
//! parent token, since the token is only borrowed. Holding two siblings at once
//! is possible too; callers that do so must agree on a secondary order
//! themselves.
//!
//! ## Declaring an order
//!
//! ```
//! use kernel_sync::{lock_order, LockToken, OrderedLock};
//!
//! pub struct Outer;
//! pub struct Inner;
//! lock_order!(kernel_sync::Unlocked => Outer => Inner);
//!
//! let outer = OrderedLock::<Outer, _>::new(1_u32);
//! let inner = OrderedLock::<Inner, _>::new(2_u32);
//!
//! let root = LockToken::root();
//! let mut o = outer.lock(&root);
//! let (o_value, o_token) = o.split();
//! let i = inner.lock(o_token);
//! *o_value += *i;
//! drop(i);
//! assert_eq!(*o, 3);
//! ```
//!
//! Taking the outer lock while holding the inner one does not compile:
//!
//! ```compile_fail
//! use kernel_sync::{lock_order, LockToken, OrderedLock};
//!
//! pub struct Outer;
//! pub struct Inner;
//! lock_order!(kernel_sync::Unlocked => Outer => Inner);
//!
//! let outer = OrderedLock::<Outer, _>::new(1_u32);
//! let inner = OrderedLock::<Inner, _>::new(2_u32);
//!
//! let root = LockToken::root();
//! let i = inner.lock(&root);
//! let o = outer.lock(i.token()); // Outer: LockAfter<Inner> is not implemented
//! ```

use crate::spin_lock::{SpinLock, SpinLockGuard};
use core::{
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

/// Implemented by `Self` for every level `P` that must be held before `Self`.
///
/// Use [`lock_order!`](crate::lock_order) rather than implementing this by hand.
pub trait LockAfter<P> {}

/// The level of a thread that holds no ordered lock.
pub struct Unlocked;

/// Proof that the current context holds a lock of level `L`.
///
/// Zero-sized; it exists only to carry the level through the type system.
pub struct LockToken<L> {
    _level: PhantomData<fn() -> L>,
}

impl LockToken<Unlocked> {
    /// The token for a context that holds none of the ordered locks.
    #[inline]
    #[must_use]
    pub const fn root() -> Self {
        Self {
            _level: PhantomData,
        }
    }
}

impl<L> fmt::Debug for LockToken<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken<{}>", core::any::type_name::<L>())
    }
}

/// A [`SpinLock`] tagged with its position in a lock hierarchy.
pub struct OrderedLock<L, T> {
    inner: SpinLock<T>,
    _level: PhantomData<fn() -> L>,
}

impl<L, T> OrderedLock<L, T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
            _level: PhantomData,
        }
    }

    /// Acquire the lock while holding a lock of level `P` (or none).
    ///
    /// The guard cannot outlive the token it was acquired under.
    #[inline]
    pub fn lock<'a, P>(&'a self, _held: &'a LockToken<P>) -> OrderedGuard<'a, L, T>
    where
        L: LockAfter<P>,
    {
        OrderedGuard {
            guard: self.inner.lock(),
            token: LockToken {
                _level: PhantomData,
            },
        }
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<L, T: Default> Default for OrderedLock<L, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<L, T: fmt::Debug> fmt::Debug for OrderedLock<L, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedLock")
            .field("level", &core::any::type_name::<L>())
            .field("inner", &self.inner)
            .finish()
    }
}

/// Guard of an [`OrderedLock`]; hands out the token for its own level.
pub struct OrderedGuard<'a, L, T> {
    guard: SpinLockGuard<'a, T>,
    token: LockToken<L>,
}

impl<L, T> OrderedGuard<'_, L, T> {
    /// Token to take locks ordered after `L`, while only reading the data.
    #[inline]
    #[must_use]
    pub const fn token(&self) -> &LockToken<L> {
        &self.token
    }

    /// Mutable access to the data together with the token for level `L`.
    #[inline]
    pub fn split(&mut self) -> (&mut T, &LockToken<L>) {
        (&mut *self.guard, &self.token)
    }
}

impl<L, T> Deref for OrderedGuard<'_, L, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.guard
    }
}

impl<L, T> DerefMut for OrderedGuard<'_, L, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.guard
    }
}

/// Declare a total lock order.
///
/// `lock_order!(A => B => C)` implements `LockAfter<A>` for `B` and `C`, and
/// `LockAfter<B>` for `C`. Start the chain with [`Unlocked`] to make the first
/// level lockable from [`LockToken::root`].
#[macro_export]
macro_rules! lock_order {
    () => {};
    ($head:ty $(=> $tail:ty)*) => {
        $( impl $crate::LockAfter<$head> for $tail {} )*
        $crate::lock_order!($($tail)=>*);
    };
}
