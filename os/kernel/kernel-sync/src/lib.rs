//! # Kernel synchronization primitives
//!
//! - [`SpinLock`]: the plain leaf lock.
//! - [`OrderedLock`]: a spin lock with a compile-time position in a lock
//!   hierarchy, see [`ordered`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod ordered;
mod spin_lock;

pub use ordered::{LockAfter, LockToken, OrderedGuard, OrderedLock, Unlocked};
pub use spin_lock::{SpinLock, SpinLockGuard};
