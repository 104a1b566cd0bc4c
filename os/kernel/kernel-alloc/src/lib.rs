//! # Physical Page Pool
//!
//! This crate owns physical memory on behalf of the virtual-memory core. It
//! hands out 4 KiB frames wrapped in reference-counted [`PhysicalPage`]
//! handles and keeps the global commit accounting that lets the VM promise
//! memory now and materialize it later.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          UserPhysicalPages (global pool)            │
//! │    • commit / uncommit credits                      │
//! │    • committed and uncommitted page allocation      │
//! │    • PhysicalPage handles return frames on drop     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • FrameAlloc trait                               │
//! │    • BitmapFrameAlloc: next-fit over a bit array    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Commit Accounting
//!
//! Every frame the pool manages is in exactly one of three buckets:
//!
//! | Bucket        | Meaning                                                        |
//! |---------------|----------------------------------------------------------------|
//! | `uncommitted` | Free and promised to nobody; overcommitting allocations draw here. |
//! | `committed`   | Free but reserved by a prior `commit`; cannot be taken by others. |
//! | `used`        | Backing a live [`PhysicalPage`].                               |
//!
//! `total == uncommitted + committed + used` holds after every operation.
//! Committed credits move to `used` through
//! [`UserPhysicalPages::allocate_committed_user_physical_page`], which therefore
//! cannot fail; uncommitted allocations can.
//!
//! Credits are only ever moved through the pool's entry points. Scoped owners
//! such as [`CommitReservation`] give credits back on drop, so an early return
//! never leaks committed capacity.
//!
//! ## Locking
//!
//! The pool's lock is a leaf: no other lock is taken while it is held. It may
//! be acquired under any lock of the VM core, including from [`PhysicalPage`]
//! drops.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
mod physical_page;
mod user_pages;

pub use frame_alloc::{BitmapFrameAlloc, FrameAlloc, FrameAllocError};
pub use physical_page::PhysicalPage;
pub use user_pages::{CommitReservation, PoolStats, ShouldZeroFill, UserPhysicalPages};
