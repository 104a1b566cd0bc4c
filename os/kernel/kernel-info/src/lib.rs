//! # Virtual Memory Configuration
//!
//! Compile-time layout constants shared by the address-manipulation crate,
//! the physical page pool and the virtual-memory core. Nothing in here is
//! mutable at runtime; sizes that vary per machine (how many frames the pool
//! manages, where they start) are constructor arguments of the pool instead.
//!
//! ## Userspace window
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │    Null guard (never handed out)│
//! USERSPACE_BASE        ├─────────────────────────────────┤ 0x0000_0000_0080_0000
//!                       │                                 │
//!                       │   Range allocator window:       │
//!                       │   regions, stacks, mmap()       │
//!                       │                                 │
//! USERSPACE_CEILING     ├─────────────────────────────────┤ 0x0000_7fff_ffff_0000
//!                       │    Top guard                    │
//! 0x0000_7fff_ffff_ffff └─────────────────────────────────┘
//! ```
//!
//! Every freshly created page directory hands `[USERSPACE_BASE, USERSPACE_CEILING)`
//! to its range allocator. Forked page directories start from a snapshot of
//! their parent's allocator instead.
//!
//! ## Page geometry
//!
//! A single page size is supported. Page tables hold [`memory::PAGE_TABLE_ENTRIES`]
//! leaves, so one table covers `PAGE_TABLE_ENTRIES * PAGE_SIZE` bytes of
//! virtual address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
