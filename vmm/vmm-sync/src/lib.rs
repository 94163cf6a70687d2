//! # Synchronization for Page-Table Owners
//!
//! A single primitive, [`SpinLock`], serializes every operation on one page
//! table. Mapping calls are short and bounded (at most four levels are
//! walked), so spinning is preferred over anything that would need a
//! scheduler.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
