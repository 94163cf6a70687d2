//! # Hypervisor Memory Configuration
//!
//! Single source of truth for the compile-time constants shared by the page
//! pool, the register types and the paging engine: table geometry, address
//! widths, the host PAT programming and the virtual range handed out for
//! temporary mappings.
//!
//! ```text
//! Hypervisor address space (host table):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   identity / low mappings       │
//!                       ├─────────────────────────────────┤
//!                       │           unused                │
//! MAP_WINDOW_BASE       ├─────────────────────────────────┤ 0xffff_9000_0000_0000
//!                       │   scoped mapping windows        │
//! MAP_WINDOW_BASE +     ├─────────────────────────────────┤
//!   MAP_WINDOW_SIZE     │           unused                │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Everything here is `const`; invalid combinations fail the build through
//! the `const _: () = { assert!(..) }` blocks in [`memory`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
