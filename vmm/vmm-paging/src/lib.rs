//! # Hypervisor Paging Engine
//!
//! Builds and maintains the 4-level page tables a type-1 hypervisor needs:
//! extended page tables that translate guest-physical to system-physical
//! addresses, and the hypervisor's own host table.
//!
//! ```text
//!           ┌──────────────────┐   lock    ┌──────────────────────┐
//!  map/     │  RootPageTable   │──────────►│ PageTableNode (L4)   │
//!  unmap ──►│  E = EptEntry    │           │  ├─ node (L3)        │
//!           │    | HostEntry   │           │  │   ├─ node (L2) ... │
//!           └────────┬─────────┘           └──────────────────────┘
//!                    │ pages                       ▲
//!                    ▼                             │ phys ↔ virt
//!               PagePool ──────────────────────────┘
//!
//!  ScopedMapping ── Mapper (map_4k/unmap) + MapWindowAllocator
//!  translate     ── read-only walk of a foreign root
//! ```
//!
//! ## Pieces
//!
//! - [`entry`]: typed views of EPT and host entries, attributes and memory types.
//! - [`PageTableNode`]: one table page and the recursive tree algorithms.
//! - [`RootPageTable`]: the locked owner of a tree, with
//!   [`ExtendedPageTable`] and [`HostPageTable`] aliases, identity maps
//!   and granularity conversion.
//! - [`translate`](fn@translate): resolves addresses through a tree this crate does not own.
//! - [`ScopedMapping`]: maps memory for the lifetime of a handle.
//!
//! ## Example
//!
//! ```rust
//! use vmm_addresses::{PhysicalAddress, VirtualAddress};
//! use vmm_paging::{Attributes, ExtendedPageTable, Level, NoIntrinsics};
//! use vmm_pool::{LinearPagePool, PagePool};
//!
//! let pool = LinearPagePool::new(16, PhysicalAddress::new(0x10_0000));
//! let ept = ExtendedPageTable::new(&pool, NoIntrinsics, false)?;
//!
//! let gpa = VirtualAddress::new(0x4000_0000);
//! ept.map_2m(gpa, PhysicalAddress::new(0x8020_0000), Attributes::READ_WRITE)?;
//! assert_eq!(
//!     ept.virt_to_phys(gpa + 0x1234)?,
//!     (PhysicalAddress::new(0x8020_1234), Level::L2)
//! );
//!
//! ept.unmap(gpa);
//! assert_eq!(pool.allocated(), 1);
//! # Ok::<(), vmm_paging::Error>(())
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod context;
pub mod entry;
mod error;
mod identity;
pub mod intrinsics;
mod level;
mod mapper;
mod node;
mod scoped;
mod table;
mod translate;

pub use context::{ContextMapping, MemoryContext};
pub use entry::{Attributes, EntryView, EptEntry, HostEntry, MemoryType, PageTableEntry, TableKind};
pub use error::{Error, Result};
pub use intrinsics::{CpuIntrinsics, NoIntrinsics, RecordingIntrinsics};
#[cfg(feature = "asm")]
pub use intrinsics::X86Intrinsics;
pub use level::{LeafSize, Level};
pub use mapper::Mapper;
pub use node::{MemoryDescriptor, PageTableNode};
pub use scoped::{MappingParts, ScopedMapping};
pub use table::{ExtendedPageTable, HostPageTable, RootPageTable};
pub use translate::{translate, translate_with_level};
