// kernel/src/memory/paging/mod.rs
//
// Four-level page-table walker and the operations built on it (§4.2,
// §4.3), replacing the `x86_64::Mapper`-based `ActivePageTable`/
// `OwnedPageTable` the source used: those stay useful as grounding for
// the direct-map and PML4-clone idiom but can't express the generic
// callback-driven walk this subsystem needs.

pub mod entry;
pub mod walker;
pub mod ops;

pub use ops::{insert, lookup, populate, protect, unmap_page_range, Lookup, Owner};
pub use walker::{walk_page_range, PageTableWalker, WalkAction};
