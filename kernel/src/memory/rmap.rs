// kernel/src/memory/rmap.rs
//
// Reverse mapping (§4.5): every shared physical frame points back to the
// set of VMAs that cover it, so swap-out and COW invalidation can rewrite
// every PTE naming the frame without walking every task's page tables.
//
// A VMA never holds a raw pointer to its task, and an rmap never holds a
// raw pointer to a VMA: per the arena-plus-index design (§9), both sides
// are named by `(Pid, VmaId)` and resolved through the PID table and the
// owning task's VMA arena at walk time. This is what lets `Rmap` be
// `Send + Sync` and stored behind a plain `Arc` with no unsafe cycles.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::Pid;
use crate::memory::vma::VmaId;

/// One frame's set of covering VMAs, each independently lockable (§5:
/// the fine-grained regime's per-rmap lock).
pub struct Rmap {
    vmas: spin::Mutex<Vec<(Pid, VmaId)>>,
}

impl Rmap {
    pub const fn new() -> Self {
        Self { vmas: spin::Mutex::new(Vec::new()) }
    }

    pub fn attach(&self, pid: Pid, vma: VmaId) {
        let mut list = self.vmas.lock();
        debug_assert!(!list.contains(&(pid, vma)), "vma already on this rmap");
        list.push((pid, vma));
    }

    pub fn detach(&self, pid: Pid, vma: VmaId) {
        self.vmas.lock().retain(|&entry| entry != (pid, vma));
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.vmas.lock().len()
    }

    /// Empty this rmap's list and return what it held, for a merge that
    /// transplants entries onto a surviving sibling rmap.
    pub fn drain(&self) -> Vec<(Pid, VmaId)> {
        core::mem::take(&mut *self.vmas.lock())
    }

    /// Visit every `(pid, vma)` currently on this rmap. Callers driving
    /// an actual page-table rewrite (swap, COW break, unmap-on-exit)
    /// resolve each pid through the PID table and each vma through that
    /// task's VMA arena, then invoke `paging::ops::walk_page_range` over
    /// `[vma.base, vma.end)` — composition that lives in `swap.rs` and
    /// `fault.rs`, not here, to keep this module free of a dependency on
    /// the PID table.
    pub fn for_each<F: FnMut(Pid, VmaId)>(&self, mut f: F) {
        for &(pid, vma) in self.vmas.lock().iter() {
            f(pid, vma);
        }
    }
}

impl Default for Rmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Growable table of rmaps, indexed by the `u32` id stored in
/// `FrameInfo::rmap`. Slot allocation/recycling is guarded by its own
/// lock; once handed out, an `Arc<Rmap>` clone lets the caller operate
/// on that rmap's list through its own lock without holding the arena
/// lock for the duration (§5 lock order: task → rmap → swap → buddy;
/// the arena lock is a leaf, held only to fetch the handle).
pub struct RmapArena {
    slots: Vec<Option<Arc<Rmap>>>,
    free_list: Vec<u32>,
}

impl RmapArena {
    pub const fn new() -> Self {
        Self { slots: Vec::new(), free_list: Vec::new() }
    }

    /// Allocate a fresh, empty rmap and return its arena id.
    pub fn alloc(&mut self) -> u32 {
        if let Some(id) = self.free_list.pop() {
            self.slots[id as usize] = Some(Arc::new(Rmap::new()));
            return id;
        }
        let id = self.slots.len() as u32;
        self.slots.push(Some(Arc::new(Rmap::new())));
        id
    }

    /// Clone the `Arc<Rmap>` handle for `id`. `None` if `id` was never
    /// allocated or has since been freed.
    pub fn get(&self, id: u32) -> Option<Arc<Rmap>> {
        self.slots.get(id as usize).and_then(|slot| slot.clone())
    }

    /// Return `id`'s slot to the free list once its rmap is empty.
    ///
    /// # Safety
    /// `id` must name an rmap no frame or VMA still references; callers
    /// check `Rmap::is_empty` under the rmap's own lock first.
    pub unsafe fn free(&mut self, id: u32) {
        debug_assert!(
            self.slots[id as usize].as_ref().is_some_and(|r| r.is_empty()),
            "freeing a non-empty rmap"
        );
        self.slots[id as usize] = None;
        self.free_list.push(id);
    }
}

pub static RMAP_ARENA: spin::Mutex<RmapArena> = spin::Mutex::new(RmapArena::new());

/// Allocate a fresh, empty rmap and return its arena id.
pub fn alloc_rmap() -> u32 {
    RMAP_ARENA.lock().alloc()
}

/// Clone the `Arc<Rmap>` handle for `id`. `None` if `id` was never
/// allocated or has since been freed.
pub fn get_rmap(id: u32) -> Option<Arc<Rmap>> {
    RMAP_ARENA.lock().get(id)
}

/// Return `id`'s slot to the free list once its rmap is empty.
///
/// # Safety
/// `id` must name an rmap no frame or VMA still references; callers
/// check `Rmap::is_empty` under the rmap's own lock first.
pub unsafe fn free_rmap(id: u32) {
    RMAP_ARENA.lock().free(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_detach_round_trips_to_empty() {
        let rmap = Rmap::new();
        assert!(rmap.is_empty());
        rmap.attach(1, 0);
        rmap.attach(1, 1);
        assert_eq!(rmap.len(), 2);
        rmap.detach(1, 0);
        assert_eq!(rmap.len(), 1);
        rmap.detach(1, 1);
        assert!(rmap.is_empty());
    }

    #[test]
    fn for_each_visits_every_entry() {
        let rmap = Rmap::new();
        rmap.attach(1, 0);
        rmap.attach(2, 3);
        let mut seen = Vec::new();
        rmap.for_each(|pid, vma| seen.push((pid, vma)));
        assert_eq!(seen, alloc::vec![(1, 0), (2, 3)]);
    }

    // Exercised against a private `RmapArena`, not the shared `RMAP_ARENA`
    // static: the test harness runs tests on multiple threads, and a
    // global arena shared with every other memory-module test would make
    // slot-recycling assertions race with unrelated allocations.
    #[test]
    fn arena_allocates_distinct_ids_and_recycles_freed_slots() {
        let mut arena = RmapArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        assert_ne!(a, b);
        assert!(arena.get(a).is_some());
        unsafe { arena.free(a) };
        assert!(arena.get(a).is_none());
        let c = arena.alloc();
        assert_eq!(c, a, "freed slot should be recycled before growing");
    }

    #[test]
    fn get_rmap_shares_the_same_underlying_list() {
        let mut arena = RmapArena::new();
        let id = arena.alloc();
        let handle = arena.get(id).unwrap();
        handle.attach(7, 0);
        let other_handle = arena.get(id).unwrap();
        assert_eq!(other_handle.len(), 1);
        unsafe {
            other_handle.detach(7, 0);
            arena.free(id);
        }
    }
}
