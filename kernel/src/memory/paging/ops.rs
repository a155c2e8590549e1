// kernel/src/memory/paging/ops.rs
//
// The four page-table operations (§4.3), each a small `PageTableWalker`
// driven by `walker::walk_page_range`.

use x86_64::instructions::tlb;
use x86_64::structures::paging::{PageTableEntry, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use crate::allocator::buddy_allocator::{AllocFlags, BuddyAllocator, BUDDY};
use crate::config::{Pid, PAGE_SIZE};
use crate::error::{KernelError, KResult};
use crate::memory::frame::FrameNumber;
use crate::memory::paging::entry::{decode_swap_slot, is_present, ptbl_alloc, ptbl_free};
use crate::memory::paging::walker::{walk_page_range, PageTableWalker, WalkAction};
use crate::memory::swap;

/// Owning VMA context for a user-facing install, so the frame's rmap
/// gets attached and it's enlisted for swap (§4.3: "for user mappings
/// attach the frame's rmap to the owning VMA's rmap and enlist it on
/// the swap list").
#[derive(Clone, Copy)]
pub struct Owner {
    pub pid: Pid,
    pub rmap_id: u32,
}

fn ensure_intermediate(entry: &mut PageTableEntry) -> KResult<WalkAction> {
    if !is_present(entry) {
        let phys = ptbl_alloc()?;
        entry.set_addr(
            phys,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        );
    }
    Ok(WalkAction::Descend)
}

struct InsertOp {
    frame: FrameNumber,
    flags: PageTableFlags,
    owner: Option<Owner>,
}

impl PageTableWalker for InsertOp {
    fn pml4e(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        ensure_intermediate(entry)
    }
    fn pdpte(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        ensure_intermediate(entry)
    }
    fn pde(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        ensure_intermediate(entry)
    }
    fn pte(&mut self, entry: &mut PageTableEntry, va: VirtAddr) -> KResult<()> {
        if is_present(entry) {
            let old_frame = BuddyAllocator::addr_to_frame(entry.addr());
            if BUDDY.lock().put(old_frame) == 0 {
                swap::delist(old_frame);
                unsafe { BUDDY.lock().free(old_frame, 0) };
            }
            tlb::flush(va);
        }
        let phys = BuddyAllocator::frame_to_addr(self.frame);
        entry.set_addr(phys, self.flags | PageTableFlags::PRESENT);
        {
            let mut buddy = BUDDY.lock();
            buddy.get(self.frame);
            if let Some(owner) = self.owner {
                buddy.set_rmap(self.frame, owner.rmap_id);
            }
        }
        if self.owner.is_some() {
            swap::enlist(self.frame);
        }
        crate::serial_print_raw!("paging: insert va={:#x} frame={}\n", va.as_u64(), self.frame);
        Ok(())
    }
}

/// Install `frame` at `va` in the page table rooted at `pml4`. Bumps
/// the new frame's refcount and, for `owner.is_some()`, attaches its
/// rmap and enlists it for swap.
pub fn insert(pml4: PhysAddr, va: VirtAddr, frame: FrameNumber, flags: PageTableFlags, owner: Option<Owner>) -> KResult<()> {
    let mut op = InsertOp { frame, flags, owner };
    walk_page_range(pml4, va, va + PAGE_SIZE, &mut op)
}

#[derive(Default)]
struct LookupOp {
    found: Option<(FrameNumber, PageTableFlags)>,
    swapped: Option<u64>,
}

impl PageTableWalker for LookupOp {
    fn pte(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<()> {
        if is_present(entry) {
            self.found = Some((BuddyAllocator::addr_to_frame(entry.addr()), entry.flags()));
        } else {
            self.swapped = decode_swap_slot(entry);
        }
        Ok(())
    }
}

pub enum Lookup {
    Present { frame: FrameNumber, flags: PageTableFlags },
    Swapped { slot: u64 },
    Absent,
}

pub fn lookup(pml4: PhysAddr, va: VirtAddr) -> KResult<Lookup> {
    let mut op = LookupOp::default();
    walk_page_range(pml4, va, va + PAGE_SIZE, &mut op)?;
    Ok(match (op.found, op.swapped) {
        (Some((frame, flags)), _) => Lookup::Present { frame, flags },
        (None, Some(slot)) => Lookup::Swapped { slot },
        (None, None) => Lookup::Absent,
    })
}

struct ProtectOp {
    flags: PageTableFlags,
}

impl PageTableWalker for ProtectOp {
    fn pte(&mut self, entry: &mut PageTableEntry, va: VirtAddr) -> KResult<()> {
        if is_present(entry) {
            let new_flags = self.flags | PageTableFlags::PRESENT;
            if entry.flags() != new_flags {
                let addr = entry.addr();
                entry.set_addr(addr, new_flags);
                tlb::flush(va);
            }
        }
        Ok(())
    }
}

/// Rewrite permission bits across `[base, end)`; only invalidates the
/// TLB for entries whose bits actually changed (§4.3).
pub fn protect(pml4: PhysAddr, base: VirtAddr, end: VirtAddr, flags: PageTableFlags) -> KResult<()> {
    let mut op = ProtectOp { flags };
    walk_page_range(pml4, base, end, &mut op)
}

struct PopulateOp {
    flags: PageTableFlags,
    owner: Owner,
    failed: bool,
}

impl PageTableWalker for PopulateOp {
    fn pml4e(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        ensure_intermediate(entry)
    }
    fn pdpte(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        ensure_intermediate(entry)
    }
    fn pde(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        ensure_intermediate(entry)
    }
    fn pte(&mut self, entry: &mut PageTableEntry, va: VirtAddr) -> KResult<()> {
        debug_assert!(!is_present(entry), "populate over an already-present page at {:#x}", va.as_u64());
        let frame = match BUDDY.lock().alloc(0, AllocFlags::ZERO) {
            Some(f) => f,
            None => {
                self.failed = true;
                return Err(KernelError::OutOfMemory);
            }
        };
        let phys = BuddyAllocator::frame_to_addr(frame);
        entry.set_addr(phys, self.flags | PageTableFlags::PRESENT);
        {
            let mut buddy = BUDDY.lock();
            buddy.get(frame);
            buddy.set_rmap(frame, self.owner.rmap_id);
        }
        swap::enlist(frame);
        Ok(())
    }
}

/// Allocate and map a zeroed, present frame for every page in
/// `[base, end)`. Every covered PTE must currently be not-present.
pub fn populate(pml4: PhysAddr, base: VirtAddr, end: VirtAddr, flags: PageTableFlags, owner: Owner) -> KResult<()> {
    let mut op = PopulateOp { flags, owner, failed: false };
    walk_page_range(pml4, base, end, &mut op)
}

struct RemoveOp;

impl PageTableWalker for RemoveOp {
    fn pte(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<()> {
        if is_present(entry) {
            let frame = BuddyAllocator::addr_to_frame(entry.addr());
            entry.set_unused();
            if BUDDY.lock().put(frame) == 0 {
                swap::delist(frame);
                unsafe { BUDDY.lock().free(frame, 0) };
            }
        } else if decode_swap_slot(entry).is_some() {
            entry.set_unused();
        }
        Ok(())
    }

    fn pml4e_unmap(&mut self, entry: &mut PageTableEntry, child: PhysAddr, _va: VirtAddr) {
        entry.set_unused();
        unsafe { ptbl_free(child) };
    }
    fn pdpte_unmap(&mut self, entry: &mut PageTableEntry, child: PhysAddr, _va: VirtAddr) {
        entry.set_unused();
        unsafe { ptbl_free(child) };
    }
    fn pde_unmap(&mut self, entry: &mut PageTableEntry, child: PhysAddr, _va: VirtAddr) {
        entry.set_unused();
        unsafe { ptbl_free(child) };
    }
}

/// Unmap `[base, end)`, decrementing (and freeing, at zero) every
/// present frame's refcount, and freeing any intermediate page table
/// left fully empty by the unwind (§4.3).
pub fn unmap_page_range(pml4: PhysAddr, base: VirtAddr, end: VirtAddr) -> KResult<()> {
    let mut op = RemoveOp;
    walk_page_range(pml4, base, end, &mut op)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global BUDDY backs every `ptbl_alloc`/`insert`/`lookup`/
    // `unmap_page_range` call (they're not parameterized over an
    // allocator instance), so the round trip below seeds it with its
    // own small region, carved out of the `#[cfg(test)]` direct-map
    // stand-in `memory::physical_memory_offset` leaks.
    fn seeded_pml4() -> PhysAddr {
        static SEEDED: spin::Once<()> = spin::Once::new();
        SEEDED.call_once(|| unsafe {
            BUDDY.lock().add_region(0, 1 << 20);
        });
        ptbl_alloc().expect("seeded region has room for a pml4")
    }

    #[test]
    fn insert_lookup_unmap_round_trip() {
        let pml4 = seeded_pml4();
        let va = VirtAddr::new(0x1_0000);
        let frame = BUDDY.lock().alloc(0, AllocFlags::empty()).expect("data frame");
        let flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        insert(pml4, va, frame, flags, None).expect("insert");
        match lookup(pml4, va).expect("lookup") {
            Lookup::Present { frame: found, .. } => assert_eq!(found, frame),
            _ => panic!("expected Present after insert"),
        }

        unmap_page_range(pml4, va, va + PAGE_SIZE).expect("unmap");
        match lookup(pml4, va).expect("lookup after unmap") {
            Lookup::Absent => {}
            _ => panic!("expected Absent after unmap"),
        }
    }
}
