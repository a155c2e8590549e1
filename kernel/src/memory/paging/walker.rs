// kernel/src/memory/paging/walker.rs
//
// Generic four-level page-table range walker (§4.2). A concrete
// operation (insert/lookup/protect/populate/remove, in `ops.rs`)
// implements `PageTableWalker`; the walker truncates the iteration
// window to each level's natural boundary, invokes that level's
// pre-descent callback, re-reads the entry (the callback may have
// mutated it), and descends iff it's now present and — at the PD level
// — not a huge page. A post-descent `*_unmap` callback fires whenever
// the child table it just finished walking is left fully empty.

use x86_64::structures::paging::{PageTable, PageTableEntry};
use x86_64::{PhysAddr, VirtAddr};

use crate::error::KResult;
use crate::memory::paging::entry::{is_huge, is_present, table_at, table_is_empty};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WalkAction {
    Descend,
    Skip,
}

/// Implemented by each concrete page-table operation. Every method has
/// a no-op default so an operation only overrides the levels it cares
/// about (§9: "concrete implementations should expose just four entry
/// points and keep the walker private").
pub trait PageTableWalker {
    fn pml4e(&mut self, _entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        Ok(WalkAction::Descend)
    }
    fn pdpte(&mut self, _entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        Ok(WalkAction::Descend)
    }
    fn pde(&mut self, _entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<WalkAction> {
        Ok(WalkAction::Descend)
    }
    fn pte(&mut self, _entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<()> {
        Ok(())
    }

    fn pml4e_unmap(&mut self, _entry: &mut PageTableEntry, _child: PhysAddr, _va: VirtAddr) {}
    fn pdpte_unmap(&mut self, _entry: &mut PageTableEntry, _child: PhysAddr, _va: VirtAddr) {}
    fn pde_unmap(&mut self, _entry: &mut PageTableEntry, _child: PhysAddr, _va: VirtAddr) {}

    /// A sub-range with no present entry at some intermediate level;
    /// the walker did not descend into it.
    fn hole(&mut self, _start: VirtAddr, _end: VirtAddr) {}
}

const PML4_SHIFT: u64 = 39;
const PDPT_SHIFT: u64 = 30;
const PD_SHIFT: u64 = 21;
const PT_SHIFT: u64 = 12;

#[inline]
fn index(va: u64, shift: u64) -> usize {
    ((va >> shift) & 0x1FF) as usize
}

#[inline]
fn window_end(va: u64, shift: u64, end: u64) -> u64 {
    let region_end = ((va >> shift) + 1) << shift;
    end.min(region_end)
}

pub fn walk_page_range(
    pml4_phys: PhysAddr,
    base: VirtAddr,
    end: VirtAddr,
    walker: &mut dyn PageTableWalker,
) -> KResult<()> {
    let table = unsafe { table_at(pml4_phys) };
    walk_pml4(table, base.as_u64(), end.as_u64(), walker)
}

fn walk_pml4(table: &mut PageTable, base: u64, end: u64, walker: &mut dyn PageTableWalker) -> KResult<()> {
    let mut va = base;
    while va < end {
        let i = index(va, PML4_SHIFT);
        let we = window_end(va, PML4_SHIFT, end);
        let action = walker.pml4e(&mut table[i], VirtAddr::new(va))?;
        if action == WalkAction::Descend && is_present(&table[i]) {
            let child_phys = table[i].addr();
            let child = unsafe { table_at(child_phys) };
            walk_pdpt(child, va, we, walker)?;
            if table_is_empty(child) {
                walker.pml4e_unmap(&mut table[i], child_phys, VirtAddr::new(va));
            }
        } else {
            walker.hole(VirtAddr::new(va), VirtAddr::new(we));
        }
        va = we;
    }
    Ok(())
}

fn walk_pdpt(table: &mut PageTable, base: u64, end: u64, walker: &mut dyn PageTableWalker) -> KResult<()> {
    let mut va = base;
    while va < end {
        let i = index(va, PDPT_SHIFT);
        let we = window_end(va, PDPT_SHIFT, end);
        let action = walker.pdpte(&mut table[i], VirtAddr::new(va))?;
        if action == WalkAction::Descend && is_present(&table[i]) {
            let child_phys = table[i].addr();
            let child = unsafe { table_at(child_phys) };
            walk_pd(child, va, we, walker)?;
            if table_is_empty(child) {
                walker.pdpte_unmap(&mut table[i], child_phys, VirtAddr::new(va));
            }
        } else {
            walker.hole(VirtAddr::new(va), VirtAddr::new(we));
        }
        va = we;
    }
    Ok(())
}

fn walk_pd(table: &mut PageTable, base: u64, end: u64, walker: &mut dyn PageTableWalker) -> KResult<()> {
    let mut va = base;
    while va < end {
        let i = index(va, PD_SHIFT);
        let we = window_end(va, PD_SHIFT, end);
        let action = walker.pde(&mut table[i], VirtAddr::new(va))?;
        // A present PAGE_HUGE entry is a 2 MiB leaf; this crate never
        // produces one, but treats it opaquely (as a hole) if found,
        // rather than misinterpreting its bits as a PT frame (§9).
        if action == WalkAction::Descend && is_present(&table[i]) && !is_huge(&table[i]) {
            let child_phys = table[i].addr();
            let child = unsafe { table_at(child_phys) };
            walk_pt(child, va, we, walker)?;
            if table_is_empty(child) {
                walker.pde_unmap(&mut table[i], child_phys, VirtAddr::new(va));
            }
        } else {
            walker.hole(VirtAddr::new(va), VirtAddr::new(we));
        }
        va = we;
    }
    Ok(())
}

fn walk_pt(table: &mut PageTable, base: u64, end: u64, walker: &mut dyn PageTableWalker) -> KResult<()> {
    let mut va = base;
    while va < end {
        let i = index(va, PT_SHIFT);
        walker.pte(&mut table[i], VirtAddr::new(va))?;
        va += 1 << PT_SHIFT;
    }
    Ok(())
}
