// kernel/src/memory/paging/entry.rs
//
// Raw PTE-level helpers shared by the walker and its operations (§4.3).
// Everything here works one entry or one table at a time; range logic
// lives in `walker.rs`.

use x86_64::structures::paging::{PageTable, PageTableEntry, PageTableFlags};
use x86_64::PhysAddr;

use crate::allocator::buddy_allocator::{AllocFlags, BuddyAllocator, BUDDY};
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KResult};

/// Allocate and zero a fresh intermediate page-table frame.
pub fn ptbl_alloc() -> KResult<PhysAddr> {
    let frame = BUDDY.lock().alloc(0, AllocFlags::ZERO).ok_or(KernelError::OutOfMemory)?;
    Ok(BuddyAllocator::frame_to_addr(frame))
}

/// Return an emptied intermediate page-table frame to the buddy.
///
/// # Safety
/// `phys` must be a page-table frame with no present entries, and must
/// not be reachable from any other live PML4.
pub unsafe fn ptbl_free(phys: PhysAddr) {
    let frame = BuddyAllocator::addr_to_frame(phys);
    unsafe { BUDDY.lock().free(frame, 0) };
}

/// View a physical page-table frame through the direct map.
///
/// # Safety
/// `phys` must name a live page-table frame; the caller must not alias
/// this reference with another live `&mut PageTable` over the same
/// frame.
pub unsafe fn table_at(phys: PhysAddr) -> &'static mut PageTable {
    let virt = crate::memory::physical_memory_offset() + phys.as_u64();
    unsafe { &mut *virt.as_mut_ptr::<PageTable>() }
}

pub fn table_is_empty(table: &PageTable) -> bool {
    (0..512).all(|i| table[i].is_unused())
}

#[inline]
pub fn is_present(entry: &PageTableEntry) -> bool {
    entry.flags().contains(PageTableFlags::PRESENT)
}

#[inline]
pub fn is_huge(entry: &PageTableEntry) -> bool {
    entry.flags().contains(PageTableFlags::HUGE_PAGE)
}

/// Encode a swapped-out page (§3): not present, physical-address bits
/// reused to carry the disk slot (`slot * PAGE_SIZE`, matching the bump
/// allocator's own slot-to-byte-offset convention in `swap.rs`).
pub fn encode_swap_slot(entry: &mut PageTableEntry, slot: u64) {
    entry.set_addr(PhysAddr::new(slot * PAGE_SIZE), PageTableFlags::empty());
}

/// Decode a swap slot from a not-present entry that has one, `None` for
/// a genuinely unused entry or a present one.
pub fn decode_swap_slot(entry: &PageTableEntry) -> Option<u64> {
    if entry.is_unused() || is_present(entry) {
        return None;
    }
    Some(entry.addr().as_u64() / PAGE_SIZE)
}
