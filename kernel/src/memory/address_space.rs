// kernel/src/memory/address_space.rs
//
// PML4 construction for new tasks (§4.8). A fresh user address space
// starts as a copy of the kernel's own PML4 with the user-owned entries
// left blank, so each task builds independent intermediate tables for
// its own code/stack ranges instead of sharing a PDPT with anyone else
// (rebuilt from the source's `OwnedPageTable::new_user` on the custom
// walker instead of `x86_64::Mapper`).

use x86_64::registers::control::Cr3;
use x86_64::PhysAddr;

use crate::allocator::buddy_allocator::{AllocFlags, BuddyAllocator, BUDDY};
use crate::error::{KernelError, KResult};
use crate::memory::paging::entry::table_at;

const USER_CODE_BASE: u64 = 0x0000_0000_0040_0000;
const USER_STACK_BASE: u64 = 0x0000_7100_0000_0000;

const fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

const USER_PML4_ENTRIES: [usize; 2] = [pml4_index(USER_CODE_BASE), pml4_index(USER_STACK_BASE)];

fn is_user_pml4_entry(index: usize) -> bool {
    USER_PML4_ENTRIES.contains(&index)
}

pub fn kernel_pml4() -> PhysAddr {
    Cr3::read().0.start_address()
}

/// Allocate a fresh PML4 for a new task: every kernel entry copied
/// verbatim except the user-owned slots, which are left unused so the
/// task builds its own code/stack page-table chain independently.
pub fn new_user_pml4() -> KResult<PhysAddr> {
    let frame = BUDDY.lock().alloc(0, AllocFlags::ZERO).ok_or(KernelError::OutOfMemory)?;
    let phys = BuddyAllocator::frame_to_addr(frame);
    let new_pml4 = unsafe { table_at(phys) };
    let kernel_pml4 = unsafe { table_at(kernel_pml4()) };
    for i in 0..512 {
        if kernel_pml4[i].is_unused() || is_user_pml4_entry(i) {
            continue;
        }
        new_pml4[i] = kernel_pml4[i].clone();
    }
    Ok(phys)
}

/// Release a task's PML4 frame. The caller must have already unmapped
/// every user page (via `paging::unmap_page_range`), which frees the
/// intermediate PDPT/PD/PT frames as it empties them.
pub unsafe fn free_pml4(phys: PhysAddr) {
    let frame = BuddyAllocator::addr_to_frame(phys);
    BUDDY.lock().free(frame, 0);
}
