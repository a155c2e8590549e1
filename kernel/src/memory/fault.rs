// kernel/src/memory/fault.rs
//
// Page-fault dispatch (§4.9): not-present faults are either a swap-in
// or a first-touch anonymous allocation; present-but-faulted means a
// COW write hit a read-only shared page. Anything else — no covering
// VMA, or a write against a VMA that never allowed one — is a segfault
// and left for the trap layer to turn into a kill. Error-code bit
// layout follows the source's `demand_paging` pre-filter.

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::allocator::buddy_allocator::{AllocFlags, BuddyAllocator, BUDDY};
use crate::config::{Pid, PAGE_SIZE};
use crate::error::{KernelError, KResult};
use crate::memory::paging::{self, Lookup, Owner};
use crate::memory::swap;
use crate::memory::vma::{Vma, VmaFlags};
use crate::process::{oom, pid_table};

const PF_PRESENT: u64 = 1 << 0;
const PF_WRITE: u64 = 1 << 1;
#[allow(dead_code)]
const PF_USER: u64 = 1 << 2;
const PF_RESERVED: u64 = 1 << 3;

pub enum FaultOutcome {
    Resolved,
    Segfault,
}

/// Dispatch one page fault for `pid` at `fault_addr`. A reserved-bit
/// fault, a fault with no covering VMA, or a write against a
/// non-writable VMA all resolve to `Segfault` immediately. An
/// out-of-memory attempt runs the OOM reaper once and retries before
/// giving up.
pub fn handle(pid: Pid, fault_addr: VirtAddr, error_code: u64) -> FaultOutcome {
    if error_code & PF_RESERVED != 0 {
        return FaultOutcome::Segfault;
    }
    let handle = match pid_table::get(pid) {
        Some(h) => h,
        None => return FaultOutcome::Segfault,
    };

    let (pml4, vma) = {
        let task = handle.lock();
        let vma = task
            .vmas
            .iter()
            .map(|(_, v)| v.clone())
            .find(|v| v.contains(fault_addr.as_u64()));
        (task.pml4, vma)
    };
    let vma = match vma {
        Some(v) => v,
        None => return FaultOutcome::Segfault,
    };

    if error_code & PF_WRITE != 0 && !vma.flags.contains(VmaFlags::WRITE) {
        return FaultOutcome::Segfault;
    }

    let present = error_code & PF_PRESENT != 0;
    let attempt = || {
        if present {
            handle_protection_fault(pml4, fault_addr, &vma, pid)
        } else {
            handle_not_present_fault(pml4, fault_addr, &vma, pid)
        }
    };

    match attempt() {
        Ok(()) => FaultOutcome::Resolved,
        Err(KernelError::OutOfMemory) => {
            oom::oom_pass();
            match attempt() {
                Ok(()) => FaultOutcome::Resolved,
                Err(_) => FaultOutcome::Segfault,
            }
        }
        Err(_) => FaultOutcome::Segfault,
    }
}

/// Not-present fault: the covering VMA's backing content (if any) is
/// expected to already sit in the frame by the time a task can touch
/// it — the ELF loader populates those pages eagerly at exec time
/// (§6) — so this path only ever serves anonymous demand allocation
/// and swap-in.
fn handle_not_present_fault(pml4: PhysAddr, fault_addr: VirtAddr, vma: &Vma, pid: Pid) -> KResult<()> {
    let rmap_id = vma.rmap_id.ok_or(KernelError::AddressSpaceViolation)?;
    let page_base = VirtAddr::new(fault_addr.as_u64() & !(PAGE_SIZE - 1));
    match paging::lookup(pml4, page_base)? {
        Lookup::Swapped { slot } => swap::swap_in(
            pid,
            page_base,
            slot,
            vma.flags.to_page_table_flags(),
            Owner { pid, rmap_id },
        ),
        Lookup::Absent => paging::populate(
            pml4,
            page_base,
            page_base + PAGE_SIZE,
            vma.flags.to_page_table_flags(),
            Owner { pid, rmap_id },
        ),
        Lookup::Present { .. } => Ok(()),
    }
}

/// Present-but-faulted: a COW write. A lone owner (refcount 1) just
/// gets its PTE re-marked writable; a shared frame gets a private copy.
fn handle_protection_fault(pml4: PhysAddr, fault_addr: VirtAddr, vma: &Vma, pid: Pid) -> KResult<()> {
    let rmap_id = vma.rmap_id.ok_or(KernelError::AddressSpaceViolation)?;
    let page_base = VirtAddr::new(fault_addr.as_u64() & !(PAGE_SIZE - 1));
    let (frame, flags) = match paging::lookup(pml4, page_base)? {
        Lookup::Present { frame, flags } => (frame, flags),
        _ => return Err(KernelError::AddressSpaceViolation),
    };
    if flags.contains(PageTableFlags::WRITABLE) {
        return Ok(());
    }

    let new_flags = vma.flags.to_page_table_flags();
    if BUDDY.lock().refcount(frame) <= 1 {
        return paging::protect(pml4, page_base, page_base + PAGE_SIZE, new_flags);
    }

    let new_frame = BUDDY.lock().alloc(0, AllocFlags::empty()).ok_or(KernelError::OutOfMemory)?;
    unsafe { copy_frame(frame, new_frame) };
    paging::insert(pml4, page_base, new_frame, new_flags, Some(Owner { pid, rmap_id }))
}

unsafe fn copy_frame(src: crate::memory::frame::FrameNumber, dst: crate::memory::frame::FrameNumber) {
    let offset = crate::memory::physical_memory_offset().as_u64();
    let src_ptr = (offset + BuddyAllocator::frame_to_addr(src).as_u64()) as *const u8;
    let dst_ptr = (offset + BuddyAllocator::frame_to_addr(dst).as_u64()) as *mut u8;
    core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, PAGE_SIZE as usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_address_with_no_vma_segfaults() {
        // pid 0 never has a VMA covering this address in a fresh table.
        match handle(0, VirtAddr::new(0x1000), 0) {
            FaultOutcome::Segfault => {}
            FaultOutcome::Resolved => panic!("expected segfault with no task/VMA registered"),
        }
    }
}
