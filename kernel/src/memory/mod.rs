// kernel/src/memory/mod.rs
//
// The virtual memory subsystem (§4): physical frame bookkeeping, the
// page-table walker, per-task VMAs, reverse mapping, swap, and fault
// dispatch.

use x86_64::VirtAddr;
use core::sync::atomic::{AtomicU64, Ordering};

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod paging;
pub mod rmap;
pub mod swap;
pub mod vma;

static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the direct map's base, established once by the bootloader.
pub fn init(physical_memory_offset: VirtAddr) {
    PHYSICAL_MEMORY_OFFSET.store(physical_memory_offset.as_u64(), Ordering::Relaxed);
}

/// The direct map's base: `physical_memory_offset() + phys` reads any
/// physical address without a dedicated mapping.
#[cfg(not(test))]
pub fn physical_memory_offset() -> VirtAddr {
    VirtAddr::new(PHYSICAL_MEMORY_OFFSET.load(Ordering::Relaxed))
}

/// Host unit tests have no bootloader-built direct map. Stand in with a
/// leaked heap buffer and treat its base as physical address zero, so
/// the buddy allocator and page-table walker can run unmodified against
/// it under `cargo test`.
#[cfg(test)]
pub fn physical_memory_offset() -> VirtAddr {
    use spin::Once;

    const TEST_BACKING_SIZE: usize = 1 << 25;
    static BASE: Once<u64> = Once::new();
    let base = BASE.call_once(|| {
        let buf = alloc::vec![0u8; TEST_BACKING_SIZE].into_boxed_slice();
        alloc::boxed::Box::leak(buf).as_mut_ptr() as u64
    });
    VirtAddr::new(*base)
}