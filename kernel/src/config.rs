// kernel/src/config.rs
//
// Build-time knobs (§6, §4.12). Everything a port would tune lives here
// rather than scattered across the subsystems that consume it.

/// Size of one physical/virtual page.
pub const PAGE_SIZE: u64 = 4096;

/// Highest virtual address a user mapping may ever reach. Above this is
/// kernel space; `mmap`/`add_vma` never place anything at or beyond it.
pub const USER_LIM: u64 = 0x0000_8000_0000_0000;

/// Virtual address the kernel image is linked at; `p_va > KERNEL_VMA`
/// in an ELF program header means "kernel segment" at boot (§6).
pub const KERNEL_VMA: u64 = 0xFFFF_8000_0000_0000;

/// Dense PID table capacity (§3).
pub const PID_MAX: usize = 1 << 16;

/// Numeric task identifier, indexing the PID table directly.
pub type Pid = u32;

/// Smallest buddy order (a single 4 KiB frame).
pub const MIN_ORDER: usize = 0;

/// Largest buddy order served; order 9 == 2 MiB == `HUGE`. Bounded well
/// under the frame table's `MAX_FRAMES` (see `buddy_allocator`) since a
/// free order-`MAX_ORDER` block must still fit inside that table.
pub const MAX_ORDER: usize = 15;

/// Free-page threshold (in pages) below which the OOM reaper selects a
/// victim (§4.9).
pub static MEMORY_THRESHOLD: core::sync::atomic::AtomicU64 =
    core::sync::atomic::AtomicU64::new(1024);

/// Eviction attempts per swap-task batch before yielding (§4.6).
pub const SWAP_BLOCK: usize = 1000;

/// TSC ticks charged to a task before the timer IRQ forces a yield (§4.7).
pub const TIMESLICE_TICKS: u64 = 20;

/// True when the crate is built with `--features fair_scheduler`.
#[inline]
pub const fn fair_scheduler_enabled() -> bool {
    cfg!(feature = "fair_scheduler")
}

/// True when the crate is built with the coarse big-kernel-lock regime.
/// The alternative (default) is fine-grained per-subsystem locking (§5).
#[inline]
pub const fn big_kernel_lock() -> bool {
    cfg!(feature = "big_kernel_lock")
}
