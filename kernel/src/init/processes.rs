// kernel/src/init/processes.rs
//
// Task creation at boot: the idle task that owns the boot-time address
// space, plus a handful of demo user tasks that exercise IRETQ, paging,
// and syscalls end to end (§4.8, §6).

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::allocator::buddy_allocator::{AllocFlags, BuddyAllocator, BUDDY};
use crate::config::Pid;
use crate::memory::paging::{self, Owner};
use crate::memory::vma::VmaFlags;
use crate::process::{self, pid_table, user_demo};
use crate::serial_println;

const USER_CODE_BASE: u64 = 0x0000_0000_0040_0000;
const USER_STACK_BASE: u64 = 0x0000_7100_0000_0000;
const STACK_PAGES: u64 = 16;

/// Create every task the boot sequence starts with: the idle task
/// (this thread, PID 0) and a small fleet of demo user tasks.
pub fn init_all() {
    serial_println!("\nCreating tasks...");

    let idle = process::spawn_kernel_task(None).expect("failed to register idle task");
    serial_println!("  idle task: pid {}", idle);

    for (i, demo) in ["loop", "stack", "syscall"].iter().enumerate() {
        match create_demo_user_task(Some(idle), demo, i as u64) {
            Ok(pid) => serial_println!("  user task '{}': pid {}", demo, pid),
            Err(e) => serial_println!("  user task '{}' failed: {:?}", demo, e),
        }
    }

    serial_println!("Tasks created.\n");
}

/// Spawn one user task running `demo` (one of `user_demo`'s programs),
/// with its code page mapped eagerly and its stack VMA registered but
/// demand-paged (§4.9 handles the first touch).
fn create_demo_user_task(parent: Option<Pid>, demo: &str, slot: u64) -> crate::error::KResult<Pid> {
    let stack_base = USER_STACK_BASE + slot * (STACK_PAGES + 1) * 4096;
    let stack_top = VirtAddr::new(stack_base + STACK_PAGES * 4096 - 8);

    let pid = process::spawn_user_task(parent, VirtAddr::new(USER_CODE_BASE), stack_top)?;
    let handle = pid_table::get(pid).expect("just-inserted pid missing");

    let (pml4, code_rmap) = {
        let mut task = handle.lock();
        let (_, vma_id) = task.vmas.add_vma(
            USER_CODE_BASE,
            4096,
            VmaFlags::READ | VmaFlags::EXEC,
            "code",
            None,
        )?;
        task.vmas.add_vma(
            stack_base,
            STACK_PAGES * 4096,
            VmaFlags::READ | VmaFlags::WRITE,
            "stack",
            None,
        )?;
        let rmap_id = task.vmas.get(vma_id).unwrap().rmap_id.unwrap();
        (task.pml4, rmap_id)
    };

    map_demo_code(pml4, demo, code_rmap, pid)?;
    Ok(pid)
}

/// Allocate a frame, copy the demo program's bytes into it, and install
/// it at `USER_CODE_BASE`. Demo programs are a handful of instructions,
/// always well under one page.
fn map_demo_code(pml4: x86_64::PhysAddr, demo: &str, rmap_id: u32, pid: Pid) -> crate::error::KResult<()> {
    let frame = BUDDY.lock().alloc(0, AllocFlags::ZERO).ok_or(crate::error::KernelError::OutOfMemory)?;
    let phys = BuddyAllocator::frame_to_addr(frame);
    let dst = (crate::memory::physical_memory_offset() + phys.as_u64()).as_mut_ptr::<u8>();

    let src = user_demo::get_demo_ptr(demo);
    const DEMO_LEN: usize = 64;
    unsafe { core::ptr::copy_nonoverlapping(src, dst, DEMO_LEN) };

    let flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    paging::insert(pml4, VirtAddr::new(USER_CODE_BASE), frame, flags, Some(Owner { pid, rmap_id }))
}

/// Run forever once boot is done: service the keyboard-driven shell and
/// halt between interrupts. Every other task is resumed from here only
/// indirectly, through the timer interrupt (§4.7) — this loop is what
/// the CPU falls back to whenever nothing else is runnable.
pub fn run_idle_loop(mut repl: crate::repl::Repl) -> ! {
    loop {
        if let Some(character) = crate::keyboard::read_key() {
            repl.handle_char(character);
        }
        unsafe { core::arch::asm!("hlt") };
    }
}
