// kernel/src/process/mod.rs
//
// Task lifecycle, scheduling, and the user/kernel trap boundary (§3,
// §4.7, §4.8). The PID table (`pid_table`) is the sole owner of task
// objects; everything else reaches a task through a `Pid`.

pub mod lifecycle;
pub mod oom;
pub mod pid_table;
pub mod scheduler;
pub mod syscall_abi;
pub mod task;
pub mod trapframe;

// These touch real hardware (asm trampolines, GDT/TSS, `int 0x80`) and
// have no meaning on the host test target.
#[cfg(not(test))]
pub mod syscall;
#[cfg(not(test))]
pub mod timer_preempt;
#[cfg(not(test))]
pub mod trapret;
#[cfg(not(test))]
pub mod tss;
#[cfg(not(test))]
pub mod user_demo;
#[cfg(not(test))]
pub mod userspace;

use x86_64::VirtAddr;

use crate::config::Pid;
use crate::error::KResult;
use crate::memory::address_space;
use crate::memory::vma::VmaSpace;
use crate::process::task::{Task, TaskKind};

/// Build the first kernel task (the idle/shell task that owns the
/// boot-time address space) and register it.
pub fn spawn_kernel_task(parent: Option<Pid>) -> KResult<Pid> {
    let pml4 = address_space::kernel_pml4();
    let task = Task::new(0, parent, TaskKind::Kernel, pml4);
    let pid = pid_table::insert(task)?;
    if let Some(handle) = pid_table::get(pid) {
        let mut t = handle.lock();
        t.vmas = VmaSpace::new(pid);
    }
    scheduler::enqueue_global(pid, TaskKind::Kernel);
    Ok(pid)
}

/// Build a fresh user task with an empty address space; the caller
/// (the ELF loader, an external collaborator per §6) populates its
/// VMAs and initial trapframe afterward.
pub fn spawn_user_task(parent: Option<Pid>, entry: VirtAddr, user_stack: VirtAddr) -> KResult<Pid> {
    let pml4 = address_space::new_user_pml4()?;
    let mut task = Task::new(0, parent, TaskKind::User, pml4);
    let (user_cs, user_ss) = user_selectors();
    task.trapframe = trapframe::TrapFrame::new_user(entry.as_u64(), user_stack.as_u64(), user_cs, user_ss);
    let pid = pid_table::insert(task)?;
    if let Some(handle) = pid_table::get(pid) {
        let mut t = handle.lock();
        t.vmas = VmaSpace::new(pid);
    }
    scheduler::enqueue_global(pid, TaskKind::User);
    Ok(pid)
}

#[cfg(not(test))]
fn user_selectors() -> (u64, u64) {
    let (cs, ss) = tss::get_user_selectors();
    (cs.0 as u64, ss.0 as u64)
}

#[cfg(test)]
fn user_selectors() -> (u64, u64) {
    (0, 0)
}
