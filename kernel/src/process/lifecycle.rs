// kernel/src/process/lifecycle.rs
//
// fork/wait/waitpid/kill/task_destroy (§4.8). Suspension (the actual
// context switch away from a blocked or dying task) is the timer/trap
// layer's job; this module only manages task state and memory teardown.

use alloc::vec::Vec;

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{Pid, PAGE_SIZE};
use crate::error::{KernelError, KResult, LifecycleFault};
use crate::memory::address_space;
use crate::memory::paging;
use crate::memory::vma::{Vma, VmaId, VmaSpace};
use crate::process::pid_table::{self, TaskHandle};
use crate::process::scheduler;
use crate::process::task::{Task, TaskStatus, WaitTarget};

fn wait_matches(target: WaitTarget, candidate: Pid) -> bool {
    match target {
        WaitTarget::AnyChild => true,
        WaitTarget::Child(p) => p == candidate,
        WaitTarget::None => false,
    }
}

/// `fork` (§4.8): new task, parent's register frame with `rax = 0`, a
/// fresh PML4 with only the kernel half populated, every parent VMA
/// duplicated onto the shared rmap, and every present writable PTE in
/// range downgraded to read-only on both sides (COW).
pub fn fork(parent_pid: Pid) -> KResult<Pid> {
    let parent_handle = pid_table::get(parent_pid)
        .ok_or(KernelError::LifecycleViolation(LifecycleFault::NoSuchPid))?;

    let child_pml4 = address_space::new_user_pml4()?;

    let (kind, trapframe, parent_pml4, vma_snapshot) = {
        let parent = parent_handle.lock();
        let vmas: Vec<Vma> = parent.vmas.iter().map(|(_, v)| v.clone()).collect();
        (parent.kind, parent.trapframe, parent.pml4, vmas)
    };

    let mut child = Task::new(0, Some(parent_pid), kind, child_pml4);
    child.trapframe = trapframe;
    child.trapframe.rax = 0;
    let child_pid = pid_table::insert(child)?;
    let child_handle = pid_table::get(child_pid).expect("just inserted");

    {
        let mut child_task = child_handle.lock();
        child_task.vmas = VmaSpace::new(child_pid);
        for vma in &vma_snapshot {
            child_task.vmas.insert_vma(vma.clone())?;
        }
    }

    for vma in &vma_snapshot {
        let rmap_id = vma.rmap_id.expect("every reachable vma owns an rmap");
        let owner = paging::Owner { pid: child_pid, rmap_id };
        duplicate_mapped_pages(parent_pml4, child_pml4, VirtAddr::new(vma.base), VirtAddr::new(vma.end), owner)?;
    }

    parent_handle.lock().children.push(child_pid);
    scheduler::enqueue_global(child_pid, kind);
    Ok(child_pid)
}

fn duplicate_mapped_pages(
    parent_pml4: PhysAddr,
    child_pml4: PhysAddr,
    base: VirtAddr,
    end: VirtAddr,
    owner: paging::Owner,
) -> KResult<()> {
    let mut va = base;
    while va < end {
        if let paging::Lookup::Present { frame, flags } = paging::lookup(parent_pml4, va)? {
            let ro_flags = flags & !PageTableFlags::WRITABLE;
            if flags.contains(PageTableFlags::WRITABLE) {
                paging::protect(parent_pml4, va, va + PAGE_SIZE, ro_flags)?;
            }
            paging::insert(child_pml4, va, frame, ro_flags, Some(owner))?;
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

pub enum WaitOutcome {
    Reaped(Pid, i32),
    /// No matching zombie yet; the task has been marked not-runnable
    /// and decremented from the schedulable count. The caller must
    /// yield off this task.
    Blocked,
}

/// `wait`/`waitpid` (§4.8). `target = None` waits for any child.
pub fn wait(caller: Pid, target: Option<Pid>) -> KResult<WaitOutcome> {
    let handle = pid_table::get(caller)
        .ok_or(KernelError::LifecycleViolation(LifecycleFault::NoSuchPid))?;

    let wait_target = match target {
        Some(child) => WaitTarget::Child(child),
        None => WaitTarget::AnyChild,
    };

    {
        let mut task = handle.lock();
        if task.children.is_empty() && task.zombies.is_empty() {
            return Err(KernelError::LifecycleViolation(LifecycleFault::NoChildren));
        }
        if let Some(child) = target {
            if !task.children.contains(&child) && !task.zombies.contains(&child) {
                return Err(KernelError::LifecycleViolation(LifecycleFault::NotAChild));
            }
        }
        task.task_wait = wait_target;
    }

    if let Some((zpid, code)) = reap_matching_zombie(&handle, wait_target) {
        return Ok(WaitOutcome::Reaped(zpid, code));
    }

    let mut task = handle.lock();
    if task.status != TaskStatus::NotRunnable {
        task.status = TaskStatus::NotRunnable;
        scheduler::task_exited(task.kind);
    }
    Ok(WaitOutcome::Blocked)
}

fn reap_matching_zombie(handle: &TaskHandle, target: WaitTarget) -> Option<(Pid, i32)> {
    let zpid = {
        let task = handle.lock();
        task.zombies.iter().copied().find(|&z| wait_matches(target, z))
    }?;
    let exit_code = pid_table::get(zpid).map(|z| z.lock().exit_code).unwrap_or(0);
    {
        let mut task = handle.lock();
        task.zombies.retain(|&z| z != zpid);
        task.task_wait = WaitTarget::None;
    }
    pid_table::remove(zpid);
    Some((zpid, exit_code))
}

/// Mark `pid` `DYING`. If it is the task currently running on this CPU,
/// the caller must yield immediately afterward so the kill completes
/// off-CPU (§4.8) — `task_run` destroys any task it finds `DYING`.
pub fn kill(pid: Pid, exit_code: i32) -> KResult<()> {
    let handle = pid_table::get(pid)
        .ok_or(KernelError::LifecycleViolation(LifecycleFault::NoSuchPid))?;
    let mut task = handle.lock();
    task.status = TaskStatus::Dying;
    task.exit_code = exit_code;
    Ok(())
}

/// `task_destroy` (§4.8): unmap every user page, drop VMAs, and free
/// the PML4 immediately. The PID slot itself, and the `Task` object,
/// survive as a zombie until a waiting parent reaps it — or are freed
/// on the spot if there is no live parent to reap them.
pub fn task_destroy(pid: Pid) {
    let handle = match pid_table::get(pid) {
        Some(h) => h,
        None => return,
    };

    let own_zombies: Vec<Pid> = {
        let mut task = handle.lock();
        task.status = TaskStatus::Dying;
        core::mem::take(&mut task.zombies)
    };
    for z in own_zombies {
        pid_table::remove(z);
    }

    let (kind, pml4, parent) = {
        let mut task = handle.lock();
        let vma_ids: Vec<VmaId> = task.vmas.iter().map(|(id, _)| id).collect();
        let ranges: Vec<(u64, u64)> = task.vmas.iter().map(|(_, v)| (v.base, v.end)).collect();
        for (base, end) in ranges {
            let _ = paging::unmap_page_range(task.pml4, VirtAddr::new(base), VirtAddr::new(end));
        }
        for id in vma_ids {
            task.vmas.remove_vma(id);
        }
        (task.kind, task.pml4, task.parent)
    };
    unsafe { address_space::free_pml4(pml4) };
    scheduler::task_exited(kind);

    match parent.and_then(pid_table::get) {
        Some(parent_handle) => {
            let exit_code = handle.lock().exit_code;
            let mut parent_task = parent_handle.lock();
            parent_task.children.retain(|&c| c != pid);
            parent_task.zombies.push(pid);
            crate::serial_println!("lifecycle: pid {} zombied, exit_code={}", pid, exit_code);
            if wait_matches(parent_task.task_wait, pid) {
                parent_task.task_wait = WaitTarget::None;
                if parent_task.status == TaskStatus::NotRunnable {
                    parent_task.status = TaskStatus::Runnable;
                    let parent_pid = parent_task.pid;
                    let parent_kind = parent_task.kind;
                    drop(parent_task);
                    scheduler::enqueue_global(parent_pid, parent_kind);
                }
            }
        }
        None => {
            pid_table::remove(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_matches_any_child_matches_everything() {
        assert!(wait_matches(WaitTarget::AnyChild, 7));
        assert!(wait_matches(WaitTarget::AnyChild, 0));
    }

    #[test]
    fn wait_matches_specific_child_is_exact() {
        assert!(wait_matches(WaitTarget::Child(3), 3));
        assert!(!wait_matches(WaitTarget::Child(3), 4));
    }

    #[test]
    fn wait_matches_none_matches_nothing() {
        assert!(!wait_matches(WaitTarget::None, 1));
    }
}
