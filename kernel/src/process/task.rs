// kernel/src/process/task.rs
//
// The task object (§3). Replaces the source's intrusive list-link
// fields (ready-queue link, parent's-children link, zombie-set link,
// waiter link) with plain `Vec<Pid>`/`VecDeque<Pid>` ownership: the PID
// table and scheduler hold tasks by pid and look them up through it,
// rather than chasing raw pointers through embedded links.

use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::Pid;
use crate::error::KResult;
use crate::memory::paging::entry::is_present;
use crate::memory::paging::{walk_page_range, PageTableWalker};
use crate::memory::vma::VmaSpace;
use crate::process::trapframe::TrapFrame;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
    User,
    Kernel,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskStatus {
    Runnable,
    Running,
    NotRunnable,
    Dying,
}

/// What `wait`/`waitpid` is blocked on (§4.8). A plain enum in place of
/// the source's "`task_wait == self` means any child" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitTarget {
    None,
    AnyChild,
    Child(Pid),
}

pub struct Task {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub pml4: PhysAddr,
    pub vmas: VmaSpace,
    pub trapframe: TrapFrame,
    pub children: Vec<Pid>,
    pub zombies: Vec<Pid>,
    pub task_wait: WaitTarget,
    pub exit_code: i32,
    pub cpu: Option<u32>,
}

impl Task {
    pub fn new(pid: Pid, parent: Option<Pid>, kind: TaskKind, pml4: PhysAddr) -> Self {
        Self {
            pid,
            parent,
            kind,
            status: TaskStatus::Runnable,
            pml4,
            vmas: VmaSpace::new(pid),
            trapframe: TrapFrame::default(),
            children: Vec::new(),
            zombies: Vec::new(),
            task_wait: WaitTarget::None,
            exit_code: 0,
            cpu: None,
        }
    }

    /// Count of present PTEs across every VMA — the OOM score (§4.9).
    pub fn oom_score(&self) -> u32 {
        let mut total = 0u32;
        for (_, vma) in self.vmas.iter() {
            let mut counter = PresentCounter { count: 0 };
            let _ = walk_page_range(self.pml4, VirtAddr::new(vma.base), VirtAddr::new(vma.end), &mut counter);
            total += counter.count;
        }
        total
    }
}

struct PresentCounter {
    count: u32,
}

impl PageTableWalker for PresentCounter {
    fn pte(&mut self, entry: &mut x86_64::structures::paging::PageTableEntry, _va: VirtAddr) -> KResult<()> {
        if is_present(entry) {
            self.count += 1;
        }
        Ok(())
    }
}
