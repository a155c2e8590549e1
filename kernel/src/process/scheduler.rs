// kernel/src/process/scheduler.rs
//
// Per-CPU run queues plus a global run queue (§4.7, §5). Round-robin by
// default; `fair_scheduler` inserts onto the global queue ordered by
// jiffies instead of FIFO. `NCPUS` is 1 in this port — the per-CPU
// split is already in place for a port that raises it.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once};

use crate::config::{big_kernel_lock, fair_scheduler_enabled, Pid, TIMESLICE_TICKS};
use crate::process::pid_table;
use crate::process::task::{TaskKind, TaskStatus};

pub const NCPUS: usize = 1;

struct PerCpu {
    runq: VecDeque<Pid>,
    nextq: VecDeque<Pid>,
    current: Option<Pid>,
    ticks_left: u32,
}

impl PerCpu {
    const fn new() -> Self {
        Self { runq: VecDeque::new(), nextq: VecDeque::new(), current: None, ticks_left: TIMESLICE_TICKS }
    }
}

struct GlobalRunq {
    queue: VecDeque<(u64, Pid)>,
    nuser_tasks: u32,
    nkernel_tasks: u32,
}

impl GlobalRunq {
    const fn new() -> Self {
        Self { queue: VecDeque::new(), nuser_tasks: 0, nkernel_tasks: 0 }
    }

    fn insert(&mut self, pid: Pid, stamp: u64) {
        if fair_scheduler_enabled() {
            let pos = self.queue.iter().position(|&(s, _)| s > stamp).unwrap_or(self.queue.len());
            self.queue.insert(pos, (stamp, pid));
        } else {
            self.queue.push_back((stamp, pid));
        }
    }
}

static GLOBAL: Mutex<GlobalRunq> = Mutex::new(GlobalRunq::new());
static PER_CPU: Once<[Mutex<PerCpu>; NCPUS]> = Once::new();
static JIFFIES: AtomicU64 = AtomicU64::new(0);

fn per_cpu(cpu: usize) -> &'static Mutex<PerCpu> {
    &PER_CPU.call_once(|| core::array::from_fn(|_| Mutex::new(PerCpu::new())))[cpu]
}

pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

/// Called once per timer tick, independent of which task (if any) is
/// charged a timeslice tick.
pub fn tick_jiffies() {
    JIFFIES.fetch_add(1, Ordering::Relaxed);
}

/// Put a task on the global run queue — where fresh kernel tasks and
/// fork children always start (§4.8).
pub fn enqueue_global(pid: Pid, kind: TaskKind) {
    let mut g = GLOBAL.lock();
    let stamp = JIFFIES.load(Ordering::Relaxed);
    g.insert(pid, stamp);
    match kind {
        TaskKind::User => g.nuser_tasks += 1,
        TaskKind::Kernel => g.nkernel_tasks += 1,
    }
}

/// Account for a task leaving the system for good (`task_destroy`).
pub fn task_exited(kind: TaskKind) {
    let mut g = GLOBAL.lock();
    match kind {
        TaskKind::User => g.nuser_tasks = g.nuser_tasks.saturating_sub(1),
        TaskKind::Kernel => g.nkernel_tasks = g.nkernel_tasks.saturating_sub(1),
    }
}

pub fn current(cpu: usize) -> Option<Pid> {
    per_cpu(cpu).lock().current
}

/// Best-effort short-circuit for the swap and OOM loops (§5): any task
/// marked `DYING` means memory is about to free up on its own.
pub fn any_dying() -> bool {
    pid_table::any(|task| task.status == TaskStatus::Dying)
}

pub enum YieldOutcome {
    /// Nothing left to run but bookkeeping kernel tasks; halt.
    Idle,
    Next(Pid),
}

/// `sched_yield` (§4.7): move the outgoing task to the local `nextq`,
/// try the local `runq`, and rebalance against the global queue if it
/// ran dry.
pub fn sched_yield(cpu: usize, outgoing: Option<Pid>) -> YieldOutcome {
    {
        let g = GLOBAL.lock();
        if g.nuser_tasks == g.nkernel_tasks {
            return YieldOutcome::Idle;
        }
    }

    let mut local = per_cpu(cpu).lock();
    if let Some(pid) = outgoing {
        local.nextq.push_back(pid);
    }

    if let Some(pid) = local.runq.pop_front() {
        local.current = Some(pid);
        local.ticks_left = TIMESLICE_TICKS;
        return YieldOutcome::Next(pid);
    }

    rebalance(&mut local);

    let picked = local.runq.pop_front();
    local.current = picked;
    local.ticks_left = TIMESLICE_TICKS;
    match picked {
        Some(pid) => YieldOutcome::Next(pid),
        None => YieldOutcome::Idle,
    }
}

fn rebalance(local: &mut PerCpu) {
    core::mem::swap(&mut local.runq, &mut local.nextq);

    if big_kernel_lock() {
        let mut g = GLOBAL.lock();
        pull_or_push(local, &mut g);
    } else if let Some(mut g) = GLOBAL.try_lock() {
        // Fine-grained locking: rebalancing is opportunistic and simply
        // skips this round if the global queue is contended.
        pull_or_push(local, &mut g);
    }
}

fn pull_or_push(local: &mut PerCpu, g: &mut GlobalRunq) {
    let target = (g.nuser_tasks as usize).div_ceil(NCPUS);
    if local.runq.len() < target {
        while local.runq.len() < target {
            match g.queue.pop_front() {
                Some((_, pid)) => local.runq.push_back(pid),
                None => break,
            }
        }
    } else {
        while local.runq.len() > target {
            match local.runq.pop_back() {
                Some(pid) => g.insert(pid, JIFFIES.load(Ordering::Relaxed)),
                None => break,
            }
        }
    }
}

/// Drain `cpu`'s remaining timeslice so the next timer tick forces a
/// reschedule. `sys_yield` uses this: the syscall layer has no way to
/// perform the actual context switch itself, so it only shortens the
/// wait until the timer interrupt does it.
pub fn force_yield(cpu: usize) {
    per_cpu(cpu).lock().ticks_left = 0;
}

/// Charge one timer tick to whichever task is running on `cpu`; `true`
/// means the timeslice is exhausted and the caller should yield.
pub fn charge_tick(cpu: usize) -> bool {
    let mut local = per_cpu(cpu).lock();
    if local.ticks_left == 0 {
        true
    } else {
        local.ticks_left -= 1;
        local.ticks_left == 0
    }
}

pub enum RunDecision {
    Resume(Pid),
    Destroyed(Pid),
}

/// `task_run` (§4.7): a task found `DYING` is destroyed instead of
/// resumed.
pub fn task_run(pid: Pid) -> RunDecision {
    let dying = pid_table::get(pid).map(|t| t.lock().status == TaskStatus::Dying).unwrap_or(true);
    if dying {
        crate::process::lifecycle::task_destroy(pid);
        RunDecision::Destroyed(pid)
    } else {
        if let Some(task) = pid_table::get(pid) {
            task.lock().status = TaskStatus::Running;
        }
        RunDecision::Resume(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_runq_round_robin_is_fifo_by_default() {
        let mut g = GlobalRunq::new();
        g.insert(1, 0);
        g.insert(2, 0);
        g.insert(3, 0);
        let order: alloc::vec::Vec<Pid> = g.queue.iter().map(|&(_, p)| p).collect();
        assert_eq!(order, alloc::vec![1, 2, 3]);
    }

    #[test]
    fn per_cpu_target_share_rounds_up() {
        let mut g = GlobalRunq::new();
        g.nuser_tasks = 5;
        let target = (g.nuser_tasks as usize).div_ceil(NCPUS);
        assert_eq!(target, 5);
    }
}
