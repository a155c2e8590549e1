// kernel/src/process/pid_table.rs
//
// The PID table (§3): "exclusive owner of task pointers; entry cleared
// on destroy." Slots recycle the same way `memory::rmap`'s arena does,
// bounded at `PID_MAX` entries.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{Pid, PID_MAX};
use crate::error::{KernelError, KResult};
use crate::process::task::Task;

pub type TaskHandle = Arc<Mutex<Task>>;

struct PidTable {
    slots: Vec<Option<TaskHandle>>,
    free_list: Vec<Pid>,
}

impl PidTable {
    const fn new() -> Self {
        Self { slots: Vec::new(), free_list: Vec::new() }
    }

    fn insert(&mut self, task: Task) -> KResult<Pid> {
        if let Some(pid) = self.free_list.pop() {
            self.slots[pid as usize] = Some(Arc::new(Mutex::new(task)));
            return Ok(pid);
        }
        let pid = self.slots.len() as Pid;
        if pid as usize >= PID_MAX {
            return Err(KernelError::OutOfMemory);
        }
        self.slots.push(Some(Arc::new(Mutex::new(task))));
        Ok(pid)
    }

    fn get(&self, pid: Pid) -> Option<TaskHandle> {
        self.slots.get(pid as usize).and_then(|slot| slot.clone())
    }

    fn remove(&mut self, pid: Pid) -> Option<TaskHandle> {
        let handle = self.slots.get_mut(pid as usize)?.take()?;
        self.free_list.push(pid);
        Some(handle)
    }
}

static PID_TABLE: Mutex<PidTable> = Mutex::new(PidTable::new());

/// Register a freshly built task and return its pid.
pub fn insert(task: Task) -> KResult<Pid> {
    let pid = {
        let mut table = PID_TABLE.lock();
        table.insert(task)
    };
    if let Ok(pid) = pid {
        // The table assigns the pid; stamp it back onto the task so the
        // handle is self-describing to anyone holding only the Arc.
        if let Some(handle) = get(pid) {
            handle.lock().pid = pid;
        }
    }
    pid
}

pub fn get(pid: Pid) -> Option<TaskHandle> {
    PID_TABLE.lock().get(pid)
}

/// True if any occupied slot's task satisfies `pred`.
pub fn any(pred: impl Fn(&Task) -> bool) -> bool {
    let table = PID_TABLE.lock();
    table.slots.iter().flatten().any(|handle| pred(&handle.lock()))
}

/// Clear `pid`'s slot. The caller must already have torn down the
/// task's address space and VMAs.
pub fn remove(pid: Pid) -> Option<TaskHandle> {
    PID_TABLE.lock().remove(pid)
}

/// Visit every occupied slot. Handles are cloned out from under the
/// table lock first, so `f` is free to lock each task itself.
pub fn for_each(mut f: impl FnMut(Pid, &Task)) {
    let handles: Vec<(Pid, TaskHandle)> = {
        let table = PID_TABLE.lock();
        table
            .slots
            .iter()
            .enumerate()
            .filter_map(|(pid, slot)| slot.clone().map(|h| (pid as Pid, h)))
            .collect()
    };
    for (pid, handle) in handles {
        f(pid, &handle.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::task::TaskKind;
    use x86_64::PhysAddr;

    #[test]
    fn insert_then_get_round_trips() {
        let task = Task::new(0, None, TaskKind::Kernel, PhysAddr::new(0));
        let pid = insert(task).unwrap();
        let handle = get(pid).expect("task should be present");
        assert_eq!(handle.lock().pid, pid);
        remove(pid);
        assert!(get(pid).is_none());
    }
}
