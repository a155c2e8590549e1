// kernel/src/process/timer_preempt.rs
//
// Timer-driven preemption (§4.7). The asm trampoline pushes a full GPR
// set on top of the hardware IRETQ frame; the combined 20 fields line
// up exactly with `TrapFrame`, so the handler just hands back whichever
// pointer it wants restored. IRETQ does not care whether that frame was
// pushed by this interrupt or synthesized earlier by
// `TrapFrame::new_user` — the same mechanism serves both a task's very
// first dispatch and every later resume.

use core::arch::global_asm;

use crate::config::Pid;
use crate::process::pid_table;
use crate::process::scheduler::{self, RunDecision, YieldOutcome};
use crate::process::task::TaskKind;
use crate::process::trapframe::TrapFrame;

global_asm!(
    ".global timer_interrupt_entry",
    "timer_interrupt_entry:",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "call timer_preempt_handler",
    "mov rsp, rax",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "iretq",
);

extern "C" {
    pub fn timer_interrupt_entry();
}

const CPU: usize = 0;

#[no_mangle]
pub extern "C" fn timer_preempt_handler(current_tf: *mut TrapFrame) -> *const TrapFrame {
    unsafe {
        use x86_64::instructions::port::PortWriteOnly;
        PortWriteOnly::<u8>::new(0x20).write(0x20);
    }
    scheduler::tick_jiffies();

    let outgoing = scheduler::current(CPU);
    if let Some(pid) = outgoing {
        save_trapframe(pid, current_tf);
    }

    if !scheduler::charge_tick(CPU) {
        return current_tf;
    }

    dispatch(outgoing).unwrap_or(current_tf)
}

fn save_trapframe(pid: Pid, tf: *const TrapFrame) {
    if let Some(handle) = pid_table::get(pid) {
        let mut task = handle.lock();
        if task.kind == TaskKind::User {
            task.trapframe = unsafe { *tf };
        }
    }
}

/// Pick and resume the next runnable task on `CPU`, retrying past any
/// found `DYING` by the time they're reached (`task_run` destroys
/// those instead of resuming them). `None` means nothing is runnable —
/// the caller keeps whatever is currently executing.
fn dispatch(mut outgoing: Option<Pid>) -> Option<*const TrapFrame> {
    loop {
        match scheduler::sched_yield(CPU, outgoing.take()) {
            YieldOutcome::Idle => return None,
            YieldOutcome::Next(pid) => match scheduler::task_run(pid) {
                RunDecision::Destroyed(_) => continue,
                RunDecision::Resume(pid) => {
                    let handle = pid_table::get(pid)?;
                    // The pointer outlives this lock: `pid_table` keeps
                    // the Arc alive and the Task's address never moves.
                    let ptr = {
                        let task = handle.lock();
                        &task.trapframe as *const TrapFrame
                    };
                    return Some(ptr);
                }
            },
        }
    }
}

/// Used by exception handlers (§4.11) right after killing the
/// currently running task: pick whatever runs next with nothing to
/// re-enqueue. `None` means this CPU has nothing left to run.
pub fn reschedule_after_kill() -> Option<TrapFrame> {
    loop {
        match scheduler::sched_yield(CPU, None) {
            YieldOutcome::Idle => return None,
            YieldOutcome::Next(pid) => match scheduler::task_run(pid) {
                RunDecision::Destroyed(_) => continue,
                RunDecision::Resume(pid) => {
                    let handle = pid_table::get(pid)?;
                    return Some(handle.lock().trapframe);
                }
            },
        }
    }
}
