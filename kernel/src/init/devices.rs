// kernel/src/init/devices.rs
//
// IDT construction, interrupt handlers, PIC/PIT init, boot screen.
//
// The page fault handler lives here because it bridges memory and
// process layers.  User-mode segfaults kill the process; only
// kernel-mode faults panic.

use spin::Once;

use crate::{
    framebuffer::{self, Color},
    interrupts::{
        exception::ExceptionStackFrame,
        idt::InterruptDescriptorTable,
    },
    keyboard,
    serial_println,
};

// ============================================================================
// IDT
// ============================================================================

static IDT: Once<InterruptDescriptorTable> = Once::new();

extern "C" {
    fn syscall_entry();
}

pub fn init_idt() {
    IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.add_handler(0, divide_by_zero_handler);
        idt.add_handler(6, invalid_opcode_handler);
        // IST index is 1-based in the IDT entry.  TSS defines
        // DOUBLE_FAULT_IST_INDEX = 0 (array index), so CPU IST = 0 + 1 = 1.
        idt.add_double_fault_handler(
            8,
            double_fault_handler,
            (crate::process::tss::DOUBLE_FAULT_IST_INDEX + 1) as u16,
        );
        idt.add_handler_with_error(13, general_protection_fault_handler);
        idt.add_handler_with_error(14, page_fault_handler);
        idt.entries[32].set_handler_addr(crate::process::timer_preempt::timer_interrupt_entry as u64);
        idt.add_handler(33, keyboard_interrupt_handler);
        idt.entries[0x80]
            .set_handler_addr(syscall_entry as u64)
            .set_privilege_level(3);
        idt
    });
}

fn load_idt() {
    IDT.get().unwrap().load();
}

// ============================================================================
// Page fault error code bits
// ============================================================================

const PF_USER: u64 = 1 << 2;

fn read_cr2() -> u64 {
    use x86_64::registers::control::Cr2;
    Cr2::read_raw()
}

// ============================================================================
// INTERRUPT HANDLERS
// ============================================================================

extern "x86-interrupt" fn keyboard_interrupt_handler(_: &mut ExceptionStackFrame) {
    let scancode = unsafe {
        x86_64::instructions::port::PortReadOnly::<u8>::new(0x60).read()
    };
    keyboard::process_scancode(scancode);
    crate::interrupts::pic::end_of_interrupt(crate::interrupts::pic::Irq::Keyboard.as_u8());
}

extern "x86-interrupt" fn divide_by_zero_handler(sf: &mut ExceptionStackFrame) {
    if sf.code_segment & 0x3 != 0 {
        if let Some(pid) = crate::process::scheduler::current(0) {
            serial_println!("divide by zero: pid {}", pid);
            kill_current_user_process(pid, sf);
            return;
        }
    }
    panic!("DIVIDE BY ZERO at {:#x}", sf.instruction_pointer);
}

extern "x86-interrupt" fn invalid_opcode_handler(sf: &mut ExceptionStackFrame) {
    if sf.code_segment & 0x3 != 0 {
        if let Some(pid) = crate::process::scheduler::current(0) {
            serial_println!("invalid opcode: pid {}", pid);
            kill_current_user_process(pid, sf);
            return;
        }
    }
    panic!("INVALID OPCODE at {:#x}", sf.instruction_pointer);
}

extern "x86-interrupt" fn double_fault_handler(
    sf: &mut ExceptionStackFrame,
    error_code: u64
) -> ! {
    panic!("DOUBLE FAULT (error: {}) at {:#x}", error_code, sf.instruction_pointer);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    sf: &mut ExceptionStackFrame,
    error_code: u64
) {
    if sf.code_segment & 0x3 != 0 {
        if let Some(pid) = crate::process::scheduler::current(0) {
            serial_println!("general protection fault: pid {} (error {})", pid, error_code);
            kill_current_user_process(pid, sf);
            return;
        }
    }
    panic!("GENERAL PROTECTION FAULT (error: {}) at {:#x}", error_code, sf.instruction_pointer);
}

/// Page fault handler — bridges memory and process layers. Dispatches
/// to `memory::fault::handle`; a segfault either kills the offending
/// user task and schedules whatever runs next, or panics if the fault
/// came from kernel mode.
extern "x86-interrupt" fn page_fault_handler(
    sf: &mut ExceptionStackFrame,
    error_code: u64
) {
    use crate::memory::fault::{self, FaultOutcome};
    use crate::process::scheduler;
    use x86_64::VirtAddr;

    let fault_addr = read_cr2();
    let is_user = error_code & PF_USER != 0;

    let pid = match scheduler::current(0) {
        Some(p) => p,
        None => {
            if is_user {
                panic!("PAGE FAULT from user mode with no current task");
            }
            panic!(
                "PAGE FAULT (kernel)\n  Address: {:#x}\n  Error: {:#b}\n  RIP: {:#x}",
                fault_addr, error_code, sf.instruction_pointer
            );
        }
    };

    match fault::handle(pid, VirtAddr::new(fault_addr), error_code) {
        FaultOutcome::Resolved => {}
        FaultOutcome::Segfault if is_user => {
            serial_println!("segfault: pid {} at {:#x} (error {:#b})", pid, fault_addr, error_code);
            kill_current_user_process(pid, sf);
        }
        FaultOutcome::Segfault => {
            panic!(
                "PAGE FAULT (kernel)\n  Address: {:#x}\n  Error: {:#b}\n  RIP: {:#x}",
                fault_addr, error_code, sf.instruction_pointer
            );
        }
    }
}

// ============================================================================
// Kill user process and schedule next
// ============================================================================

/// Kill the current user task and switch to whatever runs next.
///
/// Called from exception handlers when the fault originated in user mode
/// (Ring 3). Overwrites the exception stack frame's IRETQ fields so the
/// CPU lands on the next task instead of retrying the faulting
/// instruction; GP registers are left as the faulting task's, which
/// only matters for the single instruction IRETQ completes before the
/// next timer tick saves the new task's own registers over them.
fn kill_current_user_process(pid: crate::config::Pid, sf: &mut ExceptionStackFrame) {
    crate::process::lifecycle::kill(pid, -1).ok();
    crate::process::lifecycle::task_destroy(pid);

    match crate::process::timer_preempt::reschedule_after_kill() {
        Some(tf) => {
            sf.instruction_pointer = tf.rip;
            sf.code_segment = tf.cs;
            sf.cpu_flags = tf.rflags;
            sf.stack_pointer = tf.rsp;
            sf.stack_segment = tf.ss;
            serial_println!("  -> switched to next task");
        }
        None => {
            serial_println!("  -> nothing left to run, halting");
            loop {
                unsafe { core::arch::asm!("hlt"); }
            }
        }
    }
}

// ============================================================================
// HARDWARE INIT
// ============================================================================

/// Draw the initial boot screen (after allocators are ready).
pub fn draw_boot_screen() {
    let mut fb = framebuffer::FRAMEBUFFER.lock();
    if let Some(fb) = fb.as_mut() {
        fb.clear(Color::rgb(0, 0, 0));
        fb.draw_text(10, 10, "ConstanOS v0.1", Color::rgb(0, 200, 255), Color::rgb(0, 0, 0), 2);
        fb.draw_text(10, 770, "Allocator: Ready", Color::rgb(0, 255, 0), Color::rgb(0, 0, 0), 2);
    }
}

/// PIC + PIT + load IDT.
pub fn init_hardware_interrupts() {
    crate::interrupts::pic::initialize();
    crate::interrupts::pic::enable_irq(0);
    crate::interrupts::pic::enable_irq(1);
    load_idt();

    crate::pit::init(100);
}