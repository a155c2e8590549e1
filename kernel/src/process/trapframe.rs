// kernel/src/process/trapframe.rs
// Basado en xv6's trapframe

/// TrapFrame: Estado del proceso de usuario guardado en el kernel stack
/// cuando ocurre una interrupción/syscall
/// 
/// Layout compatible con el stack frame que IRETQ espera
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    // ============ Guardados por el kernel (pusha/popa) ============
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    
    // ============ Guardados por el HARDWARE (IRETQ frame) ============
    pub rip: u64,      // User instruction pointer
    pub cs: u64,       // User code segment (with RPL=3)
    pub rflags: u64,   // CPU flags
    pub rsp: u64,      // User stack pointer
    pub ss: u64,       // User stack segment (with RPL=3)
}

impl TrapFrame {
    /// Crea un trapframe nuevo para un proceso que nunca ha corrido
    pub fn new_user(entry_point: u64, user_stack: u64, user_cs: u64, user_ss: u64) -> Self {
        Self {
            // Limpiar todos los registros de propósito general
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            
            // IRETQ frame
            rip: entry_point,
            cs: user_cs | 3,  // RPL = 3
            rflags: 0x202,    // Interrupts enabled
            rsp: user_stack,
            ss: user_ss | 3,  // RPL = 3
        }
    }

    /// One-line sanity dump before IRETQ: RPL must be 3 on both
    /// segments and RIP/RSP must sit below `KERNEL_VMA`.
    pub fn debug_print(&self) {
        let bad_rpl = (self.cs & 3) != 3 || (self.ss & 3) != 3;
        let bad_addr = self.rip >= crate::config::KERNEL_VMA || self.rsp >= crate::config::KERNEL_VMA;
        crate::serial_println!(
            "trapframe: rip={:#x} rsp={:#x} cs={:#x} ss={:#x} rflags={:#x}{}",
            self.rip,
            self.rsp,
            self.cs,
            self.ss,
            self.rflags,
            if bad_rpl || bad_addr { " [INVALID]" } else { "" }
        );
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self {
            rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, cs: 0, rflags: 0, rsp: 0, ss: 0,
        }
    }
}