// kernel/src/process/syscall.rs
//
// The user/kernel trap boundary (§6): `int 0x80` pushes into
// `syscall_entry`, which saves every GPR and hands a pointer to them to
// `syscall_handler_asm`. Dispatch and every syscall body below are
// plain Rust working against `pid_table`/`scheduler`/`lifecycle`/the
// memory subsystem; only the entry/exit trampoline is hand-written asm.

use core::arch::global_asm;

use x86_64::{PhysAddr, VirtAddr};

use crate::allocator::buddy_allocator::BuddyAllocator;
use crate::config::{Pid, PAGE_SIZE, USER_LIM};
use crate::errno;
use crate::error::KernelError;
use crate::memory::paging::{self, Lookup, Owner};
use crate::memory::vma::{Vma, VmaFlags, VmaId, VmaSpace};
use crate::process::pid_table::{self, TaskHandle};
use crate::process::scheduler;
use crate::process::syscall_abi::{
    vma_flags_from_prot, MmapFlags, SyscallNumber, SyscallResult, MADV_DONTNEED, MADV_WILLNEED,
    MAP_FAILED,
};
use crate::process::task::Task;

global_asm!(
    ".global syscall_entry",
    "syscall_entry:",
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
    "call syscall_handler_asm",
    "mov [rsp], rax",
    "pop rax",
    "pop rbx",
    "pop rcx",
    "pop rdx",
    "pop rsi",
    "pop rdi",
    "pop rbp",
    "pop r8",
    "pop r9",
    "pop r10",
    "pop r11",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    "iretq",
);

#[repr(C)]
struct SavedRegisters {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
}

#[no_mangle]
extern "C" fn syscall_handler_asm(regs: &SavedRegisters) -> i64 {
    syscall_handler(regs.rax, regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9)
}

/// `mquery` output (§6): either the VMA containing `addr`, or the free
/// gap surrounding it with `flags == 0`.
#[repr(C)]
struct MqueryInfo {
    base: u64,
    end: u64,
    flags: u32,
    is_vma: u32,
}

pub fn syscall_handler(
    syscall_num: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    let syscall = match SyscallNumber::from_u64(syscall_num) {
        Some(s) => s,
        None => return -errno::ENOSYS,
    };

    match syscall {
        SyscallNumber::Cputs => sys_cputs(arg1, arg2),
        SyscallNumber::Cgetc => sys_cgetc(),
        SyscallNumber::GetPid => sys_getpid(),
        SyscallNumber::GetCpuId => sys_getcpuid(),
        SyscallNumber::Kill => sys_kill(arg1 as Pid),
        SyscallNumber::Mquery => sys_mquery(arg1, arg2),
        SyscallNumber::Mmap => sys_mmap(arg1, arg2, arg3, arg4, arg5),
        SyscallNumber::Munmap => sys_munmap(arg1, arg2),
        SyscallNumber::Mprotect => sys_mprotect(arg1, arg2, arg3),
        SyscallNumber::Madvise => sys_madvise(arg1, arg2, arg3),
        SyscallNumber::Yield => sys_yield(),
        SyscallNumber::Fork => sys_fork(),
        SyscallNumber::Wait => sys_wait(arg1),
        SyscallNumber::Waitpid => sys_waitpid(arg1 as Pid, arg2, arg3),
    }
}

fn current_handle() -> Option<(Pid, TaskHandle)> {
    let pid = scheduler::current(0)?;
    let handle = pid_table::get(pid)?;
    Some((pid, handle))
}

fn direct_map(phys: PhysAddr) -> *const u8 {
    let offset = crate::memory::physical_memory_offset().as_u64();
    (offset + phys.as_u64()) as *const u8
}

fn direct_map_mut(phys: PhysAddr) -> *mut u8 {
    let offset = crate::memory::physical_memory_offset().as_u64();
    (offset + phys.as_u64()) as *mut u8
}

/// Copy `len` bytes starting at user virtual address `addr`, checking
/// every page touched is present and carries `required` among its VMA
/// flags.
fn copy_from_user(pml4: PhysAddr, vmas: &VmaSpace, addr: u64, len: u64, required: VmaFlags) -> Result<alloc::vec::Vec<u8>, KernelError> {
    let end = addr.checked_add(len).ok_or(KernelError::AddressSpaceViolation)?;
    let mut out = alloc::vec::Vec::with_capacity(len as usize);
    let mut va = addr;
    while va < end {
        let vma = vmas.iter().map(|(_, v)| v).find(|v| v.contains(va)).ok_or(KernelError::AddressSpaceViolation)?;
        if !vma.flags.contains(required) {
            return Err(KernelError::PermissionViolation);
        }
        let page_base = va & !(PAGE_SIZE - 1);
        let offset = (va - page_base) as usize;
        let take = core::cmp::min(PAGE_SIZE as usize - offset, (end - va) as usize);
        match paging::lookup(pml4, VirtAddr::new(page_base))? {
            Lookup::Present { frame, .. } => {
                let ptr = direct_map(BuddyAllocator::frame_to_addr(frame));
                let slice = unsafe { core::slice::from_raw_parts(ptr.add(offset), take) };
                out.extend_from_slice(slice);
            }
            _ => return Err(KernelError::AddressSpaceViolation),
        }
        va += take as u64;
    }
    Ok(out)
}

/// Write `bytes` to user virtual address `addr`, same page-walking and
/// permission-checking discipline as `copy_from_user`.
fn copy_to_user(pml4: PhysAddr, vmas: &VmaSpace, addr: u64, bytes: &[u8]) -> Result<(), KernelError> {
    let end = addr.checked_add(bytes.len() as u64).ok_or(KernelError::AddressSpaceViolation)?;
    let mut va = addr;
    let mut written = 0usize;
    while va < end {
        let vma = vmas.iter().map(|(_, v)| v).find(|v| v.contains(va)).ok_or(KernelError::AddressSpaceViolation)?;
        if !vma.flags.contains(VmaFlags::WRITE) {
            return Err(KernelError::PermissionViolation);
        }
        let page_base = va & !(PAGE_SIZE - 1);
        let offset = (va - page_base) as usize;
        let take = core::cmp::min(PAGE_SIZE as usize - offset, (end - va) as usize);
        match paging::lookup(pml4, VirtAddr::new(page_base))? {
            Lookup::Present { frame, .. } => {
                let ptr = direct_map_mut(BuddyAllocator::frame_to_addr(frame));
                unsafe { core::ptr::copy_nonoverlapping(bytes[written..written + take].as_ptr(), ptr.add(offset), take) };
            }
            _ => return Err(KernelError::AddressSpaceViolation),
        }
        va += take as u64;
        written += take;
    }
    Ok(())
}

/// `cputs(ptr, len)` (§6): read-permission check, then write the bytes
/// out the serial console.
fn sys_cputs(ptr: u64, len: u64) -> SyscallResult {
    let (_, handle) = match current_handle() {
        Some(h) => h,
        None => return -1,
    };
    let bytes = {
        let task = handle.lock();
        match copy_from_user(task.pml4, &task.vmas, ptr, len, VmaFlags::READ) {
            Ok(bytes) => bytes,
            Err(e) => return e.to_errno(),
        }
    };
    for byte in &bytes {
        crate::serial_print_raw!("{}", *byte as char);
    }
    len as SyscallResult
}

/// `cgetc()` (§6): non-blocking, `-EAGAIN` when nothing is buffered.
fn sys_cgetc() -> SyscallResult {
    match crate::keyboard::read_from_buffer() {
        Some(c) => c as u32 as SyscallResult,
        None => -errno::EAGAIN,
    }
}

fn sys_getpid() -> SyscallResult {
    current_handle().map(|(pid, _)| pid as SyscallResult).unwrap_or(-1)
}

fn sys_getcpuid() -> SyscallResult {
    0
}

/// `kill(pid)` (§6): only a direct parent may kill a child; destruction
/// happens immediately rather than waiting for the victim to be
/// scheduled, so memory and the zombie slot are visible to a
/// subsequent `wait` right away.
fn sys_kill(target: Pid) -> SyscallResult {
    let (caller, _) = match current_handle() {
        Some(h) => h,
        None => return -1,
    };
    let owned_by_caller = pid_table::get(target).map(|t| t.lock().parent == Some(caller)).unwrap_or(false);
    if !owned_by_caller {
        return -1;
    }
    if crate::process::lifecycle::kill(target, -9).is_err() {
        return -1;
    }
    crate::process::lifecycle::task_destroy(target);
    0
}

/// `mquery(info, addr)` (§6): describes the VMA containing `addr`, or
/// the surrounding free gap if there is none.
fn sys_mquery(info_ptr: u64, addr: u64) -> SyscallResult {
    let (_, handle) = match current_handle() {
        Some(h) => h,
        None => return -1,
    };
    let info = {
        let task = handle.lock();
        match task.vmas.iter().map(|(_, v)| v).find(|v| v.contains(addr)) {
            Some(vma) => MqueryInfo { base: vma.base, end: vma.end, flags: vma.flags.bits(), is_vma: 1 },
            None => {
                let (base, end) = task.vmas.find_free_vma(addr);
                MqueryInfo { base, end, flags: 0, is_vma: 0 }
            }
        }
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(&info as *const MqueryInfo as *const u8, core::mem::size_of::<MqueryInfo>())
    };
    let task = handle.lock();
    match copy_to_user(task.pml4, &task.vmas, info_ptr, bytes) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// Remove every VMA covering `[base, end)`, splitting at the boundary
/// where a surviving VMA straddles it, and unmap the underlying pages.
/// Shared by `munmap` and `mmap(MAP_FIXED)`.
fn unmap_range(task: &mut Task, base: u64, end: u64) -> Result<(), KernelError> {
    paging::unmap_page_range(task.pml4, VirtAddr::new(base), VirtAddr::new(end))?;
    let overlapping: alloc::vec::Vec<VmaId> = task
        .vmas
        .iter()
        .filter(|(_, v)| v.base < end && v.end > base)
        .map(|(id, _)| id)
        .collect();
    for id in overlapping {
        let (vbase, vend) = {
            let v = task.vmas.get(id).expect("id came from this same vmas iteration");
            (v.base, v.end)
        };
        let remove_id = if vbase >= base && vend <= end {
            id
        } else if vbase < base && vend > end {
            task.vmas.split_vmas(id, base, end - base)?
        } else if vbase < base {
            task.vmas.split_vma(id, base)?
        } else {
            task.vmas.split_vma(id, end)?;
            id
        };
        task.vmas.remove_vma(remove_id);
    }
    Ok(())
}

/// `mmap(addr, len, prot, flags, fd, off)` (§6). Only anonymous private
/// mappings are supported; `fd`/`off` are ignored. `MAP_FIXED` clears
/// any overlap first; otherwise placement follows `VmaSpace::add_vma`.
fn sys_mmap(addr: u64, len: u64, prot: u64, flags: u64, _fd_off: u64) -> SyscallResult {
    let mmap_flags = match MmapFlags::from_bits(flags as u32) {
        Some(f) => f,
        None => return MAP_FAILED,
    };
    if !mmap_flags.contains(MmapFlags::MAP_ANONYMOUS | MmapFlags::MAP_PRIVATE) {
        return MAP_FAILED;
    }
    if len == 0 {
        return MAP_FAILED;
    }
    let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    if addr.checked_add(len).map(|e| e > USER_LIM).unwrap_or(true) {
        return MAP_FAILED;
    }
    let vma_flags = vma_flags_from_prot(prot);

    let (_, handle) = match current_handle() {
        Some(h) => h,
        None => return MAP_FAILED,
    };
    let mut task = handle.lock();

    let (base, id) = if mmap_flags.contains(MmapFlags::MAP_FIXED) {
        if addr == 0 || unmap_range(&mut task, addr, addr + len).is_err() {
            return MAP_FAILED;
        }
        let vma = Vma { base: addr, end: addr + len, name: "mmap", flags: vma_flags, source: None, rmap_id: None };
        match task.vmas.insert_vma(vma) {
            Ok(id) => (addr, id),
            Err(_) => return MAP_FAILED,
        }
    } else {
        match task.vmas.add_vma(addr, len, vma_flags, "mmap", None) {
            Ok(placed) => placed,
            Err(_) => return MAP_FAILED,
        }
    };
    let id = task.vmas.merge_vmas(id);

    if mmap_flags.contains(MmapFlags::MAP_POPULATE) {
        let rmap_id = task.vmas.get(id).and_then(|v| v.rmap_id).expect("insert_vma always assigns an rmap");
        let pml4 = task.pml4;
        let pid = task.pid;
        let pt_flags = vma_flags.to_page_table_flags();
        if paging::populate(pml4, VirtAddr::new(base), VirtAddr::new(base + len), pt_flags, Owner { pid, rmap_id }).is_err() {
            task.vmas.remove_vma(id);
            return MAP_FAILED;
        }
    }

    base as SyscallResult
}

/// `munmap(addr, len)` (§6).
fn sys_munmap(addr: u64, len: u64) -> SyscallResult {
    if len == 0 {
        return -1;
    }
    let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let (_, handle) = match current_handle() {
        Some(h) => h,
        None => return -1,
    };
    let mut task = handle.lock();
    match unmap_range(&mut task, addr, addr + len) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

fn split_at_boundary(vmas: &mut VmaSpace, addr: u64) {
    if let Some((id, _)) = vmas.iter().find(|(_, v)| v.base < addr && v.end > addr) {
        let _ = vmas.split_vma(id, addr);
    }
}

/// `mprotect(addr, len, prot)` (§6): splits any VMA straddling the
/// range's boundaries, rewrites the flags of every VMA now fully
/// inside it, and re-applies the PTE bits over the present pages.
fn sys_mprotect(addr: u64, len: u64, prot: u64) -> SyscallResult {
    if len == 0 {
        return -1;
    }
    let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let end = addr + len;
    let new_flags = vma_flags_from_prot(prot);

    let (_, handle) = match current_handle() {
        Some(h) => h,
        None => return -1,
    };
    let mut task = handle.lock();

    split_at_boundary(&mut task.vmas, addr);
    split_at_boundary(&mut task.vmas, end);

    let ids: alloc::vec::Vec<VmaId> = task
        .vmas
        .iter()
        .filter(|(_, v)| v.base >= addr && v.end <= end)
        .map(|(id, _)| id)
        .collect();
    if ids.is_empty() {
        return -1;
    }
    for id in ids {
        if let Some(v) = task.vmas.get_mut(id) {
            v.flags = new_flags;
        }
    }
    let pml4 = task.pml4;
    match paging::protect(pml4, VirtAddr::new(addr), VirtAddr::new(end), new_flags.to_page_table_flags()) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// `madvise(addr, len, advice)` (§6): `DONTNEED` frees present frames
/// without touching VMA bookkeeping (a later fault repopulates them
/// lazily); `WILLNEED` eagerly populates every not-present page.
fn sys_madvise(addr: u64, len: u64, advice: u64) -> SyscallResult {
    if len == 0 {
        return -1;
    }
    let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let end = addr + len;

    let (pid, handle) = match current_handle() {
        Some(h) => h,
        None => return -1,
    };
    let task = handle.lock();
    let pml4 = task.pml4;

    match advice {
        MADV_DONTNEED => match paging::unmap_page_range(pml4, VirtAddr::new(addr), VirtAddr::new(end)) {
            Ok(()) => 0,
            Err(e) => e.to_errno(),
        },
        MADV_WILLNEED => {
            for (_, vma) in task.vmas.iter() {
                let seg_base = core::cmp::max(addr, vma.base);
                let seg_end = core::cmp::min(end, vma.end);
                if seg_base >= seg_end {
                    continue;
                }
                let rmap_id = match vma.rmap_id {
                    Some(r) => r,
                    None => continue,
                };
                let flags = vma.flags.to_page_table_flags();
                let mut va = seg_base;
                while va < seg_end {
                    let absent = matches!(paging::lookup(pml4, VirtAddr::new(va)), Ok(Lookup::Absent));
                    if absent {
                        let res = paging::populate(pml4, VirtAddr::new(va), VirtAddr::new(va + PAGE_SIZE), flags, Owner { pid, rmap_id });
                        if let Err(e) = res {
                            return e.to_errno();
                        }
                    }
                    va += PAGE_SIZE;
                }
            }
            0
        }
        _ => -1,
    }
}

/// `yield()` (§6): the syscall layer can't itself perform a context
/// switch — that happens on the next timer interrupt — so this only
/// drains the caller's remaining timeslice to force one promptly.
fn sys_yield() -> SyscallResult {
    scheduler::force_yield(0);
    0
}

fn sys_fork() -> SyscallResult {
    let (pid, _) = match current_handle() {
        Some(h) => h,
        None => return -1,
    };
    match crate::process::lifecycle::fork(pid) {
        Ok(child) => child as SyscallResult,
        Err(e) => e.to_errno(),
    }
}

/// `wait`/`waitpid` (§6). A zombie ready to reap is returned
/// immediately; otherwise this returns `-EAGAIN` rather than actually
/// blocking, since suspending the calling task across this syscall
/// boundary needs the timer/trap layer's cooperation, which a `wait`
/// call can't reach on its own — callers spin-retry, the same pattern
/// `DeviceBusy` already uses for a busy disk.
fn sys_waitpid(target: Pid, status_ptr: u64, _options: u64) -> SyscallResult {
    wait_impl(Some(target), status_ptr)
}

fn sys_wait(status_ptr: u64) -> SyscallResult {
    wait_impl(None, status_ptr)
}

fn wait_impl(target: Option<Pid>, status_ptr: u64) -> SyscallResult {
    let (caller, handle) = match current_handle() {
        Some(h) => h,
        None => return -1,
    };
    match crate::process::lifecycle::wait(caller, target) {
        Ok(crate::process::lifecycle::WaitOutcome::Reaped(pid, code)) => {
            if status_ptr != 0 {
                let task = handle.lock();
                let bytes = code.to_ne_bytes();
                if let Err(e) = copy_to_user(task.pml4, &task.vmas, status_ptr, &bytes) {
                    return e.to_errno();
                }
            }
            pid as SyscallResult
        }
        Ok(crate::process::lifecycle::WaitOutcome::Blocked) => -errno::EAGAIN,
        Err(e) => e.to_errno(),
    }
}

