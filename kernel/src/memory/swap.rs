// kernel/src/memory/swap.rs
//
// The swap engine (§4.6): a global swappable-frame list walked as a
// second-chance (clock) queue, backed by a disk reached through the
// `BlockDevice` trait. `MemDisk` is the in-memory test double; a real
// AHCI/virtio driver is an external collaborator (§1, §6).

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::structures::paging::{PageTableEntry, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use crate::allocator::buddy_allocator::{AllocFlags, BuddyAllocator, BUDDY};
use crate::config::{Pid, PAGE_SIZE, SWAP_BLOCK};
use crate::error::{KernelError, KResult};
use crate::memory::frame::FrameNumber;
use crate::memory::paging::entry::{decode_swap_slot, encode_swap_slot, is_present};
use crate::memory::paging::{walk_page_range, PageTableWalker};
use crate::memory::rmap;
use crate::process::pid_table;

/// Non-blocking disk contract consumed by the swap engine. `poll`
/// returns `1` when the device is ready to accept a new request.
pub trait BlockDevice: Send + Sync {
    fn poll(&self) -> bool;
    fn stat(&self) -> DiskStat;
    fn read(&self, buf: &mut [u8], addr: u64) -> KResult<()>;
    fn write(&self, buf: &[u8], addr: u64) -> KResult<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DiskStat {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// In-memory stand-in for a disk, used by the unit tests in this
/// module and the end-to-end swap scenario.
pub struct MemDisk {
    bytes: spin::Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(capacity_bytes: usize) -> Self {
        Self { bytes: spin::Mutex::new(alloc::vec![0u8; capacity_bytes]) }
    }
}

impl BlockDevice for MemDisk {
    fn poll(&self) -> bool {
        true
    }

    fn stat(&self) -> DiskStat {
        let bytes = self.bytes.lock();
        DiskStat { capacity_bytes: bytes.len() as u64, used_bytes: 0 }
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> KResult<()> {
        let bytes = self.bytes.lock();
        let start = addr as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(KernelError::DeviceBusy);
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write(&self, buf: &[u8], addr: u64) -> KResult<()> {
        let mut bytes = self.bytes.lock();
        let start = addr as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(KernelError::DeviceBusy);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}

struct SwapState {
    /// Clock queue: tail is popped first, survivors go back on the head.
    frames: VecDeque<FrameNumber>,
    free_disk_addr: u64,
}

impl SwapState {
    const fn new() -> Self {
        Self { frames: VecDeque::new(), free_disk_addr: 0 }
    }
}

static SWAP: spin::Mutex<SwapState> = spin::Mutex::new(SwapState::new());
static DISK: spin::Mutex<Option<Arc<dyn BlockDevice>>> = spin::Mutex::new(None);

pub fn set_disk(disk: Arc<dyn BlockDevice>) {
    *DISK.lock() = Some(disk);
}

fn with_disk<R>(f: impl FnOnce(&dyn BlockDevice) -> KResult<R>) -> KResult<R> {
    let guard = DISK.lock();
    match guard.as_ref() {
        Some(disk) => f(disk.as_ref()),
        None => Err(KernelError::DeviceBusy),
    }
}

/// Add a freshly-mapped user frame to the swappable list.
pub fn enlist(frame: FrameNumber) {
    let mut swap = SWAP.lock();
    if !swap.frames.contains(&frame) {
        swap.frames.push_front(frame);
    }
}

/// Drop `frame` from the swappable list, e.g. when its refcount hits
/// zero before swap ever chose it as a victim.
pub fn delist(frame: FrameNumber) {
    let mut swap = SWAP.lock();
    swap.frames.retain(|&f| f != frame);
}

fn resolve_pml4(pid: Pid) -> Option<PhysAddr> {
    pid_table::get(pid).map(|task| task.lock().pml4)
}

struct AccessedScan {
    any_set: bool,
}

impl PageTableWalker for AccessedScan {
    fn pte(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<()> {
        if is_present(entry) && entry.flags().contains(PageTableFlags::ACCESSED) {
            self.any_set = true;
        }
        Ok(())
    }
}

struct AccessedClear;

impl PageTableWalker for AccessedClear {
    fn pte(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<()> {
        if is_present(entry) {
            let flags = entry.flags() & !PageTableFlags::ACCESSED;
            let addr = entry.addr();
            entry.set_addr(addr, flags);
        }
        Ok(())
    }
}

fn rmap_owners(frame: FrameNumber) -> Vec<(Pid, VirtAddr)> {
    let rmap_id = match BUDDY.lock().rmap(frame) {
        Some(id) => id,
        None => return Vec::new(),
    };
    let rmap = match rmap::get_rmap(rmap_id) {
        Some(r) => r,
        None => return Vec::new(),
    };
    let mut owners = Vec::new();
    rmap.for_each(|pid, vma_id| {
        if let Some(task) = pid_table::get(pid) {
            let task = task.lock();
            if let Some(vma) = task.vmas.get(vma_id) {
                owners.push((pid, VirtAddr::new(vma.base)));
            }
        }
    });
    owners
}

/// Second-chance scan: true if any owning PTE had ACCESSED set (and
/// clears every ACCESSED bit it finds along the way).
fn give_second_chance(frame: FrameNumber) -> bool {
    let mut any_set = false;
    for (pid, va) in rmap_owners(frame) {
        if let Some(pml4) = resolve_pml4(pid) {
            let mut scan = AccessedScan { any_set: false };
            let _ = walk_page_range(pml4, va, va + PAGE_SIZE, &mut scan);
            if scan.any_set {
                any_set = true;
                let mut clear = AccessedClear;
                let _ = walk_page_range(pml4, va, va + PAGE_SIZE, &mut clear);
            }
        }
    }
    any_set
}

/// Rewrite every owning PTE for `frame` to the not-present, disk-slot
/// encoding, decrementing the frame's refcount on each rewrite.
fn rewrite_owners_to_swapped(frame: FrameNumber, slot: u64) {
    for (pid, va) in rmap_owners(frame) {
        if let Some(pml4) = resolve_pml4(pid) {
            struct SwapOut {
                slot: u64,
            }
            impl PageTableWalker for SwapOut {
                fn pte(&mut self, entry: &mut PageTableEntry, _va: VirtAddr) -> KResult<()> {
                    if is_present(entry) {
                        encode_swap_slot(entry, self.slot);
                    }
                    Ok(())
                }
            }
            let mut op = SwapOut { slot };
            let _ = walk_page_range(pml4, va, va + PAGE_SIZE, &mut op);
            x86_64::instructions::tlb::flush(va);
        }
        if BUDDY.lock().put(frame) == 0 {
            delist(frame);
            unsafe { BUDDY.lock().free(frame, 0) };
            break;
        }
    }
}

/// Attempt one eviction. Returns `Ok(None)` if the disk was busy or the
/// list was empty (nothing evicted this round), `Ok(Some(frame))` on
/// success.
pub fn swap_out_one() -> KResult<Option<FrameNumber>> {
    loop {
        let frame = {
            let mut swap = SWAP.lock();
            match swap.frames.pop_back() {
                Some(f) => f,
                None => return Ok(None),
            }
        };
        if give_second_chance(frame) {
            SWAP.lock().frames.push_front(frame);
            continue;
        }

        let slot = {
            let mut swap = SWAP.lock();
            if !with_disk(|d| Ok(d.poll()))? {
                swap.frames.push_front(frame);
                return Ok(None);
            }
            let slot = swap.free_disk_addr;
            swap.free_disk_addr += PAGE_SIZE;
            slot
        };

        let phys = BuddyAllocator::frame_to_addr(frame);
        let bytes = unsafe { core::slice::from_raw_parts(direct_map(phys), PAGE_SIZE as usize) };
        with_disk(|d| d.write(bytes, slot))?;

        rewrite_owners_to_swapped(frame, slot);
        crate::serial_println!("swap: evicted frame {} to slot {}", frame, slot);
        return Ok(Some(frame));
    }
}

fn direct_map(phys: PhysAddr) -> *const u8 {
    let offset = crate::memory::physical_memory_offset().as_u64();
    (offset + phys.as_u64()) as *const u8
}

fn direct_map_mut(phys: PhysAddr) -> *mut u8 {
    let offset = crate::memory::physical_memory_offset().as_u64();
    (offset + phys.as_u64()) as *mut u8
}

/// Bring a swapped-out page back in. Returns `DeviceBusy` (mapped to
/// `EAGAIN` by the fault handler) if the disk isn't ready; the caller
/// must retry the faulting instruction.
pub fn swap_in(pid: Pid, va: VirtAddr, slot: u64, flags: PageTableFlags, owner: crate::memory::paging::Owner) -> KResult<()> {
    if !with_disk(|d| Ok(d.poll()))? {
        return Err(KernelError::DeviceBusy);
    }
    let frame = BUDDY.lock().alloc(0, AllocFlags::empty()).ok_or(KernelError::OutOfMemory)?;
    let phys = BuddyAllocator::frame_to_addr(frame);
    let buf = unsafe { core::slice::from_raw_parts_mut(direct_map_mut(phys), PAGE_SIZE as usize) };
    if let Err(e) = with_disk(|d| d.read(buf, slot)) {
        unsafe { BUDDY.lock().free(frame, 0) };
        return Err(e);
    }

    let pml4 = resolve_pml4(pid).ok_or(KernelError::LifecycleViolation(crate::error::LifecycleFault::NoSuchPid))?;
    crate::memory::paging::insert(pml4, va, frame, flags, Some(owner))?;
    crate::serial_println!("swap: restored slot {} into frame {}", slot, frame);
    Ok(())
}

/// Run up to `SWAP_BLOCK` evictions, yielding between batches; bails
/// out immediately if any task is dying, since destroying it will free
/// memory on its own.
pub fn swap_daemon_pass() {
    for _ in 0..SWAP_BLOCK {
        if any_task_dying() {
            return;
        }
        match swap_out_one() {
            Ok(Some(_)) => continue,
            Ok(None) => return,
            Err(_) => return,
        }
    }
}

fn any_task_dying() -> bool {
    crate::process::scheduler::any_dying()
}

pub fn decode_slot_from_pte(entry: &PageTableEntry) -> Option<u64> {
    decode_swap_slot(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdisk_write_then_read_round_trips() {
        let disk = MemDisk::new(PAGE_SIZE as usize * 4);
        let payload = [7u8; PAGE_SIZE as usize];
        disk.write(&payload, PAGE_SIZE).unwrap();
        let mut out = [0u8; PAGE_SIZE as usize];
        disk.read(&mut out, PAGE_SIZE).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn memdisk_rejects_reads_past_capacity() {
        let disk = MemDisk::new(PAGE_SIZE as usize);
        let mut out = [0u8; PAGE_SIZE as usize];
        assert!(disk.read(&mut out, PAGE_SIZE).is_err());
    }

    #[test]
    fn enlist_is_idempotent_and_delist_removes() {
        let mut swap = SwapState::new();
        swap.frames.push_front(5);
        swap.frames.push_front(5);
        assert_eq!(swap.frames.iter().filter(|&&f| f == 5).count(), 2);
        swap.frames.retain(|&f| f != 5);
        assert!(swap.frames.is_empty());
    }

    #[test]
    fn free_disk_addr_bumps_by_page_size() {
        let mut swap = SwapState::new();
        let first = swap.free_disk_addr;
        swap.free_disk_addr += PAGE_SIZE;
        let second = swap.free_disk_addr;
        assert_eq!(second - first, PAGE_SIZE);
    }
}
