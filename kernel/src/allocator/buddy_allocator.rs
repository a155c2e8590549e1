// kernel/src/allocator/buddy_allocator.rs
//
// Buddy physical-page allocator (§4.1). Owns the dense frame descriptor
// array (§3) and serializes every operation on it — including ref-count
// bumps/drops performed by the page-table code in `memory::paging::ops`
// — behind a single `spin::Mutex`.
//
// The frame table is a fixed-size static array rather than a `Vec`: the
// buddy allocator has to come up before the heap does (the slab
// allocator in `allocator::slab` gets its backing pages FROM the buddy),
// so it cannot depend on an allocator to size its own bookkeeping.

use bitflags::bitflags;
use x86_64::PhysAddr;

use crate::config::{MAX_ORDER, PAGE_SIZE};
use crate::memory::frame::{FrameInfo, FrameNumber};

/// Frames managed by this allocator: 2^16 * 4 KiB = 256 MiB. Fixed
/// independently of `MAX_ORDER` (an order-`MAX_ORDER` block must still
/// fit inside it); a port tracking more RAM grows this constant.
const MAX_FRAMES: usize = 1 << 16;
const _: () = assert!(1 << MAX_ORDER <= MAX_FRAMES);

bitflags! {
    /// Allocation-time hints (§4.1).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Caller needs zeroed memory; served from the pre-zeroed list
        /// when possible, memset on the path otherwise.
        const ZERO = 1 << 0;
        /// Round up to a 2 MiB (order-9) block.
        const HUGE = 1 << 1;
    }
}

pub struct BuddyAllocator {
    frames: [FrameInfo; MAX_FRAMES],
    free_lists: [Option<FrameNumber>; MAX_ORDER + 1],
    zero_list: Option<FrameNumber>,
    nframes: usize,
}

impl BuddyAllocator {
    pub const fn new() -> Self {
        const INIT: FrameInfo = FrameInfo::new();
        Self {
            frames: [INIT; MAX_FRAMES],
            free_lists: [None; MAX_ORDER + 1],
            zero_list: None,
            nframes: 0,
        }
    }

    #[inline]
    pub fn frame_to_addr(frame: FrameNumber) -> PhysAddr {
        PhysAddr::new(frame as u64 * PAGE_SIZE)
    }

    #[inline]
    pub fn addr_to_frame(addr: PhysAddr) -> FrameNumber {
        (addr.as_u64() / PAGE_SIZE) as FrameNumber
    }

    /// Register `[start, end)` (already page-aligned by the caller) as
    /// usable RAM, carving it into the largest aligned power-of-two
    /// blocks that fit and handing each to `free_block`.
    ///
    /// # Safety
    /// Must be called only at boot, before any `alloc`/`free`, and the
    /// range must not overlap a previously-added region.
    pub unsafe fn add_region(&mut self, start: u64, end: u64) {
        let mut addr = start;
        while addr < end {
            let remaining = end - addr;
            if remaining < PAGE_SIZE {
                break;
            }

            let align_order = (addr / PAGE_SIZE).trailing_zeros() as usize;
            let size_order = (63 - (remaining / PAGE_SIZE).leading_zeros()) as usize;
            let order = align_order.min(size_order).min(MAX_ORDER);

            let frame = Self::addr_to_frame(PhysAddr::new(addr));
            self.nframes = self.nframes.max(frame + (1 << order));
            self.free_block(frame, order);

            addr += (1u64 << order) * PAGE_SIZE;
        }
    }

    #[inline]
    fn buddy_of(&self, frame: FrameNumber, order: usize) -> FrameNumber {
        frame ^ (1 << order)
    }

    fn list_push(&mut self, order: usize, frame: FrameNumber) {
        let old_head = self.free_lists[order];
        self.frames[frame].buddy_prev = None;
        self.frames[frame].buddy_next = old_head;
        if let Some(head) = old_head {
            self.frames[head].buddy_prev = Some(frame);
        }
        self.free_lists[order] = Some(frame);
        self.frames[frame].free = true;
        self.frames[frame].order = order as u8;
    }

    fn list_remove(&mut self, order: usize, frame: FrameNumber) {
        let prev = self.frames[frame].buddy_prev;
        let next = self.frames[frame].buddy_next;
        match prev {
            Some(p) => self.frames[p].buddy_next = next,
            None => self.free_lists[order] = next,
        }
        if let Some(n) = next {
            self.frames[n].buddy_prev = prev;
        }
        self.frames[frame].buddy_prev = None;
        self.frames[frame].buddy_next = None;
        self.frames[frame].free = false;
    }

    /// Place a just-freed block of order `k` on the free lists,
    /// coalescing with its buddy up through `MAX_ORDER`.
    fn free_block(&mut self, frame: FrameNumber, order: usize) {
        let mut frame = frame;
        let mut order = order;
        while order < MAX_ORDER {
            let buddy = self.buddy_of(frame, order);
            if !self.frames[buddy].free || self.frames[buddy].order as usize != order {
                break;
            }
            self.list_remove(order, buddy);
            frame = frame.min(buddy);
            order += 1;
        }
        self.list_push(order, frame);
        self.enqueue_zero(frame);
    }

    fn enqueue_zero(&mut self, frame: FrameNumber) {
        if self.frames[frame].zeroed {
            return;
        }
        self.frames[frame].zero_next = self.zero_list;
        self.zero_list = Some(frame);
    }

    /// Split a free block at `from_order` down to `to_order`, pushing
    /// each buddy half produced along the way onto its own free list.
    fn split_down(&mut self, frame: FrameNumber, from_order: usize, to_order: usize) {
        let mut order = from_order;
        while order > to_order {
            order -= 1;
            let buddy = frame ^ (1 << order);
            self.list_push(order, buddy);
        }
        self.frames[frame].order = to_order as u8;
    }

    /// Allocate a `2^order` run of frames honoring `flags` (§4.1).
    /// Never blocks; returns `None` on exhaustion.
    pub fn alloc(&mut self, order: usize, flags: AllocFlags) -> Option<FrameNumber> {
        let order = if flags.contains(AllocFlags::HUGE) { order.max(9) } else { order };
        debug_assert!(order <= MAX_ORDER);

        let mut found = None;
        for larger in order..=MAX_ORDER {
            if let Some(frame) = self.free_lists[larger] {
                self.list_remove(larger, frame);
                if larger > order {
                    self.split_down(frame, larger, order);
                }
                found = Some(frame);
                break;
            }
        }

        let frame = found?;
        self.frames[frame].refcount = 0;
        if flags.contains(AllocFlags::ZERO) && !self.frames[frame].zeroed {
            unsafe { self.zero_frame(frame) };
        }
        crate::serial_print_raw!("buddy: alloc frame={} order={}\n", frame, order);
        Some(frame)
    }

    /// Return a previously-allocated `2^order` run to the free lists.
    ///
    /// # Safety
    /// `frame` must have been returned by `alloc` at exactly `order` and
    /// not freed since (no double-free).
    pub unsafe fn free(&mut self, frame: FrameNumber, order: usize) {
        debug_assert!(!self.frames[frame].free, "double free of frame {frame}");
        self.frames[frame].rmap = None;
        self.free_block(frame, order);
        crate::serial_print_raw!("buddy: free frame={} order={}\n", frame, order);
    }

    unsafe fn zero_frame(&mut self, frame: FrameNumber) {
        let phys_offset = crate::memory::physical_memory_offset();
        let virt = phys_offset + Self::frame_to_addr(frame).as_u64();
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        self.frames[frame].zeroed = true;
    }

    /// Pop one frame from the "needs zeroing" list for the background
    /// zeroing task, or `None` if every free frame is already zeroed.
    pub fn pop_needs_zeroing(&mut self) -> Option<FrameNumber> {
        loop {
            let frame = self.zero_list?;
            self.zero_list = self.frames[frame].zero_next;
            self.frames[frame].zero_next = None;
            if self.frames[frame].free && !self.frames[frame].zeroed {
                return Some(frame);
            }
            // Frame was reallocated since being enqueued; drop it.
        }
    }

    /// Zero a frame the background task popped via `pop_needs_zeroing`.
    ///
    /// # Safety
    /// `frame` must currently be free (not reallocated since the pop).
    pub unsafe fn zero_free_frame(&mut self, frame: FrameNumber) {
        if self.frames[frame].free {
            self.zero_frame(frame);
        }
    }

    /// Bump a frame's reference count (an installed PTE, or an internal
    /// holder such as a page-table frame).
    pub fn get(&mut self, frame: FrameNumber) {
        self.frames[frame].refcount += 1;
    }

    /// Drop a reference; returns the refcount after the decrement.
    pub fn put(&mut self, frame: FrameNumber) -> u32 {
        debug_assert!(self.frames[frame].refcount > 0, "refcount underflow on frame {frame}");
        self.frames[frame].refcount -= 1;
        self.frames[frame].refcount
    }

    pub fn refcount(&self, frame: FrameNumber) -> u32 {
        self.frames[frame].refcount
    }

    /// Index into `memory::rmap::RMAP_ARENA`, if this frame is
    /// currently attached to a VMA.
    pub fn rmap(&self, frame: FrameNumber) -> Option<u32> {
        self.frames[frame].rmap
    }

    pub fn set_rmap(&mut self, frame: FrameNumber, rmap_id: u32) {
        self.frames[frame].rmap = Some(rmap_id);
    }

    pub fn clear_rmap(&mut self, frame: FrameNumber) {
        self.frames[frame].rmap = None;
    }

    /// Sum, over every order, of `blocks_in_list(order) * 2^order` — the
    /// accumulated total free frame count (§4.1, §9: the source's
    /// per-order partial is a bug).
    pub fn count_total_free(&self) -> u64 {
        let mut total = 0u64;
        for order in 0..=MAX_ORDER {
            let mut count = 0u64;
            let mut cur = self.free_lists[order];
            while let Some(frame) = cur {
                count += 1;
                cur = self.frames[frame].buddy_next;
            }
            total += count * (1u64 << order);
        }
        total
    }

    #[cfg(test)]
    fn order_aligned(frame: FrameNumber, order: usize) -> bool {
        frame & ((1 << order) - 1) == 0
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for order in 0..=MAX_ORDER {
            let mut cur = self.free_lists[order];
            while let Some(frame) = cur {
                assert!(Self::order_aligned(frame, order), "frame {frame} not order-{order} aligned");
                let buddy = self.buddy_of(frame, order);
                let buddy_is_mutual_free =
                    self.frames[buddy].free && self.frames[buddy].order as usize == order;
                assert!(!buddy_is_mutual_free, "frame {frame} and buddy {buddy} both free at order {order} (should have merged)");
                cur = self.frames[frame].buddy_next;
            }
        }
    }
}

// Global instance, mutex-guarded (§5: "all operations are serialized by
// the buddy lock").
pub static BUDDY: spin::Mutex<BuddyAllocator> = spin::Mutex::new(BuddyAllocator::new());

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> BuddyAllocator {
        let mut b = BuddyAllocator::new();
        unsafe { b.add_region(0, (1 << 12) * PAGE_SIZE) };
        b
    }

    #[test]
    fn alloc_free_round_trip_restores_free_count() {
        let mut b = fresh();
        let before = b.count_total_free();
        let frame = b.alloc(3, AllocFlags::empty()).expect("alloc order 3");
        assert_eq!(b.count_total_free(), before - 8);
        unsafe { b.free(frame, 3) };
        assert_eq!(b.count_total_free(), before);
        b.assert_invariants();
    }

    #[test]
    fn split_then_coalesce_merges_back_to_original_order() {
        let mut b = fresh();
        let a = b.alloc(0, AllocFlags::empty()).unwrap();
        let c = b.alloc(0, AllocFlags::empty()).unwrap();
        // a and c are very likely buddies of a freshly split order-1 block.
        unsafe {
            b.free(a, 0);
            b.free(c, 0);
        }
        b.assert_invariants();
    }

    #[test]
    fn zero_flag_yields_zeroed_frame() {
        let mut b = fresh();
        let frame = b.alloc(0, AllocFlags::ZERO).unwrap();
        assert!(b.frames[frame].zeroed);
    }

    #[test]
    fn exhaustion_returns_none_without_blocking() {
        let mut b = BuddyAllocator::new();
        unsafe { b.add_region(0, PAGE_SIZE) };
        let _first = b.alloc(0, AllocFlags::empty()).unwrap();
        assert!(b.alloc(0, AllocFlags::empty()).is_none());
    }

    #[test]
    fn refcount_tracks_gets_and_puts() {
        let mut b = fresh();
        let frame = b.alloc(0, AllocFlags::empty()).unwrap();
        b.get(frame);
        b.get(frame);
        assert_eq!(b.refcount(frame), 2);
        assert_eq!(b.put(frame), 1);
        assert_eq!(b.put(frame), 0);
    }
}
