// kernel/src/memory/frame.rs
//
// The physical frame descriptor array (§3). One `FrameInfo` per managed
// 4 KiB frame, indexed by frame number. Owned entirely by the buddy
// allocator (`allocator::buddy_allocator::BUDDY`) — every field here is
// read/written only while that lock is held, which also gives ref-count
// updates (bumped from page-table insert/remove, not just alloc/free)
// a single well-defined lock rather than a second one racing against it.

pub type FrameNumber = usize;

/// One physical page's bookkeeping.
///
/// Every field is `Copy` on purpose: the frame table is a fixed-size
/// static array built with a `const` repeat expression, which rules out
/// storing an `Arc<Rmap>` (or anything else non-`Copy`) directly here.
/// The `rmap` field is instead an index into `memory::rmap`'s own arena,
/// resolved through that module once the heap exists.
#[derive(Clone, Copy)]
pub struct FrameInfo {
    /// Order of the buddy block this frame currently belongs to. Only
    /// meaningful while `free` (the frame is the block's canonical head)
    /// or as metadata once split — see `BuddyAllocator`.
    pub order: u8,
    /// `true` iff this frame is the head of a free block on some
    /// order's free list.
    pub free: bool,
    /// `true` once the background zeroing task (or an eager memset on
    /// the allocation path) has zeroed this frame's contents.
    pub zeroed: bool,
    /// Number of present PTEs naming this frame, plus internal holders
    /// (page tables, kernel objects allocated by order-0 `alloc`).
    pub refcount: u32,
    /// Intrusive doubly-linked free-list links (buddy order lists).
    pub buddy_prev: Option<FrameNumber>,
    pub buddy_next: Option<FrameNumber>,
    /// Intrusive singly-linked "needs zeroing" list.
    pub zero_next: Option<FrameNumber>,
    /// Index into `memory::rmap::RMAP_ARENA` for this frame's owning
    /// reverse map. `None` for kernel frames and for frames not yet
    /// attached to any VMA.
    pub rmap: Option<u32>,
}

impl FrameInfo {
    pub const fn new() -> Self {
        Self {
            order: 0,
            free: false,
            zeroed: false,
            refcount: 0,
            buddy_prev: None,
            buddy_next: None,
            zero_next: None,
            rmap: None,
        }
    }
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self::new()
    }
}
