// kernel/src/memory/vma.rs
//
// Per-task virtual memory areas (§4.4): a set of disjoint, page-aligned
// address ranges with uniform protection, placement (`add_vma`), and
// merge/split. The red-black tree plus sorted list the source keeps as
// two intrusive structures collapse here into one `BTreeMap<base, VmaId>`
// — its iteration order already is the sorted list, so "list order
// matches tree order" (§8) holds without maintaining a second structure.

use alloc::vec::Vec;
use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::config::{Pid, USER_LIM};
use crate::error::{KernelError, KResult};
use crate::memory::rmap;

pub type VmaId = u32;

bitflags! {
    /// VMA protection bits (§3: `R|W|X`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl VmaFlags {
    /// The PTE permission bits implied by this VMA's protections. Pages
    /// are always present and user-accessible once installed; `WRITE`
    /// sets `WRITABLE`, and the absence of `EXEC` sets `NO_EXECUTE`.
    pub fn to_page_table_flags(self) -> x86_64::structures::paging::PageTableFlags {
        use x86_64::structures::paging::PageTableFlags as F;
        let mut out = F::PRESENT | F::USER_ACCESSIBLE;
        if self.contains(VmaFlags::WRITE) {
            out |= F::WRITABLE;
        }
        if !self.contains(VmaFlags::EXEC) {
            out |= F::NO_EXECUTE;
        }
        out
    }
}

/// File-backed portion of an executable VMA: `len` bytes starting at
/// `src_offset` in the backing image, zero-filled beyond that up to the
/// VMA's own size (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmaSource {
    pub src_offset: u64,
    pub len: u64,
}

#[derive(Clone, Debug)]
pub struct Vma {
    pub base: u64,
    pub end: u64,
    pub name: &'static str,
    pub flags: VmaFlags,
    pub source: Option<VmaSource>,
    /// The rmap this VMA is enlisted on (§4.5). Always `Some` once a VMA
    /// is reachable from a `VmaSpace` — allocated in `insert_vma` if the
    /// caller didn't already have one to share (fork, split).
    pub rmap_id: Option<u32>,
}

impl Vma {
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.base
    }
}

/// One task's VMA set: a dense arena of slots (freed ones recycled) plus
/// a `base -> VmaId` tree giving sorted, overlap-checkable ordering.
pub struct VmaSpace {
    owner: Pid,
    arena: Vec<Option<Vma>>,
    free_list: Vec<VmaId>,
    tree: BTreeMap<u64, VmaId>,
}

impl VmaSpace {
    pub fn new(owner: Pid) -> Self {
        Self { owner, arena: Vec::new(), free_list: Vec::new(), tree: BTreeMap::new() }
    }

    pub fn get(&self, id: VmaId) -> Option<&Vma> {
        self.arena.get(id as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: VmaId) -> Option<&mut Vma> {
        self.arena.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (VmaId, &Vma)> {
        self.tree.values().map(move |&id| (id, self.arena[id as usize].as_ref().unwrap()))
    }

    fn alloc_slot(&mut self, vma: Vma) -> VmaId {
        if let Some(id) = self.free_list.pop() {
            self.arena[id as usize] = Some(vma);
            id
        } else {
            let id = self.arena.len() as VmaId;
            self.arena.push(Some(vma));
            id
        }
    }

    /// Attach `vma` into the tree, rejecting overlap with an existing
    /// entry (§4.4). Allocates a fresh rmap if `vma.rmap_id` is `None`.
    pub fn insert_vma(&mut self, mut vma: Vma) -> KResult<VmaId> {
        if vma.base >= vma.end || vma.end > USER_LIM {
            return Err(KernelError::AddressSpaceViolation);
        }
        if let Some((_, &prev)) = self.tree.range(..vma.base).next_back() {
            if self.arena[prev as usize].as_ref().unwrap().end > vma.base {
                return Err(KernelError::AddressSpaceViolation);
            }
        }
        if let Some((&next_base, _)) = self.tree.range(vma.base..).next() {
            if next_base < vma.end {
                return Err(KernelError::AddressSpaceViolation);
            }
        }
        if vma.rmap_id.is_none() {
            vma.rmap_id = Some(rmap::alloc_rmap());
        }
        let base = vma.base;
        let rmap_id = vma.rmap_id;
        let id = self.alloc_slot(vma);
        self.tree.insert(base, id);
        if let Some(rid) = rmap_id {
            if let Some(r) = rmap::get_rmap(rid) {
                r.attach(self.owner, id);
            }
        }
        Ok(id)
    }

    /// Every free gap in `[0, USER_LIM)`, in ascending base order.
    fn gaps(&self) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut prev_end = 0u64;
        for (&base, &id) in self.tree.iter() {
            if base > prev_end {
                gaps.push((prev_end, base));
            }
            prev_end = prev_end.max(self.arena[id as usize].as_ref().unwrap().end);
        }
        if prev_end < USER_LIM {
            gaps.push((prev_end, USER_LIM));
        }
        gaps
    }

    /// Place a new `size`-byte VMA: try `addr` itself, then the nearest
    /// free gap below it down to 0, then the nearest free gap at or
    /// above it down from `USER_LIM` (§4.4). `addr == 0` skips straight
    /// to the last step, giving deterministic top-down placement.
    pub fn add_vma(
        &mut self,
        addr: u64,
        size: u64,
        flags: VmaFlags,
        name: &'static str,
        source: Option<VmaSource>,
    ) -> KResult<(u64, VmaId)> {
        if size == 0 || addr.checked_add(size).is_none() {
            return Err(KernelError::AddressSpaceViolation);
        }
        let gaps = self.gaps();

        let at_addr = (addr != 0)
            .then(|| gaps.iter().find(|&&(s, e)| addr >= s && addr + size <= e))
            .flatten()
            .map(|_| addr);

        let below_addr = (addr != 0)
            .then(|| {
                gaps.iter()
                    .rev()
                    .find(|&&(s, e)| e <= addr && e.saturating_sub(s) >= size)
                    .map(|&(_, e)| e - size)
            })
            .flatten();

        let from_top = gaps
            .iter()
            .rev()
            .find(|&&(s, e)| s >= addr && e.saturating_sub(s) >= size)
            .map(|&(_, e)| e - size);

        let chosen = at_addr
            .or(below_addr)
            .or(from_top)
            .ok_or(KernelError::AddressSpaceViolation)?;

        let vma = Vma { base: chosen, end: chosen + size, name, flags, source, rmap_id: None };
        let id = self.insert_vma(vma)?;
        Ok((chosen, id))
    }

    /// The gap immediately surrounding `addr` (§4.4). Meaningful only
    /// when `addr` does not fall inside an existing VMA.
    pub fn find_free_vma(&self, addr: u64) -> (u64, u64) {
        let base = self
            .tree
            .range(..=addr)
            .next_back()
            .map(|(_, &id)| self.arena[id as usize].as_ref().unwrap().end)
            .filter(|&end| end <= addr)
            .unwrap_or(0);
        let end = self.tree.range(addr..).next().map(|(&b, _)| b).unwrap_or(USER_LIM);
        (base, end)
    }

    pub fn remove_vma(&mut self, id: VmaId) -> Option<Vma> {
        let vma = self.arena.get_mut(id as usize)?.take()?;
        self.tree.remove(&vma.base);
        self.free_list.push(id);
        if let Some(rid) = vma.rmap_id {
            if let Some(r) = rmap::get_rmap(rid) {
                r.detach(self.owner, id);
                if r.is_empty() {
                    unsafe { rmap::free_rmap(rid) };
                }
            }
        }
        Some(vma)
    }

    /// Merge `rhs` into `lhs` iff same flags, same name, and contiguous
    /// (§4.4). Any VMAs still on `rhs`'s rmap (other tasks sharing it
    /// after a fork) are transplanted onto `lhs`'s rmap so they keep
    /// seeing every mapping of the now-combined range.
    pub fn merge_vma(&mut self, lhs: VmaId, rhs: VmaId) -> bool {
        let (lhs_end, lhs_flags, lhs_name, lhs_rmap) = {
            let l = match self.arena[lhs as usize].as_ref() {
                Some(l) => l,
                None => return false,
            };
            (l.end, l.flags, l.name, l.rmap_id)
        };
        let (rhs_base, rhs_end, rhs_flags, rhs_name, rhs_rmap) = {
            let r = match self.arena[rhs as usize].as_ref() {
                Some(r) => r,
                None => return false,
            };
            (r.base, r.end, r.flags, r.name, r.rmap_id)
        };
        if lhs_flags != rhs_flags || lhs_name != rhs_name || lhs_end != rhs_base {
            return false;
        }

        self.tree.remove(&rhs_base);
        self.arena[rhs as usize] = None;
        self.free_list.push(rhs);
        self.arena[lhs as usize].as_mut().unwrap().end = rhs_end;

        if let Some(rid) = rhs_rmap {
            if let Some(rmap_rhs) = rmap::get_rmap(rid) {
                rmap_rhs.detach(self.owner, rhs);
                match lhs_rmap {
                    Some(lid) if lid != rid => {
                        let entries = rmap_rhs.drain();
                        if let Some(rmap_lhs) = rmap::get_rmap(lid) {
                            for (pid, vma) in entries {
                                rmap_lhs.attach(pid, vma);
                            }
                        }
                        unsafe { rmap::free_rmap(rid) };
                    }
                    _ => {
                        if rmap_rhs.is_empty() {
                            unsafe { rmap::free_rmap(rid) };
                        }
                    }
                }
            }
        }
        true
    }

    /// Try merging `id` with both its predecessor and successor;
    /// returns the id of the surviving (possibly-grown) VMA.
    pub fn merge_vmas(&mut self, id: VmaId) -> VmaId {
        let mut cur = id;
        let base = self.arena[cur as usize].as_ref().unwrap().base;
        if let Some((_, &prev)) = self.tree.range(..base).next_back() {
            if self.merge_vma(prev, cur) {
                cur = prev;
            }
        }
        let end = self.arena[cur as usize].as_ref().unwrap().end;
        if let Some((&next_base, &next)) = self.tree.range(end..).next() {
            if next_base == end {
                self.merge_vma(cur, next);
            }
        }
        cur
    }

    /// Split `id` at `addr`, producing a right sibling `[addr, end)`
    /// sharing `id`'s rmap (the frames already installed in that range,
    /// if any, still belong to it — splitting only cuts bookkeeping).
    pub fn split_vma(&mut self, id: VmaId, addr: u64) -> KResult<VmaId> {
        let (base, end, name, flags, source, rmap_id) = {
            let v = self.arena[id as usize].as_ref().ok_or(KernelError::AddressSpaceViolation)?;
            (v.base, v.end, v.name, v.flags, v.source, v.rmap_id)
        };
        if addr <= base || addr >= end {
            return Err(KernelError::AddressSpaceViolation);
        }
        let right_source = source.map(|s| VmaSource {
            src_offset: s.src_offset + (addr - base),
            len: s.len.saturating_sub(addr - base),
        });
        let right = Vma { base: addr, end, name, flags, source: right_source, rmap_id };
        let right_id = self.alloc_slot(right);
        self.tree.insert(addr, right_id);
        if let Some(rid) = rmap_id {
            if let Some(r) = rmap::get_rmap(rid) {
                r.attach(self.owner, right_id);
            }
        }
        self.arena[id as usize].as_mut().unwrap().end = addr;
        Ok(right_id)
    }

    /// Carve the middle `[base, base+size)` out of `id`, returning it.
    pub fn split_vmas(&mut self, id: VmaId, base: u64, size: u64) -> KResult<VmaId> {
        let middle = self.split_vma(id, base)?;
        self.split_vma(middle, base + size)?;
        Ok(middle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> VmaSpace {
        VmaSpace::new(1)
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut s = space();
        let v = Vma { base: 0x1000, end: 0x3000, name: "a", flags: VmaFlags::READ, source: None, rmap_id: None };
        s.insert_vma(v).unwrap();
        let overlap = Vma { base: 0x2000, end: 0x4000, name: "b", flags: VmaFlags::READ, source: None, rmap_id: None };
        assert!(s.insert_vma(overlap).is_err());
    }

    #[test]
    fn add_vma_null_addr_is_deterministic_and_below_user_lim() {
        let mut s = space();
        let (addr1, _) = s.add_vma(0, 0x1000, VmaFlags::READ | VmaFlags::WRITE, "anon", None).unwrap();
        assert!(addr1 + 0x1000 <= USER_LIM);
        let mut s2 = space();
        let (addr2, _) = s2.add_vma(0, 0x1000, VmaFlags::READ | VmaFlags::WRITE, "anon", None).unwrap();
        assert_eq!(addr1, addr2, "placement for an empty space must be deterministic");
    }

    #[test]
    fn add_vma_over_user_lim_fails() {
        let mut s = space();
        assert!(s.add_vma(USER_LIM - 0x1000, 0x2000, VmaFlags::READ, "x", None).is_err());
    }

    #[test]
    fn split_then_merge_reproduces_original_extent() {
        let mut s = space();
        let v = Vma { base: 0x1000, end: 0x5000, name: "heap", flags: VmaFlags::READ | VmaFlags::WRITE, source: None, rmap_id: None };
        let id = s.insert_vma(v).unwrap();
        let right = s.split_vma(id, 0x3000).unwrap();
        assert_eq!(s.get(id).unwrap().end, 0x3000);
        assert_eq!(s.get(right).unwrap().base, 0x3000);
        assert!(s.merge_vma(id, right));
        assert_eq!(s.get(id).unwrap().base, 0x1000);
        assert_eq!(s.get(id).unwrap().end, 0x5000);
    }

    #[test]
    fn split_vmas_carves_out_the_middle() {
        let mut s = space();
        let v = Vma { base: 0, end: 0x4000, name: "x", flags: VmaFlags::READ, source: None, rmap_id: None };
        let id = s.insert_vma(v).unwrap();
        let middle = s.split_vmas(id, 0x1000, 0x1000).unwrap();
        assert_eq!(s.get(middle).unwrap().base, 0x1000);
        assert_eq!(s.get(middle).unwrap().end, 0x2000);
        assert_eq!(s.iter().count(), 3);
    }

    #[test]
    fn find_free_vma_reports_surrounding_gap() {
        let mut s = space();
        let v = Vma { base: 0x2000, end: 0x3000, name: "x", flags: VmaFlags::READ, source: None, rmap_id: None };
        s.insert_vma(v).unwrap();
        assert_eq!(s.find_free_vma(0x1000), (0, 0x2000));
        assert_eq!(s.find_free_vma(0x5000), (0x3000, USER_LIM));
    }

    #[test]
    fn remove_vma_frees_an_empty_rmap() {
        let mut s = space();
        let v = Vma { base: 0x1000, end: 0x2000, name: "x", flags: VmaFlags::READ, source: None, rmap_id: None };
        let id = s.insert_vma(v).unwrap();
        let rid = s.get(id).unwrap().rmap_id.unwrap();
        assert!(rmap::get_rmap(rid).is_some());
        s.remove_vma(id);
        assert!(rmap::get_rmap(rid).is_none());
    }
}
