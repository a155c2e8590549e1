// kernel/src/process/syscall_abi.rs
//
// The pure-logic half of the syscall ABI (§6): numbering, flag bits,
// and the `prot`→`VmaFlags` mapping. Split out of `syscall.rs` so it
// compiles (and its tests run) on the host target too — the rest of
// that module is `int 0x80`/GDT-adjacent and has no meaning off real
// hardware.

use crate::memory::vma::VmaFlags;

pub type SyscallResult = i64;

/// Syscall numbers (§6). This is a from-scratch ABI, not Linux's.
#[derive(Debug, Clone, Copy)]
#[repr(u64)]
pub enum SyscallNumber {
    Cputs = 0,
    Cgetc = 1,
    GetPid = 2,
    GetCpuId = 3,
    Kill = 4,
    Mquery = 5,
    Mmap = 6,
    Munmap = 7,
    Mprotect = 8,
    Madvise = 9,
    Yield = 10,
    Fork = 11,
    Wait = 12,
    Waitpid = 13,
}

impl SyscallNumber {
    pub fn from_u64(n: u64) -> Option<Self> {
        Some(match n {
            0 => Self::Cputs,
            1 => Self::Cgetc,
            2 => Self::GetPid,
            3 => Self::GetCpuId,
            4 => Self::Kill,
            5 => Self::Mquery,
            6 => Self::Mmap,
            7 => Self::Munmap,
            8 => Self::Mprotect,
            9 => Self::Madvise,
            10 => Self::Yield,
            11 => Self::Fork,
            12 => Self::Wait,
            13 => Self::Waitpid,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// `mmap` flag bits (§6). Anything outside this set is rejected.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        const MAP_ANONYMOUS = 1 << 0;
        const MAP_PRIVATE   = 1 << 1;
        const MAP_FIXED     = 1 << 2;
        const MAP_POPULATE  = 1 << 3;
    }
}

pub const MAP_FAILED: i64 = -1;

/// `madvise` advice values (§6).
pub const MADV_DONTNEED: u64 = 0;
pub const MADV_WILLNEED: u64 = 1;

pub fn vma_flags_from_prot(prot: u64) -> VmaFlags {
    VmaFlags::from_bits_truncate(prot as u32 & VmaFlags::all().bits())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_flags_reject_unknown_bits() {
        assert!(MmapFlags::from_bits(0xFFFF_FFFF).is_none());
    }

    #[test]
    fn vma_flags_from_prot_truncates_to_known_bits() {
        let flags = vma_flags_from_prot(0xFF);
        assert_eq!(flags, VmaFlags::READ | VmaFlags::WRITE | VmaFlags::EXEC);
    }

    #[test]
    fn syscall_number_round_trips() {
        assert!(matches!(SyscallNumber::from_u64(11), Some(SyscallNumber::Fork)));
        assert!(SyscallNumber::from_u64(999).is_none());
    }
}
