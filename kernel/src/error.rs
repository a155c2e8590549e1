// kernel/src/error.rs
//
// Typed replacement for the ad hoc `&'static str` errors the teacher
// returns (§4.11, §7). Every fallible kernel-internal operation in the
// memory and process subsystems returns `Result<T, KernelError>`; the
// syscall layer converts the tail of that chain to a negative errno.

use core::fmt;

/// A child failed to reap because the caller has none, or named one that
/// does not exist / is not its child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleFault {
    NoChildren,
    NoSuchPid,
    NotAChild,
}

/// The five error kinds named in §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The buddy allocator (or an allocation built on it) could not find
    /// a free block of the requested order.
    OutOfMemory,
    /// An operation on the VMA tree or address space violated the
    /// "VMAs never overlap" / "stays below USER_LIM" invariants.
    AddressSpaceViolation,
    /// A fault or syscall tried to do something a VMA's protection bits
    /// forbid and that is not a COW-eligible write.
    PermissionViolation,
    /// The disk driver polled busy; the caller must yield and retry.
    DeviceBusy,
    /// `wait`/`waitpid`/`kill` on an invalid task relationship.
    LifecycleViolation(LifecycleFault),
}

impl KernelError {
    /// Map to the negated errno constants named in §6. Kinds with no
    /// closer match fall back to bare `-1`, matching the source.
    pub fn to_errno(self) -> i64 {
        match self {
            KernelError::OutOfMemory => -super::errno::ENOMEM,
            KernelError::AddressSpaceViolation => -1,
            KernelError::PermissionViolation => -1,
            KernelError::DeviceBusy => -super::errno::EAGAIN,
            KernelError::LifecycleViolation(LifecycleFault::NoChildren) => -super::errno::ECHILD,
            KernelError::LifecycleViolation(_) => -1,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::AddressSpaceViolation => write!(f, "address space violation"),
            KernelError::PermissionViolation => write!(f, "permission violation"),
            KernelError::DeviceBusy => write!(f, "device busy"),
            KernelError::LifecycleViolation(LifecycleFault::NoChildren) => {
                write!(f, "wait with no children")
            }
            KernelError::LifecycleViolation(LifecycleFault::NoSuchPid) => {
                write!(f, "no such pid")
            }
            KernelError::LifecycleViolation(LifecycleFault::NotAChild) => {
                write!(f, "pid is not a child of the caller")
            }
        }
    }
}

pub type KResult<T> = Result<T, KernelError>;
