// kernel/src/lib.rs
//
// Same module tree as the `kernel` binary, exposed as a library so the
// buddy allocator, page-table walker, VMA tree, rmap, scheduler, and
// lifecycle logic can be unit-tested on the host under `cargo test`
// (`#![cfg_attr(not(test), no_std)]` below). `init` is boot-sequencing
// glue over real hardware (bootloader handoff, IDT, TSS) and has no
// meaning off real silicon, so it's the one module gated out entirely.

#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod allocator;
pub mod config;
pub mod errno;
pub mod error;
pub mod framebuffer;
pub mod interrupts;
pub mod keyboard;
pub mod keyboard_buffer;
pub mod memory;
pub mod panic;
pub mod pit;
pub mod process;
pub mod repl;
pub mod serial;

#[cfg(not(test))]
pub mod init;
