//! Platform abstraction.
//!
//! This module defines the `Platform` trait, the raw-syscall shim the stub runs on.
//! The loader stays generic over it; `linux` talks to the kernel directly and
//! `emulator` is an instrumented in-memory model used by the tests and the `run` command.

use core::convert::Infallible;

use crate::fault::{Fault, FATAL_EXIT_STATUS};

pub mod emulator;
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub mod linux;

/// Page permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prot(u32);

impl Prot {
    pub const NONE: Prot = Prot(0);
    pub const READ: Prot = Prot(1);
    pub const WRITE: Prot = Prot(2);
    pub const EXEC: Prot = Prot(4);
    pub const READ_WRITE: Prot = Prot(1 | 2);

    /// Converts ELF `PF_X | PF_W | PF_R` bits.
    pub fn from_elf_flags(flags: u32) -> Prot {
        let mut prot = Prot::NONE;
        if flags & 4 != 0 {
            prot = prot | Prot::READ;
        }
        if flags & 2 != 0 {
            prot = prot | Prot::WRITE;
        }
        if flags & 1 != 0 {
            prot = prot | Prot::EXEC;
        }
        prot
    }

    /// The `PROT_*` value Linux expects; the bits line up.
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Prot) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for Prot {
    type Output = Prot;

    fn bitor(self, rhs: Prot) -> Prot {
        Prot(self.0 | rhs.0)
    }
}

/// A positive error number returned by a failed system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const EINVAL: Errno = Errno(22);
    pub const ENOMEM: Errno = Errno(12);
    pub const EEXIST: Errno = Errno(17);
}

/// Register and stack state handed to the original program.
///
/// Every register not listed here is zero at the jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchState {
    /// Original entry address.
    pub entry: u64,
    /// The stack pointer the kernel gave the process (points at `argc`).
    pub stack_pointer: u64,
}

/// A target platform, seen through the handful of system calls the stub needs.
pub trait Platform: Sized {
    /// Page granularity of mappings and permission changes.
    fn page_size(&self) -> u64;

    /// Maps `len` bytes of fresh zeroed read+write memory exactly at `addr`.
    /// Both must be page aligned. Replaces whatever was mapped there.
    fn map_fixed(&mut self, addr: u64, len: u64) -> Result<(), Errno>;

    /// Maps `len` bytes of fresh zeroed read+write memory wherever the platform likes.
    fn map_anywhere(&mut self, len: u64) -> Result<u64, Errno>;

    /// Borrows `len` mapped, writable bytes at `addr`.
    fn memory_mut(&mut self, addr: u64, len: u64) -> Option<&mut [u8]>;

    /// Sets the permissions of a page-aligned range.
    fn protect(&mut self, addr: u64, len: u64, prot: Prot) -> Result<(), Errno>;

    /// Makes freshly written code in `[addr, addr + len)` visible to instruction fetch.
    fn flush_icache(&mut self, addr: u64, len: u64);

    /// The words of the initial process stack, from `argc` through the `AT_NULL` pair.
    fn initial_stack(&mut self) -> &mut [usize];

    /// Address of the initial process stack (where `argc` lives).
    fn initial_stack_pointer(&self) -> u64;

    /// Switches to the stack whose top is `top` and runs `body` there.
    /// `body` cannot return; it ends in `exit` or `launch`.
    fn run_on_stack(&mut self, top: u64, body: &mut dyn FnMut(&mut Self) -> Infallible) -> !;

    /// Terminates the process.
    fn exit(&mut self, status: i32) -> !;

    /// Terminates the process because of `fault`.
    fn abort(&mut self, _fault: Fault) -> ! {
        self.exit(FATAL_EXIT_STATUS)
    }

    /// Clears the registers, installs `state.stack_pointer` and jumps to `state.entry`.
    fn launch(&mut self, state: LaunchState) -> !;
}
