//! Linux backend.
//!
//! Implements the `Platform` trait with raw system calls on x86_64 and aarch64,
//! without libc. The `unfold-stub` binary calls [`stub_start`] from its entry
//! symbol with the stack pointer the kernel handed it.

use core::arch::asm;
use core::convert::Infallible;

use super::{Errno, LaunchState, Platform, Prot};
use crate::fault::{fatal, Fault};
use crate::format::{elf_extent, Image};
use crate::launch::{get_aux, AT_NULL, AT_PAGESZ};
use crate::loader;

#[cfg(target_arch = "x86_64")]
mod nr {
    pub const CLOSE: usize = 3;
    pub const LSEEK: usize = 8;
    pub const MMAP: usize = 9;
    pub const MPROTECT: usize = 10;
    pub const EXIT_GROUP: usize = 231;
    pub const OPENAT: usize = 257;
}

#[cfg(target_arch = "aarch64")]
mod nr {
    pub const OPENAT: usize = 56;
    pub const CLOSE: usize = 57;
    pub const LSEEK: usize = 62;
    pub const EXIT_GROUP: usize = 94;
    pub const MMAP: usize = 222;
    pub const MPROTECT: usize = 226;
}

const MAP_PRIVATE: usize = 0x02;
const MAP_FIXED: usize = 0x10;
const MAP_ANONYMOUS: usize = 0x20;
const PROT_READ: usize = 0x1;
const PROT_WRITE: usize = 0x2;
const AT_FDCWD: isize = -100;
const SEEK_END: usize = 2;
/// Used when the kernel does not say.
const DEFAULT_PAGE_SIZE: u64 = 0x1000;

#[cfg(target_arch = "x86_64")]
unsafe fn syscall6(nr: usize, a0: usize, a1: usize, a2: usize, a3: usize, a4: usize, a5: usize) -> isize {
    let ret: isize;
    asm!(
        "syscall",
        inlateout("rax") nr as isize => ret,
        in("rdi") a0,
        in("rsi") a1,
        in("rdx") a2,
        in("r10") a3,
        in("r8") a4,
        in("r9") a5,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack),
    );
    ret
}

#[cfg(target_arch = "aarch64")]
unsafe fn syscall6(nr: usize, a0: usize, a1: usize, a2: usize, a3: usize, a4: usize, a5: usize) -> isize {
    let ret: isize;
    asm!(
        "svc 0",
        in("x8") nr,
        inlateout("x0") a0 as isize => ret,
        in("x1") a1,
        in("x2") a2,
        in("x3") a3,
        in("x4") a4,
        in("x5") a5,
        options(nostack),
    );
    ret
}

/// Splits a raw return value into a result the way the kernel encodes errors.
fn check(ret: isize) -> Result<usize, Errno> {
    if (-4095..0).contains(&ret) {
        Err(Errno(-ret as i32))
    } else {
        Ok(ret as usize)
    }
}

/// The running process.
pub struct LinuxPlatform {
    stack_pointer: *mut usize,
    stack_words: usize,
    page_size: u64,
}

impl LinuxPlatform {
    /// # Safety
    /// `stack_pointer` must be the untouched initial stack pointer of the process.
    pub unsafe fn new(stack_pointer: *mut usize) -> Self {
        // argc, argv..., NULL, envp..., NULL, (key, value)..., AT_NULL pair
        let argc = *stack_pointer;
        let mut words = 1 + argc + 1;
        while *stack_pointer.add(words) != 0 {
            words += 1;
        }
        words += 1;
        let auxv = words;
        while *stack_pointer.add(words) != AT_NULL {
            words += 2;
        }
        words += 2;

        let auxv = core::slice::from_raw_parts(stack_pointer.add(auxv), words - auxv);
        let page_size = match get_aux(auxv, AT_PAGESZ) {
            Some(size) if size.is_power_of_two() => size as u64,
            _ => DEFAULT_PAGE_SIZE,
        };
        Self { stack_pointer, stack_words: words, page_size }
    }

    /// Maps the packed file this process was started from, read-only.
    pub fn map_self(&mut self) -> Result<&'static [u8], Errno> {
        let path = b"/proc/self/exe\0";
        unsafe {
            let fd = check(syscall6(nr::OPENAT, AT_FDCWD as usize, path.as_ptr() as usize, 0, 0, 0, 0))?;
            let mapped = check(syscall6(nr::LSEEK, fd, 0, SEEK_END, 0, 0, 0)).and_then(|len| {
                let addr = check(syscall6(nr::MMAP, 0, len, PROT_READ, MAP_PRIVATE, fd, 0))?;
                Ok(core::slice::from_raw_parts(addr as *const u8, len))
            });
            let _ = syscall6(nr::CLOSE, fd, 0, 0, 0, 0, 0);
            mapped
        }
    }
}

impl Platform for LinuxPlatform {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn map_fixed(&mut self, addr: u64, len: u64) -> Result<(), Errno> {
        let flags = MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED;
        let ret = unsafe {
            syscall6(nr::MMAP, addr as usize, len as usize, PROT_READ | PROT_WRITE, flags, usize::MAX, 0)
        };
        match check(ret)? {
            got if got as u64 == addr => Ok(()),
            _ => Err(Errno::EEXIST),
        }
    }

    fn map_anywhere(&mut self, len: u64) -> Result<u64, Errno> {
        let ret = unsafe {
            syscall6(nr::MMAP, 0, len as usize, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, usize::MAX, 0)
        };
        check(ret).map(|addr| addr as u64)
    }

    fn memory_mut(&mut self, addr: u64, len: u64) -> Option<&mut [u8]> {
        // The builder only asks for ranges it has just mapped writable.
        Some(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len as usize) })
    }

    fn protect(&mut self, addr: u64, len: u64, prot: Prot) -> Result<(), Errno> {
        let ret = unsafe { syscall6(nr::MPROTECT, addr as usize, len as usize, prot.bits() as usize, 0, 0, 0) };
        check(ret).map(|_| ())
    }

    #[cfg(target_arch = "x86_64")]
    fn flush_icache(&mut self, _addr: u64, _len: u64) {
        // x86 keeps instruction fetch coherent with stores.
    }

    #[cfg(target_arch = "aarch64")]
    fn flush_icache(&mut self, addr: u64, len: u64) {
        let ctr: u64;
        unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
        let dline = 4u64 << ((ctr >> 16) & 0xf);
        let iline = 4u64 << (ctr & 0xf);
        let end = addr + len;
        unsafe {
            let mut line = addr & !(dline - 1);
            while line < end {
                asm!("dc cvau, {}", in(reg) line, options(nostack));
                line += dline;
            }
            asm!("dsb ish", options(nostack));
            let mut line = addr & !(iline - 1);
            while line < end {
                asm!("ic ivau, {}", in(reg) line, options(nostack));
                line += iline;
            }
            asm!("dsb ish", "isb", options(nostack));
        }
    }

    fn initial_stack(&mut self) -> &mut [usize] {
        unsafe { core::slice::from_raw_parts_mut(self.stack_pointer, self.stack_words) }
    }

    fn initial_stack_pointer(&self) -> u64 {
        self.stack_pointer as u64
    }

    fn run_on_stack(&mut self, top: u64, body: &mut dyn FnMut(&mut Self) -> Infallible) -> ! {
        struct Frame<'a> {
            platform: *mut LinuxPlatform,
            body: &'a mut dyn FnMut(&mut LinuxPlatform) -> Infallible,
        }

        extern "C" fn resume(frame: *mut u8) -> ! {
            let frame = unsafe { &mut *(frame as *mut Frame) };
            match (frame.body)(unsafe { &mut *frame.platform }) {}
        }

        // The frame stays valid: the old stack is never popped again.
        let mut frame = Frame { platform: self, body };
        let top = top & !0xf;
        unsafe {
            #[cfg(target_arch = "x86_64")]
            asm!(
                "mov rsp, {top}",
                "call {resume}",
                top = in(reg) top,
                resume = sym resume,
                in("rdi") &mut frame as *mut Frame as *mut u8,
                options(noreturn),
            );
            #[cfg(target_arch = "aarch64")]
            asm!(
                "mov sp, {top}",
                "bl {resume}",
                top = in(reg) top,
                resume = sym resume,
                in("x0") &mut frame as *mut Frame as *mut u8,
                options(noreturn),
            );
        }
    }

    fn exit(&mut self, status: i32) -> ! {
        loop {
            unsafe { syscall6(nr::EXIT_GROUP, status as usize, 0, 0, 0, 0, 0) };
        }
    }

    fn launch(&mut self, state: LaunchState) -> ! {
        unsafe {
            // rdx = 0: no termination function for the program to register.
            #[cfg(target_arch = "x86_64")]
            asm!(
                "mov rsp, rdi",
                "push rsi",
                "xor eax, eax",
                "xor ebx, ebx",
                "xor ecx, ecx",
                "xor edx, edx",
                "xor esi, esi",
                "xor edi, edi",
                "xor ebp, ebp",
                "xor r8d, r8d",
                "xor r9d, r9d",
                "xor r10d, r10d",
                "xor r11d, r11d",
                "xor r12d, r12d",
                "xor r13d, r13d",
                "xor r14d, r14d",
                "xor r15d, r15d",
                "ret",
                in("rdi") state.stack_pointer,
                in("rsi") state.entry,
                options(noreturn),
            );
            // x0 = 0: no termination function. x16 keeps the entry address.
            #[cfg(target_arch = "aarch64")]
            asm!(
                "mov sp, x0",
                "mov x16, x1",
                "mov x0, xzr",
                "mov x1, xzr",
                "mov x2, xzr",
                "mov x3, xzr",
                "mov x4, xzr",
                "mov x5, xzr",
                "mov x6, xzr",
                "mov x7, xzr",
                "mov x8, xzr",
                "mov x9, xzr",
                "mov x10, xzr",
                "mov x11, xzr",
                "mov x12, xzr",
                "mov x13, xzr",
                "mov x14, xzr",
                "mov x15, xzr",
                "mov x17, xzr",
                "mov x19, xzr",
                "mov x20, xzr",
                "mov x21, xzr",
                "mov x22, xzr",
                "mov x23, xzr",
                "mov x24, xzr",
                "mov x25, xzr",
                "mov x26, xzr",
                "mov x27, xzr",
                "mov x28, xzr",
                "mov x29, xzr",
                "mov x30, xzr",
                "br x16",
                in("x0") state.stack_pointer,
                in("x1") state.entry,
                options(noreturn),
            );
        }
    }
}

/// Everything after the entry symbol.
///
/// The packed header follows the stub's own ELF file, so its length comes from
/// the stub's headers at the front of the mapped file.
///
/// # Safety
/// Must be called exactly once, from the process entry point, with the
/// kernel's initial stack pointer.
pub unsafe fn stub_start(stack_pointer: *mut usize) -> ! {
    let mut platform = LinuxPlatform::new(stack_pointer);
    let bytes = match platform.map_self() {
        Ok(bytes) => bytes,
        Err(Errno(errno)) => fatal(&mut platform, Fault::SelfImage { errno }),
    };
    let stub_len = match elf_extent(bytes) {
        Some(len) => len,
        None => fatal(&mut platform, Fault::BadMagic),
    };
    loader::run(&mut platform, Image::new(bytes), stub_len)
}
