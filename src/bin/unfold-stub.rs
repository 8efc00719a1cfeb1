//! The loader stub.
//!
//! Built with `cargo build --release --features stub --bin unfold-stub` and
//! handed to `unfold pack --stub`. The kernel enters at `_start` with `argc` on
//! top of the stack; everything after that is `stub_start`.

#![no_main]

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
core::arch::global_asm!(
    ".globl _start",
    "_start:",
    "xor ebp, ebp",
    "mov rdi, rsp",
    "and rsp, -16",
    "call {entry}",
    "ud2",
    entry = sym entry,
);

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
core::arch::global_asm!(
    ".globl _start",
    "_start:",
    "mov x29, xzr",
    "mov x30, xzr",
    "mov x0, sp",
    "bl {entry}",
    "brk #0",
    entry = sym entry,
);

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe extern "C" fn entry(stack_pointer: *mut usize) -> ! {
    unfold::platform::linux::stub_start(stack_pointer)
}
