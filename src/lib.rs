//! Runtime loader stub for packed executables.
//!
//! This library holds the stub core and its host-side companions.
//! It is organized into several modules:
//! - `trampoline`: scratch stack and header discovery.
//! - `codec`: payload codecs (the decompression engine).
//! - `builder`: recreating segments in memory.
//! - `launch`: auxiliary vector fix-up and the final jump.
//! - `loader`: the state machine tying those together.
//! - `platform`: the syscall shim (Linux) and the reference emulator.
//! - `format`, `fault`: the packed image layout and the fatal exit path.
//! - `pack`, `config`: the paired packer and the CLI configuration.

pub mod builder;
pub mod codec;
pub mod config;
pub mod fault;
pub mod format;
pub mod launch;
pub mod loader;
pub mod pack;
pub mod platform;
pub mod trampoline;
pub mod utils;
