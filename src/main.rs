//! Entry point for the unfold host companion.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize `tracing` from `--log-level` (or `RUST_LOG`).
//! 3. Dispatch: `pack` an ELF executable, `inspect` a packed file, or `run`
//!    the loader stub on the emulator and optionally verify the result.
//!
//! Error handling is done via `anyhow`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use unfold::config::{Command, Config};
use unfold::format::{self, Image};
use unfold::loader;
use unfold::pack::{self, Packer};
use unfold::platform::emulator::{Emulator, Outcome};
use unfold::trampoline::Located;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match config.command {
        Command::Pack { input, stub, output } => {
            let mut stub = std::fs::read(&stub).with_context(|| format!("failed to read {}", stub.display()))?;
            // The stub finds the header at the end of its own ELF file.
            let stub_len = format::elf_extent(&stub).context("stub is not a 64-bit little-endian ELF file")?;
            anyhow::ensure!(stub_len <= stub.len(), "stub is shorter than its headers say");
            stub.truncate(stub_len);
            let elf = map_file(&input)?;
            let packed = Packer::from_elf(stub, &elf)?.pack()?;
            pack::write_packed(&output, &packed)?;
            println!("Packed {} into {}", input.display(), output.display());
        }
        Command::Inspect { image, stub_len } => {
            let bytes = map_file(&image)?;
            let stub_len = resolve_stub_len(&bytes, stub_len)?;
            inspect(&bytes, stub_len)?;
        }
        Command::Run { image, stub_len, page_size, verify } => {
            let bytes = map_file(&image)?;
            let stub_len = resolve_stub_len(&bytes, stub_len)?;
            anyhow::ensure!(page_size.is_power_of_two(), "page size must be a power of two");

            let mut emu = Emulator::new(page_size);
            let outcome = emu.run(|platform| loader::run(platform, Image::new(&bytes), stub_len));
            for (start, len, prot) in emu.mappings() {
                tracing::info!("mapping 0x{:x}..0x{:x} {:?}", start, start + len, prot);
            }

            match outcome {
                Outcome::Launched(state) => {
                    println!("Launched entry 0x{:x} with sp 0x{:x}", state.entry, state.stack_pointer)
                }
                Outcome::Exited { status, fault } => {
                    let reason = fault.map(|f| f.to_string()).unwrap_or_else(|| "no fault".into());
                    anyhow::bail!("stub exited with status {} ({})", status, reason);
                }
            }

            if let Some(original) = verify {
                let elf = map_file(&original)?;
                let expected = Packer::from_elf(Vec::new(), &elf)?;
                pack::verify_segments(&emu, expected.segments())?;
                println!("Rebuilt segments match {}", original.display());
            }
        }
    }
    Ok(())
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

fn resolve_stub_len(bytes: &[u8], given: Option<usize>) -> Result<usize> {
    match given {
        Some(len) => Ok(len),
        None => pack::find_stub_len(bytes).ok_or_else(|| anyhow!("no packed header found")),
    }
}

fn inspect(bytes: &[u8], stub_len: usize) -> Result<()> {
    let located = Located::new(Image::new(bytes), stub_len).context("failed to locate the header")?;
    let header = located.header;
    println!("stub length:  {} bytes", stub_len);
    println!("entry:        0x{:x}", header.entry);
    println!("phdr:         0x{:x} ({} entries)", header.phdr_addr, header.phnum);
    println!("payload from: 0x{:x}", located.payload_start());
    for (index, desc) in located.descriptors().enumerate() {
        let desc = desc.with_context(|| format!("descriptor {}", index))?;
        let kind = if desc.is_zero_fill() { "zero".to_string() } else { format!("{:?}", desc.method) };
        println!(
            "[{}] 0x{:08x}+0x{:x} mem 0x{:x} flags {:03b} {} file 0x{:x}+0x{:x}",
            index, desc.dst_addr, desc.dst_len, desc.mem_len, desc.perms(), kind, desc.src_offset, desc.src_len
        );
    }
    Ok(())
}
