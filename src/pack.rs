//! Packed image producer.
//!
//! The host-side counterpart of the stub: compresses segments with the paired
//! codecs, lays out `[stub][header][table][payload]`, and writes the result.
//! Also used to check a rebuilt address space against the segments that went in.

use anyhow::{anyhow, bail, ensure, Context, Result};
use object::elf;
use object::read::elf::{ElfFile64, FileHeader, ProgramHeader};
use object::Endianness;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::builder::Region;
use crate::codec::{Codec, Lz4, Stored};
use crate::format::{Descriptor, Header, Image, Method, FLAG_PERMS, FLAG_ZERO_FILL, MAGIC};
use crate::platform::emulator::Emulator;
use crate::platform::Prot;
use crate::trampoline::Located;

const PAGE_SIZE: u64 = 0x1000;
/// Where position-independent executables are placed. Clear of the usual
/// executable, heap and mmap areas, and 64 KiB aligned.
pub const PIE_LOAD_BIAS: u64 = 0x40_0000_0000;

/// One segment to pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpec {
    /// Virtual address of the first byte.
    pub addr: u64,
    /// Initialised contents; empty for a zero-fill segment.
    pub data: Vec<u8>,
    /// Size in memory, at least `data.len()`.
    pub mem_len: u64,
    /// ELF `PF_*` bits.
    pub flags: u32,
}

impl SegmentSpec {
    pub fn data(addr: u64, data: Vec<u8>, flags: u32) -> Self {
        let mem_len = data.len() as u64;
        Self { addr, data, mem_len, flags }
    }

    pub fn zero_fill(addr: u64, mem_len: u64, flags: u32) -> Self {
        Self { addr, data: Vec::new(), mem_len, flags }
    }
}

/// Builds a packed image.
pub struct Packer {
    stub: Vec<u8>,
    segments: Vec<SegmentSpec>,
    entry: u64,
    phdr_addr: u64,
    phnum: u32,
    page_size: u64,
}

impl Packer {
    pub fn new(stub: Vec<u8>) -> Self {
        Self { stub, segments: Vec::new(), entry: 0, phdr_addr: 0, phnum: 0, page_size: PAGE_SIZE }
    }

    /// Page size the target maps with; segments may not share a page.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn add_segment(&mut self, segment: SegmentSpec) {
        self.segments.push(segment);
    }

    pub fn set_entry(&mut self, entry: u64) {
        self.entry = entry;
    }

    pub fn set_program_headers(&mut self, addr: u64, count: u32) {
        self.phdr_addr = addr;
        self.phnum = count;
    }

    pub fn segments(&self) -> &[SegmentSpec] {
        &self.segments
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn stub_len(&self) -> usize {
        self.stub.len()
    }

    /// Takes every `PT_LOAD` segment, the entry point and the program header
    /// location of a static 64-bit ELF executable. Position-independent ones
    /// (`ET_DYN` without an interpreter) are moved to `PIE_LOAD_BIAS`.
    pub fn from_elf(stub: Vec<u8>, data: &[u8]) -> Result<Packer> {
        let file = ElfFile64::<Endianness>::parse(data).context("failed to parse ELF file")?;
        let endian = file.endian();
        let header = file.elf_header();
        let bias = match header.e_type(endian) {
            elf::ET_EXEC => 0,
            elf::ET_DYN => PIE_LOAD_BIAS,
            other => bail!("only executables can be packed (e_type {})", other),
        };

        let mut packer = Packer::new(stub);
        let phoff = header.e_phoff(endian);
        let phdrs = file.elf_program_headers();
        let mut phdr_addr = 0;

        for phdr in phdrs {
            match phdr.p_type(endian) {
                elf::PT_INTERP => bail!("dynamically linked executables are not supported"),
                elf::PT_LOAD => {
                    let vaddr = phdr
                        .p_vaddr(endian)
                        .checked_add(bias)
                        .ok_or_else(|| anyhow!("PT_LOAD address wraps around"))?;
                    let offset = phdr.p_offset(endian);
                    let filesz = phdr.p_filesz(endian);
                    let memsz = phdr.p_memsz(endian);
                    let flags = phdr.p_flags(endian) & FLAG_PERMS;
                    let file_end = offset
                        .checked_add(filesz)
                        .ok_or_else(|| anyhow!("PT_LOAD at 0x{:x} lies outside the file", vaddr))?;
                    if phoff >= offset && phoff < file_end {
                        phdr_addr = vaddr.wrapping_add(phoff - offset);
                    }
                    if memsz == 0 {
                        continue;
                    }
                    let segment = if filesz == 0 {
                        SegmentSpec::zero_fill(vaddr, memsz, flags)
                    } else {
                        let bytes = phdr
                            .data(endian, data)
                            .map_err(|()| anyhow!("PT_LOAD at 0x{:x} lies outside the file", vaddr))?;
                        SegmentSpec { addr: vaddr, data: bytes.to_vec(), mem_len: memsz, flags }
                    };
                    tracing::debug!("PT_LOAD 0x{:x}+0x{:x} (file 0x{:x}) flags {}", vaddr, memsz, filesz, flags);
                    packer.add_segment(segment);
                }
                _ => {}
            }
        }

        packer.set_entry(header.e_entry(endian).wrapping_add(bias));
        packer.set_program_headers(phdr_addr, phdrs.len() as u32);
        Ok(packer)
    }

    /// Lays out the packed image.
    pub fn pack(&self) -> Result<Vec<u8>> {
        ensure!(!self.segments.is_empty(), "nothing to pack");
        let count = u16::try_from(self.segments.len()).context("too many segments")?;

        let mut segments: Vec<&SegmentSpec> = self.segments.iter().collect();
        segments.sort_by_key(|s| s.addr);

        let header = Header { count, entry: self.entry, phdr_addr: self.phdr_addr, phnum: self.phnum };
        let mut offset = (self.stub.len() + header.metadata_len()) as u64;
        let mut descriptors = Vec::with_capacity(segments.len());
        let mut payload = Vec::new();

        for segment in segments {
            ensure!(
                segment.mem_len >= segment.data.len() as u64 && segment.mem_len > 0,
                "segment at 0x{:x} has memory size 0x{:x} smaller than its data",
                segment.addr,
                segment.mem_len
            );
            let desc = if segment.data.is_empty() {
                Descriptor {
                    src_offset: 0,
                    src_len: 0,
                    dst_addr: segment.addr,
                    dst_len: segment.mem_len,
                    mem_len: segment.mem_len,
                    flags: (segment.flags & FLAG_PERMS) | FLAG_ZERO_FILL,
                    method: Method::Stored,
                }
            } else {
                let (method, bytes) = compress(&segment.data);
                let desc = Descriptor {
                    src_offset: offset,
                    src_len: bytes.len() as u64,
                    dst_addr: segment.addr,
                    dst_len: segment.data.len() as u64,
                    mem_len: segment.mem_len,
                    flags: segment.flags & FLAG_PERMS,
                    method,
                };
                tracing::debug!(
                    "segment 0x{:x}: {} -> {} bytes ({:?})",
                    segment.addr,
                    segment.data.len(),
                    bytes.len(),
                    method
                );
                offset += bytes.len() as u64;
                payload.extend_from_slice(&bytes);
                desc
            };
            descriptors.push(desc);
        }

        let mut out = self.stub.clone();
        header.write(&mut out);
        for desc in &descriptors {
            desc.write(&mut out);
        }
        out.extend_from_slice(&payload);

        self.check(&out)?;
        tracing::info!("packed {} segments into {} bytes", count, out.len());
        Ok(out)
    }

    /// Runs the stub's own checks over a freshly packed image.
    fn check(&self, out: &[u8]) -> Result<()> {
        let located = Located::new(Image::new(out), self.stub.len())?;
        let mut next_free = 0;
        for (index, desc) in located.descriptors().enumerate() {
            let desc = desc?;
            let region = Region::of(&desc, self.page_size)
                .ok_or_else(|| anyhow!("segment {} wraps around the address space", index))?;
            ensure!(
                region.start >= next_free,
                "segment {} at 0x{:x} shares a page with the previous one",
                index,
                desc.dst_addr
            );
            next_free = region.end;
        }
        Ok(())
    }
}

/// LZ4 unless it does not shrink the data.
fn compress(data: &[u8]) -> (Method, Vec<u8>) {
    let packed = Lz4.compress(data);
    if packed.len() < data.len() {
        (Lz4::METHOD, packed)
    } else {
        (Stored::METHOD, Stored.compress(data))
    }
}

/// Finds the header in a packed file whose stub length is not known.
pub fn find_stub_len(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(MAGIC.len())
        .enumerate()
        .filter(|(_, window)| *window == MAGIC)
        .map(|(at, _)| at)
        .find(|&at| Located::new(Image::new(bytes), at).is_ok())
}

/// Writes a packed image to disk and makes it executable.
pub fn write_packed(output_path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(output_path, bytes)
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    let mut perms = std::fs::metadata(output_path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(output_path, perms)?;
    Ok(())
}

/// Checks that `emu` holds exactly `segments`: contents, zero tails, and permissions.
pub fn verify_segments(emu: &Emulator, segments: &[SegmentSpec]) -> Result<()> {
    for segment in segments {
        let memory = emu
            .read(segment.addr, segment.mem_len)
            .ok_or_else(|| anyhow!("segment 0x{:x} is not mapped", segment.addr))?;
        let (data, tail) = memory.split_at(segment.data.len());
        ensure!(data == segment.data.as_slice(), "segment 0x{:x} contents differ", segment.addr);
        ensure!(tail.iter().all(|&b| b == 0), "segment 0x{:x} has a dirty zero tail", segment.addr);

        let expected = Prot::from_elf_flags(segment.flags);
        let actual = emu.prot_at(segment.addr);
        ensure!(
            actual == Some(expected),
            "segment 0x{:x} has permissions {:?}, expected {:?}",
            segment.addr,
            actual,
            expected
        );
    }
    Ok(())
}
