//! Packed image format.
//!
//! A packed file is `[stub][header][descriptor table][payload]`. The header sits
//! right after the stub, so the stub finds it from its own length and the base
//! address the image is mapped at. All fields are little-endian.

use crate::fault::Fault;
use crate::utils::{le_u16, le_u32, le_u64};

/// Header magic.
pub const MAGIC: [u8; 4] = *b"UFLD";
/// The only format version.
pub const VERSION: u16 = 1;

/// Descriptor flag: the segment has no payload and is left zero.
pub const FLAG_ZERO_FILL: u32 = 1 << 8;
/// ELF permission bits carried in the low flag bits.
pub const FLAG_PERMS: u32 = 0b111;

/// The packed file as the stub sees it: mapped bytes plus the address they live at.
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> Image<'a> {
    /// Wraps bytes mapped at their own address.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { base: bytes.as_ptr() as u64, bytes }
    }

    /// Wraps bytes that represent an image loaded at `base`.
    pub fn with_base(base: u64, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `len` bytes at file `offset`, or `None` if any of them is outside the image.
    pub fn slice(&self, offset: u64, len: u64) -> Option<&'a [u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.bytes.get(start..end)
    }
}

/// Bytes of file a 64-bit little-endian ELF file accounts for: the furthest end
/// of its headers, program header table, segments and section header table.
///
/// A stub binary's packed header starts right there.
pub fn elf_extent(bytes: &[u8]) -> Option<usize> {
    if bytes.get(..4)? != b"\x7fELF" || *bytes.get(4)? != 2 || *bytes.get(5)? != 1 {
        return None;
    }
    let phoff = le_u64(bytes, 0x20)?;
    let shoff = le_u64(bytes, 0x28)?;
    let phentsize = le_u16(bytes, 0x36)? as u64;
    let phnum = le_u16(bytes, 0x38)? as u64;
    let shentsize = le_u16(bytes, 0x3a)? as u64;
    let shnum = le_u16(bytes, 0x3c)? as u64;

    let mut end = 64u64
        .max(phoff.checked_add(phentsize * phnum)?)
        .max(shoff.checked_add(shentsize * shnum)?);
    for i in 0..phnum {
        let at = usize::try_from(phoff.checked_add(i * phentsize)?).ok()?;
        let offset = le_u64(bytes, at.checked_add(0x08)?)?;
        let filesz = le_u64(bytes, at.checked_add(0x20)?)?;
        end = end.max(offset.checked_add(filesz)?);
    }
    usize::try_from(end).ok()
}

/// Codec used for one segment's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Method {
    Stored = 0,
    Lz4 = 1,
}

impl Method {
    pub fn from_u8(value: u8) -> Result<Method, Fault> {
        match value {
            0 => Ok(Method::Stored),
            1 => Ok(Method::Lz4),
            method => Err(Fault::UnknownMethod { method }),
        }
    }
}

/// The fixed-size header after the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Number of descriptors in the table.
    pub count: u16,
    /// Original program entry address.
    pub entry: u64,
    /// Virtual address of the original program headers, 0 if unknown.
    pub phdr_addr: u64,
    /// Number of original program headers.
    pub phnum: u32,
}

impl Header {
    pub const SIZE: usize = 32;

    /// Parses and checks the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Header, Fault> {
        if bytes.len() < Self::SIZE {
            return Err(Fault::Truncated);
        }
        if bytes[..4] != MAGIC {
            return Err(Fault::BadMagic);
        }
        let version = le_u16(bytes, 4).ok_or(Fault::Truncated)?;
        if version != VERSION {
            return Err(Fault::BadVersion { version });
        }
        let header = Header {
            count: le_u16(bytes, 6).ok_or(Fault::Truncated)?,
            entry: le_u64(bytes, 8).ok_or(Fault::Truncated)?,
            phdr_addr: le_u64(bytes, 16).ok_or(Fault::Truncated)?,
            phnum: le_u32(bytes, 24).ok_or(Fault::Truncated)?,
        };
        if header.count == 0 || le_u32(bytes, 28) != Some(0) {
            return Err(Fault::BadHeader);
        }
        Ok(header)
    }

    /// Bytes of header plus descriptor table.
    pub fn metadata_len(&self) -> usize {
        Self::SIZE + self.count as usize * Descriptor::SIZE
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&self.phdr_addr.to_le_bytes());
        out.extend_from_slice(&self.phnum.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }
}

/// One original program segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// File offset of the payload.
    pub src_offset: u64,
    /// Payload length, 0 for zero-fill.
    pub src_len: u64,
    /// Where the segment starts in memory.
    pub dst_addr: u64,
    /// Bytes produced by the payload (or zeroed, for zero-fill).
    pub dst_len: u64,
    /// Bytes the segment occupies in memory; the tail past `dst_len` is zero.
    pub mem_len: u64,
    /// ELF `PF_*` bits plus `FLAG_ZERO_FILL`.
    pub flags: u32,
    pub method: Method,
}

impl Descriptor {
    pub const SIZE: usize = 48;

    /// Parses table entry `index` from `bytes` (exactly one entry) and checks its fields.
    pub fn parse(bytes: &[u8], index: usize) -> Result<Descriptor, Fault> {
        let field = |at| le_u64(bytes, at).ok_or(Fault::Truncated);
        let flags = le_u32(bytes, 40).ok_or(Fault::Truncated)?;
        let method = Method::from_u8(*bytes.get(44).ok_or(Fault::Truncated)?)?;
        let reserved = bytes.get(45..48).ok_or(Fault::Truncated)?;
        let desc = Descriptor {
            src_offset: field(0)?,
            src_len: field(8)?,
            dst_addr: field(16)?,
            dst_len: field(24)?,
            mem_len: field(32)?,
            flags,
            method,
        };
        if reserved != [0, 0, 0] || !desc.is_consistent() {
            return Err(Fault::BadDescriptor { index });
        }
        Ok(desc)
    }

    fn is_consistent(&self) -> bool {
        if self.flags & !(FLAG_PERMS | FLAG_ZERO_FILL) != 0 {
            return false;
        }
        if self.mem_len == 0 || self.mem_len < self.dst_len {
            return false;
        }
        if self.dst_addr.checked_add(self.mem_len).is_none() {
            return false;
        }
        if self.is_zero_fill() {
            return self.src_len == 0;
        }
        if self.src_len == 0 || self.dst_len == 0 {
            return false;
        }
        self.method != Method::Stored || self.src_len == self.dst_len
    }

    pub fn is_zero_fill(&self) -> bool {
        self.flags & FLAG_ZERO_FILL != 0
    }

    /// The ELF permission bits.
    pub fn perms(&self) -> u32 {
        self.flags & FLAG_PERMS
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.src_offset.to_le_bytes());
        out.extend_from_slice(&self.src_len.to_le_bytes());
        out.extend_from_slice(&self.dst_addr.to_le_bytes());
        out.extend_from_slice(&self.dst_len.to_le_bytes());
        out.extend_from_slice(&self.mem_len.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.push(self.method as u8);
        out.extend_from_slice(&[0; 3]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_segment() -> Descriptor {
        Descriptor {
            src_offset: 0x200,
            src_len: 40,
            dst_addr: 0x401000,
            dst_len: 100,
            mem_len: 100,
            flags: 5,
            method: Method::Lz4,
        }
    }

    #[test]
    fn header_parses_what_it_writes() {
        let header = Header { count: 3, entry: 0x401000, phdr_addr: 0x400040, phnum: 4 };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        assert_eq!(bytes.len(), Header::SIZE);
        assert_eq!(Header::parse(&bytes), Ok(header));
        assert_eq!(header.metadata_len(), 32 + 3 * 48);
    }

    #[test]
    fn header_rejects_garbage() {
        let mut bytes = Vec::new();
        Header { count: 1, entry: 0, phdr_addr: 0, phnum: 0 }.write(&mut bytes);
        assert_eq!(Header::parse(&bytes[..31]), Err(Fault::Truncated));

        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'X';
        assert_eq!(Header::parse(&wrong_magic), Err(Fault::BadMagic));

        let mut wrong_version = bytes.clone();
        wrong_version[4] = 9;
        assert_eq!(Header::parse(&wrong_version), Err(Fault::BadVersion { version: 9 }));

        let mut reserved = bytes.clone();
        reserved[30] = 1;
        assert_eq!(Header::parse(&reserved), Err(Fault::BadHeader));

        let mut empty = bytes;
        empty[6] = 0;
        assert_eq!(Header::parse(&empty), Err(Fault::BadHeader));
    }

    #[test]
    fn descriptor_parses_what_it_writes() {
        let desc = code_segment();
        let mut bytes = Vec::new();
        desc.write(&mut bytes);
        assert_eq!(bytes.len(), Descriptor::SIZE);
        assert_eq!(Descriptor::parse(&bytes, 0), Ok(desc));
        assert_eq!(desc.perms(), 5);
    }

    #[test]
    fn descriptor_field_checks() {
        let reject = |desc: Descriptor| {
            let mut bytes = Vec::new();
            desc.write(&mut bytes);
            Descriptor::parse(&bytes, 7)
        };

        let stored_mismatch = Descriptor { method: Method::Stored, ..code_segment() };
        assert_eq!(reject(stored_mismatch), Err(Fault::BadDescriptor { index: 7 }));

        let zero_with_payload = Descriptor { flags: 6 | FLAG_ZERO_FILL, ..code_segment() };
        assert_eq!(reject(zero_with_payload), Err(Fault::BadDescriptor { index: 7 }));

        let short_memory = Descriptor { mem_len: 99, ..code_segment() };
        assert_eq!(reject(short_memory), Err(Fault::BadDescriptor { index: 7 }));

        let wraps = Descriptor { dst_addr: u64::MAX - 10, ..code_segment() };
        assert_eq!(reject(wraps), Err(Fault::BadDescriptor { index: 7 }));

        let unknown_flag = Descriptor { flags: 1 << 12, ..code_segment() };
        assert_eq!(reject(unknown_flag), Err(Fault::BadDescriptor { index: 7 }));

        let zero_fill = Descriptor { src_len: 0, flags: 6 | FLAG_ZERO_FILL, ..code_segment() };
        assert!(reject(zero_fill).is_ok());
    }

    #[test]
    fn descriptor_rejects_unknown_method() {
        let mut bytes = Vec::new();
        code_segment().write(&mut bytes);
        bytes[44] = 9;
        assert_eq!(Descriptor::parse(&bytes, 0), Err(Fault::UnknownMethod { method: 9 }));
    }

    fn elf_with(phdrs: &[(u64, u64)], shoff: u64, shnum: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[..6].copy_from_slice(b"\x7fELF\x02\x01");
        bytes[0x20..0x28].copy_from_slice(&64u64.to_le_bytes());
        bytes[0x28..0x30].copy_from_slice(&shoff.to_le_bytes());
        bytes[0x36..0x38].copy_from_slice(&56u16.to_le_bytes());
        bytes[0x38..0x3a].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());
        bytes[0x3a..0x3c].copy_from_slice(&64u16.to_le_bytes());
        bytes[0x3c..0x3e].copy_from_slice(&shnum.to_le_bytes());
        for &(offset, filesz) in phdrs {
            let mut phdr = [0u8; 56];
            phdr[0x08..0x10].copy_from_slice(&offset.to_le_bytes());
            phdr[0x20..0x28].copy_from_slice(&filesz.to_le_bytes());
            bytes.extend_from_slice(&phdr);
        }
        bytes
    }

    #[test]
    fn elf_extent_covers_segments_and_section_headers() {
        let mut bytes = elf_with(&[(0, 0x1000), (0x1000, 0x234)], 0x1300, 4);
        bytes.resize(0x2000, 0);
        assert_eq!(elf_extent(&bytes), Some(0x1300 + 4 * 64));

        let bytes = elf_with(&[(0, 0x1000), (0x1000, 0x234)], 0, 0);
        assert_eq!(elf_extent(&bytes), Some(0x1234));
    }

    #[test]
    fn elf_extent_needs_an_elf_file() {
        assert_eq!(elf_extent(b"UFLD"), None);
        let mut bytes = elf_with(&[], 0, 0);
        bytes[4] = 1;
        assert_eq!(elf_extent(&bytes), None);
        let truncated = elf_with(&[(0, 0x10)], 0, 0);
        assert_eq!(elf_extent(&truncated[..100]), None);
    }

    #[test]
    fn image_slices_are_bounded() {
        let bytes = [0u8; 16];
        let image = Image::with_base(0x1000, &bytes);
        assert_eq!(image.base(), 0x1000);
        assert_eq!(image.slice(8, 8).map(<[u8]>::len), Some(8));
        assert!(image.slice(8, 9).is_none());
        assert!(image.slice(u64::MAX, 1).is_none());
    }
}
