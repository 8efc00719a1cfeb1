//! Entry trampoline.
//!
//! First thing the stub does: get off the process stack onto a private scratch
//! stack, then find and check the header and descriptor table that follow the
//! stub in the packed file. Positions are computed from the image base and the
//! stub's own length, never from addresses fixed at pack time.

use crate::builder::Region;
use crate::fault::{fatal, Fault};
use crate::format::{Descriptor, Header, Image};
use crate::platform::{Errno, Platform};
use crate::utils::align_up;

/// Size of the private stack the loader runs on.
pub const SCRATCH_STACK_SIZE: u64 = 64 * 1024;

/// The scratch stack mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchStack {
    pub base: u64,
    pub len: u64,
}

impl ScratchStack {
    /// Initial stack pointer (stacks grow down).
    pub fn top(&self) -> u64 {
        self.base + self.len
    }

    pub fn region(&self) -> Region {
        Region { start: self.base, end: self.top() }
    }
}

/// Maps the scratch stack somewhere away from everything else.
pub fn reserve_scratch_stack<P: Platform>(platform: &mut P) -> ScratchStack {
    let len = align_up(SCRATCH_STACK_SIZE, platform.page_size()).unwrap_or(SCRATCH_STACK_SIZE);
    match platform.map_anywhere(len) {
        Ok(base) => ScratchStack { base, len },
        Err(Errno(errno)) => fatal(platform, Fault::MapFailed { errno }),
    }
}

/// The header has been found and checked; the table is in bounds.
#[derive(Debug, Clone, Copy)]
pub struct Located<'a> {
    pub image: Image<'a>,
    pub header: Header,
    table: &'a [u8],
    payload_start: u64,
}

impl<'a> Located<'a> {
    /// Parses the header at `stub_len` and bounds-checks the table after it.
    pub fn new(image: Image<'a>, stub_len: usize) -> Result<Located<'a>, Fault> {
        let stub_len = stub_len as u64;
        let header_bytes = image.slice(stub_len, Header::SIZE as u64).ok_or(Fault::Truncated)?;
        let header = Header::parse(header_bytes)?;
        let table_len = (header.count as usize * Descriptor::SIZE) as u64;
        let table = image.slice(stub_len + Header::SIZE as u64, table_len).ok_or(Fault::Truncated)?;
        Ok(Located { image, header, table, payload_start: stub_len + header.metadata_len() as u64 })
    }

    /// Descriptor `index`, checked on its own and against the image.
    pub fn descriptor(&self, index: usize) -> Result<Descriptor, Fault> {
        let at = index * Descriptor::SIZE;
        let bytes = self.table.get(at..at + Descriptor::SIZE).ok_or(Fault::Truncated)?;
        let desc = Descriptor::parse(bytes, index)?;
        if !desc.is_zero_fill() && (desc.src_offset < self.payload_start || self.payload(&desc).is_none()) {
            return Err(Fault::PayloadOutOfBounds { index });
        }
        Ok(desc)
    }

    /// All descriptors, in file order.
    pub fn descriptors(&self) -> impl Iterator<Item = Result<Descriptor, Fault>> + '_ {
        (0..self.header.count as usize).map(|index| self.descriptor(index))
    }

    /// Compressed bytes of a data descriptor.
    pub fn payload(&self, desc: &Descriptor) -> Option<&'a [u8]> {
        self.image.slice(desc.src_offset, desc.src_len)
    }

    /// Offset of the first payload byte.
    pub fn payload_start(&self) -> u64 {
        self.payload_start
    }
}

/// `Start -> HeaderLocated`, or death.
pub fn locate<'a, P: Platform>(platform: &mut P, image: Image<'a>, stub_len: usize) -> Located<'a> {
    match Located::new(image, stub_len) {
        Ok(located) => located,
        Err(fault) => fatal(platform, fault),
    }
}
