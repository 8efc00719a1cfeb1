//! Image builder.
//!
//! Recreates each original segment at its virtual address: map it writable,
//! expand the payload into it, then switch it to its final permissions.
//! Nothing is written to a region after its permissions are final.

use crate::codec;
use crate::fault::{fatal, Fault};
use crate::format::{Descriptor, Header};
use crate::platform::{Errno, Platform, Prot};
use crate::trampoline::Located;
use crate::utils::{align_down, align_up};

/// Every descriptor has been materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Built {
    pub header: Header,
}

/// The page-rounded memory a descriptor occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

impl Region {
    /// `None` if rounding the end up overflows.
    pub fn of(desc: &Descriptor, page_size: u64) -> Option<Region> {
        Some(Region {
            start: align_down(desc.dst_addr, page_size),
            end: align_up(desc.dst_addr.checked_add(desc.mem_len)?, page_size)?,
        })
    }

    /// Pages holding `len` bytes at `start`, cut off at the top of the address space.
    pub fn around(start: u64, len: u64, page_size: u64) -> Region {
        let end = start.saturating_add(len);
        Region {
            start: align_down(start, page_size),
            end: align_up(end, page_size).unwrap_or(u64::MAX),
        }
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// `HeaderLocated -> SegmentsBuilt(N)`, one descriptor at a time.
///
/// `reserved` is memory the loader is still using (its stack, the packed image);
/// no segment may be placed over it.
pub fn build<P: Platform>(platform: &mut P, located: &Located, reserved: &[Region]) -> Built {
    let page_size = platform.page_size();
    let mut next_free = 0;

    for index in 0..located.header.count as usize {
        let desc = match located.descriptor(index) {
            Ok(desc) => desc,
            Err(fault) => fatal(platform, fault),
        };
        let region = match Region::of(&desc, page_size) {
            Some(region) => region,
            None => fatal(platform, Fault::BadDescriptor { index }),
        };
        if region.start < next_free || reserved.iter().any(|r| r.overlaps(&region)) {
            fatal(platform, Fault::Overlap { index });
        }
        build_segment(platform, located, &desc, region);
        next_free = region.end;
    }

    Built { header: located.header }
}

fn build_segment<P: Platform>(platform: &mut P, located: &Located, desc: &Descriptor, region: Region) {
    tracing::trace!(
        "segment 0x{:x}+0x{:x} ({} bytes from offset 0x{:x}, {:?})",
        desc.dst_addr,
        desc.mem_len,
        desc.src_len,
        desc.src_offset,
        desc.method
    );

    // Fresh anonymous pages are zero, which is all a zero-fill segment or a tail needs.
    if let Err(Errno(errno)) = platform.map_fixed(region.start, region.len()) {
        fatal(platform, Fault::MapFailed { errno });
    }

    if !desc.is_zero_fill() {
        let expanded = match (located.payload(desc), platform.memory_mut(desc.dst_addr, desc.dst_len)) {
            (Some(src), Some(dst)) => codec::expand(desc.method, src, dst),
            (None, _) => Err(Fault::Truncated),
            (_, None) => Err(Fault::RegionUnavailable),
        };
        if let Err(fault) = expanded {
            fatal(platform, fault);
        }
    }

    let prot = Prot::from_elf_flags(desc.perms());
    if prot.contains(Prot::EXEC) {
        platform.flush_icache(region.start, region.len());
    }
    if let Err(Errno(errno)) = platform.protect(region.start, region.len(), prot) {
        fatal(platform, Fault::ProtectFailed { errno });
    }
}
