//! Fatal error path.
//!
//! The stub has nobody to report to. Every inconsistency is described by a
//! [`Fault`] and handed to [`fatal`], which ends the process with
//! [`FATAL_EXIT_STATUS`] and never returns.

use std::fmt;

use crate::platform::Platform;

/// Exit status of a stub that could not rebuild the program.
pub const FATAL_EXIT_STATUS: i32 = 127;

/// What went wrong before the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The header is not where the stub expects it, or has the wrong magic.
    BadMagic,
    /// The header has no descriptors or nonzero reserved bits.
    BadHeader,
    /// The header names a format version this stub does not speak.
    BadVersion { version: u16 },
    /// The header or descriptor table runs past the end of the image.
    Truncated,
    /// A descriptor has inconsistent fields.
    BadDescriptor { index: usize },
    /// A descriptor names a codec this stub does not carry.
    UnknownMethod { method: u8 },
    /// A descriptor's payload lies outside the payload area of the image.
    PayloadOutOfBounds { index: usize },
    /// Destination ranges are out of order or overlap after page rounding.
    Overlap { index: usize },
    /// The compressed stream is malformed.
    Corrupt,
    /// Decompression did not produce exactly the declared number of bytes.
    LengthMismatch,
    /// The platform refused to reserve memory.
    MapFailed { errno: i32 },
    /// The platform refused to change page permissions.
    ProtectFailed { errno: i32 },
    /// A freshly mapped region could not be written.
    RegionUnavailable,
    /// The initial process stack has no recognisable auxiliary vector.
    BadInitialStack,
    /// The packed file could not be opened or mapped.
    SelfImage { errno: i32 },
}

impl std::error::Error for Fault {}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Fault::BadMagic => write!(f, "packed header magic not found"),
            Fault::BadHeader => write!(f, "packed header is inconsistent"),
            Fault::BadVersion { version } => write!(f, "unsupported packed format version {}", version),
            Fault::Truncated => write!(f, "packed header or descriptor table is truncated"),
            Fault::BadDescriptor { index } => write!(f, "descriptor {} is malformed", index),
            Fault::UnknownMethod { method } => write!(f, "unknown codec method {}", method),
            Fault::PayloadOutOfBounds { index } => {
                write!(f, "payload of descriptor {} lies outside the image", index)
            }
            Fault::Overlap { index } => {
                write!(f, "descriptor {} overlaps or precedes the previous one", index)
            }
            Fault::Corrupt => write!(f, "compressed stream is corrupt"),
            Fault::LengthMismatch => write!(f, "decompressed length does not match the descriptor"),
            Fault::MapFailed { errno } => write!(f, "memory reservation failed (errno {})", errno),
            Fault::ProtectFailed { errno } => write!(f, "permission change failed (errno {})", errno),
            Fault::RegionUnavailable => write!(f, "mapped region is not writable"),
            Fault::BadInitialStack => write!(f, "initial stack has no auxiliary vector"),
            Fault::SelfImage { errno } => write!(f, "cannot map the packed image (errno {})", errno),
        }
    }
}

/// Ends the run. The only error exit the stub has.
#[cold]
pub fn fatal<P: Platform>(platform: &mut P, fault: Fault) -> ! {
    platform.abort(fault)
}
