//! Codec abstraction.
//!
//! Each payload is stored with one codec. The stub only ever calls `expand`;
//! `compress` is the paired encoder used by the packer.

use crate::fault::Fault;
use crate::format::Method;

pub mod lz4;
pub mod stored;

pub use lz4::Lz4;
pub use stored::Stored;

/// A payload codec.
pub trait Codec {
    /// The method byte written to descriptors using this codec.
    const METHOD: Method;

    /// Rebuilds `dst` from `src`.
    ///
    /// Must read only `src` and write only `dst`, and must fill `dst` exactly
    /// while consuming all of `src`.
    fn expand(&self, src: &[u8], dst: &mut [u8]) -> Result<(), Fault>;

    /// Produces a payload `expand` turns back into `input`.
    fn compress(&self, input: &[u8]) -> Vec<u8>;
}

/// Dispatches to the codec named by `method`.
pub fn expand(method: Method, src: &[u8], dst: &mut [u8]) -> Result<(), Fault> {
    match method {
        Method::Stored => Stored.expand(src, dst),
        Method::Lz4 => Lz4.expand(src, dst),
    }
}
