//! Uncompressed payloads.

use super::Codec;
use crate::fault::Fault;
use crate::format::Method;

/// Plain copy, used when compression does not pay off.
pub struct Stored;

impl Codec for Stored {
    const METHOD: Method = Method::Stored;

    fn expand(&self, src: &[u8], dst: &mut [u8]) -> Result<(), Fault> {
        if src.len() != dst.len() {
            return Err(Fault::LengthMismatch);
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    fn compress(&self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }
}
