//! LZ4 block codec.
//!
//! The decoder is written against the LZ4 block format: a stream of sequences,
//! each a token byte (literal count in the high nibble, match length minus 4 in
//! the low nibble), optional length extension bytes, the literals, then a 16-bit
//! little-endian back-reference offset and optional match length extension bytes.
//! The final sequence carries literals only.
//!
//! The destination slice is both the output and the dictionary: a match copies
//! bytes this same call already produced, and may overlap its own output.

use super::Codec;
use crate::fault::Fault;
use crate::format::Method;

const MIN_MATCH: usize = 4;

/// The LZ4 block format.
pub struct Lz4;

impl Codec for Lz4 {
    const METHOD: Method = Method::Lz4;

    fn expand(&self, src: &[u8], dst: &mut [u8]) -> Result<(), Fault> {
        let mut ip: usize = 0;
        let mut op: usize = 0;

        loop {
            let token = *src.get(ip).ok_or(Fault::Corrupt)?;
            ip += 1;

            let literals = read_length(src, &mut ip, (token >> 4) as usize)?;
            let lit_src = ip.checked_add(literals).filter(|&end| end <= src.len()).ok_or(Fault::Corrupt)?;
            let lit_dst = op.checked_add(literals).filter(|&end| end <= dst.len()).ok_or(Fault::Corrupt)?;
            dst[op..lit_dst].copy_from_slice(&src[ip..lit_src]);
            ip = lit_src;
            op = lit_dst;

            if ip == src.len() {
                break;
            }

            let offset = match src.get(ip..ip + 2) {
                Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]) as usize,
                _ => return Err(Fault::Corrupt),
            };
            ip += 2;
            if offset == 0 || offset > op {
                return Err(Fault::Corrupt);
            }

            let len = read_length(src, &mut ip, (token & 0x0f) as usize)?
                .checked_add(MIN_MATCH)
                .ok_or(Fault::Corrupt)?;
            let end = op.checked_add(len).filter(|&end| end <= dst.len()).ok_or(Fault::Corrupt)?;
            copy_match(dst, op, offset, len);
            op = end;
        }

        if op != dst.len() {
            return Err(Fault::LengthMismatch);
        }
        Ok(())
    }

    fn compress(&self, input: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress(input)
    }
}

/// Extends a 4-bit length: a nibble of 15 is followed by bytes that add up
/// until one of them is not 255.
fn read_length(src: &[u8], ip: &mut usize, nibble: usize) -> Result<usize, Fault> {
    let mut len = nibble;
    if nibble == 0x0f {
        loop {
            let byte = *src.get(*ip).ok_or(Fault::Corrupt)?;
            *ip += 1;
            len = len.checked_add(byte as usize).ok_or(Fault::Corrupt)?;
            if byte != 0xff {
                break;
            }
        }
    }
    Ok(len)
}

/// Copies `len` bytes from `offset` bytes back. Bounds are checked by the caller.
fn copy_match(dst: &mut [u8], op: usize, offset: usize, len: usize) {
    let from = op - offset;
    if offset >= len {
        dst.copy_within(from..from + len, op);
    } else {
        // Overlapping: each byte may be one this loop just wrote.
        for i in 0..len {
            dst[op + i] = dst[from + i];
        }
    }
}
