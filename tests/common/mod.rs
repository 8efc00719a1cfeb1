#![allow(dead_code)]

use unfold::format::Image;
use unfold::loader;
use unfold::pack::{Packer, SegmentSpec};
use unfold::platform::emulator::{Emulator, Outcome};

pub const STUB: &[u8] = &[0xf4; 100];

/// Runs the loader over `bytes` on `emu`.
pub fn run(emu: &mut Emulator, bytes: &[u8], stub_len: usize) -> Outcome {
    emu.run(|platform| loader::run(platform, Image::new(bytes), stub_len))
}

/// A packer with the test stub and the given segments.
pub fn packer(segments: Vec<SegmentSpec>, entry: u64) -> Packer {
    let mut packer = Packer::new(STUB.to_vec());
    for segment in segments {
        packer.add_segment(segment);
    }
    packer.set_entry(entry);
    packer
}

/// Deterministic, compressible bytes.
pub fn text(len: usize, seed: u32) -> Vec<u8> {
    let words: [&[u8]; 6] = [b"mov ", b"call ", b"ret\n", b"push rbp\n", b"xor eax, eax\n", b"jmp "];
    let mut state = seed.wrapping_mul(747796405).wrapping_add(2891336453);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        out.extend_from_slice(words[state as usize % words.len()]);
        out.push((state >> 24) as u8);
    }
    out.truncate(len);
    out
}

/// Deterministic bytes LZ4 cannot shrink.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}
