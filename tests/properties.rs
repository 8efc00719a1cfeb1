mod common;

use unfold::codec::{Codec, Lz4};
use unfold::fault::{Fault, FATAL_EXIT_STATUS};
use unfold::format::{Image, Method};
use unfold::pack::{verify_segments, SegmentSpec};
use unfold::platform::emulator::{Emulator, Event, Outcome};
use unfold::platform::Prot;
use unfold::trampoline::Located;

fn program() -> Vec<SegmentSpec> {
    vec![
        SegmentSpec::data(0x40_0000, common::text(0x2345, 1), 5),
        SegmentSpec::data(0x40_3000, common::text(0x800, 2), 4),
        SegmentSpec { addr: 0x40_4120, data: common::text(0x300, 3), mem_len: 0x5000, flags: 6 },
        SegmentSpec::zero_fill(0x40_a000, 0x3000, 6),
    ]
}

fn is_fatal(outcome: &Outcome) -> bool {
    matches!(outcome, Outcome::Exited { status: FATAL_EXIT_STATUS, fault: Some(_) })
}

#[test]
fn round_trip_restores_contents_and_permissions() {
    let segments = program();
    let bytes = common::packer(segments.clone(), 0x40_0100).pack().unwrap();
    let mut emu = Emulator::new(0x1000);

    let outcome = common::run(&mut emu, &bytes, common::STUB.len());

    assert!(matches!(outcome, Outcome::Launched(state) if state.entry == 0x40_0100));
    verify_segments(&emu, &segments).unwrap();
}

#[test]
fn every_truncation_dies_cleanly() {
    let bytes = common::packer(program(), 0x40_0100).pack().unwrap();
    for cut in (0..bytes.len()).step_by(7) {
        let mut emu = Emulator::new(0x1000);
        let outcome = common::run(&mut emu, &bytes[..cut], common::STUB.len());
        assert!(is_fatal(&outcome), "cut at {} gave {:?}", cut, outcome);
    }
}

#[test]
fn corrupted_payload_never_escapes_its_bounds() {
    let bytes = common::packer(program(), 0x40_0100).pack().unwrap();
    let located = Located::new(Image::new(&bytes), common::STUB.len()).unwrap();
    let start = located.payload_start() as usize;

    for at in (start..bytes.len()).step_by(13) {
        for flip in [0x01u8, 0x80, 0xff] {
            let mut damaged = bytes.clone();
            damaged[at] ^= flip;
            let mut emu = Emulator::new(0x1000);
            let outcome = common::run(&mut emu, &damaged, common::STUB.len());
            // A flipped literal still decodes; anything else must be fatal.
            assert!(
                matches!(outcome, Outcome::Launched(_)) || is_fatal(&outcome),
                "flip at {} gave {:?}",
                at,
                outcome
            );
        }
    }
}

#[test]
fn corrupted_table_is_fatal_or_harmless() {
    let bytes = common::packer(program(), 0x40_0100).pack().unwrap();
    let located = Located::new(Image::new(&bytes), common::STUB.len()).unwrap();
    let table = common::STUB.len()..located.payload_start() as usize;

    for at in table {
        let mut damaged = bytes.clone();
        damaged[at] ^= 0x40;
        let mut emu = Emulator::new(0x1000);
        let outcome = common::run(&mut emu, &damaged, common::STUB.len());
        assert!(matches!(outcome, Outcome::Launched(_)) || is_fatal(&outcome), "byte {} gave {:?}", at, outcome);
    }
}

#[test]
fn decompressor_bounds_are_exact() {
    let input = common::text(5000, 9);
    let packed = Lz4.compress(&input);

    let mut short = vec![0; input.len() - 1];
    assert_eq!(Lz4.expand(&packed, &mut short), Err(Fault::Corrupt));

    let mut long = vec![0; input.len() + 1];
    assert_eq!(Lz4.expand(&packed, &mut long), Err(Fault::LengthMismatch));

    let mut exact = vec![0; input.len()];
    assert!(Lz4.expand(&packed[..packed.len() - 1], &mut exact).is_err());
}

#[test]
fn self_referencing_matches_agree_with_lz4_flex() {
    // Literal "ab", then offset 2 length 18 (overlapping), then offset 1
    // length 6, then a closing run of 12 literals.
    let mut stream = vec![0x2e, b'a', b'b', 0x02, 0x00, 0x22, b'c', b'd', 0x01, 0x00, 0xc0];
    stream.extend_from_slice(b"0123456789ab");
    let expected = lz4_flex::block::decompress(&stream, 40).unwrap();
    let mut out = vec![0; 40];
    Lz4.expand(&stream, &mut out).unwrap();
    assert_eq!(out, expected);
    assert_eq!(&out[..20], b"abababababababababab");
    assert_eq!(&out[20..28], b"cddddddd");

    for seed in 0..16 {
        let mut input = common::text(3000 + seed as usize * 97, seed);
        input.extend(std::iter::repeat(input[0]).take(300));
        let packed = Lz4.compress(&input);
        let mut out = vec![0; input.len()];
        Lz4.expand(&packed, &mut out).unwrap();
        assert_eq!(out, lz4_flex::block::decompress(&packed, input.len()).unwrap());
    }
}

#[test]
fn nothing_is_written_after_a_downgrade() {
    let bytes = common::packer(program(), 0x40_0100).pack().unwrap();
    let mut emu = Emulator::new(0x1000);
    common::run(&mut emu, &bytes, common::STUB.len());

    let events = emu.events();
    for (i, event) in events.iter().enumerate() {
        if let Event::Protect { addr, len, prot } = *event {
            if prot.contains(Prot::WRITE) {
                continue;
            }
            let late_write = events[i + 1..].iter().any(|later| match *later {
                Event::Write { addr: w, len: l } | Event::WriteDenied { addr: w, len: l } => {
                    w < addr + len && w + l > addr
                }
                _ => false,
            });
            assert!(!late_write, "write into 0x{:x}+0x{:x} after it became {:?}", addr, len, prot);
        }
    }
    assert!(!events.iter().any(|e| matches!(e, Event::WriteDenied { .. })));
}

#[test]
fn stored_segments_round_trip() {
    let noise = common::noise(3000, 5);
    let segments = vec![SegmentSpec::data(0x50_0000, noise, 4)];
    let bytes = common::packer(segments.clone(), 0x50_0000).pack().unwrap();
    let located = Located::new(Image::new(&bytes), common::STUB.len()).unwrap();
    assert_eq!(located.descriptor(0).unwrap().method, Method::Stored);

    let mut emu = Emulator::new(0x1000);
    assert!(matches!(common::run(&mut emu, &bytes, common::STUB.len()), Outcome::Launched(_)));
    verify_segments(&emu, &segments).unwrap();
}
