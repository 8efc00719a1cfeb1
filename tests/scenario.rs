mod common;

use unfold::codec::{Codec, Lz4};
use unfold::fault::{Fault, FATAL_EXIT_STATUS};
use unfold::format::{Image, Method};
use unfold::launch::{auxv_range, get_aux, AT_ENTRY};
use unfold::loader;
use unfold::pack::SegmentSpec;
use unfold::platform::emulator::{Emulator, Event, Outcome};
use unfold::platform::{LaunchState, Platform, Prot};
use unfold::trampoline::{Located, SCRATCH_STACK_SIZE};

fn pattern() -> Vec<u8> {
    (0..4096u32).map(|i| b"UNFOLD!?"[i as usize % 8] ^ (i / 512) as u8).collect()
}

fn two_segments() -> Vec<u8> {
    common::packer(
        vec![SegmentSpec::data(0x10000, pattern(), 5), SegmentSpec::zero_fill(0x20000, 4096, 6)],
        0x10000,
    )
    .pack()
    .unwrap()
}

#[test]
fn pattern_and_zero_fill_then_jump() {
    let bytes = two_segments();
    let mut emu = Emulator::new(0x1000);
    let sp = emu.initial_stack_pointer();

    let outcome = common::run(&mut emu, &bytes, common::STUB.len());

    assert_eq!(outcome, Outcome::Launched(LaunchState { entry: 0x10000, stack_pointer: sp }));
    assert_eq!(emu.read(0x10000, 4096).unwrap(), pattern().as_slice());
    assert!(emu.read(0x20000, 4096).unwrap().iter().all(|&b| b == 0));
    assert_eq!(emu.prot_at(0x10000), Some(Prot::READ | Prot::EXEC));
    assert_eq!(emu.prot_at(0x20000), Some(Prot::READ_WRITE));

    let range = auxv_range(emu.initial_stack()).unwrap();
    assert_eq!(get_aux(&emu.initial_stack()[range], AT_ENTRY), Some(0x10000));
}

#[test]
fn pattern_segment_is_actually_compressed() {
    let bytes = two_segments();
    let located = Located::new(Image::new(&bytes), common::STUB.len()).unwrap();
    let code = located.descriptor(0).unwrap();
    assert_eq!(code.method, Method::Lz4);
    assert!(code.src_len < code.dst_len);

    let mut out = vec![0; 4096];
    Lz4.expand(located.payload(&code).unwrap(), &mut out).unwrap();
    assert_eq!(out, pattern());
}

#[test]
fn loader_runs_on_its_scratch_stack() {
    let bytes = two_segments();
    let mut emu = Emulator::new(0x1000);
    common::run(&mut emu, &bytes, common::STUB.len());

    let events = emu.events();
    let (base, len) = match events[0] {
        Event::MapAnywhere { addr, len } => (addr, len),
        ref other => panic!("first call was {:?}", other),
    };
    assert_eq!(len, SCRATCH_STACK_SIZE);
    assert_eq!(events[1], Event::StackSwitch { top: base + len });
    assert!(base >= 0x21000 || base + len <= 0x10000);
}

#[test]
fn zero_fill_wipes_what_was_there() {
    let bytes = two_segments();
    let mut emu = Emulator::new(0x1000);
    emu.preload(0x20000, &[0xaa; 4096], Prot::READ_WRITE);
    emu.preload(0x10000, &[0x55; 4096], Prot::READ | Prot::EXEC);

    let outcome = common::run(&mut emu, &bytes, common::STUB.len());

    assert!(matches!(outcome, Outcome::Launched(_)));
    assert!(emu.read(0x20000, 4096).unwrap().iter().all(|&b| b == 0));
    assert_eq!(emu.read(0x10000, 4096).unwrap(), pattern().as_slice());
}

#[test]
fn same_image_on_larger_pages() {
    let bytes = common::packer(
        vec![SegmentSpec::data(0x10000, pattern(), 5), SegmentSpec::zero_fill(0x20000, 4096, 6)],
        0x10000,
    )
    .with_page_size(0x1_0000)
    .pack()
    .unwrap();
    let mut emu = Emulator::new(0x1_0000);

    let outcome = common::run(&mut emu, &bytes, common::STUB.len());

    assert!(matches!(outcome, Outcome::Launched(LaunchState { entry: 0x10000, .. })));
    assert_eq!(emu.read(0x10000, 4096).unwrap(), pattern().as_slice());
    assert!(emu.read(0x20000, 0x1_0000).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn segment_over_the_scratch_stack_is_refused() {
    let mut emu = Emulator::new(0x1000);
    common::run(&mut emu, &two_segments(), common::STUB.len());
    let stack = match emu.events()[0] {
        Event::MapAnywhere { addr, .. } => addr,
        ref other => panic!("first call was {:?}", other),
    };

    let bytes = common::packer(vec![SegmentSpec::data(stack, pattern(), 5)], stack).pack().unwrap();
    let mut emu = Emulator::new(0x1000);
    let outcome = common::run(&mut emu, &bytes, common::STUB.len());

    assert_eq!(outcome, Outcome::Exited { status: FATAL_EXIT_STATUS, fault: Some(Fault::Overlap { index: 0 }) });
    assert!(!emu.events().contains(&Event::Map { addr: stack, len: 0x1000 }));
    assert_eq!(emu.prot_at(stack), Some(Prot::READ_WRITE));
}

#[test]
fn segment_over_the_packed_image_is_refused() {
    let bytes = two_segments();
    let mut emu = Emulator::new(0x1000);
    let image = Image::with_base(0x1_0800, &bytes);

    let outcome = emu.run(|platform| loader::run(platform, image, common::STUB.len()));

    assert_eq!(outcome, Outcome::Exited { status: FATAL_EXIT_STATUS, fault: Some(Fault::Overlap { index: 0 }) });
    assert!(emu.read(0x10000, 1).is_none());
}

#[test]
fn zero_fill_over_part_of_an_older_mapping() {
    let bytes = two_segments();
    let mut emu = Emulator::new(0x1000);
    emu.preload(0x1f000, &[0xaa; 0x3000], Prot::READ_WRITE);

    let outcome = common::run(&mut emu, &bytes, common::STUB.len());

    assert!(matches!(outcome, Outcome::Launched(_)));
    assert!(emu.read(0x20000, 4096).unwrap().iter().all(|&b| b == 0));
    assert!(emu.read(0x1f000, 0x1000).unwrap().iter().all(|&b| b == 0xaa));
    assert!(emu.read(0x21000, 0x1000).unwrap().iter().all(|&b| b == 0xaa));
}
