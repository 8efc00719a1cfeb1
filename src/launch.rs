//! Launch sequencer.
//!
//! Points the auxiliary vector at the rebuilt program, then hands the CPU over
//! with the kernel's original stack pointer and cleared registers. There is no
//! way back.

use core::ops::Range;

use crate::builder::Built;
use crate::fault::{fatal, Fault};
use crate::platform::{LaunchState, Platform};

pub const AT_NULL: usize = 0;
pub const AT_PHDR: usize = 3;
pub const AT_PHNUM: usize = 5;
pub const AT_PAGESZ: usize = 6;
pub const AT_ENTRY: usize = 9;

/// Word range of the auxiliary vector (including the `AT_NULL` pair) in an
/// initial stack laid out as `argc, argv..., 0, envp..., 0, auxv...`.
pub fn auxv_range(words: &[usize]) -> Option<Range<usize>> {
    let argc = *words.first()?;
    let argv_end = argc.checked_add(1)?;
    if *words.get(argv_end)? != 0 {
        return None;
    }
    let mut at = argv_end + 1;
    while *words.get(at)? != 0 {
        at += 1;
    }
    let start = at + 1;
    let mut at = start;
    loop {
        let key = *words.get(at)?;
        words.get(at + 1)?;
        if key == AT_NULL {
            return Some(start..at + 2);
        }
        at += 2;
    }
}

/// Overwrites the value of `key`, if the vector has it.
pub fn set_aux(auxv: &mut [usize], key: usize, value: usize) -> bool {
    match auxv.chunks_exact_mut(2).find(|pair| pair[0] == key) {
        Some(pair) => {
            pair[1] = value;
            true
        }
        None => false,
    }
}

/// Value of `key`, if the vector has it.
pub fn get_aux(auxv: &[usize], key: usize) -> Option<usize> {
    auxv.chunks_exact(2).find(|pair| pair[0] == key).map(|pair| pair[1])
}

/// `SegmentsBuilt -> Launched`.
pub fn launch<P: Platform>(platform: &mut P, built: &Built) -> ! {
    let header = built.header;
    let range = match auxv_range(platform.initial_stack()) {
        Some(range) => range,
        None => fatal(platform, Fault::BadInitialStack),
    };

    // The program reads these to find itself; they still describe the stub.
    let auxv = &mut platform.initial_stack()[range];
    set_aux(auxv, AT_ENTRY, header.entry as usize);
    if header.phdr_addr != 0 {
        set_aux(auxv, AT_PHDR, header.phdr_addr as usize);
        set_aux(auxv, AT_PHNUM, header.phnum as usize);
    }

    let state = LaunchState { entry: header.entry, stack_pointer: platform.initial_stack_pointer() };
    platform.launch(state)
}
