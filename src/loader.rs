//! Core loader sequence.
//!
//! One straight line through the stub's states:
//! 1. Start: reserve the scratch stack and move onto it.
//! 2. HeaderLocated: find the header and descriptor table after the stub.
//! 3. SegmentsBuilt: map, expand and protect every segment in file order.
//! 4. Launched: fix the auxiliary vector and jump to the original entry.
//!
//! Any fault on the way ends the process with `FATAL_EXIT_STATUS`.

use core::convert::Infallible;

use crate::builder::{self, Region};
use crate::format::Image;
use crate::launch;
use crate::platform::Platform;
use crate::trampoline;

/// Runs the stub on `platform`. `stub_len` is where the header starts in `image`.
pub fn run<P: Platform>(platform: &mut P, image: Image<'_>, stub_len: usize) -> ! {
    let scratch = trampoline::reserve_scratch_stack(platform);
    // Segments may not land on the stack we run on or the bytes we read from.
    let reserved = [scratch.region(), Region::around(image.base(), image.len() as u64, platform.page_size())];
    platform.run_on_stack(scratch.top(), &mut |platform: &mut P| -> Infallible {
        let located = trampoline::locate(platform, image, stub_len);
        let built = builder::build(platform, &located, &reserved);
        launch::launch(platform, &built)
    })
}
