//! Reference platform emulator.
//!
//! An in-memory address space with page permissions and a fake initial process
//! stack. Every call is logged as an [`Event`], writes to non-writable mappings
//! are refused and logged, and the two terminal calls (`exit`, `launch`) unwind
//! back into [`Emulator::run`], which turns them into an [`Outcome`].

use std::convert::Infallible;
use std::panic::{self, AssertUnwindSafe};

use super::{Errno, LaunchState, Platform, Prot};
use crate::fault::{Fault, FATAL_EXIT_STATUS};
use crate::launch::{AT_ENTRY, AT_NULL, AT_PAGESZ, AT_PHDR, AT_PHNUM};

/// Highest address mappings may reach.
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;
/// Where `map_anywhere` starts handing out memory, going down.
const ANYWHERE_TOP: u64 = 0x0000_7f00_0000_0000;
/// Where the fake initial stack pretends to live.
const STACK_POINTER: u64 = 0x0000_7ffd_ff00;
/// Default cap on mapped bytes, so corrupt lengths fail like a real ENOMEM.
const DEFAULT_MEMORY_LIMIT: u64 = 256 << 20;

/// One observed platform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Map { addr: u64, len: u64 },
    MapAnywhere { addr: u64, len: u64 },
    Write { addr: u64, len: u64 },
    WriteDenied { addr: u64, len: u64 },
    Protect { addr: u64, len: u64, prot: Prot },
    FlushIcache { addr: u64, len: u64 },
    StackSwitch { top: u64 },
    Abort(Fault),
    Exit(i32),
    Launch(LaunchState),
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Control reached the original program.
    Launched(LaunchState),
    /// The process exited, with the fault that caused it if there was one.
    Exited { status: i32, fault: Option<Fault> },
}

/// Unwinding payload of the terminal calls.
enum Stop {
    Exit(i32),
    Launch(LaunchState),
}

struct Mapping {
    start: u64,
    bytes: Vec<u8>,
    prot: Prot,
}

impl Mapping {
    fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.start && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }
}

/// The instrumented platform.
pub struct Emulator {
    page_size: u64,
    memory_limit: u64,
    mappings: Vec<Mapping>,
    stack: Vec<usize>,
    next_anywhere: u64,
    events: Vec<Event>,
    fault: Option<Fault>,
}

impl Emulator {
    /// An empty address space and a process started with one argument and a
    /// typical auxiliary vector.
    pub fn new(page_size: u64) -> Self {
        assert!(page_size.is_power_of_two());
        let auxv = [
            (AT_PHDR, 0x80_0040),
            (AT_PHNUM, 2),
            (AT_PAGESZ, page_size as usize),
            (AT_ENTRY, 0x80_0000),
        ];
        Self {
            page_size,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            mappings: Vec::new(),
            stack: initial_stack(1, 0, &auxv),
            next_anywhere: ANYWHERE_TOP,
            events: Vec::new(),
            fault: None,
        }
    }

    /// Replaces the initial process stack.
    pub fn with_process(mut self, args: usize, envs: usize, auxv: &[(usize, usize)]) -> Self {
        self.stack = initial_stack(args, envs, auxv);
        self
    }

    /// Replaces the raw initial stack words.
    pub fn with_stack_words(mut self, words: Vec<usize>) -> Self {
        self.stack = words;
        self
    }

    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Maps `bytes` at `addr` before the run, as if something already lived there.
    pub fn preload(&mut self, addr: u64, bytes: &[u8], prot: Prot) {
        let len = bytes.len() as u64;
        let mut contents = bytes.to_vec();
        contents.resize(len.div_ceil(self.page_size).max(1) as usize * self.page_size as usize, 0);
        self.unmap(addr, addr + contents.len() as u64);
        self.mappings.push(Mapping { start: addr, bytes: contents, prot });
        self.mappings.sort_by_key(|m| m.start);
    }

    /// Runs `body`, which must end in `exit` or `launch`.
    pub fn run<F: FnOnce(&mut Emulator)>(&mut self, body: F) -> Outcome {
        let caught = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        match caught {
            Ok(()) => panic!("stub returned instead of exiting or launching"),
            Err(payload) => match payload.downcast::<Stop>() {
                Ok(stop) => match *stop {
                    Stop::Exit(status) => Outcome::Exited { status, fault: self.fault },
                    Stop::Launch(state) => Outcome::Launched(state),
                },
                Err(other) => panic::resume_unwind(other),
            },
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Reads mapped memory regardless of permissions. Not logged.
    pub fn read(&self, addr: u64, len: u64) -> Option<&[u8]> {
        let m = self.mappings.iter().find(|m| m.contains(addr, len))?;
        let at = (addr - m.start) as usize;
        Some(&m.bytes[at..at + len as usize])
    }

    /// Permissions of the page holding `addr`.
    pub fn prot_at(&self, addr: u64) -> Option<Prot> {
        self.mappings.iter().find(|m| m.contains(addr, 1)).map(|m| m.prot)
    }

    /// `(start, len, prot)` of every mapping, in address order.
    pub fn mappings(&self) -> impl Iterator<Item = (u64, u64, Prot)> + '_ {
        self.mappings.iter().map(|m| (m.start, m.bytes.len() as u64, m.prot))
    }

    fn is_page_aligned(&self, value: u64) -> bool {
        value & (self.page_size - 1) == 0
    }

    fn mapped_bytes(&self) -> u64 {
        self.mappings.iter().map(|m| m.bytes.len() as u64).sum()
    }

    /// Drops `[addr, end)` from the address space, splitting mappings that
    /// stick out on either side.
    fn unmap(&mut self, addr: u64, end: u64) {
        let mut kept = Vec::with_capacity(self.mappings.len() + 1);
        for mut m in std::mem::take(&mut self.mappings) {
            if m.end() <= addr || m.start >= end {
                kept.push(m);
                continue;
            }
            if m.end() > end {
                let tail = m.bytes.split_off((end - m.start) as usize);
                kept.push(Mapping { start: end, bytes: tail, prot: m.prot });
            }
            if m.start < addr {
                m.bytes.truncate((addr - m.start) as usize);
                kept.push(m);
            }
        }
        kept.sort_by_key(|m| m.start);
        self.mappings = kept;
    }

    /// Maps fresh memory over `[addr, addr + len)`, replacing whatever was there.
    fn insert(&mut self, addr: u64, len: u64) -> Result<(), Errno> {
        let end = addr.checked_add(len).ok_or(Errno::EINVAL)?;
        if end > USER_SPACE_END {
            return Err(Errno::ENOMEM);
        }
        let replaced: u64 = self
            .mappings
            .iter()
            .map(|m| m.end().min(end).saturating_sub(m.start.max(addr)))
            .sum();
        if self.mapped_bytes() - replaced + len > self.memory_limit {
            return Err(Errno::ENOMEM);
        }
        self.unmap(addr, end);
        self.mappings.push(Mapping { start: addr, bytes: vec![0; len as usize], prot: Prot::READ_WRITE });
        self.mappings.sort_by_key(|m| m.start);
        Ok(())
    }
}

impl Platform for Emulator {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn map_fixed(&mut self, addr: u64, len: u64) -> Result<(), Errno> {
        tracing::debug!("map_fixed 0x{:x} +0x{:x}", addr, len);
        self.events.push(Event::Map { addr, len });
        if len == 0 || !self.is_page_aligned(addr) || !self.is_page_aligned(len) {
            return Err(Errno::EINVAL);
        }
        self.insert(addr, len)
    }

    fn map_anywhere(&mut self, len: u64) -> Result<u64, Errno> {
        if len == 0 || !self.is_page_aligned(len) {
            return Err(Errno::EINVAL);
        }
        let addr = self.next_anywhere.checked_sub(len).ok_or(Errno::ENOMEM)?;
        self.insert(addr, len)?;
        // Leave a guard page between consecutive requests.
        self.next_anywhere = addr - self.page_size;
        tracing::debug!("map_anywhere 0x{:x} +0x{:x}", addr, len);
        self.events.push(Event::MapAnywhere { addr, len });
        Ok(addr)
    }

    fn memory_mut(&mut self, addr: u64, len: u64) -> Option<&mut [u8]> {
        let index = self.mappings.iter().position(|m| m.contains(addr, len))?;
        if !self.mappings[index].prot.contains(Prot::WRITE) {
            tracing::debug!("write denied at 0x{:x} +0x{:x}", addr, len);
            self.events.push(Event::WriteDenied { addr, len });
            return None;
        }
        self.events.push(Event::Write { addr, len });
        let m = &mut self.mappings[index];
        let at = (addr - m.start) as usize;
        Some(&mut m.bytes[at..at + len as usize])
    }

    fn protect(&mut self, addr: u64, len: u64, prot: Prot) -> Result<(), Errno> {
        tracing::debug!("protect 0x{:x} +0x{:x} {:?}", addr, len, prot);
        self.events.push(Event::Protect { addr, len, prot });
        if !self.is_page_aligned(addr) || !self.is_page_aligned(len) {
            return Err(Errno::EINVAL);
        }
        let index = self.mappings.iter().position(|m| m.contains(addr, len)).ok_or(Errno::ENOMEM)?;
        let mut head = self.mappings.remove(index);
        let mut middle = head.bytes.split_off((addr - head.start) as usize);
        let tail = middle.split_off(len as usize);
        let tail_start = addr + len;
        let old = head.prot;
        for (start, bytes, prot) in [(head.start, std::mem::take(&mut head.bytes), old), (addr, middle, prot), (tail_start, tail, old)] {
            if !bytes.is_empty() {
                self.mappings.push(Mapping { start, bytes, prot });
            }
        }
        self.mappings.sort_by_key(|m| m.start);
        Ok(())
    }

    fn flush_icache(&mut self, addr: u64, len: u64) {
        self.events.push(Event::FlushIcache { addr, len });
    }

    fn initial_stack(&mut self) -> &mut [usize] {
        &mut self.stack
    }

    fn initial_stack_pointer(&self) -> u64 {
        STACK_POINTER
    }

    fn run_on_stack(&mut self, top: u64, body: &mut dyn FnMut(&mut Self) -> Infallible) -> ! {
        tracing::debug!("switching to stack top 0x{:x}", top);
        self.events.push(Event::StackSwitch { top });
        match body(self) {}
    }

    fn exit(&mut self, status: i32) -> ! {
        tracing::debug!("exit {}", status);
        self.events.push(Event::Exit(status));
        panic::resume_unwind(Box::new(Stop::Exit(status)))
    }

    fn abort(&mut self, fault: Fault) -> ! {
        tracing::debug!("abort: {}", fault);
        self.fault = Some(fault);
        self.events.push(Event::Abort(fault));
        self.exit(FATAL_EXIT_STATUS)
    }

    fn launch(&mut self, state: LaunchState) -> ! {
        tracing::debug!("launch entry=0x{:x} sp=0x{:x}", state.entry, state.stack_pointer);
        self.events.push(Event::Launch(state));
        panic::resume_unwind(Box::new(Stop::Launch(state)))
    }
}

/// Lays out `argc`, argument and environment pointers and the auxiliary vector
/// the way the kernel does. The string pointers are placeholders.
pub fn initial_stack(args: usize, envs: usize, auxv: &[(usize, usize)]) -> Vec<usize> {
    let string = |i: usize| STACK_POINTER as usize + 0x1000 + i * 0x20;
    let mut words = vec![args];
    words.extend((0..args).map(string));
    words.push(0);
    words.extend((args..args + envs).map(string));
    words.push(0);
    for &(key, value) in auxv {
        words.push(key);
        words.push(value);
    }
    words.push(AT_NULL);
    words.push(0);
    words
}
