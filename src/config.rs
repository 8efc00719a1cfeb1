//! Configuration module.
//!
//! This module defines the command-line interface (CLI) of the host companion using `clap`.
//! The stub itself takes no configuration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Packs executables behind the unfold loader stub and exercises the stub
/// on an emulated address space.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true, help = "Set the logging level")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pack a static or static-pie ELF executable behind a stub
    Pack {
        /// ELF executable to pack
        input: PathBuf,

        /// The `unfold-stub` executable to put at the front of the file
        #[arg(long)]
        stub: PathBuf,

        /// Output file
        #[arg(short, long, default_value = "a.packed", help = "Path to the packed executable")]
        output: PathBuf,
    },

    /// Print the header and descriptor table of a packed file
    Inspect {
        /// Packed file
        image: PathBuf,

        /// Stub length; searched for when omitted
        #[arg(long)]
        stub_len: Option<usize>,
    },

    /// Run the loader against the emulator and report where it ends up
    Run {
        /// Packed file
        image: PathBuf,

        /// Stub length; searched for when omitted
        #[arg(long)]
        stub_len: Option<usize>,

        /// Emulated page size
        #[arg(long, default_value_t = 0x1000)]
        page_size: u64,

        /// Original ELF executable to compare the rebuilt segments with
        #[arg(long)]
        verify: Option<PathBuf>,
    },
}
