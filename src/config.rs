//! Command-line configuration.

use clap::Parser;
use std::path::PathBuf;

/// Build a kernel hot-patch object from two versions of the same
/// relocatable object file.
///
/// Both inputs must come from the same translation unit, compiled with
/// per-function and per-data sections. The output object contains only
/// the functions that changed, plus whatever they drag along.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Config {
    /// Object file built from the original source.
    pub original: PathBuf,

    /// Object file built from the patched source.
    pub patched: PathBuf,

    /// Where to write the reduced output object.
    pub output: PathBuf,

    /// Show debug output.
    #[arg(short, long)]
    pub debug: bool,

    /// Create an inventory file with the list of sections and symbols.
    #[arg(short, long)]
    pub inventory: bool,
}
