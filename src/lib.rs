//! Object-file differencing engine for kernel hot-patches.
//!
//! Given a "base" and a "patched" relocatable object compiled from the
//! same translation unit, the pipeline extracts the changed functions
//! plus the minimal transitive closure of sections, symbols and
//! relocations they need, and writes the result as a new relocatable
//! object that links against the original binary image.
//!
//! Modules, in pipeline order:
//! - `config`: CLI configuration.
//! - `elf`: in-memory object graph and loader.
//! - `diff`: correlation and comparison of the two graphs.
//! - `include`: inclusion closure rooted at the changed functions.
//! - `output`: output graph synthesis.
//! - `writer`: ELF emission.
//! - `inventory`: optional section/symbol listing.
//! - `error`: the operational/unreconcilable error split.

use std::fs::File;

use anyhow::{Context, Result};
use memmap2::Mmap;
use tracing::info;

pub mod config;
pub mod diff;
pub mod elf;
pub mod error;
pub mod include;
pub mod inventory;
pub mod output;
pub mod writer;

use crate::config::Config;
use crate::elf::ElfObject;

/// Run the whole differencing pipeline.
pub fn run(config: &Config) -> Result<()> {
    let base_file = File::open(&config.original)
        .with_context(|| format!("failed to open {}", config.original.display()))?;
    let base_map = unsafe { Mmap::map(&base_file) }
        .with_context(|| format!("failed to map {}", config.original.display()))?;
    let patched_file = File::open(&config.patched)
        .with_context(|| format!("failed to open {}", config.patched.display()))?;
    let patched_map = unsafe { Mmap::map(&patched_file) }
        .with_context(|| format!("failed to map {}", config.patched.display()))?;

    let mut base = ElfObject::parse(&base_map)
        .with_context(|| format!("failed to load {}", config.original.display()))?;
    let mut patched = ElfObject::parse(&patched_map)
        .with_context(|| format!("failed to load {}", config.patched.display()))?;

    diff::compare_headers(&base, &patched)?;
    diff::check_program_headers(&base)?;
    diff::check_program_headers(&patched)?;

    diff::correlate(&mut base, &mut patched);
    // From here on the base graph is only reached through twin links.
    diff::compare(&mut patched, &base)?;
    diff::replace_section_symbols(&mut patched);

    include::report_changed_functions(&patched);
    include::include_changed_functions(&mut patched);
    elf::dump_graph(&patched);

    let mut out = output::generate(&mut patched)?;
    output::create_rela_sections(&mut out, &patched)?;
    output::create_shstrtab(&mut out)?;
    output::create_strtab(&mut out)?;
    output::create_symtab(&mut out)?;
    elf::dump_graph(&out);

    if config.inventory {
        inventory::write_inventory(&out, &config.output)?;
    }
    writer::write_output(&out, &patched.ehdr, &config.output)?;
    info!("wrote {}", config.output.display());
    Ok(())
}
