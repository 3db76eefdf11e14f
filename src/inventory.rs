//! Section and symbol inventory.
//!
//! With `--inventory` the tool writes `<output>.inventory` next to the
//! output object: one line per section and one per symbol, with the raw
//! numeric type and bind codes.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::elf::ElfObject;

pub fn write_inventory(out: &ElfObject, output_path: &Path) -> Result<()> {
    let mut path = output_path.as_os_str().to_os_string();
    path.push(".inventory");
    let path = PathBuf::from(path);

    let file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);

    for sec in &out.sections {
        writeln!(w, "section {}", sec.name)?;
    }
    for sym in out.symbols.iter().skip(1) {
        writeln!(w, "symbol {} {} {}", sym.name, sym.kind, sym.bind)?;
    }
    w.flush().context("failed to write inventory file")
}
