//! Correlation and comparison of the two object graphs.
//!
//! Entities pair across files by name (structural equality for relocation
//! entries), then every twinned pair is classified NEW, CHANGED or SAME on
//! the patched side. Mismatches that renaming cannot explain - diverging
//! headers, incompatible symbol info - are unreconcilable and abort the
//! run.

use std::collections::HashMap;

use anyhow::Result;
use object::elf;
use tracing::debug;

use crate::elf::{ElfObject, Rela, SecId, Shape, Status, SymId, Symbol};
use crate::error::Unreconcilable;

/// The two input headers must agree on everything that identifies the
/// compilation environment; section counts and table offsets may differ.
pub fn compare_headers(base: &ElfObject, patched: &ElfObject) -> Result<()> {
    let (a, b) = (&base.ehdr, &patched.ehdr);
    if a.ident != b.ident
        || a.e_type != b.e_type
        || a.e_machine != b.e_machine
        || a.e_version != b.e_version
        || a.e_entry != b.e_entry
        || a.e_phoff != b.e_phoff
        || a.e_flags != b.e_flags
        || a.e_ehsize != b.e_ehsize
        || a.e_phentsize != b.e_phentsize
        || a.e_shentsize != b.e_shentsize
    {
        return Err(Unreconcilable::new("ELF headers differ").into());
    }
    Ok(())
}

/// Inputs must be relocatables, not laid-out executables.
pub fn check_program_headers(obj: &ElfObject) -> Result<()> {
    if obj.ehdr.e_phnum != 0 {
        return Err(Unreconcilable::new("ELF contains program header").into());
    }
    Ok(())
}

/// Pair sections, symbols and relocation entries across the two graphs.
/// Twinned entries are pre-seeded SAME; comparison may still revise them.
pub fn correlate(base: &mut ElfObject, patched: &mut ElfObject) {
    correlate_sections(base, patched);
    correlate_symbols(base, patched);
    for i in 0..base.sections.len() {
        if base.sections[i].is_rela() && base.sections[i].twin.is_some() {
            correlate_relas(base, patched, SecId(i));
        }
    }
}

fn correlate_sections(base: &mut ElfObject, patched: &mut ElfObject) {
    let mut by_name: HashMap<&str, usize> = HashMap::new();
    for (j, sec) in patched.sections.iter().enumerate() {
        by_name.entry(sec.name.as_str()).or_insert(j);
    }
    let pairs: Vec<(usize, usize)> = base
        .sections
        .iter()
        .enumerate()
        .filter_map(|(i, sec)| by_name.get(sec.name.as_str()).map(|&j| (i, j)))
        .collect();
    for (i, j) in pairs {
        base.sections[i].twin = Some(SecId(j));
        patched.sections[j].twin = Some(SecId(i));
        base.sections[i].status = Status::Same;
        patched.sections[j].status = Status::Same;
    }
}

fn correlate_symbols(base: &mut ElfObject, patched: &mut ElfObject) {
    let mut by_name: HashMap<&str, usize> = HashMap::new();
    for (j, sym) in patched.symbols.iter().enumerate().skip(1) {
        by_name.entry(sym.name.as_str()).or_insert(j);
    }
    let pairs: Vec<(usize, usize)> = base
        .symbols
        .iter()
        .enumerate()
        .skip(1)
        .filter_map(|(i, sym)| by_name.get(sym.name.as_str()).map(|&j| (i, j)))
        .collect();
    for (i, j) in pairs {
        base.symbols[i].twin = Some(SymId(j));
        patched.symbols[j].twin = Some(SymId(i));
        base.symbols[i].status = Status::Same;
        patched.symbols[j].status = Status::Same;
    }
}

fn correlate_relas(base: &mut ElfObject, patched: &mut ElfObject, id: SecId) {
    let twin = match base.sections[id.0].twin {
        Some(t) => t,
        None => return,
    };
    let (bsecs, bsyms) = (&mut base.sections, &base.symbols);
    let (psecs, psyms) = (&mut patched.sections, &patched.symbols);
    let Shape::Rela { relas: brelas, .. } = &mut bsecs[id.0].shape else {
        return;
    };
    let Shape::Rela { relas: prelas, .. } = &mut psecs[twin.0].shape else {
        return;
    };
    for (i, r1) in brelas.iter_mut().enumerate() {
        for (j, r2) in prelas.iter_mut().enumerate() {
            if r2.twin.is_some() {
                continue;
            }
            if rela_equal(r1, r2, bsyms, psyms) {
                r1.twin = Some(j);
                r2.twin = Some(i);
                r1.status = Status::Same;
                r2.status = Status::Same;
                break;
            }
        }
    }
}

/// Structural equality: types and offsets must match, then either the
/// materialized strings agree or the target names and addends agree.
fn rela_equal(r1: &Rela, r2: &Rela, syms1: &[Symbol], syms2: &[Symbol]) -> bool {
    if r1.rtype != r2.rtype || r1.offset != r2.offset {
        return false;
    }
    match (&r1.string, &r2.string) {
        (Some(s1), Some(s2)) => s1 == s2,
        (Some(_), None) => false,
        (None, _) => syms1[r1.sym.0].name == syms2[r2.sym.0].name && r1.addend == r2.addend,
    }
}

/// Classify every entity on the patched side, then re-examine relocation
/// sections whose byte differences were renumbering only.
pub fn compare(patched: &mut ElfObject, base: &ElfObject) -> Result<()> {
    compare_content_sections(patched, base)?;
    compare_symbols(patched, base)?;
    for i in 0..patched.sections.len() {
        if patched.sections[i].is_rela() && patched.sections[i].status == Status::Same {
            refine_rela_section(patched, SecId(i));
        }
    }
    Ok(())
}

fn compare_content_sections(patched: &mut ElfObject, base: &ElfObject) -> Result<()> {
    for i in 0..patched.sections.len() {
        if patched.sections[i].is_rela() {
            continue;
        }
        let status = match patched.sections[i].twin {
            Some(t) => content_status(patched, base, SecId(i), t)?,
            None => Status::New,
        };
        patched.sections[i].status = status;
        // Sync the attached symbols and relocation section.
        if let Shape::Content { rela, sym, secsym } = patched.sections[i].shape {
            if let Some(s) = sym {
                patched.symbols[s.0].status = status;
            }
            if let Some(s) = secsym {
                patched.symbols[s.0].status = status;
            }
            if let Some(r) = rela {
                patched.sections[r.0].status = status;
            }
        }
    }
    Ok(())
}

fn content_status(patched: &ElfObject, base: &ElfObject, p: SecId, b: SecId) -> Result<Status> {
    let sec1 = &patched[p];
    let sec2 = &base[b];
    if sec1.sh.sh_type != sec2.sh.sh_type
        || sec1.sh.sh_flags != sec2.sh.sh_flags
        || sec1.sh.sh_addr != sec2.sh.sh_addr
        || sec1.sh.sh_addralign != sec2.sh.sh_addralign
        || sec1.sh.sh_entsize != sec2.sh.sh_entsize
        || !links_correlated(patched, base, sec1.sh.sh_link, sec2.sh.sh_link)
    {
        return Err(
            Unreconcilable::new(format!("{} section header details differ", sec1.name)).into(),
        );
    }
    Ok(
        if sec1.sh.sh_size != sec2.sh.sh_size
            || (sec1.sh.sh_type != elf::SHT_NOBITS && sec1.data != sec2.data)
        {
            Status::Changed
        } else {
            Status::Same
        },
    )
}

/// Link fields hold section indexes, which renumber freely between the two
/// files; they agree when both are unset or both resolve to correlated
/// sections.
fn links_correlated(patched: &ElfObject, base: &ElfObject, l1: u32, l2: u32) -> bool {
    if l1 == 0 && l2 == 0 {
        return true;
    }
    match (
        patched.section_by_index(l1 as usize),
        base.section_by_index(l2 as usize),
    ) {
        (Some(s1), Some(s2)) => patched[s1].twin == Some(s2),
        _ => false,
    }
}

fn compare_symbols(patched: &mut ElfObject, base: &ElfObject) -> Result<()> {
    for i in 1..patched.symbols.len() {
        match patched.symbols[i].twin {
            Some(t) => compare_symbol(patched, base, SymId(i), t)?,
            None => patched.symbols[i].status = Status::New,
        }
        debug!("symbol {} is {}", patched.symbols[i].name, patched.symbols[i].status);
    }
    Ok(())
}

fn compare_symbol(patched: &mut ElfObject, base: &ElfObject, p: SymId, b: SymId) -> Result<()> {
    let sym1 = &patched[p];
    let sym2 = &base[b];
    let secs_consistent = match (sym1.sec, sym2.sec) {
        (Some(s1), Some(s2)) => patched[s1].twin == Some(s2),
        (None, None) => true,
        _ => false,
    };
    if sym1.sym.st_info != sym2.sym.st_info
        || sym1.sym.st_other != sym2.sym.st_other
        || !secs_consistent
    {
        return Err(Unreconcilable::new(format!("symbol info mismatch: {}", sym1.name)).into());
    }
    if sym1.kind == elf::STT_OBJECT && sym1.sym.st_size != sym2.sym.st_size {
        return Err(Unreconcilable::new(format!("object size mismatch: {}", sym1.name)).into());
    }
    // Undefined and absolute symbols are identified by the outside world;
    // their equality is not ours to question.
    let external = sym1.sym.st_shndx == elf::SHN_UNDEF || sym1.sym.st_shndx == elf::SHN_ABS;
    if external {
        patched.symbols[p.0].status = Status::Same;
    }
    Ok(())
}

/// A relocation section whose base did not change still differs bytewise
/// when symbols were renumbered; only an entry with no twin makes the
/// difference real.
fn refine_rela_section(patched: &mut ElfObject, id: SecId) {
    let has_new = patched[id].relas().iter().any(|r| r.status == Status::New);
    if !has_new {
        patched.sections[id.0].status = Status::Same;
        return;
    }
    patched.sections[id.0].status = Status::Changed;
    let Some(base) = patched[id].base() else {
        return;
    };
    patched.sections[base.0].status = Status::Changed;
    let (sym, secsym) = (patched[base].entity_sym(), patched[base].section_sym());
    if let Some(s) = sym {
        patched.symbols[s.0].status = Status::Changed;
    }
    if let Some(s) = secsym {
        patched.symbols[s.0].status = Status::Changed;
    }
}

/// Compilers often reference local functions and objects through the
/// enclosing section's anonymous symbol. Re-target those relocations at
/// the named symbol so the final link can resolve against the definition
/// already present in the original image.
pub fn replace_section_symbols(obj: &mut ElfObject) {
    for i in 0..obj.sections.len() {
        if !obj.sections[i].is_rela() {
            continue;
        }
        let replacements: Vec<(usize, SymId)> = obj.sections[i]
            .relas()
            .iter()
            .enumerate()
            .filter_map(|(j, r)| {
                let target = &obj.symbols[r.sym.0];
                if target.kind != elf::STT_SECTION {
                    return None;
                }
                let entity = obj[target.sec?].entity_sym()?;
                debug!("replacing {} with {}", target.name, obj[entity].name);
                Some((j, entity))
            })
            .collect();
        if let Shape::Rela { relas, .. } = &mut obj.sections[i].shape {
            for (j, sym) in replacements {
                relas[j].sym = sym;
            }
        }
    }
}
