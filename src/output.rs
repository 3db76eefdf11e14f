//! Output graph synthesis.
//!
//! Copies the inclusion closure into a fresh graph with dense one-based
//! section indexes, rewrites symbols whose sections stayed behind into
//! undefined references, re-targets relocations through the input/output
//! crosslinks, and rebuilds the three metadata sections.

use std::borrow::Cow;
use std::mem;

use anyhow::{bail, Context, Result};
use object::elf;
use object::endian::{Endianness, I64, U16, U32, U64};
use object::pod::bytes_of;
use tracing::debug;

use crate::elf::{ElfObject, SecId, Shape, SymId, Symbol};

/// Copy every included entity into a new graph.
pub fn generate<'a>(input: &mut ElfObject<'a>) -> Result<ElfObject<'a>> {
    // The three metadata sections ride along no matter what changed.
    for name in [".shstrtab", ".strtab", ".symtab"] {
        let id = input
            .section_by_name(name)
            .with_context(|| format!("missing {name} section"))?;
        input.sections[id.0].include = true;
    }

    let mut out = ElfObject {
        ehdr: input.ehdr,
        endian: input.endian,
        sections: Vec::new(),
        symbols: Vec::new(),
    };

    for i in 0..input.sections.len() {
        if !input.sections[i].include {
            continue;
        }
        let mut sec = input.sections[i].clone();
        sec.index = out.sections.len() + 1;
        sec.cross = Some(SecId(i));
        input.sections[i].cross = Some(SecId(out.sections.len()));
        out.sections.push(sec);
    }
    debug!("outputting {} sections", out.sections.len());

    // A function or object whose section stayed behind becomes an
    // undefined global reference out of the patch into the original image.
    for sym in input.symbols.iter_mut().skip(1) {
        if sym.kind != elf::STT_FUNC && sym.kind != elf::STT_OBJECT {
            continue;
        }
        let Some(sec) = sym.sec else { continue };
        if input.sections[sec.0].include {
            continue;
        }
        sym.kind = elf::STT_NOTYPE;
        sym.bind = elf::STB_GLOBAL;
        sym.sym.st_info = (elf::STB_GLOBAL << 4) | elf::STT_NOTYPE;
        sym.sym.st_shndx = elf::SHN_UNDEF;
        sym.sym.st_size = 0;
    }

    // Output symbol order: null, FILE, local FUNC, remaining locals, then
    // non-locals. A stable sort over the rank yields the partition in one
    // pass while preserving symbol-table order inside each bucket.
    let mut order: Vec<usize> = (1..input.symbols.len())
        .filter(|&i| input.symbols[i].include)
        .collect();
    order.sort_by_key(|&i| copy_rank(&input.symbols[i]));

    out.symbols.push(Symbol::null());
    for i in order {
        let mut sym = input.symbols[i].clone();
        sym.index = out.symbols.len();
        sym.cross = Some(SymId(i));
        input.symbols[i].cross = Some(SymId(out.symbols.len()));
        if let Some(sec) = sym.sec {
            if let Some(cross) = input.sections[sec.0].cross {
                sym.sym.st_shndx = out.sections[cross.0].index as u16;
            }
        }
        out.symbols.push(sym);
    }
    debug!("outputting {} symbols", out.symbols.len());

    Ok(out)
}

fn copy_rank(sym: &Symbol) -> u8 {
    if sym.kind == elf::STT_FILE {
        0
    } else if sym.bind == elf::STB_LOCAL && sym.kind == elf::STT_FUNC {
        1
    } else if sym.bind == elf::STB_LOCAL {
        2
    } else {
        3
    }
}

/// Rebuild every output relocation section: entries are re-packed with
/// output symbol indexes, the link points at the output symbol table and
/// the info at the output copy of the base section.
pub fn create_rela_sections(out: &mut ElfObject, input: &ElfObject) -> Result<()> {
    let symtab = out
        .section_by_name(".symtab")
        .context("missing .symtab section")?;
    let link = out[symtab].index as u32;
    for i in 0..out.sections.len() {
        if out.sections[i].is_rela() {
            create_rela_section(out, input, SecId(i), link)?;
        }
    }
    Ok(())
}

fn create_rela_section(out: &mut ElfObject, input: &ElfObject, id: SecId, link: u32) -> Result<()> {
    let endian = out.endian;
    let entsize = out[id].sh.sh_entsize as usize;
    let mut buf = vec![0u8; out[id].sh.sh_size as usize];

    // Chase this section back to its input twin, over to the input base
    // section, and forward to the base's output copy.
    let input_id = out[id].cross.context("output section has no crosslink")?;
    let base = input[input_id]
        .base()
        .context("relocation section without a base")?;
    let info = input[base]
        .cross
        .map(|b| out.sections[b.0].index as u32)
        .with_context(|| format!("base section {} was not included", input[base].name))?;

    let mut remapped = Vec::with_capacity(out[id].relas().len());
    for (j, rela) in out[id].relas().iter().enumerate() {
        let target = input
            .symbols
            .get(rela.sym.0)
            .and_then(|s| s.cross)
            .context("expected rela symbol")?;
        let symndx = out[target].index as u64;
        let raw = elf::Rela64::<Endianness> {
            r_offset: U64::new(endian, rela.offset),
            r_info: U64::new(endian, (symndx << 32) | u64::from(rela.rtype)),
            r_addend: I64::new(endian, rela.addend),
        };
        buf[j * entsize..j * entsize + mem::size_of::<elf::Rela64<Endianness>>()]
            .copy_from_slice(bytes_of(&raw));
        remapped.push(target);
    }

    let sec = &mut out.sections[id.0];
    // Entries now target output symbols; keep the handles consistent.
    if let Shape::Rela { relas, .. } = &mut sec.shape {
        for (rela, target) in relas.iter_mut().zip(remapped) {
            rela.sym = target;
        }
    }
    sec.data = Cow::Owned(buf);
    sec.sh.sh_link = link;
    sec.sh.sh_info = info;
    Ok(())
}

/// Rebuild the section-name string table and write the fresh offsets back
/// into each section header.
pub fn create_shstrtab(out: &mut ElfObject) -> Result<()> {
    let shstrtab = out
        .section_by_name(".shstrtab")
        .context("missing .shstrtab section")?;

    let mut buf = vec![0u8];
    for i in 0..out.sections.len() {
        out.sections[i].sh.sh_name = buf.len() as u32;
        buf.extend_from_slice(out.sections[i].name.as_bytes());
        buf.push(0);
        debug!("{} @ shstrtab offset {}", out.sections[i].name, out.sections[i].sh.sh_name);
    }

    let sec = &mut out.sections[shstrtab.0];
    sec.sh.sh_size = buf.len() as u64;
    sec.data = Cow::Owned(buf);
    Ok(())
}

/// Rebuild the symbol-name string table. SECTION symbols keep offset 0:
/// their name is the enclosing section's.
pub fn create_strtab(out: &mut ElfObject) -> Result<()> {
    let strtab = out
        .section_by_name(".strtab")
        .context("missing .strtab section")?;

    let mut buf = vec![0u8];
    for sym in out.symbols.iter_mut().skip(1) {
        if sym.kind == elf::STT_SECTION {
            sym.sym.st_name = 0;
            continue;
        }
        sym.sym.st_name = buf.len() as u32;
        buf.extend_from_slice(sym.name.as_bytes());
        buf.push(0);
    }

    let sec = &mut out.sections[strtab.0];
    sec.sh.sh_size = buf.len() as u64;
    sec.data = Cow::Owned(buf);
    Ok(())
}

/// Re-pack the output symbol table at the original entry size. The link
/// names the string table; the info slot carries the section-name table
/// index, which is what the downstream patch link expects to find there.
pub fn create_symtab(out: &mut ElfObject) -> Result<()> {
    let symtab = out
        .section_by_name(".symtab")
        .context("missing .symtab section")?;
    let strtab = out
        .section_by_name(".strtab")
        .context("missing .strtab section")?;
    let shstrtab = out
        .section_by_name(".shstrtab")
        .context("missing .shstrtab section")?;
    let endian = out.endian;

    let entsize = out[symtab].sh.sh_entsize as usize;
    if entsize != mem::size_of::<elf::Sym64<Endianness>>() {
        bail!("unexpected symbol entry size {entsize}");
    }
    let mut buf = vec![0u8; out.symbols.len() * entsize];
    for (i, sym) in out.symbols.iter().enumerate() {
        let raw = elf::Sym64::<Endianness> {
            st_name: U32::new(endian, sym.sym.st_name),
            st_info: sym.sym.st_info,
            st_other: sym.sym.st_other,
            st_shndx: U16::new(endian, sym.sym.st_shndx),
            st_value: U64::new(endian, sym.sym.st_value),
            st_size: U64::new(endian, sym.sym.st_size),
        };
        buf[i * entsize..(i + 1) * entsize].copy_from_slice(bytes_of(&raw));
    }

    let (strtab_index, shstrtab_index) = (out[strtab].index as u32, out[shstrtab].index as u32);
    let sec = &mut out.sections[symtab.0];
    sec.sh.sh_size = buf.len() as u64;
    sec.data = Cow::Owned(buf);
    sec.sh.sh_link = strtab_index;
    sec.sh.sh_info = shstrtab_index;
    Ok(())
}
