//! ELF emitter.
//!
//! Writes the output graph as a relocatable object: a fresh file header
//! whose identity is taken from the patched input, the section data blobs
//! laid out in order, then the section header table.

use std::mem;
use std::path::Path;

use anyhow::{bail, Context, Result};
use object::elf;
use object::endian::{Endianness, U16, U32, U64};
use object::pod::bytes_of;

use crate::elf::{Ehdr, ElfObject};

fn u16(e: Endianness, v: u16) -> U16<Endianness> {
    U16::new(e, v)
}
fn u32(e: Endianness, v: u32) -> U32<Endianness> {
    U32::new(e, v)
}
fn u64(e: Endianness, v: u64) -> U64<Endianness> {
    U64::new(e, v)
}

/// Aligns an offset up to the next multiple of `align`.
/// `align` must be a power of two.
fn align_up(offset: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

/// Write the output object to disk. `source` is the patched input's
/// header; class, data encoding, machine and type carry over, the rest of
/// the geometry is freshly computed.
pub fn write_output(out: &ElfObject, source: &Ehdr, path: &Path) -> Result<()> {
    let endian = out.endian;
    let ehsize = mem::size_of::<elf::FileHeader64<Endianness>>() as u64;
    let shentsize = mem::size_of::<elf::SectionHeader64<Endianness>>();
    let shnum = u16::try_from(out.sections.len() + 1).context("too many output sections")?;

    // Lay the data blobs out in section order, honoring each section's
    // alignment. No-bits sections occupy no file space.
    let mut offsets = Vec::with_capacity(out.sections.len());
    let mut cursor = ehsize;
    for sec in &out.sections {
        if sec.sh.sh_type == elf::SHT_NOBITS {
            offsets.push(cursor);
            continue;
        }
        if sec.data.len() as u64 != sec.sh.sh_size {
            bail!("section {} data does not match its header size", sec.name);
        }
        cursor = align_up(cursor, sec.sh.sh_addralign.max(1));
        offsets.push(cursor);
        cursor += sec.data.len() as u64;
    }
    let shoff = align_up(cursor, 8);

    let shstrndx = out
        .section_by_name(".shstrtab")
        .context("missing .shstrtab section")?;
    let header = elf::FileHeader64::<Endianness> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: source.ident[4],
            data: source.ident[5],
            version: elf::EV_CURRENT,
            os_abi: source.ident[7],
            abi_version: source.ident[8],
            padding: [0; 7],
        },
        e_type: u16(endian, source.e_type),
        e_machine: u16(endian, source.e_machine),
        e_version: u32(endian, u32::from(elf::EV_CURRENT)),
        e_entry: u64(endian, 0),
        e_phoff: u64(endian, 0),
        e_shoff: u64(endian, shoff),
        e_flags: u32(endian, 0),
        e_ehsize: u16(endian, ehsize as u16),
        e_phentsize: u16(endian, 0),
        e_phnum: u16(endian, 0),
        e_shentsize: u16(endian, shentsize as u16),
        e_shnum: u16(endian, shnum),
        e_shstrndx: u16(endian, out[shstrndx].index as u16),
    };

    let mut buffer = Vec::with_capacity(shoff as usize + (shnum as usize) * shentsize);
    buffer.extend_from_slice(bytes_of(&header));

    for (sec, &off) in out.sections.iter().zip(&offsets) {
        if sec.sh.sh_type == elf::SHT_NOBITS {
            continue;
        }
        if buffer.len() < off as usize {
            buffer.resize(off as usize, 0);
        }
        buffer.extend_from_slice(&sec.data);
    }
    if buffer.len() < shoff as usize {
        buffer.resize(shoff as usize, 0);
    }

    // Section header table, reserved null header first.
    let null_sh = elf::SectionHeader64::<Endianness> {
        sh_name: u32(endian, 0),
        sh_type: u32(endian, elf::SHT_NULL),
        sh_flags: u64(endian, 0),
        sh_addr: u64(endian, 0),
        sh_offset: u64(endian, 0),
        sh_size: u64(endian, 0),
        sh_link: u32(endian, 0),
        sh_info: u32(endian, 0),
        sh_addralign: u64(endian, 0),
        sh_entsize: u64(endian, 0),
    };
    buffer.extend_from_slice(bytes_of(&null_sh));
    for (sec, &off) in out.sections.iter().zip(&offsets) {
        let sh = elf::SectionHeader64::<Endianness> {
            sh_name: u32(endian, sec.sh.sh_name),
            sh_type: u32(endian, sec.sh.sh_type),
            sh_flags: u64(endian, sec.sh.sh_flags),
            sh_addr: u64(endian, sec.sh.sh_addr),
            sh_offset: u64(endian, off),
            sh_size: u64(endian, sec.sh.sh_size),
            sh_link: u32(endian, sec.sh.sh_link),
            sh_info: u32(endian, sec.sh.sh_info),
            sh_addralign: u64(endian, sec.sh.sh_addralign),
            sh_entsize: u64(endian, sec.sh.sh_entsize),
        };
        buffer.extend_from_slice(bytes_of(&sh));
    }

    std::fs::write(path, &buffer).with_context(|| format!("failed to write {}", path.display()))
}
