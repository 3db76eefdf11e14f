//! Synthesizes minimal relocatable ELF64 objects for the test suite.
//!
//! The builder mirrors what a compiler produces for trivial translation
//! units built with per-function and per-data sections: one content
//! section per function or object, a SECTION symbol per content section,
//! an optional FILE symbol, and a `.rela.*` section wherever relocations
//! were attached.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use object::elf;
use object::endian::{Endianness, I64, U16, U32, U64};
use object::pod::bytes_of;

use patchobj::config::Config;

pub enum RelaTarget {
    /// A named symbol.
    Symbol(String),
    /// The SECTION symbol of the named section.
    Section(String),
}

pub struct FixtureRela {
    pub offset: u64,
    pub rtype: u32,
    pub target: RelaTarget,
    pub addend: i64,
}

struct Entity {
    name: String,
    bind: u8,
    kind: u8,
    size: u64,
}

struct FixtureSection {
    name: String,
    sh_type: u32,
    flags: u64,
    addralign: u64,
    entsize: u64,
    data: Vec<u8>,
    entity: Option<Entity>,
    relas: Vec<FixtureRela>,
}

#[derive(Default)]
pub struct Fixture {
    file_sym: Option<String>,
    sections: Vec<FixtureSection>,
    undefs: Vec<String>,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture::default()
    }

    /// Add a FILE symbol naming the originating source file.
    pub fn source_file(mut self, name: &str) -> Self {
        self.file_sym = Some(name.to_string());
        self
    }

    /// Add `.text.<name>` with a global FUNC symbol at offset 0.
    pub fn func(self, name: &str, body: &[u8]) -> Self {
        self.function(name, body, elf::STB_GLOBAL)
    }

    /// Add `.text.<name>` with a local FUNC symbol at offset 0.
    pub fn local_func(self, name: &str, body: &[u8]) -> Self {
        self.function(name, body, elf::STB_LOCAL)
    }

    fn function(mut self, name: &str, body: &[u8], bind: u8) -> Self {
        self.sections.push(FixtureSection {
            name: format!(".text.{name}"),
            sh_type: elf::SHT_PROGBITS,
            flags: u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            addralign: 16,
            entsize: 0,
            data: body.to_vec(),
            entity: Some(Entity {
                name: name.to_string(),
                bind,
                kind: elf::STT_FUNC,
                size: body.len() as u64,
            }),
            relas: Vec::new(),
        });
        self
    }

    /// Add `.data.<name>` with a global OBJECT symbol at offset 0.
    pub fn object(self, name: &str, data: &[u8]) -> Self {
        let size = data.len() as u64;
        self.object_sized(name, data, size)
    }

    /// Same, with an explicit symbol size.
    pub fn object_sized(mut self, name: &str, data: &[u8], size: u64) -> Self {
        self.sections.push(FixtureSection {
            name: format!(".data.{name}"),
            sh_type: elf::SHT_PROGBITS,
            flags: u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
            addralign: 8,
            entsize: 0,
            data: data.to_vec(),
            entity: Some(Entity {
                name: name.to_string(),
                bind: elf::STB_GLOBAL,
                kind: elf::STT_OBJECT,
                size,
            }),
            relas: Vec::new(),
        });
        self
    }

    /// Add a mergeable string section (no entity symbol).
    pub fn strings(mut self, name: &str, data: &[u8]) -> Self {
        self.sections.push(FixtureSection {
            name: name.to_string(),
            sh_type: elf::SHT_PROGBITS,
            flags: u64::from(elf::SHF_ALLOC | elf::SHF_MERGE | elf::SHF_STRINGS),
            addralign: 1,
            entsize: 1,
            data: data.to_vec(),
            entity: None,
            relas: Vec::new(),
        });
        self
    }

    /// Declare an undefined global (NOTYPE) symbol.
    pub fn undef(mut self, name: &str) -> Self {
        self.undefs.push(name.to_string());
        self
    }

    /// Attach a relocation against a named symbol to section `sec`.
    pub fn rela_sym(mut self, sec: &str, offset: u64, rtype: u32, target: &str, addend: i64) -> Self {
        self.section_mut(sec).relas.push(FixtureRela {
            offset,
            rtype,
            target: RelaTarget::Symbol(target.to_string()),
            addend,
        });
        self
    }

    /// Attach a relocation against another section's SECTION symbol.
    pub fn rela_sec(mut self, sec: &str, offset: u64, rtype: u32, target: &str, addend: i64) -> Self {
        self.section_mut(sec).relas.push(FixtureRela {
            offset,
            rtype,
            target: RelaTarget::Section(target.to_string()),
            addend,
        });
        self
    }

    /// Override a section's alignment.
    pub fn align(mut self, sec: &str, addralign: u64) -> Self {
        self.section_mut(sec).addralign = addralign;
        self
    }

    fn section_mut(&mut self, name: &str) -> &mut FixtureSection {
        self.sections
            .iter_mut()
            .find(|s| s.name == name)
            .expect("unknown fixture section")
    }

    pub fn build(&self) -> Vec<u8> {
        let e = Endianness::Little;

        struct RawSym {
            name: String,
            in_strtab: bool,
            info: u8,
            shndx: u16,
            size: u64,
        }

        let content_count = self.sections.len();
        let rela_secs: Vec<usize> = self
            .sections
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.relas.is_empty())
            .map(|(i, _)| i)
            .collect();
        let symtab_ndx = 1 + content_count + rela_secs.len();
        let strtab_ndx = symtab_ndx + 1;
        let shstrtab_ndx = strtab_ndx + 1;

        // Symbol table: null, FILE, SECTION symbols, local entities,
        // global entities, undefined globals.
        let mut syms = vec![RawSym {
            name: String::new(),
            in_strtab: false,
            info: 0,
            shndx: 0,
            size: 0,
        }];
        let mut sym_index: HashMap<&str, usize> = HashMap::new();
        let mut secsym_index: HashMap<&str, usize> = HashMap::new();

        if let Some(file) = &self.file_sym {
            syms.push(RawSym {
                name: file.clone(),
                in_strtab: true,
                info: (elf::STB_LOCAL << 4) | elf::STT_FILE,
                shndx: elf::SHN_ABS,
                size: 0,
            });
        }
        for (i, sec) in self.sections.iter().enumerate() {
            secsym_index.insert(sec.name.as_str(), syms.len());
            syms.push(RawSym {
                name: String::new(),
                in_strtab: false,
                info: (elf::STB_LOCAL << 4) | elf::STT_SECTION,
                shndx: (i + 1) as u16,
                size: 0,
            });
        }
        let mut first_global = 0;
        for local in [true, false] {
            if !local {
                first_global = syms.len();
            }
            for (i, sec) in self.sections.iter().enumerate() {
                let Some(ent) = &sec.entity else { continue };
                if (ent.bind == elf::STB_LOCAL) != local {
                    continue;
                }
                sym_index.insert(ent.name.as_str(), syms.len());
                syms.push(RawSym {
                    name: ent.name.clone(),
                    in_strtab: true,
                    info: (ent.bind << 4) | ent.kind,
                    shndx: (i + 1) as u16,
                    size: ent.size,
                });
            }
        }
        for undef in &self.undefs {
            sym_index.insert(undef.as_str(), syms.len());
            syms.push(RawSym {
                name: undef.clone(),
                in_strtab: true,
                info: (elf::STB_GLOBAL << 4) | elf::STT_NOTYPE,
                shndx: elf::SHN_UNDEF,
                size: 0,
            });
        }

        // String tables.
        let mut strtab = vec![0u8];
        let mut st_names = Vec::with_capacity(syms.len());
        for s in &syms {
            if s.in_strtab && !s.name.is_empty() {
                st_names.push(strtab.len() as u32);
                strtab.extend_from_slice(s.name.as_bytes());
                strtab.push(0);
            } else {
                st_names.push(0);
            }
        }

        let section_names: Vec<String> = self
            .sections
            .iter()
            .map(|s| s.name.clone())
            .chain(rela_secs.iter().map(|&i| format!(".rela{}", self.sections[i].name)))
            .chain([".symtab".to_string(), ".strtab".to_string(), ".shstrtab".to_string()])
            .collect();
        let mut shstrtab = vec![0u8];
        let mut sh_names = vec![0u32];
        for name in &section_names {
            sh_names.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }

        // Packed symbol table.
        let mut symtab = Vec::with_capacity(syms.len() * 24);
        for (s, &nameoff) in syms.iter().zip(&st_names) {
            let raw = elf::Sym64::<Endianness> {
                st_name: U32::new(e, nameoff),
                st_info: s.info,
                st_other: 0,
                st_shndx: U16::new(e, s.shndx),
                st_value: U64::new(e, 0),
                st_size: U64::new(e, s.size),
            };
            symtab.extend_from_slice(bytes_of(&raw));
        }

        // Packed relocation tables.
        let mut rela_blobs = Vec::new();
        for &si in &rela_secs {
            let mut blob = Vec::new();
            for r in &self.sections[si].relas {
                let symndx = match &r.target {
                    RelaTarget::Symbol(n) => *sym_index
                        .get(n.as_str())
                        .unwrap_or_else(|| panic!("no symbol {n} in fixture")),
                    RelaTarget::Section(n) => *secsym_index
                        .get(n.as_str())
                        .unwrap_or_else(|| panic!("no section {n} in fixture")),
                };
                let raw = elf::Rela64::<Endianness> {
                    r_offset: U64::new(e, r.offset),
                    r_info: U64::new(e, ((symndx as u64) << 32) | u64::from(r.rtype)),
                    r_addend: I64::new(e, r.addend),
                };
                blob.extend_from_slice(bytes_of(&raw));
            }
            rela_blobs.push(blob);
        }

        // Assemble the section list in final index order.
        struct OutSec {
            name_off: u32,
            sh_type: u32,
            flags: u64,
            link: u32,
            info: u32,
            addralign: u64,
            entsize: u64,
            data: Vec<u8>,
        }
        let mut secs = Vec::new();
        for (i, sec) in self.sections.iter().enumerate() {
            secs.push(OutSec {
                name_off: sh_names[1 + i],
                sh_type: sec.sh_type,
                flags: sec.flags,
                link: 0,
                info: 0,
                addralign: sec.addralign,
                entsize: sec.entsize,
                data: sec.data.clone(),
            });
        }
        for (k, &si) in rela_secs.iter().enumerate() {
            secs.push(OutSec {
                name_off: sh_names[1 + content_count + k],
                sh_type: elf::SHT_RELA,
                flags: u64::from(elf::SHF_INFO_LINK),
                link: symtab_ndx as u32,
                info: (si + 1) as u32,
                addralign: 8,
                entsize: 24,
                data: rela_blobs[k].clone(),
            });
        }
        secs.push(OutSec {
            name_off: sh_names[symtab_ndx],
            sh_type: elf::SHT_SYMTAB,
            flags: 0,
            link: strtab_ndx as u32,
            info: first_global as u32,
            addralign: 8,
            entsize: 24,
            data: symtab,
        });
        secs.push(OutSec {
            name_off: sh_names[strtab_ndx],
            sh_type: elf::SHT_STRTAB,
            flags: 0,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
            data: strtab,
        });
        secs.push(OutSec {
            name_off: sh_names[shstrtab_ndx],
            sh_type: elf::SHT_STRTAB,
            flags: 0,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
            data: shstrtab,
        });

        // Lay out data, then emit header, blobs and the header table.
        let ehsize = 64u64;
        let mut cursor = ehsize;
        let mut offsets = Vec::new();
        for s in &secs {
            cursor = align_up(cursor, s.addralign.max(1));
            offsets.push(cursor);
            cursor += s.data.len() as u64;
        }
        let shoff = align_up(cursor, 8);
        let shnum = secs.len() + 1;

        let header = elf::FileHeader64::<Endianness> {
            e_ident: elf::Ident {
                magic: elf::ELFMAG,
                class: elf::ELFCLASS64,
                data: elf::ELFDATA2LSB,
                version: elf::EV_CURRENT,
                os_abi: elf::ELFOSABI_SYSV,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: U16::new(e, elf::ET_REL),
            e_machine: U16::new(e, elf::EM_X86_64),
            e_version: U32::new(e, u32::from(elf::EV_CURRENT)),
            e_entry: U64::new(e, 0),
            e_phoff: U64::new(e, 0),
            e_shoff: U64::new(e, shoff),
            e_flags: U32::new(e, 0),
            e_ehsize: U16::new(e, 64),
            e_phentsize: U16::new(e, 0),
            e_phnum: U16::new(e, 0),
            e_shentsize: U16::new(e, 64),
            e_shnum: U16::new(e, shnum as u16),
            e_shstrndx: U16::new(e, shstrtab_ndx as u16),
        };

        let mut buffer = Vec::new();
        buffer.extend_from_slice(bytes_of(&header));
        for (s, &off) in secs.iter().zip(&offsets) {
            if buffer.len() < off as usize {
                buffer.resize(off as usize, 0);
            }
            buffer.extend_from_slice(&s.data);
        }
        if buffer.len() < shoff as usize {
            buffer.resize(shoff as usize, 0);
        }
        let null_sh = elf::SectionHeader64::<Endianness> {
            sh_name: U32::new(e, 0),
            sh_type: U32::new(e, elf::SHT_NULL),
            sh_flags: U64::new(e, 0),
            sh_addr: U64::new(e, 0),
            sh_offset: U64::new(e, 0),
            sh_size: U64::new(e, 0),
            sh_link: U32::new(e, 0),
            sh_info: U32::new(e, 0),
            sh_addralign: U64::new(e, 0),
            sh_entsize: U64::new(e, 0),
        };
        buffer.extend_from_slice(bytes_of(&null_sh));
        for (s, &off) in secs.iter().zip(&offsets) {
            let sh = elf::SectionHeader64::<Endianness> {
                sh_name: U32::new(e, s.name_off),
                sh_type: U32::new(e, s.sh_type),
                sh_flags: U64::new(e, s.flags),
                sh_addr: U64::new(e, 0),
                sh_offset: U64::new(e, off),
                sh_size: U64::new(e, s.data.len() as u64),
                sh_link: U32::new(e, s.link),
                sh_info: U32::new(e, s.info),
                sh_addralign: U64::new(e, s.addralign),
                sh_entsize: U64::new(e, s.entsize),
            };
            buffer.extend_from_slice(bytes_of(&sh));
        }
        buffer
    }
}

fn align_up(offset: u64, align: u64) -> u64 {
    (offset + align - 1) & !(align - 1)
}

/// Overwrite a little-endian u16 field in a built image.
pub fn patch_u16_le(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// ELF64 header field offsets used by the mutation tests.
pub const E_MACHINE_OFFSET: usize = 18;
pub const E_PHNUM_OFFSET: usize = 56;

pub struct DiffRun {
    pub dir: tempfile::TempDir,
    pub base: PathBuf,
    pub patched: PathBuf,
    pub output: PathBuf,
    pub result: anyhow::Result<()>,
}

/// Write both images to disk and run the full pipeline over them.
pub fn run_diff(base: &[u8], patched: &[u8]) -> DiffRun {
    run_diff_opts(base, patched, false)
}

pub fn run_diff_opts(base: &[u8], patched: &[u8], inventory: bool) -> DiffRun {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.o");
    let patched_path = dir.path().join("patched.o");
    let output = dir.path().join("output.o");
    std::fs::write(&base_path, base).unwrap();
    std::fs::write(&patched_path, patched).unwrap();
    let config = Config {
        original: base_path.clone(),
        patched: patched_path.clone(),
        output: output.clone(),
        debug: false,
        inventory,
    };
    let result = patchobj::run(&config);
    DiffRun {
        dir,
        base: base_path,
        patched: patched_path,
        output,
        result,
    }
}

/// Map a file for parsing; object graphs borrow from the mapping.
pub fn map(path: &std::path::Path) -> memmap2::Mmap {
    let file = std::fs::File::open(path).unwrap();
    unsafe { memmap2::Mmap::map(&file) }.unwrap()
}
