//! In-memory object graph.
//!
//! One [`ElfObject`] holds everything the pipeline needs to know about a
//! single relocatable file: the widened file header, the section list in
//! on-disk order, the symbol table, and per-relocation-section rela tables.
//! Entities refer to each other through plain index handles ([`SecId`],
//! [`SymId`]) into the owning graph, so cross-file twin links and
//! input/output crosslinks are just indexes into the *other* graph.

use std::borrow::Cow;
use std::fmt;
use std::mem;
use std::ops::{Index, IndexMut};

use anyhow::{anyhow, bail, Context, Result};
use object::elf;
use object::endian::Endianness;
use object::pod;
use tracing::debug;

/// Classification of an entity after correlation and comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No twin in the other object.
    New,
    /// Twin exists but differs meaningfully.
    Changed,
    /// Twin exists and is equivalent, possibly modulo symbol renumbering.
    Same,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::New => "NEW",
            Status::Changed => "CHANGED",
            Status::Same => "SAME",
        })
    }
}

/// Position of a section in its graph's section list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecId(pub usize);

/// Position of a symbol in its graph's symbol table (0 is the null symbol).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymId(pub usize);

/// Section header record, widened to the 64-bit class.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl Shdr {
    fn decode(sh: &elf::SectionHeader64<Endianness>, endian: Endianness) -> Self {
        Shdr {
            sh_name: sh.sh_name.get(endian),
            sh_type: sh.sh_type.get(endian),
            sh_flags: sh.sh_flags.get(endian),
            sh_addr: sh.sh_addr.get(endian),
            sh_offset: sh.sh_offset.get(endian),
            sh_size: sh.sh_size.get(endian),
            sh_link: sh.sh_link.get(endian),
            sh_info: sh.sh_info.get(endian),
            sh_addralign: sh.sh_addralign.get(endian),
            sh_entsize: sh.sh_entsize.get(endian),
        }
    }
}

/// Symbol table record, widened to the 64-bit class.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

/// File header fields, widened to the 64-bit class.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ehdr {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// One relocation entry, decoded against its section's base.
#[derive(Debug, Clone)]
pub struct Rela {
    pub rtype: u32,
    /// Byte offset into the base section's data.
    pub offset: u64,
    pub addend: i64,
    /// Target symbol, in the graph that owns the entry.
    pub sym: SymId,
    /// String literal referenced through a string-flagged section, if any.
    pub string: Option<String>,
    pub status: Status,
    /// Structurally equal entry in the twin relocation section.
    pub twin: Option<usize>,
}

/// The two shapes a section can take.
#[derive(Debug, Clone)]
pub enum Shape {
    /// A relocation section patching the bytes of `base`.
    Rela { base: SecId, relas: Vec<Rela> },
    /// A content section.
    Content {
        /// Relocation section pointing at this section, if any.
        rela: Option<SecId>,
        /// Named FUNC/OBJECT symbol defined at offset 0, if any.
        sym: Option<SymId>,
        /// Anonymous SECTION symbol naming this section, if any.
        secsym: Option<SymId>,
    },
}

#[derive(Debug, Clone)]
pub struct Section<'a> {
    pub sh: Shdr,
    pub data: Cow<'a, [u8]>,
    pub name: String,
    /// One-based index, assigned by position in the section list.
    pub index: usize,
    pub status: Status,
    pub include: bool,
    /// Same-named section in the other input graph.
    pub twin: Option<SecId>,
    /// Copy of this section on the other side of the input/output boundary.
    pub cross: Option<SecId>,
    pub shape: Shape,
}

impl Section<'_> {
    pub fn is_rela(&self) -> bool {
        matches!(self.shape, Shape::Rela { .. })
    }

    /// Relocation entries; empty for content sections.
    pub fn relas(&self) -> &[Rela] {
        match &self.shape {
            Shape::Rela { relas, .. } => relas,
            Shape::Content { .. } => &[],
        }
    }

    /// Base section of a relocation section.
    pub fn base(&self) -> Option<SecId> {
        match self.shape {
            Shape::Rela { base, .. } => Some(base),
            Shape::Content { .. } => None,
        }
    }

    /// Entity symbol of a content section.
    pub fn entity_sym(&self) -> Option<SymId> {
        match self.shape {
            Shape::Content { sym, .. } => sym,
            Shape::Rela { .. } => None,
        }
    }

    /// Section symbol of a content section.
    pub fn section_sym(&self) -> Option<SymId> {
        match self.shape {
            Shape::Content { secsym, .. } => secsym,
            Shape::Rela { .. } => None,
        }
    }

    /// Relocation section attached to a content section.
    pub fn rela_sec(&self) -> Option<SecId> {
        match self.shape {
            Shape::Content { rela, .. } => rela,
            Shape::Rela { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub sym: Sym,
    pub name: String,
    pub index: usize,
    pub bind: u8,
    pub kind: u8,
    /// Owning section; undefined and absolute symbols have none.
    pub sec: Option<SecId>,
    pub status: Status,
    pub include: bool,
    /// Same-named symbol in the other input graph.
    pub twin: Option<SymId>,
    /// Copy of this symbol on the other side of the input/output boundary.
    pub cross: Option<SymId>,
}

impl Symbol {
    pub fn null() -> Symbol {
        Symbol {
            sym: Sym::default(),
            name: String::new(),
            index: 0,
            bind: 0,
            kind: 0,
            sec: None,
            status: Status::New,
            include: false,
            twin: None,
            cross: None,
        }
    }
}

/// The graph for one object file. Section data borrows from the mapped
/// input file; rebuilt output buffers are owned.
pub struct ElfObject<'a> {
    pub ehdr: Ehdr,
    pub endian: Endianness,
    pub sections: Vec<Section<'a>>,
    pub symbols: Vec<Symbol>,
}

impl<'a> Index<SecId> for ElfObject<'a> {
    type Output = Section<'a>;
    fn index(&self, id: SecId) -> &Section<'a> {
        &self.sections[id.0]
    }
}

impl<'a> IndexMut<SecId> for ElfObject<'a> {
    fn index_mut(&mut self, id: SecId) -> &mut Section<'a> {
        &mut self.sections[id.0]
    }
}

impl Index<SymId> for ElfObject<'_> {
    type Output = Symbol;
    fn index(&self, id: SymId) -> &Symbol {
        &self.symbols[id.0]
    }
}

impl IndexMut<SymId> for ElfObject<'_> {
    fn index_mut(&mut self, id: SymId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }
}

impl<'a> ElfObject<'a> {
    /// Build the graph for one relocatable object.
    ///
    /// Loading is all or nothing: any missing dependency (base section,
    /// symbol index, string table entry) fails the whole parse.
    pub fn parse(data: &'a [u8]) -> Result<ElfObject<'a>> {
        let (eh, _) = pod::from_bytes::<elf::FileHeader64<Endianness>>(data)
            .map_err(|()| anyhow!("file too short for an ELF header"))?;
        let ident = &eh.e_ident;
        if ident.magic != elf::ELFMAG {
            bail!("not an ELF file");
        }
        if ident.class != elf::ELFCLASS64 {
            bail!("unsupported ELF class {}, only 64-bit objects are handled", ident.class);
        }
        let endian = match ident.data {
            elf::ELFDATA2LSB => Endianness::Little,
            elf::ELFDATA2MSB => Endianness::Big,
            other => bail!("unknown ELF data encoding {other}"),
        };
        let mut raw_ident = [0u8; 16];
        raw_ident.copy_from_slice(&data[..16]);
        let ehdr = Ehdr {
            ident: raw_ident,
            e_type: eh.e_type.get(endian),
            e_machine: eh.e_machine.get(endian),
            e_version: eh.e_version.get(endian),
            e_entry: eh.e_entry.get(endian),
            e_phoff: eh.e_phoff.get(endian),
            e_shoff: eh.e_shoff.get(endian),
            e_flags: eh.e_flags.get(endian),
            e_ehsize: eh.e_ehsize.get(endian),
            e_phentsize: eh.e_phentsize.get(endian),
            e_phnum: eh.e_phnum.get(endian),
            e_shentsize: eh.e_shentsize.get(endian),
            e_shnum: eh.e_shnum.get(endian),
            e_shstrndx: eh.e_shstrndx.get(endian),
        };

        let mut obj = ElfObject {
            ehdr,
            endian,
            sections: Vec::new(),
            symbols: Vec::new(),
        };
        obj.load_sections(data)?;
        obj.load_symbols()?;
        obj.load_relas()?;
        Ok(obj)
    }

    fn load_sections(&mut self, data: &'a [u8]) -> Result<()> {
        let endian = self.endian;
        if self.ehdr.e_shnum == 0 {
            bail!("object has no sections");
        }
        if usize::from(self.ehdr.e_shentsize) != mem::size_of::<elf::SectionHeader64<Endianness>>() {
            bail!("unexpected section header entry size {}", self.ehdr.e_shentsize);
        }
        let shoff = usize::try_from(self.ehdr.e_shoff).context("bad section header offset")?;
        let table = data.get(shoff..).context("section header table out of range")?;
        let (shdrs, _) =
            pod::slice_from_bytes::<elf::SectionHeader64<Endianness>>(table, usize::from(self.ehdr.e_shnum))
                .map_err(|()| anyhow!("section header table truncated or misaligned"))?;
        if shdrs[0].sh_type.get(endian) != elf::SHT_NULL {
            bail!("section index 0 is not the reserved null section");
        }

        let shstr = shdrs
            .get(usize::from(self.ehdr.e_shstrndx))
            .context("missing section header string table")?;
        let shstr_data = section_file_data(data, shstr, endian)?;

        let mut names = Vec::with_capacity(shdrs.len());
        for sh in shdrs {
            names.push(read_cstr(shstr_data, sh.sh_name.get(endian) as usize)?.to_string());
        }

        debug!("=== section list ({}) ===", shdrs.len() - 1);
        for (i, sh) in shdrs.iter().enumerate().skip(1) {
            let shdr = Shdr::decode(sh, endian);
            let name = names[i].clone();
            let shape = if shdr.sh_type == elf::SHT_RELA {
                let base = rela_base_name(&name)
                    .and_then(|b| names.iter().skip(1).position(|n| n.as_str() == b))
                    .map(SecId)
                    .with_context(|| format!("can't find base section for rela section {name}"))?;
                Shape::Rela { base, relas: Vec::new() }
            } else {
                Shape::Content { rela: None, sym: None, secsym: None }
            };
            let data = section_file_data(data, sh, endian)?;
            debug!("ndx {:02}, size {}, name {}", i, data.len(), name);
            self.sections.push(Section {
                sh: shdr,
                data: Cow::Borrowed(data),
                name,
                index: i,
                status: Status::New,
                include: false,
                twin: None,
                cross: None,
                shape,
            });
        }

        // Reverse links from each base section to its relocation section.
        for i in 0..self.sections.len() {
            let base = match self.sections[i].shape {
                Shape::Rela { base, .. } => base,
                Shape::Content { .. } => continue,
            };
            if self.sections[base.0].is_rela() {
                bail!("base section for {} is itself a relocation section", self.sections[i].name);
            }
            if let Shape::Content { rela, .. } = &mut self.sections[base.0].shape {
                *rela = Some(SecId(i));
            }
        }
        Ok(())
    }

    fn load_symbols(&mut self) -> Result<()> {
        let endian = self.endian;
        let symtab = self.section_by_name(".symtab").context("missing symbol table")?;
        let (entsize, link, data) = {
            let sec = &self[symtab];
            (sec.sh.sh_entsize, sec.sh.sh_link, sec.data.clone())
        };
        if usize::try_from(entsize)? != mem::size_of::<elf::Sym64<Endianness>>() {
            bail!("unexpected symbol entry size {entsize}");
        }
        let strtab = self
            .section_by_index(link as usize)
            .context("missing symbol string table")?;
        let strtab_data = self[strtab].data.clone();

        let count = data.len() / entsize as usize;
        let (raws, _) = pod::slice_from_bytes::<elf::Sym64<Endianness>>(&data, count)
            .map_err(|()| anyhow!("symbol table truncated or misaligned"))?;

        debug!("=== symbol table ({} entries) ===", count);
        self.symbols = Vec::with_capacity(count);
        self.symbols.push(Symbol::null());
        for (i, raw) in raws.iter().enumerate().skip(1) {
            let sym = Sym {
                st_name: raw.st_name.get(endian),
                st_info: raw.st_info,
                st_other: raw.st_other,
                st_shndx: raw.st_shndx.get(endian),
                st_value: raw.st_value.get(endian),
                st_size: raw.st_size.get(endian),
            };
            let mut name = read_cstr(&strtab_data, sym.st_name as usize)?.to_string();
            let bind = sym.st_info >> 4;
            let kind = sym.st_info & 0xf;
            let mut sec = None;
            if sym.st_shndx > elf::SHN_UNDEF && sym.st_shndx < elf::SHN_LORESERVE {
                let id = self
                    .section_by_index(usize::from(sym.st_shndx))
                    .with_context(|| format!("couldn't find section for symbol {name}"))?;
                sec = Some(id);
                // __ksymtab_strings is the one place where the compiler
                // emits FUNC/OBJECT symbols at nonzero offsets, for kernel
                // exported symbols; those never become entity symbols.
                if (kind == elf::STT_FUNC || kind == elf::STT_OBJECT)
                    && self[id].name != "__ksymtab_strings"
                {
                    if sym.st_value != 0 {
                        bail!(
                            "symbol {} at offset {} within section {}, expected 0",
                            name,
                            sym.st_value,
                            self[id].name
                        );
                    }
                    match &mut self.sections[id.0].shape {
                        Shape::Content { sym: entity, .. } => *entity = Some(SymId(i)),
                        Shape::Rela { .. } => {
                            bail!("symbol {name} is defined in a relocation section")
                        }
                    }
                } else if kind == elf::STT_SECTION {
                    if let Shape::Content { secsym, .. } = &mut self.sections[id.0].shape {
                        *secsym = Some(SymId(i));
                    }
                    // Use the section name as the symbol name.
                    name = self[id].name.clone();
                }
            }
            debug!("sym {:02}, type {}, bind {}, ndx {:02}, name {}", i, kind, bind, sym.st_shndx, name);
            self.symbols.push(Symbol {
                sym,
                name,
                index: i,
                bind,
                kind,
                sec,
                status: Status::New,
                include: false,
                twin: None,
                cross: None,
            });
        }
        Ok(())
    }

    fn load_relas(&mut self) -> Result<()> {
        let endian = self.endian;
        for i in 0..self.sections.len() {
            if !self.sections[i].is_rela() {
                continue;
            }
            let (entsize, data, name) = {
                let sec = &self.sections[i];
                (sec.sh.sh_entsize, sec.data.clone(), sec.name.clone())
            };
            if usize::try_from(entsize)? != mem::size_of::<elf::Rela64<Endianness>>() {
                bail!("unexpected relocation entry size {entsize} in {name}");
            }
            let count = data.len() / entsize as usize;
            let (raws, _) = pod::slice_from_bytes::<elf::Rela64<Endianness>>(&data, count)
                .map_err(|()| anyhow!("relocation table {name} truncated or misaligned"))?;

            debug!("=== rela table for {} ({} entries) ===", name, count);
            let mut relas = Vec::with_capacity(count);
            for raw in raws {
                let info = raw.r_info.get(endian);
                let rtype = (info & 0xffff_ffff) as u32;
                let symndx = (info >> 32) as usize;
                let sym = self
                    .symbol_by_index(symndx)
                    .with_context(|| format!("could not find symbol {symndx} for relocation in {name}"))?;
                let offset = raw.r_offset.get(endian);
                let addend = raw.r_addend.get(endian);
                let string = self.rela_string(sym, addend)?;
                debug!(
                    "offset {}, type {}, {} {} {}",
                    offset,
                    rtype,
                    self[sym].name,
                    if addend < 0 { '-' } else { '+' },
                    addend.unsigned_abs()
                );
                relas.push(Rela {
                    rtype,
                    offset,
                    addend,
                    sym,
                    string,
                    status: Status::New,
                    twin: None,
                });
            }
            if let Shape::Rela { relas: slot, .. } = &mut self.sections[i].shape {
                *slot = relas;
            }
        }
        Ok(())
    }

    /// String literal behind a relocation whose target lives in a
    /// string-flagged section.
    fn rela_string(&self, sym: SymId, addend: i64) -> Result<Option<String>> {
        let Some(sec) = self[sym].sec else {
            return Ok(None);
        };
        if self[sec].sh.sh_flags & u64::from(elf::SHF_STRINGS) == 0 {
            return Ok(None);
        }
        let offset = usize::try_from(addend)
            .ok()
            .context("could not look up rela string")?;
        let s = read_cstr(&self[sec].data, offset).context("could not look up rela string")?;
        Ok(Some(s.to_string()))
    }

    pub fn section_by_name(&self, name: &str) -> Option<SecId> {
        self.sections.iter().position(|s| s.name == name).map(SecId)
    }

    /// Look a section up by its one-based ELF index.
    pub fn section_by_index(&self, index: usize) -> Option<SecId> {
        self.sections.iter().position(|s| s.index == index).map(SecId)
    }

    pub fn symbol_by_index(&self, index: usize) -> Option<SymId> {
        (index < self.symbols.len()).then_some(SymId(index))
    }
}

/// File bytes backing a section; empty for no-bits sections.
fn section_file_data<'a>(
    file: &'a [u8],
    sh: &elf::SectionHeader64<Endianness>,
    endian: Endianness,
) -> Result<&'a [u8]> {
    if sh.sh_type.get(endian) == elf::SHT_NOBITS {
        return Ok(&[]);
    }
    let off = usize::try_from(sh.sh_offset.get(endian))?;
    let size = usize::try_from(sh.sh_size.get(endian))?;
    let end = off.checked_add(size).context("section data out of range")?;
    file.get(off..end).context("section data out of range")
}

/// NUL-terminated string at `offset` in a string table.
fn read_cstr(data: &[u8], offset: usize) -> Result<&str> {
    let bytes = data.get(offset..).context("string table offset out of range")?;
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .context("unterminated string table entry")?;
    std::str::from_utf8(&bytes[..end]).context("string table entry is not UTF-8")
}

fn rela_base_name(name: &str) -> Option<&str> {
    name.strip_prefix(".rela")
}

/// Debug-level dump of a whole graph, statuses included.
pub fn dump_graph(obj: &ElfObject) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    // Shape handles of a copied graph still index the source graph, so
    // every lookup here is defensive.
    let sym_name = |id: SymId| obj.symbols.get(id.0).map_or("?", |s| s.name.as_str());
    let sec_name = |id: SecId| obj.sections.get(id.0).map_or("?", |s| s.name.as_str());
    debug!("=== sections ===");
    for sec in &obj.sections {
        match &sec.shape {
            Shape::Rela { base, relas } => {
                debug!("{:02} {} ({}), base-> {}", sec.index, sec.name, sec.status, sec_name(*base));
                for r in relas {
                    debug!(
                        "  sym {}, offset {}, type {}, {} {} {} ({})",
                        r.sym.0,
                        r.offset,
                        r.rtype,
                        sym_name(r.sym),
                        if r.addend < 0 { '-' } else { '+' },
                        r.addend.unsigned_abs(),
                        r.status
                    );
                }
            }
            Shape::Content { rela, sym, secsym } => {
                let mut refs = String::new();
                if let Some(s) = sym {
                    refs.push_str(&format!(", sym-> {}", sym_name(*s)));
                }
                if let Some(s) = secsym {
                    refs.push_str(&format!(", secsym-> {}", sym_name(*s)));
                }
                if let Some(r) = rela {
                    refs.push_str(&format!(", rela-> {}", sec_name(*r)));
                }
                debug!("{:02} {} ({}){}", sec.index, sec.name, sec.status, refs);
            }
        }
    }
    debug!("=== symbols ===");
    for sym in obj.symbols.iter().skip(1) {
        let sec = sym.sec.map_or("", sec_name);
        debug!(
            "sym {:02}, type {}, bind {}, ndx {:02}, name {} ({}) {}",
            sym.index, sym.kind, sym.bind, sym.sym.st_shndx, sym.name, sym.status, sec
        );
    }
}
