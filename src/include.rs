//! Inclusion closure rooted at the changed functions.
//!
//! Starting from every function whose body or relocations changed (and
//! every function with no counterpart in the base), a depth-first walk
//! marks the sections, symbols and relocation sections the output object
//! must carry. Each node is marked at most once, so the walk terminates.

use object::elf;
use tracing::{debug, info};

use crate::elf::{ElfObject, Status, SymId};

/// Report every changed function. Returns false when the two objects are
/// equivalent.
pub fn report_changed_functions(obj: &ElfObject) -> bool {
    let mut changed = false;
    for sym in obj.symbols.iter().skip(1) {
        if sym.kind != elf::STT_FUNC {
            continue;
        }
        match sym.status {
            Status::Changed => {
                changed = true;
                info!("function {} has changed", sym.name);
            }
            Status::New => {
                changed = true;
                info!("new function: {}", sym.name);
            }
            Status::Same => {}
        }
    }
    if !changed {
        info!("no changes found");
    }
    changed
}

/// Mark the transitive closure needed by every changed or new function.
/// FILE symbols ride along unconditionally; they are cheap and keep the
/// source provenance visible in the patch object.
pub fn include_changed_functions(obj: &mut ElfObject) {
    debug!("=== inclusion tree ===");
    for i in 1..obj.symbols.len() {
        let sym = &obj.symbols[i];
        if sym.kind == elf::STT_FUNC && sym.status != Status::Same && !sym.include {
            debug!("changed function: {}", sym.name);
            include_symbol(obj, SymId(i), 0);
        }
        if obj.symbols[i].kind == elf::STT_FILE {
            obj.symbols[i].include = true;
        }
    }
}

fn include_symbol(obj: &mut ElfObject, id: SymId, depth: usize) {
    let pad = depth * 2;
    obj.symbols[id.0].include = true;
    debug!("{:pad$}symbol {} is included", "", obj.symbols[id.0].name);

    let (sec, kind, status) = {
        let sym = &obj.symbols[id.0];
        (sym.sec, sym.kind, sym.status)
    };
    // A symbol with no section, or an unchanged non-SECTION symbol, is a
    // reference the final link resolves against the original image.
    let Some(sec) = sec else { return };
    if kind != elf::STT_SECTION && status == Status::Same {
        return;
    }

    obj.sections[sec.0].include = true;
    debug!("{:pad$}section {} is included", "", obj.sections[sec.0].name);

    let secsym = obj[sec].section_sym();
    if secsym == Some(id) {
        return;
    }
    if let Some(ss) = secsym {
        obj.symbols[ss.0].include = true;
        debug!("{:pad$}section symbol {} is included", "", obj.symbols[ss.0].name);
    }

    let Some(rela) = obj[sec].rela_sec() else { return };
    obj.sections[rela.0].include = true;
    debug!("{:pad$}section {} is included", "", obj.sections[rela.0].name);
    let targets: Vec<SymId> = obj[rela].relas().iter().map(|r| r.sym).collect();
    for target in targets {
        if !obj.symbols[target.0].include {
            include_symbol(obj, target, depth + 1);
        }
    }
}
