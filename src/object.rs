//! Input object construction (§4.2), grounded in `Inputfile.go` /
//! `objectfile.go`.

use scroll::Pread;

use crate::elf;
use crate::error::{Error, Result};
use crate::file::File;
use crate::input_section::InputSection;
use crate::mergeable::MergeableSection;
use crate::output_section::OutputSectionTable;
use crate::symbol::{Binding, SymbolTable};

pub type ObjectId = usize;

/// The ELF-level view of one file: header, section headers, raw symbol
/// table. Kept distinct from `ObjectFile` because it is pure decode, with
/// no knowledge of the linking pipeline (mirrors `InputFile`/`ObjectFile`).
pub struct InputFile {
    pub file: File,
    pub ehdr: elf::Ehdr,
    pub section_headers: Vec<elf::Shdr>,
    pub str_tab: Vec<u8>,
    pub sym_table: Vec<elf::Sym>,
    pub sym_str_tab: Vec<u8>,
}

impl InputFile {
    pub fn parse(file: File) -> Result<InputFile> {
        let contents = file.contents();
        if contents.len() < elf::SIZEOF_EHDR {
            return Err(Error::InputTooSmall {
                name: file.name.clone(),
                len: contents.len(),
                minimum: elf::SIZEOF_EHDR,
            });
        }
        if !elf::check_magic(contents) {
            return Err(Error::BadMagic {
                name: file.name.clone(),
            });
        }

        let ehdr: elf::Ehdr = contents.pread_with(0, scroll::LE)?;
        let class = ehdr.e_ident[elf::EI_CLASS];
        let data = ehdr.e_ident[elf::EI_DATA];
        if class != elf::ELFCLASS64 || data != elf::ELFDATA2LSB || ehdr.e_machine != elf::EM_RISCV {
            return Err(Error::UnsupportedAbi {
                name: file.name.clone(),
                class,
                data,
                machine: ehdr.e_machine,
            });
        }

        let shoff = ehdr.e_shoff as usize;
        section_slice_check(&file, shoff, elf::SIZEOF_SHDR)?;
        let first_shdr: elf::Shdr = contents.pread_with(shoff, scroll::LE)?;

        let mut shnum = ehdr.e_shnum as usize;
        if shnum == 0 {
            shnum = first_shdr.sh_size as usize;
        }

        let mut section_headers = Vec::with_capacity(shnum.max(1));
        section_headers.push(first_shdr);
        let mut pos = shoff + elf::SIZEOF_SHDR;
        for _ in 1..shnum {
            section_slice_check(&file, pos, elf::SIZEOF_SHDR)?;
            let shdr: elf::Shdr = contents.pread_with(pos, scroll::LE)?;
            section_headers.push(shdr);
            pos += elf::SIZEOF_SHDR;
        }

        let mut shstrndx = ehdr.e_shstrndx as usize;
        if ehdr.e_shstrndx == elf::SHN_XINDEX {
            shstrndx = first_shdr.sh_link as usize;
        }
        let str_tab = bytes_of_shdr(&file, &section_headers[shstrndx], shstrndx)?.to_vec();

        Ok(InputFile {
            file,
            ehdr,
            section_headers,
            str_tab,
            sym_table: Vec::new(),
            sym_str_tab: Vec::new(),
        })
    }

    pub fn find_section(&self, sh_type: u32) -> Option<usize> {
        self.section_headers.iter().position(|s| s.sh_type == sh_type)
    }

    pub fn section_header(&self, shndx: usize) -> &elf::Shdr {
        &self.section_headers[shndx]
    }

    pub fn bytes_of_index(&self, shndx: usize) -> Result<&[u8]> {
        bytes_of_shdr(&self.file, &self.section_headers[shndx], shndx)
    }

    pub fn name_from_strtab(strtab: &[u8], offset: u32) -> String {
        let offset = offset as usize;
        if offset >= strtab.len() {
            return String::new();
        }
        let end = strtab[offset..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| offset + p)
            .unwrap_or(strtab.len());
        String::from_utf8_lossy(&strtab[offset..end]).into_owned()
    }
}

fn section_slice_check(file: &File, offset: usize, size: usize) -> Result<()> {
    if offset + size > file.contents().len() {
        return Err(Error::SectionOutOfRange {
            name: file.name.clone(),
            shndx: 0,
            offset: offset as u64,
            size: size as u64,
            file_len: file.contents().len(),
        });
    }
    Ok(())
}

fn bytes_of_shdr<'a>(file: &'a File, shdr: &elf::Shdr, shndx: usize) -> Result<&'a [u8]> {
    let start = shdr.sh_offset as usize;
    let end = start + shdr.sh_size as usize;
    let contents = file.contents();
    if end > contents.len() {
        return Err(Error::SectionOutOfRange {
            name: file.name.clone(),
            shndx,
            offset: shdr.sh_offset,
            size: shdr.sh_size,
            file_len: contents.len(),
        });
    }
    Ok(&contents[start..end])
}

/// Per-raw-symbol-table-index binding: local symbols are owned by the
/// object, globals are interned process-wide.
#[derive(Debug, Clone, Copy)]
pub enum SymRef {
    Local(usize),
    Global(crate::symbol::SymbolId),
}

/// One relocatable object: the parsed `InputFile` plus everything
/// `ObjectFile::Parse` derives from it (§4.2).
pub struct ObjectFile {
    pub input_file: InputFile,
    pub symtab_shndx: Option<usize>,
    pub symtab_shndx_sec: Vec<u32>,
    /// Indexed by section-header index; `None` for dropped types
    /// (`NULL`/`GROUP`/`SYMTAB`/`STRTAB`/`REL`/`RELA`/`SYMTAB_SHNDX`).
    pub sections: Vec<Option<InputSection>>,
    pub local_symbols: Vec<crate::symbol::Symbol>,
    /// Parallel to the raw ELF symbol table; resolves each index to either
    /// a local symbol owned here or an interned global handle.
    pub symbols: Vec<SymRef>,
    pub first_global: usize,
    pub is_alive: bool,
    /// Mergeable-section records, keyed by the *original* section's shndx,
    /// produced by `InitializeMergeableSections` and consumed by
    /// `register_section_pieces`.
    pub mergeable: std::collections::HashMap<usize, MergeableSection>,
}

impl ObjectFile {
    pub fn name(&self) -> &str {
        &self.input_file.file.name
    }

    pub fn section_name(&self, shndx: usize) -> &str {
        let off = self.input_file.section_headers[shndx].sh_name;
        lazy_name(&self.input_file.str_tab, off)
    }

    /// Panics if called on a `SHT_NOBITS` section (`.bss`-like sections have
    /// no file-backed bytes to return). Every other kept section's range
    /// was validated against the file length in `InitializeSections`.
    pub fn section_contents(&self, shndx: usize) -> &[u8] {
        self.input_file
            .bytes_of_index(shndx)
            .expect("section range validated during InitializeSections")
    }

    /// Resolve a raw `Sym`'s section index, following `SHN_XINDEX` into the
    /// `SHT_SYMTAB_SHNDX` companion table (§4.2, testable property 3).
    pub fn resolve_shndx(&self, esym: &elf::Sym, idx: usize) -> usize {
        if esym.st_shndx == elf::SHN_XINDEX {
            self.symtab_shndx_sec[idx] as usize
        } else {
            esym.st_shndx as usize
        }
    }

    pub fn ehdr(&self) -> &elf::Ehdr {
        &self.input_file.ehdr
    }
}

/// `str::from_utf8_lossy` borrow-extension helper, so callers don't need to
/// thread a `Result` through trivial name lookups once the string table is
/// known to be in range (validated when the table was sliced out).
fn lazy_name(strtab: &[u8], offset: u32) -> &str {
    let offset = offset as usize;
    if offset >= strtab.len() {
        return "";
    }
    let end = strtab[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(strtab.len());
    std::str::from_utf8(&strtab[offset..end]).unwrap_or("")
}

/// Build an `ObjectFile` from a `File`, running `InitializeSections`,
/// `InitializeSymbols`, and `InitializeMergeableSections` in order (§4.2).
/// `id` is this object's final, stable slot in `Context::objects` — passed
/// in up front (the caller reserves the slot by computing
/// `ctx.objects.len()` before calling) so every `InputSection`/`Symbol`
/// back-reference is correct from construction, with no placeholder-patch
/// pass needed afterwards. `is_alive`: true for objects named directly on
/// the command line, false for archive members pending liveness
/// propagation (§4.3).
pub fn create_object_file(
    file: File,
    id: ObjectId,
    is_alive: bool,
    output_sections: &mut OutputSectionTable,
    symbol_table: &mut SymbolTable,
) -> Result<ObjectFile> {
    let input_file = InputFile::parse(file)?;
    let mut obj = ObjectFile {
        input_file,
        symtab_shndx: None,
        symtab_shndx_sec: Vec::new(),
        sections: Vec::new(),
        local_symbols: Vec::new(),
        symbols: Vec::new(),
        first_global: 0,
        is_alive,
        mergeable: std::collections::HashMap::new(),
    };

    if let Some(symtab_idx) = obj.input_file.find_section(elf::SHT_SYMTAB) {
        let shdr = obj.input_file.section_headers[symtab_idx];
        obj.first_global = shdr.sh_info as usize;
        let bytes = obj.input_file.bytes_of_index(symtab_idx)?;
        obj.input_file.sym_table = read_syms(bytes);
        obj.input_file.sym_str_tab = obj.input_file.bytes_of_index(shdr.sh_link as usize)?.to_vec();
    }

    initialize_sections(&mut obj, id, output_sections)?;
    initialize_symbols(&mut obj, id, symbol_table);
    initialize_mergeable_sections(&mut obj)?;

    Ok(obj)
}

fn read_syms(bytes: &[u8]) -> Vec<elf::Sym> {
    let count = bytes.len() / elf::SIZEOF_SYM;
    let mut out = Vec::with_capacity(count);
    let mut offset = 0usize;
    for _ in 0..count {
        if let Ok(sym) = bytes.gread::<elf::Sym>(&mut offset) {
            out.push(sym);
        }
    }
    out
}

fn initialize_sections(obj: &mut ObjectFile, id: ObjectId, output_sections: &mut OutputSectionTable) -> Result<()> {
    let n = obj.input_file.section_headers.len();
    obj.sections = (0..n).map(|_| None).collect();

    // Companion SHT_RELA -> target shndx back-references, recorded after
    // the target InputSection exists.
    let mut rela_targets: Vec<(usize, usize)> = Vec::new();

    for i in 0..n {
        let shdr = obj.input_file.section_headers[i];
        match shdr.sh_type {
            elf::SHT_GROUP | elf::SHT_SYMTAB | elf::SHT_STRTAB | elf::SHT_REL | elf::SHT_RELA | elf::SHT_NULL => {
                if shdr.sh_type == elf::SHT_RELA {
                    rela_targets.push((i, shdr.sh_info as usize));
                }
            }
            elf::SHT_SYMTAB_SHNDX => {
                obj.symtab_shndx = Some(i);
                let bytes = obj.input_file.bytes_of_index(i)?;
                obj.symtab_shndx_sec = read_u32_vec(bytes);
            }
            _ => {
                if shdr.sh_type != elf::SHT_NOBITS {
                    obj.input_file.bytes_of_index(i)?;
                }
                let name = lazy_name(&obj.input_file.str_tab, shdr.sh_name).to_string();
                let out_id = output_sections.get_or_create(&name, shdr.sh_type, shdr.sh_flags);
                let section = InputSection::new(i, id, out_id, &shdr)?;
                obj.sections[i] = Some(section);
                output_sections.get_mut(out_id).members.push((id, i));
            }
        }
    }

    for (rela_idx, target_idx) in rela_targets {
        if let Some(Some(target)) = obj.sections.get_mut(target_idx) {
            target.relsec_idx = Some(rela_idx);
        }
    }

    Ok(())
}

fn read_u32_vec(bytes: &[u8]) -> Vec<u32> {
    let count = bytes.len() / 4;
    let mut out = Vec::with_capacity(count);
    let mut offset = 0usize;
    for _ in 0..count {
        if let Ok(v) = bytes.gread_with::<u32>(&mut offset, scroll::LE) {
            out.push(v);
        }
    }
    out
}

fn initialize_symbols(obj: &mut ObjectFile, id: ObjectId, symbol_table: &mut SymbolTable) {
    if obj.input_file.sym_table.is_empty() {
        return;
    }

    obj.local_symbols = (0..obj.first_global)
        .map(|_| crate::symbol::Symbol::new(""))
        .collect();
    // Local 0 is the sentinel: `file` is set, nothing else.
    if !obj.local_symbols.is_empty() {
        obj.local_symbols[0].sym_idx = 0;
        obj.local_symbols[0].file = Some(id);
    }

    for i in 1..obj.first_global {
        let esym = obj.input_file.sym_table[i];
        let name = InputFile::name_from_strtab(&obj.input_file.sym_str_tab, esym.st_name);
        let sym = &mut obj.local_symbols[i];
        sym.name = name;
        sym.file = Some(id);
        sym.value = esym.st_value;
        sym.sym_idx = i as i64;
        sym.elf_bind = esym.bind();
        if esym.is_abs() || esym.is_common() {
            sym.binding = Binding::Absolute;
        } else if !esym.is_undef() {
            let shndx = obj.resolve_shndx(&esym, i);
            sym.binding = Binding::Section { obj: id, shndx };
        }
    }

    obj.symbols = (0..obj.input_file.sym_table.len())
        .map(|i| {
            if i < obj.first_global {
                SymRef::Local(i)
            } else {
                let esym = obj.input_file.sym_table[i];
                let name = InputFile::name_from_strtab(&obj.input_file.sym_str_tab, esym.st_name);
                SymRef::Global(symbol_table.intern(&name))
            }
        })
        .collect();
}

fn initialize_mergeable_sections(obj: &mut ObjectFile) -> Result<()> {
    let shndxs: Vec<usize> = obj
        .sections
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.as_ref().map(|_| i))
        .collect();

    for shndx in shndxs {
        let shdr = obj.input_file.section_headers[shndx];
        if shdr.sh_flags & elf::SHF_MERGE == 0 {
            continue;
        }
        let contents = obj.input_file.bytes_of_index(shndx)?;
        let pieces = crate::mergeable::split_fragments(obj.name(), shndx, contents, shdr.sh_flags, shdr.sh_entsize)?;

        let frag_offsets: Vec<u32> = pieces.iter().map(|(_, off)| *off).collect();
        // Fragment global ids are filled in later, once the section's
        // bytes have been interned into the process-wide MergedSection
        // pool (done by `register_section_pieces` in the context module,
        // which has access to that pool). We stash the byte ranges' start
        // offsets now and the (still-empty) fragment-id slots to be
        // populated in that same pass.
        let parent = obj.sections[shndx].as_ref().unwrap().output_section;
        obj.mergeable.insert(
            shndx,
            MergeableSection {
                parent,
                p2align: obj.sections[shndx].as_ref().unwrap().p2align,
                frag_offsets,
                fragments: Vec::new(),
            },
        );

        if let Some(section) = obj.sections[shndx].as_mut() {
            section.is_alive = false;
        }
    }

    Ok(())
}
