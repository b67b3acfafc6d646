//! Shared fixture builder for the end-to-end tests: assembles minimal,
//! valid RISC-V64 relocatable ELF objects in memory, the way a real
//! assembler would, without shelling out to one.

#![allow(dead_code)]

use std::io::Write as _;
use std::path::PathBuf;

use rvld::elf::*;
use scroll::{Pread, Pwrite};

pub enum SymSection {
    Undef,
    Abs,
    Common,
    Index(usize),
}

pub struct SymSpec {
    pub name: &'static str,
    pub bind: u8,
    pub section: SymSection,
    pub value: u64,
    pub size: u64,
    /// When set, the raw symbol's `st_shndx` is forced to `SHN_XINDEX` and
    /// this value is written to its slot in a companion `SHT_SYMTAB_SHNDX`
    /// table instead (`section` is ignored). Triggers `build_object` to
    /// emit that table.
    pub xindex: Option<u32>,
}

impl SymSpec {
    pub fn undef(name: &'static str) -> SymSpec {
        SymSpec { name, bind: STB_GLOBAL, section: SymSection::Undef, value: 0, size: 0, xindex: None }
    }

    pub fn defined(name: &'static str, bind: u8, section: usize, value: u64) -> SymSpec {
        SymSpec { name, bind, section: SymSection::Index(section), value, size: 0, xindex: None }
    }

    /// A symbol whose real section index is only recoverable via the
    /// `SHT_SYMTAB_SHNDX` companion table (property 3 / E4).
    pub fn xindexed(name: &'static str, bind: u8, real_shndx: u32, value: u64) -> SymSpec {
        SymSpec { name, bind, section: SymSection::Undef, value, size: 0, xindex: Some(real_shndx) }
    }
}

pub struct ContentSection {
    pub name: &'static str,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub data: Vec<u8>,
    pub nobits_size: u64,
    pub addralign: u64,
    pub entsize: u64,
}

impl ContentSection {
    pub fn progbits(name: &'static str, sh_flags: u64, data: Vec<u8>, addralign: u64) -> ContentSection {
        ContentSection { name, sh_type: SHT_PROGBITS, sh_flags, data, nobits_size: 0, addralign, entsize: 0 }
    }

    pub fn merge_strings(name: &'static str, data: Vec<u8>) -> ContentSection {
        ContentSection {
            name,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_MERGE | SHF_STRINGS,
            data,
            nobits_size: 0,
            addralign: 1,
            entsize: 1,
        }
    }

    pub fn nobits(name: &'static str, sh_flags: u64, size: u64, addralign: u64) -> ContentSection {
        ContentSection { name, sh_type: SHT_NOBITS, sh_flags, data: Vec::new(), nobits_size: size, addralign, entsize: 0 }
    }

    fn size(&self) -> u64 {
        if self.sh_type == SHT_NOBITS {
            self.nobits_size
        } else {
            self.data.len() as u64
        }
    }
}

pub struct RelocSpec {
    pub target_section: usize,
    pub offset: u64,
    /// 1-based index into the `symbols` slice passed to [`build_object`]
    /// (symtab index 0 is always the reserved null entry).
    pub sym_index: u32,
    pub kind: u32,
    pub addend: i64,
}

fn intern(buf: &mut Vec<u8>, s: &str) -> u32 {
    let off = buf.len() as u32;
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    off
}

fn align8(buf: &mut Vec<u8>) {
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
}

/// Assemble a minimal RISC-V64 relocatable ELF object: one `.symtab` (all of
/// `symbols`, in order, after the mandatory local sentinel), one `.strtab`,
/// one `.shstrtab`, and one `.rela.<name>` per content section carrying
/// relocations.
pub fn build_object(sections: &[ContentSection], symbols: &[SymSpec], relocs: &[RelocSpec], e_flags: u32) -> Vec<u8> {
    let n_content = sections.len();

    let mut relocs_by_target: Vec<Vec<&RelocSpec>> = (0..n_content).map(|_| Vec::new()).collect();
    for r in relocs {
        relocs_by_target[r.target_section].push(r);
    }
    let rela_targets: Vec<usize> = (0..n_content).filter(|&i| !relocs_by_target[i].is_empty()).collect();
    let n_rela = rela_targets.len();
    let has_shndx_table = symbols.iter().any(|s| s.xindex.is_some());

    let shndx_table_shndx = 1 + n_content + n_rela;
    let symtab_shndx = shndx_table_shndx + has_shndx_table as usize;
    let strtab_shndx = symtab_shndx + 1;
    let shstrtab_shndx = strtab_shndx + 1;
    let total_shnum = shstrtab_shndx + 1;

    let mut shstrtab = vec![0u8];
    let content_name_off: Vec<u32> = sections.iter().map(|s| intern(&mut shstrtab, s.name)).collect();
    let rela_name_off: Vec<u32> = rela_targets.iter().map(|&t| intern(&mut shstrtab, &format!(".rela{}", sections[t].name))).collect();
    let shndx_name_off = if has_shndx_table { intern(&mut shstrtab, ".symtab_shndx") } else { 0 };
    let symtab_name_off = intern(&mut shstrtab, ".symtab");
    let strtab_name_off = intern(&mut shstrtab, ".strtab");
    let shstrtab_name_off = intern(&mut shstrtab, ".shstrtab");

    let mut strtab = vec![0u8];
    let sym_name_off: Vec<u32> = symbols.iter().map(|s| if s.name.is_empty() { 0 } else { intern(&mut strtab, s.name) }).collect();

    let n_locals = symbols.iter().take_while(|s| s.bind == STB_LOCAL).count();
    let first_global = 1 + n_locals as u32;

    let mut file = vec![0u8; SIZEOF_EHDR];

    let mut section_offsets = vec![0u64; n_content];
    for (i, s) in sections.iter().enumerate() {
        if s.sh_type == SHT_NOBITS {
            section_offsets[i] = file.len() as u64;
            continue;
        }
        align8(&mut file);
        section_offsets[i] = file.len() as u64;
        file.extend_from_slice(&s.data);
    }

    let mut rela_offsets = vec![0u64; n_rela];
    let mut rela_sizes = vec![0u64; n_rela];
    for (ri, &t) in rela_targets.iter().enumerate() {
        align8(&mut file);
        rela_offsets[ri] = file.len() as u64;
        let entries = &relocs_by_target[t];
        let base = file.len();
        file.resize(base + entries.len() * SIZEOF_RELA, 0);
        for (i, r) in entries.iter().enumerate() {
            let info = ((r.sym_index as u64) << 32) | (r.kind as u64 & 0xffff_ffff);
            let rela = Rela { r_offset: r.offset, r_info: info, r_addend: r.addend };
            file.pwrite_with(rela, base + i * SIZEOF_RELA, scroll::LE).expect("rela fits");
        }
        rela_sizes[ri] = (entries.len() * SIZEOF_RELA) as u64;
    }

    let symtab_count = 1 + symbols.len();

    let mut shndx_table_offset = 0u64;
    let mut shndx_table_size = 0u64;
    if has_shndx_table {
        align8(&mut file);
        shndx_table_offset = file.len() as u64;
        let base = file.len();
        file.resize(base + symtab_count * 4, 0);
        for (i, s) in symbols.iter().enumerate() {
            let real = s.xindex.unwrap_or(0);
            file.pwrite_with(real, base + (1 + i) * 4, scroll::LE).expect("shndx entry fits");
        }
        shndx_table_size = (symtab_count * 4) as u64;
    }

    align8(&mut file);
    let symtab_offset = file.len() as u64;
    let symtab_base = file.len();
    file.resize(symtab_base + symtab_count * SIZEOF_SYM, 0);
    file.pwrite_with(Sym::default(), symtab_base, scroll::LE).expect("null sym fits");
    for (i, s) in symbols.iter().enumerate() {
        let st_shndx = if s.xindex.is_some() {
            SHN_XINDEX
        } else {
            match s.section {
                SymSection::Undef => SHN_UNDEF,
                SymSection::Abs => SHN_ABS,
                SymSection::Common => SHN_COMMON,
                SymSection::Index(idx) => (1 + idx) as u16,
            }
        };
        let sym = Sym {
            st_name: sym_name_off[i],
            st_info: s.bind << 4,
            st_other: 0,
            st_shndx,
            st_value: s.value,
            st_size: s.size,
        };
        file.pwrite_with(sym, symtab_base + (1 + i) * SIZEOF_SYM, scroll::LE).expect("sym fits");
    }
    let symtab_size = (symtab_count * SIZEOF_SYM) as u64;

    align8(&mut file);
    let strtab_offset = file.len() as u64;
    file.extend_from_slice(&strtab);
    let strtab_size = strtab.len() as u64;

    align8(&mut file);
    let shstrtab_offset = file.len() as u64;
    file.extend_from_slice(&shstrtab);
    let shstrtab_size = shstrtab.len() as u64;

    align8(&mut file);
    let shdr_table_offset = file.len();
    file.resize(shdr_table_offset + total_shnum * SIZEOF_SHDR, 0);

    let put_shdr = |file: &mut Vec<u8>, idx: usize, shdr: Shdr| {
        file.pwrite_with(shdr, shdr_table_offset + idx * SIZEOF_SHDR, scroll::LE).expect("shdr fits");
    };

    put_shdr(&mut file, 0, Shdr::default());

    for (i, s) in sections.iter().enumerate() {
        put_shdr(
            &mut file,
            1 + i,
            Shdr {
                sh_name: content_name_off[i],
                sh_type: s.sh_type,
                sh_flags: s.sh_flags,
                sh_addr: 0,
                sh_offset: section_offsets[i],
                sh_size: s.size(),
                sh_link: 0,
                sh_info: 0,
                sh_addralign: s.addralign.max(1),
                sh_entsize: s.entsize,
            },
        );
    }

    for (ri, &t) in rela_targets.iter().enumerate() {
        put_shdr(
            &mut file,
            1 + n_content + ri,
            Shdr {
                sh_name: rela_name_off[ri],
                sh_type: SHT_RELA,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: rela_offsets[ri],
                sh_size: rela_sizes[ri],
                sh_link: symtab_shndx as u32,
                sh_info: (1 + t) as u32,
                sh_addralign: 8,
                sh_entsize: SIZEOF_RELA as u64,
            },
        );
    }

    if has_shndx_table {
        put_shdr(
            &mut file,
            shndx_table_shndx,
            Shdr {
                sh_name: shndx_name_off,
                sh_type: SHT_SYMTAB_SHNDX,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: shndx_table_offset,
                sh_size: shndx_table_size,
                sh_link: symtab_shndx as u32,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 4,
            },
        );
    }

    put_shdr(
        &mut file,
        symtab_shndx,
        Shdr {
            sh_name: symtab_name_off,
            sh_type: SHT_SYMTAB,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: symtab_offset,
            sh_size: symtab_size,
            sh_link: strtab_shndx as u32,
            sh_info: first_global,
            sh_addralign: 8,
            sh_entsize: SIZEOF_SYM as u64,
        },
    );

    put_shdr(
        &mut file,
        strtab_shndx,
        Shdr {
            sh_name: strtab_name_off,
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: strtab_offset,
            sh_size: strtab_size,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        },
    );

    put_shdr(
        &mut file,
        shstrtab_shndx,
        Shdr {
            sh_name: shstrtab_name_off,
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: shstrtab_offset,
            sh_size: shstrtab_size,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        },
    );

    let e_shoff = shdr_table_offset as u64;

    let mut e_ident = [0u8; SIZEOF_IDENT];
    e_ident[0..4].copy_from_slice(MAGIC);
    e_ident[EI_CLASS] = ELFCLASS64;
    e_ident[EI_DATA] = ELFDATA2LSB;
    e_ident[EI_VERSION] = EV_CURRENT;

    let ehdr = Ehdr {
        e_ident,
        e_type: ET_REL,
        e_machine: EM_RISCV,
        e_version: EV_CURRENT as u32,
        e_entry: 0,
        e_phoff: 0,
        e_shoff,
        e_flags,
        e_ehsize: SIZEOF_EHDR as u16,
        e_phentsize: 0,
        e_phnum: 0,
        e_shentsize: SIZEOF_SHDR as u16,
        e_shnum: total_shnum as u16,
        e_shstrndx: shstrtab_shndx as u16,
    };
    file.pwrite_with(ehdr, 0, scroll::LE).expect("ehdr fits");

    file
}

/// Write `bytes` to a fresh temp file under a per-test subdirectory (so
/// parallel tests never collide on the same path), returning its path.
pub fn write_temp(subdir: &str, filename: &str, bytes: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join("rvld_test").join(subdir);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let path = dir.join(filename);
    let mut f = std::fs::File::create(&path).expect("create temp file");
    f.write_all(bytes).expect("write temp file");
    path
}

pub fn link(subdir: &str, inputs: Vec<PathBuf>) -> PathBuf {
    let output = std::env::temp_dir().join("rvld_test").join(subdir).join("a.out");
    let options = rvld::cli::LinkerOptions {
        inputs: inputs.into_iter().map(rvld::cli::InputSpec::Path).collect(),
        library_paths: Vec::new(),
        output: output.clone(),
        emulation: rvld::cli::Emulation::Elf64LRiscv,
    };
    rvld::context::link(options).expect("link succeeds");
    output
}

pub fn link_result(subdir: &str, inputs: Vec<PathBuf>) -> rvld::error::Result<PathBuf> {
    let output = std::env::temp_dir().join("rvld_test").join(subdir).join("a.out");
    let options = rvld::cli::LinkerOptions {
        inputs: inputs.into_iter().map(rvld::cli::InputSpec::Path).collect(),
        library_paths: Vec::new(),
        output: output.clone(),
        emulation: rvld::cli::Emulation::Elf64LRiscv,
    };
    rvld::context::link(options)?;
    Ok(output)
}

pub fn parse_ehdr(bytes: &[u8]) -> Ehdr {
    bytes.pread_with(0, scroll::LE).expect("output carries a valid Ehdr")
}

pub fn parse_phdrs(bytes: &[u8], ehdr: &Ehdr) -> Vec<ProgramHeader> {
    (0..ehdr.e_phnum as usize)
        .map(|i| {
            bytes
                .pread_with(ehdr.e_phoff as usize + i * SIZEOF_PHDR, scroll::LE)
                .expect("phdr entry in range")
        })
        .collect()
}

/// Read section header `shndx` out of the output's own table. The writer
/// never synthesizes `.shstrtab`, so section headers can only be found by
/// numeric index, not by name — callers work out the expected index from
/// the known chunk order (`Ehdr`, `Phdr`, then each live output/merged
/// section in layout order, then `Shdr`).
pub fn parse_shdr(bytes: &[u8], ehdr: &Ehdr, shndx: usize) -> Shdr {
    bytes
        .pread_with(ehdr.e_shoff as usize + shndx * SIZEOF_SHDR, scroll::LE)
        .expect("shdr entry in range")
}

fn pad_ar_header(name: &str, size: usize) -> Vec<u8> {
    let mut hdr = vec![b' '; 60];
    let name_bytes = name.as_bytes();
    hdr[..name_bytes.len()].copy_from_slice(name_bytes);
    let size_bytes = size.to_string();
    hdr[48..48 + size_bytes.len()].copy_from_slice(size_bytes.as_bytes());
    hdr[58] = 0x60;
    hdr[59] = 0x0a;
    hdr
}

/// Assemble a minimal System V `ar` archive (no long-name table - every
/// member name here fits in the 16-byte name field) from `(name, bytes)`
/// pairs, in the order given. Mirrors `archive::tests::build_archive`.
pub fn build_archive(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut out = b"!<arch>\n".to_vec();
    for (name, contents) in members {
        out.extend_from_slice(&pad_ar_header(&format!("{name}/"), contents.len()));
        out.extend_from_slice(contents);
        if contents.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

/// Decode a RISC-V `auipc`/`jalr` (or any U-type+I-type) pair at `words[0..8]`
/// back into the signed displacement the linker encoded, independent of the
/// `utype`/`itype` helpers under test.
pub fn decode_utype_itype_pair(word0: u32, word1: u32) -> i64 {
    let hi20 = (word0 & 0xffff_f000) as i32 as i64;
    let lo12 = (word1 >> 20) & 0xfff;
    let signed_lo12 = if lo12 & 0x800 != 0 { lo12 as i64 - 0x1000 } else { lo12 as i64 };
    hi20 + signed_lo12
}
