//! Fixed-layout little-endian ELF64 record decoding.
//!
//! Mirrors the teacher's per-class `elf/_64` modules (`header64.rs`,
//! `section_header64.rs`, `sym64.rs`, `rela64.rs`): plain `#[repr(C)]`
//! structs with `scroll`'s `Pread`/`Pwrite`/`SizeWith` derives, rather than
//! hand-rolled byte-by-byte reads. Only ELFCLASS64/ELFDATA2LSB/EM_RISCV is
//! ever produced or consumed, so unlike the teacher there is no 32/64 split.

use scroll::{Pread, Pwrite, SizeWith};

pub mod constants;
pub use constants::*;

pub const SIZEOF_IDENT: usize = 16;
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;
pub const EI_OSABI: usize = 7;
pub const EI_ABIVERSION: usize = 8;

pub const MAGIC: &[u8; 4] = b"\x7fELF";

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Pread, Pwrite, SizeWith)]
pub struct Ehdr {
    pub e_ident: [u8; SIZEOF_IDENT],
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

pub const SIZEOF_EHDR: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Pread, Pwrite, SizeWith)]
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

pub const SIZEOF_SHDR: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Pread, Pwrite, SizeWith)]
pub struct Sym {
    /// Symbol name (string table index).
    pub st_name: u32,
    /// Type and binding.
    pub st_info: u8,
    /// Visibility.
    pub st_other: u8,
    /// Section index, or `SHN_XINDEX` if the real index lives in the
    /// `SHT_SYMTAB_SHNDX` companion table.
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

pub const SIZEOF_SYM: usize = 24;

impl Sym {
    pub fn bind(&self) -> u8 {
        self.st_info >> 4
    }

    pub fn is_undef(&self) -> bool {
        self.st_shndx == SHN_UNDEF
    }

    pub fn is_abs(&self) -> bool {
        self.st_shndx == SHN_ABS
    }

    pub fn is_common(&self) -> bool {
        self.st_shndx == SHN_COMMON
    }
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Pread, Pwrite, SizeWith)]
pub struct Rela {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

pub const SIZEOF_RELA: usize = 24;

impl Rela {
    #[inline]
    pub fn sym(&self) -> u32 {
        (self.r_info >> 32) as u32
    }

    #[inline]
    pub fn kind(&self) -> u32 {
        (self.r_info & 0xffff_ffff) as u32
    }
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Pread, Pwrite, SizeWith)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

pub const SIZEOF_PHDR: usize = 56;

pub fn check_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[0..4] == MAGIC
}
