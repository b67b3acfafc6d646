//! An `InputSection` is a kept section header from one object file, bound
//! to the `OutputSection` it will be merged into (§3, grounded in
//! `inputsection.go`).

use std::cell::OnceCell;

use crate::elf;
use crate::error::Result;
use crate::object::{ObjectFile, ObjectId};
use crate::output_section::OutputSectionId;

#[derive(Debug)]
pub struct InputSection {
    pub obj: ObjectId,
    pub shndx: usize,
    pub sh_size: u32,
    pub p2align: u8,
    pub output_section: OutputSectionId,
    pub is_alive: bool,
    /// Final byte offset within `output_section`, assigned during layout.
    pub offset: u32,
    pub relsec_idx: Option<usize>,
    rels: OnceCell<Vec<elf::Rela>>,
}

impl InputSection {
    pub fn new(shndx: usize, obj: ObjectId, output_section: OutputSectionId, shdr: &elf::Shdr) -> Result<InputSection> {
        if shdr.sh_flags & elf::SHF_COMPRESSED != 0 {
            return Err(crate::error::Error::UnsupportedFeature {
                name: format!("section {shndx}"),
                feature: "SHF_COMPRESSED",
            });
        }
        let p2align = if shdr.sh_addralign == 0 {
            0
        } else {
            shdr.sh_addralign.trailing_zeros() as u8
        };
        Ok(InputSection {
            obj,
            shndx,
            sh_size: shdr.sh_size as u32,
            p2align,
            output_section,
            is_alive: true,
            offset: u32::MAX,
            relsec_idx: None,
            rels: OnceCell::new(),
        })
    }

    pub fn name<'a>(&self, obj: &'a ObjectFile) -> &'a str {
        obj.section_name(self.shndx)
    }

    pub fn contents<'a>(&self, obj: &'a ObjectFile) -> &'a [u8] {
        obj.section_contents(self.shndx)
    }

    pub fn shdr<'a>(&self, obj: &'a ObjectFile) -> &'a elf::Shdr {
        obj.input_file.section_header(self.shndx)
    }

    /// Address this section lands at in the output image (valid only after
    /// layout has run).
    pub fn addr(&self, output_sections: &crate::output_section::OutputSectionTable) -> u64 {
        output_sections.get(self.output_section).shdr.sh_addr + self.offset as u64
    }

    /// Lazily parse and cache this section's `Rela` vector.
    pub fn rels<'a>(&'a self, obj: &ObjectFile) -> &'a [elf::Rela] {
        self.rels
            .get_or_init(|| match self.relsec_idx {
                None => Vec::new(),
                Some(relsec_idx) => {
                    let bytes = obj.section_contents(relsec_idx);
                    read_rela_vec(bytes)
                }
            })
            .as_slice()
    }
}

fn read_rela_vec(bytes: &[u8]) -> Vec<elf::Rela> {
    use scroll::Pread;
    let count = bytes.len() / elf::SIZEOF_RELA;
    let mut out = Vec::with_capacity(count);
    let mut offset = 0usize;
    for _ in 0..count {
        if let Ok(rela) = bytes.gread::<elf::Rela>(&mut offset) {
            out.push(rela);
        }
    }
    out
}
