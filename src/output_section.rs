//! Output sections: one per `(name, type, flags)` triple, collecting the
//! input sections merged into it (§3, §4.5 ordering).

use std::collections::HashMap;

use crate::elf;
use crate::object::ObjectId;

pub type OutputSectionId = usize;

/// `(ObjectId, shndx)` - a stable, non-owning reference to an `InputSection`
/// stored inside its owning `ObjectFile`.
pub type InputSectionRef = (ObjectId, usize);

#[derive(Debug)]
pub struct OutputSection {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub members: Vec<InputSectionRef>,
    pub shdr: elf::Shdr,
}

impl OutputSection {
    fn new(name: String, sh_type: u32, sh_flags: u64) -> OutputSection {
        OutputSection {
            name,
            sh_type,
            sh_flags,
            members: Vec::new(),
            shdr: elf::Shdr {
                sh_type,
                sh_flags,
                sh_addralign: 1,
                ..Default::default()
            },
        }
    }
}

/// Collapse common per-translation-unit section names to their canonical
/// output name, e.g. `.text.foo` -> `.text` (§3).
pub fn canonicalize_name(name: &str) -> &str {
    const PREFIXES: &[&str] = &[".text", ".data.rel.ro", ".data", ".rodata", ".bss.rel.ro", ".bss", ".tbss", ".tdata", ".init_array", ".fini_array"];
    for prefix in PREFIXES {
        if name == *prefix {
            return prefix;
        }
        if let Some(rest) = name.strip_prefix(prefix) {
            if rest.starts_with('.') {
                return prefix;
            }
        }
    }
    name
}

/// Lookup-or-create table keyed by `(canonical name, type, flags)`, as used
/// for both plain `OutputSection`s and `MergedSection`s (§4.4's key also
/// strips the merge-only flag bits).
#[derive(Debug, Default)]
pub struct OutputSectionTable {
    pub sections: Vec<OutputSection>,
    index: HashMap<(String, u32, u64), OutputSectionId>,
}

impl OutputSectionTable {
    pub fn new() -> OutputSectionTable {
        OutputSectionTable::default()
    }

    pub fn get_or_create(&mut self, name: &str, sh_type: u32, sh_flags: u64) -> OutputSectionId {
        let canonical = canonicalize_name(name).to_string();
        let key = (canonical.clone(), sh_type, sh_flags);
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.sections.len();
        self.sections.push(OutputSection::new(canonical, sh_type, sh_flags));
        self.index.insert(key, id);
        id
    }

    pub fn get(&self, id: OutputSectionId) -> &OutputSection {
        &self.sections[id]
    }

    pub fn get_mut(&mut self, id: OutputSectionId) -> &mut OutputSection {
        &mut self.sections[id]
    }
}

pub fn merged_section_flags(sh_flags: u64) -> u64 {
    sh_flags & !(elf::SHF_GROUP | elf::SHF_MERGE | elf::SHF_STRINGS | elf::SHF_COMPRESSED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_dotted_suffixes() {
        assert_eq!(canonicalize_name(".text.foo"), ".text");
        assert_eq!(canonicalize_name(".data.bar"), ".data");
        assert_eq!(canonicalize_name(".rodata.str1.1"), ".rodata");
        assert_eq!(canonicalize_name(".bss.x"), ".bss");
        assert_eq!(canonicalize_name(".comment"), ".comment");
    }

    #[test]
    fn get_or_create_dedupes_by_key() {
        let mut table = OutputSectionTable::new();
        let a = table.get_or_create(".text.main", elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        let b = table.get_or_create(".text.other", elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        assert_eq!(a, b);
        let c = table.get_or_create(".data", elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE);
        assert_ne!(a, c);
    }
}
