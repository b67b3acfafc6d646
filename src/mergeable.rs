//! Mergeable-section splitting and deduplication (§4.4).
//!
//! Grounded in `mergeablesection.go` / `sectionfragment.go`: a
//! [`MergedSection`] is the global, per-`(name, type, flags)` dedup pool; a
//! [`MergeableSection`] is the per-input-section record of which byte
//! ranges of the *original* section map to which fragment, used afterwards
//! to rebind symbols that pointed into the section.

use std::collections::HashMap;

use crate::elf;

pub type MergedSectionId = usize;
pub type FragmentId = usize;

#[derive(Debug, Clone)]
pub struct SectionFragment {
    pub parent: MergedSectionId,
    /// Assigned during layout; `u32::MAX` until then.
    pub offset: u32,
    pub p2align: u8,
    pub is_alive: bool,
    pub size: u32,
}

impl SectionFragment {
    pub fn addr(&self, ctx_merged_addr: u64) -> u64 {
        ctx_merged_addr + self.offset as u64
    }
}

/// The dedup pool for one `(canonical_name, type, flags)` triple.
#[derive(Debug)]
pub struct MergedSection {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub shdr: elf::Shdr,
    pub fragments: Vec<SectionFragment>,
    /// Parallel to `fragments`: each fragment's deduplicated byte content,
    /// kept so the writer can copy it without re-deriving it from `by_bytes`.
    data: Vec<Vec<u8>>,
    by_bytes: HashMap<Vec<u8>, FragmentId>,
    pub max_p2align: u8,
}

impl MergedSection {
    pub fn new(name: String, sh_type: u32, sh_flags: u64) -> MergedSection {
        MergedSection {
            name,
            sh_type,
            sh_flags,
            shdr: elf::Shdr {
                sh_type,
                sh_flags,
                sh_addralign: 1,
                ..Default::default()
            },
            fragments: Vec::new(),
            data: Vec::new(),
            by_bytes: HashMap::new(),
            max_p2align: 0,
        }
    }

    pub fn fragment_bytes(&self, id: FragmentId) -> &[u8] {
        &self.data[id]
    }

    /// Insert `bytes` at alignment `p2align`, returning the (possibly
    /// pre-existing) fragment id. Raises the fragment's recorded alignment
    /// to the max of what's been seen for that exact byte sequence.
    /// `self_id` is this section's own id in `Context::merged_sections`,
    /// stamped onto freshly created fragments.
    pub fn insert(&mut self, self_id: MergedSectionId, bytes: &[u8], p2align: u8) -> FragmentId {
        if let Some(&id) = self.by_bytes.get(bytes) {
            let frag = &mut self.fragments[id];
            if p2align > frag.p2align {
                frag.p2align = p2align;
            }
            self.max_p2align = self.max_p2align.max(p2align);
            return id;
        }
        let id = self.fragments.len();
        self.fragments.push(SectionFragment {
            parent: self_id,
            offset: u32::MAX,
            p2align,
            is_alive: true,
            size: bytes.len() as u32,
        });
        self.data.push(bytes.to_vec());
        self.by_bytes.insert(bytes.to_vec(), id);
        self.max_p2align = self.max_p2align.max(p2align);
        id
    }
}

/// One input section's worth of split fragments, before the fragments have
/// been deduplicated into the global [`MergedSection`] pool. Kept on the
/// owning `ObjectFile` keyed by the original section's shndx so that
/// `register_section_pieces` can later rebind symbols whose `value` fell
/// inside the section.
#[derive(Debug)]
pub struct MergeableSection {
    pub parent: MergedSectionId,
    pub p2align: u8,
    /// Start offset (within the original section) of each fragment, in
    /// increasing order - binary-searched by [`MergeableSection::fragment_at`].
    pub frag_offsets: Vec<u32>,
    /// Parallel to `frag_offsets`: the global fragment id each piece was
    /// deduplicated into.
    pub fragments: Vec<FragmentId>,
}

impl MergeableSection {
    /// Locate the fragment enclosing a byte `offset` into the original
    /// section, mirroring `MergeableSection.GetFragment`'s binary search
    /// over fragment start offsets.
    pub fn fragment_at(&self, offset: u32) -> Option<(FragmentId, u32)> {
        let pos = self.frag_offsets.partition_point(|&start| start <= offset);
        if pos == 0 {
            return None;
        }
        let start = self.frag_offsets[pos - 1];
        Some((self.fragments[pos - 1], offset - start))
    }
}

/// Split `contents` (the entire, unrelocated original-section bytes) into
/// `(fragment bytes, start offset)` pairs per §4.2's
/// `InitializeMergeableSections` rule.
pub fn split_fragments<'a>(
    name: &str,
    shndx: usize,
    contents: &'a [u8],
    sh_flags: u64,
    entsize: u64,
) -> crate::error::Result<Vec<(&'a [u8], u32)>> {
    use crate::error::Error;

    let mut out = Vec::new();
    if sh_flags & elf::SHF_STRINGS != 0 {
        let entsize = entsize.max(1) as usize;
        let mut pos = 0usize;
        while pos < contents.len() {
            let rest = &contents[pos..];
            let mut end = None;
            let mut i = 0;
            while i + entsize <= rest.len() {
                if rest[i..i + entsize].iter().all(|&b| b == 0) {
                    end = Some(i);
                    break;
                }
                i += entsize;
            }
            let Some(end) = end else {
                return Err(Error::UnterminatedMergeString {
                    name: name.to_string(),
                    shndx,
                });
            };
            out.push((&rest[..end + entsize], pos as u32));
            pos += end + entsize;
        }
    } else {
        let entsize = entsize as usize;
        if entsize == 0 || contents.len() % entsize != 0 {
            return Err(Error::MergeSizeNotMultiple {
                name: name.to_string(),
                shndx,
                entsize: entsize as u64,
            });
        }
        let mut pos = 0usize;
        while pos < contents.len() {
            out.push((&contents[pos..pos + entsize], pos as u32));
            pos += entsize;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_null_terminated_strings() {
        let data = b"hi\0world\0hi\0";
        let pieces = split_fragments("t", 0, data, elf::SHF_MERGE | elf::SHF_STRINGS, 1).unwrap();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].0, b"hi\0");
        assert_eq!(pieces[1].0, b"world\0");
        assert_eq!(pieces[2].0, b"hi\0");
    }

    #[test]
    fn dedups_identical_strings_into_one_fragment() {
        let mut merged = MergedSection::new(".rodata".into(), elf::SHT_PROGBITS, elf::SHF_ALLOC);
        let a = merged.insert(0, b"hi\0", 0);
        let b = merged.insert(0, b"world\0", 0);
        let c = merged.insert(0, b"hi\0", 0);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(merged.fragments.len(), 2);
    }

    #[test]
    fn fixed_size_records_reject_misaligned_size() {
        let err = split_fragments("t", 0, &[1, 2, 3], elf::SHF_MERGE, 4).unwrap_err();
        matches!(err, crate::error::Error::MergeSizeNotMultiple { .. });
    }
}
