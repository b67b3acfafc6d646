//! Output chunks: the pieces the writer lays out, assigns an address and
//! file offset to, and finally serializes (§3, grounded in `chunk.go` /
//! `outputehdr.go` / `outputphdr.go` / `outputshdr.go`).
//!
//! The original models a chunk as an interface (`Chunker`) implemented by
//! four distinct types. Index-based `Context` ownership (§9) makes a closed
//! enum a better fit in Rust than a trait-object `Vec<Box<dyn Chunker>>`:
//! every variant's behavior is a short match in [`update_shdr`]/[`copy_buf`]
//! rather than a virtual call.

use crate::context::Context;
use crate::elf;
use crate::mergeable::MergedSectionId;
use crate::output_section::OutputSectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Ehdr,
    Phdr,
    Shdr,
    Output(OutputSectionId),
    Merged(MergedSectionId),
}

#[derive(Debug)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub shdr: elf::Shdr,
    /// Output `.shstrtab`-relative section index, or 0 for chunks that
    /// never get a section header entry (`Ehdr`, `Phdr`).
    pub shndx: usize,
}

impl Chunk {
    fn new(kind: ChunkKind) -> Chunk {
        Chunk {
            kind,
            shdr: elf::Shdr {
                sh_addralign: 1,
                ..Default::default()
            },
            shndx: 0,
        }
    }

    pub fn ehdr() -> Chunk {
        let mut c = Chunk::new(ChunkKind::Ehdr);
        c.shdr.sh_flags = elf::SHF_ALLOC;
        c.shdr.sh_size = elf::SIZEOF_EHDR as u64;
        c.shdr.sh_addralign = 8;
        c
    }

    pub fn phdr() -> Chunk {
        let mut c = Chunk::new(ChunkKind::Phdr);
        c.shdr.sh_flags = elf::SHF_ALLOC;
        c.shdr.sh_addralign = 8;
        c
    }

    pub fn shdr_chunk() -> Chunk {
        let mut c = Chunk::new(ChunkKind::Shdr);
        c.shdr.sh_addralign = 8;
        c
    }

    pub fn output(id: OutputSectionId, sh_type: u32, sh_flags: u64, sh_addralign: u64) -> Chunk {
        let mut c = Chunk::new(ChunkKind::Output(id));
        c.shdr.sh_type = sh_type;
        c.shdr.sh_flags = sh_flags;
        c.shdr.sh_addralign = sh_addralign.max(1);
        c
    }

    pub fn merged(id: MergedSectionId, sh_type: u32, sh_flags: u64, sh_addralign: u64) -> Chunk {
        let mut c = Chunk::new(ChunkKind::Merged(id));
        c.shdr.sh_type = sh_type;
        c.shdr.sh_flags = sh_flags;
        c.shdr.sh_addralign = sh_addralign.max(1);
        c
    }

    pub fn is_tls(&self) -> bool {
        self.shdr.sh_flags & elf::SHF_TLS != 0
    }

    pub fn is_bss(&self) -> bool {
        self.shdr.sh_type == elf::SHT_NOBITS && !self.is_tls()
    }

    pub fn is_note(&self) -> bool {
        self.shdr.sh_type == elf::SHT_NOTE && self.shdr.sh_flags & elf::SHF_ALLOC != 0
    }

    pub fn phdr_flags(&self) -> u32 {
        let mut flags = elf::PF_R;
        if self.shdr.sh_flags & elf::SHF_WRITE != 0 {
            flags |= elf::PF_W;
        }
        if self.shdr.sh_flags & elf::SHF_EXECINSTR != 0 {
            flags |= elf::PF_X;
        }
        flags
    }
}

/// Chunk names are derived, not stored, since an `Output`/`Merged` chunk's
/// name already lives on the section it wraps.
pub fn name(chunk: &Chunk, ctx: &Context) -> String {
    match chunk.kind {
        ChunkKind::Ehdr => String::new(),
        ChunkKind::Phdr => "phdr".to_string(),
        ChunkKind::Shdr => "shdr".to_string(),
        ChunkKind::Output(id) => ctx.output_sections.get(id).name.clone(),
        ChunkKind::Merged(id) => ctx.merged_sections[id].name.clone(),
    }
}

/// Per-kind `UpdateShdr`: fill in `sh_size` (and for `Shdr`, also roll up
/// every other chunk's final `shndx`) once layout has assigned addresses.
pub fn update_shdr(index: usize, ctx: &mut Context) {
    match ctx.chunks[index].kind {
        ChunkKind::Phdr => {
            let (phdrs, tp_addr) = crate::layout::create_phdr(ctx);
            ctx.chunks[index].shdr.sh_size = (phdrs.len() * elf::SIZEOF_PHDR) as u64;
            ctx.phdrs = phdrs;
            ctx.tp_addr = tp_addr;
        }
        ChunkKind::Shdr => {
            let max_shndx = ctx.chunks.iter().map(|c| c.shndx).max().unwrap_or(0);
            ctx.chunks[index].shdr.sh_size = ((max_shndx + 1) * elf::SIZEOF_SHDR) as u64;
        }
        ChunkKind::Output(id) => {
            let shdr = ctx.output_sections.get(id).shdr;
            ctx.chunks[index].shdr.sh_size = shdr.sh_size;
        }
        ChunkKind::Merged(id) => {
            let shdr = ctx.merged_sections[id].shdr;
            ctx.chunks[index].shdr.sh_size = shdr.sh_size;
        }
        ChunkKind::Ehdr => {}
    }
}

/// Serialize this chunk's bytes into `ctx.buf` at `sh_offset`.
pub fn copy_buf(index: usize, ctx: &mut Context) {
    match ctx.chunks[index].kind {
        ChunkKind::Ehdr => crate::writer::write_ehdr(ctx),
        ChunkKind::Phdr => crate::writer::write_phdr(ctx),
        ChunkKind::Shdr => crate::writer::write_shdr(ctx),
        ChunkKind::Output(id) => crate::writer::write_output_section(ctx, index, id),
        ChunkKind::Merged(id) => crate::writer::write_merged_section(ctx, index, id),
    }
}
