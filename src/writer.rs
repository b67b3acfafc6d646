//! Output-buffer allocation and serialization (§4.7), grounded in
//! `outputehdr.go` / `outputshdr.go` / `outputphdr.go` / `inputsection.go`'s
//! `WriteTo`/`CopyContents`.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;

use log::info;
use scroll::Pwrite;

use crate::chunk::ChunkKind;
use crate::context::Context;
use crate::elf;
use crate::error::Result;

/// Allocate `ctx.buf`, copy every chunk's raw bytes in, apply relocations,
/// then persist to `ctx.args.output` with mode `0755` (§4.7).
pub fn write(ctx: &mut Context) -> Result<()> {
    let size = ctx
        .chunks
        .iter()
        .map(|c| {
            let file_size = if c.shdr.sh_type == elf::SHT_NOBITS { 0 } else { c.shdr.sh_size };
            c.shdr.sh_offset + file_size
        })
        .max()
        .unwrap_or(0);
    ctx.buf = vec![0u8; size as usize];

    for i in 0..ctx.chunks.len() {
        crate::chunk::copy_buf(i, ctx);
    }

    info!("applying relocations");
    crate::relocation::apply_all(ctx)?;

    persist(ctx)
}

fn persist(ctx: &Context) -> Result<()> {
    let mut file = std::fs::File::create(&ctx.args.output)?;
    file.write_all(&ctx.buf)?;
    let mut perms = file.metadata()?.permissions();
    perms.set_mode(0o755);
    file.set_permissions(perms)?;
    Ok(())
}

pub fn write_ehdr(ctx: &mut Context) {
    let phdr_chunk = ctx.chunks.iter().find(|c| c.kind == ChunkKind::Phdr).expect("Phdr chunk always present");
    let phoff = phdr_chunk.shdr.sh_offset;
    let shdr_chunk = ctx.chunks.iter().find(|c| c.kind == ChunkKind::Shdr).expect("Shdr chunk always present");
    let shoff = shdr_chunk.shdr.sh_offset;
    let phnum = (phdr_chunk.shdr.sh_size / elf::SIZEOF_PHDR as u64) as u16;
    let shnum = (shdr_chunk.shdr.sh_size / elf::SIZEOF_SHDR as u64) as u16;

    let entry = entry_address(ctx);
    let flags = object_flags(ctx);

    let mut e_ident = [0u8; elf::SIZEOF_IDENT];
    e_ident[0..4].copy_from_slice(elf::MAGIC);
    e_ident[elf::EI_CLASS] = elf::ELFCLASS64;
    e_ident[elf::EI_DATA] = elf::ELFDATA2LSB;
    e_ident[elf::EI_VERSION] = elf::EV_CURRENT;

    let ehdr = elf::Ehdr {
        e_ident,
        e_type: elf::ET_EXEC,
        e_machine: elf::EM_RISCV,
        e_version: elf::EV_CURRENT as u32,
        e_entry: entry,
        e_phoff: phoff,
        e_shoff: shoff,
        e_flags: flags,
        e_ehsize: elf::SIZEOF_EHDR as u16,
        e_phentsize: elf::SIZEOF_PHDR as u16,
        e_phnum: phnum,
        e_shentsize: elf::SIZEOF_SHDR as u16,
        e_shnum: shnum,
        e_shstrndx: 0,
    };
    ctx.buf.pwrite_with(ehdr, 0, scroll::LE).expect("ehdr fits in an allocated buffer");
}

fn entry_address(ctx: &Context) -> u64 {
    ctx.output_sections
        .sections
        .iter()
        .find(|s| s.name == ".text")
        .map(|s| s.shdr.sh_addr)
        .unwrap_or(0)
}

/// `GetFlags`: the first live object's `e_flags`, with `EF_RISCV_RVC` pulled
/// in from any other live object that sets it.
fn object_flags(ctx: &Context) -> u32 {
    let Some(first) = ctx.objects.iter().find(|o| o.is_alive) else {
        return 0;
    };
    let mut flags = first.ehdr().e_flags;
    for obj in ctx.objects.iter().filter(|o| o.is_alive) {
        if obj.ehdr().e_flags & elf::EF_RISCV_RVC != 0 {
            flags |= elf::EF_RISCV_RVC;
        }
    }
    flags
}

pub fn write_phdr(ctx: &mut Context) {
    let phdr_chunk = ctx.chunks.iter().find(|c| c.kind == ChunkKind::Phdr).expect("Phdr chunk always present");
    let mut offset = phdr_chunk.shdr.sh_offset as usize;
    let phdrs = ctx.phdrs.clone();
    for phdr in phdrs {
        ctx.buf.pwrite_with(phdr, offset, scroll::LE).expect("phdr fits in an allocated buffer");
        offset += elf::SIZEOF_PHDR;
    }
}

pub fn write_shdr(ctx: &mut Context) {
    let shdr_chunk = ctx.chunks.iter().find(|c| c.kind == ChunkKind::Shdr).expect("Shdr chunk always present");
    let base = shdr_chunk.shdr.sh_offset as usize;
    ctx.buf
        .pwrite_with(elf::Shdr::default(), base, scroll::LE)
        .expect("null section header fits in an allocated buffer");

    let entries: Vec<(usize, elf::Shdr)> = ctx
        .chunks
        .iter()
        .filter(|c| c.shndx > 0)
        .map(|c| (c.shndx, c.shdr))
        .collect();
    for (shndx, shdr) in entries {
        let offset = base + shndx * elf::SIZEOF_SHDR;
        ctx.buf.pwrite_with(shdr, offset, scroll::LE).expect("shdr entry fits in an allocated buffer");
    }
}

/// Copy every live member's raw bytes into this output section's slot.
/// `SHT_NOBITS` sections occupy address space but contribute no file bytes.
/// Relocations are applied afterward, once every chunk's raw content has
/// been copied (§4.6).
pub fn write_output_section(ctx: &mut Context, index: usize, id: crate::output_section::OutputSectionId) {
    if ctx.chunks[index].shdr.sh_type == elf::SHT_NOBITS {
        return;
    }
    let base = ctx.chunks[index].shdr.sh_offset as usize;
    let members = ctx.output_sections.get(id).members.clone();
    for (obj_id, shndx) in members {
        let Some(section) = ctx.objects[obj_id].sections[shndx].as_ref() else {
            continue;
        };
        if !section.is_alive {
            continue;
        }
        let offset = section.offset as usize;
        let contents = ctx.objects[obj_id].section_contents(shndx).to_vec();
        ctx.buf[base + offset..base + offset + contents.len()].copy_from_slice(&contents);
    }
}

pub fn write_merged_section(ctx: &mut Context, index: usize, id: crate::mergeable::MergedSectionId) {
    if ctx.chunks[index].shdr.sh_type == elf::SHT_NOBITS {
        return;
    }
    let base = ctx.chunks[index].shdr.sh_offset as usize;
    let fragment_ids: Vec<usize> = (0..ctx.merged_sections[id].fragments.len()).collect();
    for frag_id in fragment_ids {
        let frag = ctx.merged_sections[id].fragments[frag_id].clone();
        if !frag.is_alive {
            continue;
        }
        let bytes = ctx.merged_sections[id].fragment_bytes(frag_id).to_vec();
        let offset = frag.offset as usize;
        ctx.buf[base + offset..base + offset + bytes.len()].copy_from_slice(&bytes);
    }
}
