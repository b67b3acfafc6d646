//! Address/offset assignment and program-header synthesis (§4.5), grounded
//! in `outputphdr.go`'s `CreatePhdr` and the distilled spec's ordering rule.

use log::debug;

use crate::chunk::{Chunk, ChunkKind};
use crate::context::Context;
use crate::elf;

pub const IMAGE_BASE: u64 = 0x200000;
pub const PAGE_SIZE: u64 = 4096;

fn align_up(v: u64, align: u64) -> u64 {
    if align == 0 {
        v
    } else {
        (v + align - 1) & !(align - 1)
    }
}

/// Chunk ordering tier (§4.5): `.text`, `.rodata`, `.data`, TLS data, BSS,
/// TLS BSS, then every non-allocatable section last.
fn order_key(chunk: &Chunk) -> u8 {
    if chunk.shdr.sh_flags & elf::SHF_ALLOC == 0 {
        return 6;
    }
    if is_tbss(chunk) {
        return 5;
    }
    if chunk.is_bss() {
        return 4;
    }
    if chunk.is_tls() {
        return 3;
    }
    let writable = chunk.shdr.sh_flags & elf::SHF_WRITE != 0;
    let executable = chunk.shdr.sh_flags & elf::SHF_EXECINSTR != 0;
    if executable {
        0
    } else if writable {
        2
    } else {
        1
    }
}

/// Sort, then assign `shdr.addr`/`shdr.offset`/`shndx`, then synthesize the
/// program header table and write it back into the `Phdr`/`Shdr` chunks.
pub fn assign_addresses(ctx: &mut Context) {
    sort_chunks(ctx);
    assign_shndx(ctx);
    pack_members(ctx);

    // First pass: every content chunk's own `sh_size` is still the zero
    // default (`pack_members` wrote the real size onto the wrapped
    // `OutputSection`/`MergedSection`, not the chunk), so these addresses
    // and offsets are placeholders. Its only job is to let `update_shdr`
    // pull each chunk's real `sh_size` in (and, for `Phdr`/`Shdr`, settle
    // how many entries they'll hold) before a real layout pass runs.
    assign_addresses_and_offsets(ctx);
    for i in 0..ctx.chunks.len() {
        crate::chunk::update_shdr(i, ctx);
    }

    // Second pass: every chunk's `sh_size` is now final, so this is the
    // real layout.
    assign_addresses_and_offsets(ctx);

    // `update_shdr`'s `Phdr` arm built `ctx.phdrs`/`ctx.tp_addr` during the
    // loop above, against the placeholder pass's addresses - every
    // `p_vaddr`/`p_offset`/`p_filesz`/`p_memsz` in there is stale now that
    // the second pass has moved every chunk to its real address. Rebuild
    // the program header table once more against the final layout.
    let (phdrs, tp_addr) = create_phdr(ctx);
    let phdr_chunk = ctx.chunks.iter_mut().find(|c| c.kind == ChunkKind::Phdr).expect("Phdr chunk always present");
    phdr_chunk.shdr.sh_size = (phdrs.len() * elf::SIZEOF_PHDR) as u64;
    ctx.phdrs = phdrs;
    ctx.tp_addr = tp_addr;

    sync_section_addresses(ctx);
}

/// `assign_addresses_and_offsets` only writes `sh_addr`/`sh_offset` onto
/// each chunk's own `shdr`. The relocation engine and `entry_address`/
/// fragment-addressing both read those fields back off the wrapped
/// `OutputSection`/`MergedSection` instead (so that code never has to carry
/// a chunk index around), so the two final values need copying back.
fn sync_section_addresses(ctx: &mut Context) {
    for i in 0..ctx.chunks.len() {
        let (kind, sh_addr, sh_offset) = {
            let c = &ctx.chunks[i];
            (c.kind, c.shdr.sh_addr, c.shdr.sh_offset)
        };
        match kind {
            ChunkKind::Output(id) => {
                let sec = ctx.output_sections.get_mut(id);
                sec.shdr.sh_addr = sh_addr;
                sec.shdr.sh_offset = sh_offset;
            }
            ChunkKind::Merged(id) => {
                let sec = &mut ctx.merged_sections[id];
                sec.shdr.sh_addr = sh_addr;
                sec.shdr.sh_offset = sh_offset;
            }
            ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr => {}
        }
    }
}

/// Pack each output section's live members, and each merged section's
/// fragments, in append order (§4.5), writing `InputSection::offset` /
/// `SectionFragment::offset` and the owning section's final `sh_size` /
/// `sh_addralign`.
fn pack_members(ctx: &mut Context) {
    for out_id in 0..ctx.output_sections.sections.len() {
        let members = ctx.output_sections.get(out_id).members.clone();
        let mut offset = 0u64;
        let mut max_align = 1u64;
        for (obj_id, shndx) in members {
            let Some(section) = ctx.objects[obj_id].sections[shndx].as_mut() else {
                continue;
            };
            if !section.is_alive {
                continue;
            }
            let align = 1u64 << section.p2align;
            max_align = max_align.max(align);
            offset = align_up(offset, align);
            section.offset = offset as u32;
            offset += section.sh_size as u64;
        }
        let sec = ctx.output_sections.get_mut(out_id);
        sec.shdr.sh_addralign = max_align;
        sec.shdr.sh_size = align_up(offset, max_align);
    }

    for merged_id in 0..ctx.merged_sections.len() {
        let sec = &mut ctx.merged_sections[merged_id];
        let mut offset = 0u64;
        let mut max_align = 1u64;
        for frag in sec.fragments.iter_mut() {
            if !frag.is_alive {
                continue;
            }
            let align = 1u64 << frag.p2align;
            max_align = max_align.max(align);
            offset = align_up(offset, align);
            frag.offset = offset as u32;
            offset += frag.size as u64;
        }
        sec.shdr.sh_addralign = max_align;
        sec.shdr.sh_size = align_up(offset, max_align);
    }
}

fn sort_chunks(ctx: &mut Context) {
    let ehdr_phdr: Vec<Chunk> = ctx
        .chunks
        .drain(..2.min(ctx.chunks.len()))
        .collect();
    let shdr = ctx.chunks.pop();

    ctx.chunks.sort_by(|a, b| {
        if a.is_note() != b.is_note() {
            return b.is_note().cmp(&a.is_note());
        }
        order_key(a).cmp(&order_key(b))
    });

    let mut ordered = ehdr_phdr;
    ordered.append(&mut ctx.chunks);
    if let Some(shdr) = shdr {
        ordered.push(shdr);
    }
    ctx.chunks = ordered;
}

fn assign_shndx(ctx: &mut Context) {
    let mut next = 1usize;
    for chunk in ctx.chunks.iter_mut() {
        if matches!(chunk.kind, ChunkKind::Ehdr | ChunkKind::Phdr) {
            continue;
        }
        chunk.shndx = next;
        next += 1;
    }
}

fn assign_addresses_and_offsets(ctx: &mut Context) {
    let mut addr = IMAGE_BASE;
    let mut offset = 0u64;
    let mut prev_alloc = false;

    for i in 0..ctx.chunks.len() {
        let (sh_type, sh_flags, sh_addralign, sh_size) = {
            let shdr = &ctx.chunks[i].shdr;
            (shdr.sh_type, shdr.sh_flags, shdr.sh_addralign, shdr.sh_size)
        };
        let allocatable = sh_flags & elf::SHF_ALLOC != 0;

        if allocatable {
            addr = align_up(addr, sh_addralign.max(1));
            if !prev_alloc {
                offset = align_up(offset, PAGE_SIZE) + (addr % PAGE_SIZE);
            } else {
                offset = align_up(offset, sh_addralign.max(1));
            }
        } else {
            offset = align_up(offset, sh_addralign.max(1));
        }

        ctx.chunks[i].shdr.sh_addr = if allocatable { addr } else { 0 };
        ctx.chunks[i].shdr.sh_offset = offset;

        if allocatable {
            addr += sh_size;
        }
        if sh_type != elf::SHT_NOBITS {
            offset += sh_size;
        }
        prev_alloc = allocatable;
    }
}

/// §4.5's `CreatePhdr`: `PT_PHDR`, maximal `PT_NOTE` runs, maximal `PT_LOAD`
/// runs (BSS trailing, TBSS excluded), one `PT_TLS`. Returns the program
/// headers plus `tp_addr` (the last synthesized phdr's `VAddr`, matching the
/// original's `ctx.TpAddr = vec[len(vec)-1].VAddr` — meaningful only when a
/// `PT_TLS` entry was produced, since it is always the last one appended).
pub fn create_phdr(ctx: &Context) -> (Vec<elf::ProgramHeader>, u64) {
    let mut out = Vec::new();

    let phdr_chunk = ctx.chunks.iter().find(|c| c.kind == ChunkKind::Phdr).expect("Phdr chunk always present");
    define(&mut out, elf::PT_PHDR, elf::PF_R, 8, phdr_chunk);

    let chunks = &ctx.chunks;
    let n = chunks.len();

    let mut i = 0;
    while i < n {
        if !chunks[i].is_note() {
            i += 1;
            continue;
        }
        let flags = chunks[i].phdr_flags();
        let align = chunks[i].shdr.sh_addralign;
        define(&mut out, elf::PT_NOTE, flags, align as i64, &chunks[i]);
        i += 1;
        while i < n && chunks[i].is_note() && chunks[i].phdr_flags() == flags {
            push(&mut out, &chunks[i]);
            i += 1;
        }
    }

    let loadable: Vec<&Chunk> = chunks.iter().filter(|c| !is_tbss(c)).collect();
    let end = loadable.len();
    let mut i = 0;
    while i < end {
        if loadable[i].shdr.sh_flags & elf::SHF_ALLOC == 0 {
            break;
        }
        let flags = loadable[i].phdr_flags();
        define(&mut out, elf::PT_LOAD, flags, PAGE_SIZE as i64, loadable[i]);
        i += 1;

        if !loadable[i - 1].is_bss() {
            while i < end && !loadable[i].is_bss() && loadable[i].phdr_flags() == flags {
                push(&mut out, loadable[i]);
                i += 1;
            }
        }
        while i < end && loadable[i].is_bss() && loadable[i].phdr_flags() == flags {
            push(&mut out, loadable[i]);
            i += 1;
        }
    }

    let mut i = 0;
    while i < n {
        if !chunks[i].is_tls() {
            i += 1;
            continue;
        }
        define(&mut out, elf::PT_TLS, chunks[i].phdr_flags(), 1, &chunks[i]);
        i += 1;
        while i < n && chunks[i].is_tls() {
            push(&mut out, &chunks[i]);
            i += 1;
        }
    }

    let tp_addr = out.last().map(|p| p.p_vaddr).unwrap_or(0);
    (out, tp_addr)
}

fn is_tbss(chunk: &Chunk) -> bool {
    chunk.is_tls() && chunk.shdr.sh_type == elf::SHT_NOBITS
}

fn define(out: &mut Vec<elf::ProgramHeader>, p_type: u32, p_flags: u32, min_align: i64, chunk: &Chunk) {
    let file_size = if chunk.shdr.sh_type == elf::SHT_NOBITS { 0 } else { chunk.shdr.sh_size };
    out.push(elf::ProgramHeader {
        p_type,
        p_flags,
        p_offset: chunk.shdr.sh_offset,
        p_vaddr: chunk.shdr.sh_addr,
        p_paddr: chunk.shdr.sh_addr,
        p_filesz: file_size,
        p_memsz: chunk.shdr.sh_size,
        p_align: (min_align as u64).max(chunk.shdr.sh_addralign),
    });
    debug!("phdr: type={p_type} flags={p_flags:#x} vaddr={:#x}", out.last().unwrap().p_vaddr);
}

fn push(out: &mut [elf::ProgramHeader], chunk: &Chunk) {
    let phdr = out.last_mut().expect("push called after define");
    phdr.p_align = phdr.p_align.max(chunk.shdr.sh_addralign);
    if chunk.shdr.sh_type != elf::SHT_NOBITS {
        phdr.p_filesz = chunk.shdr.sh_addr + chunk.shdr.sh_size - phdr.p_vaddr;
    }
    phdr.p_memsz = chunk.shdr.sh_addr + chunk.shdr.sh_size - phdr.p_vaddr;
}
