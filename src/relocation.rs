//! The RISC-V relocation engine (§4.6), grounded in `inputsection.go`'s
//! `ApplyRelocAlloc` and its instruction-encoding helpers.
//!
//! After layout, every alive `SHF_ALLOC` input section's raw bytes are
//! copied into the output buffer (done by the writer, which calls
//! [`apply_section`] right after the copy), then its relocations are applied
//! in three passes: direct writes (with `PCREL_HI20`/`TLS_GOT_HI20` stashed
//! as a provisional word), `PCREL_LO12` resolution against the stash, and
//! finally the stash is turned into the real `U`-type instruction.

use crate::context::Context;
use crate::elf;
use crate::error::Result;
use crate::object::{ObjectId, SymRef};
use crate::symbol::{Binding, Symbol};

pub fn apply_all(ctx: &mut Context) -> Result<()> {
    for obj_id in 0..ctx.objects.len() {
        if !ctx.objects[obj_id].is_alive {
            continue;
        }
        let shndxs: Vec<usize> = (0..ctx.objects[obj_id].sections.len())
            .filter(|&i| ctx.objects[obj_id].sections[i].is_some())
            .collect();
        for shndx in shndxs {
            apply_section(ctx, obj_id, shndx);
        }
    }
    Ok(())
}

fn apply_section(ctx: &mut Context, obj_id: ObjectId, shndx: usize) {
    let sh_flags = ctx.objects[obj_id].input_file.section_header(shndx).sh_flags;
    if sh_flags & elf::SHF_ALLOC == 0 {
        return;
    }
    let section = ctx.objects[obj_id].sections[shndx].as_ref().unwrap();
    if !section.is_alive {
        return;
    }

    let rels: Vec<elf::Rela> = section.rels(&ctx.objects[obj_id]).to_vec();
    if rels.is_empty() {
        return;
    }

    let base_addr = section.addr(&ctx.output_sections);
    // `ctx.buf` is indexed by file offset, not virtual address - the two
    // agree modulo the page size but not in absolute value.
    let out_file_offset = ctx.output_sections.get(section.output_section).shdr.sh_offset;
    let section_offset = section.offset as usize;
    let original = ctx.objects[obj_id].section_contents(shndx).to_vec();

    // Pass A: direct relocations, with PCREL_HI20/TLS_GOT_HI20 stashed.
    for rel in &rels {
        let kind = rel.kind();
        if kind == elf::R_RISCV_NONE || kind == elf::R_RISCV_RELAX {
            continue;
        }
        let Some(sym) = resolved_symbol(ctx, obj_id, rel.sym() as usize) else {
            continue;
        };
        if !sym.is_defined() {
            continue;
        }
        let s = symbol_addr(ctx, &sym);
        let a = rel.r_addend as u64;
        let p = base_addr + rel.r_offset;
        let loc = out_file_offset as usize + section_offset + rel.r_offset as usize;

        match kind {
            elf::R_RISCV_32 => write_u32(&mut ctx.buf, loc, (s.wrapping_add(a)) as u32),
            elf::R_RISCV_64 => write_u64(&mut ctx.buf, loc, s.wrapping_add(a)),
            elf::R_RISCV_BRANCH => write_btype(&mut ctx.buf, loc, s.wrapping_add(a).wrapping_sub(p) as u32),
            elf::R_RISCV_JAL => write_jtype(&mut ctx.buf, loc, s.wrapping_add(a).wrapping_sub(p) as u32),
            elf::R_RISCV_CALL | elf::R_RISCV_CALL_PLT => {
                let val = s.wrapping_add(a).wrapping_sub(p) as u32;
                write_utype(&mut ctx.buf, loc, val);
                write_itype(&mut ctx.buf, loc + 4, val);
            }
            elf::R_RISCV_TLS_GOT_HI20 => {
                let t = s.wrapping_sub(ctx.tp_addr);
                write_u32(&mut ctx.buf, loc, t.wrapping_add(a).wrapping_sub(p) as u32);
            }
            elf::R_RISCV_PCREL_HI20 => {
                write_u32(&mut ctx.buf, loc, s.wrapping_add(a).wrapping_sub(p) as u32);
            }
            elf::R_RISCV_HI20 => {
                write_utype(&mut ctx.buf, loc, s.wrapping_add(a) as u32);
            }
            elf::R_RISCV_LO12_I | elf::R_RISCV_LO12_S => {
                let val = s.wrapping_add(a);
                if kind == elf::R_RISCV_LO12_I {
                    write_itype(&mut ctx.buf, loc, val as u32);
                } else {
                    write_stype(&mut ctx.buf, loc, val as u32);
                }
                if sign_extend(val, 11) == val {
                    set_rs1(&mut ctx.buf, loc, 0);
                }
            }
            elf::R_RISCV_TPREL_LO12_I | elf::R_RISCV_TPREL_LO12_S => {
                let val = s.wrapping_add(a).wrapping_sub(ctx.tp_addr);
                if kind == elf::R_RISCV_TPREL_LO12_I {
                    write_itype(&mut ctx.buf, loc, val as u32);
                } else {
                    write_stype(&mut ctx.buf, loc, val as u32);
                }
                if sign_extend(val, 11) == val {
                    set_rs1(&mut ctx.buf, loc, 4);
                }
            }
            _ => {}
        }
    }

    // Pass B: PCREL_LO12 resolution against the stashed provisional word at
    // the paired local symbol's own offset within this same section.
    for rel in &rels {
        let kind = rel.kind();
        if kind != elf::R_RISCV_PCREL_LO12_I && kind != elf::R_RISCV_PCREL_LO12_S {
            continue;
        }
        let Some(sym) = resolved_symbol(ctx, obj_id, rel.sym() as usize) else {
            continue;
        };
        let loc = out_file_offset as usize + section_offset + rel.r_offset as usize;
        let word_loc = out_file_offset as usize + section_offset + sym.value as usize;
        let val = read_u32(&ctx.buf, word_loc);
        if kind == elf::R_RISCV_PCREL_LO12_I {
            write_itype(&mut ctx.buf, loc, val);
        } else {
            write_stype(&mut ctx.buf, loc, val);
        }
    }

    // Pass C: finalize HI20 stashes - restore the original instruction bits
    // and overwrite with the real U-type encoding of the stashed value.
    for rel in &rels {
        let kind = rel.kind();
        if kind != elf::R_RISCV_PCREL_HI20 && kind != elf::R_RISCV_TLS_GOT_HI20 {
            continue;
        }
        let loc = out_file_offset as usize + section_offset + rel.r_offset as usize;
        let val = read_u32(&ctx.buf, loc);
        let orig = u32::from_le_bytes(original[rel.r_offset as usize..rel.r_offset as usize + 4].try_into().unwrap());
        write_u32(&mut ctx.buf, loc, orig);
        write_utype(&mut ctx.buf, loc, val);
    }
}

/// Resolve a raw symbol-table index (local or global) to the `Symbol`
/// record that carries its final binding, cloned out since the caller also
/// needs mutable access to `ctx.buf`.
fn resolved_symbol(ctx: &Context, obj_id: ObjectId, idx: usize) -> Option<Symbol> {
    match *ctx.objects[obj_id].symbols.get(idx)? {
        SymRef::Local(i) => ctx.objects[obj_id].local_symbols.get(i).cloned(),
        SymRef::Global(sym_id) => Some(ctx.symbol_table.get(sym_id).clone()),
    }
}

/// `S`: the symbol's final address (§4.6).
fn symbol_addr(ctx: &Context, sym: &Symbol) -> u64 {
    match sym.binding {
        Binding::Undefined => 0,
        Binding::Absolute => sym.value,
        Binding::Section { obj, shndx } => {
            let section = ctx.objects[obj].sections[shndx].as_ref().expect("bound section is kept");
            section.addr(&ctx.output_sections) + sym.value
        }
        Binding::Fragment { merged, fragment } => {
            let merged_sec = &ctx.merged_sections[merged];
            merged_sec.fragments[fragment].addr(merged_sec.shdr.sh_addr) + sym.value
        }
    }
}

fn sign_extend(v: u64, bit: u32) -> u64 {
    let shift = 63 - bit;
    (((v << shift) as i64) >> shift) as u64
}

fn read_u32(buf: &[u8], loc: usize) -> u32 {
    u32::from_le_bytes(buf[loc..loc + 4].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], loc: usize, val: u32) {
    buf[loc..loc + 4].copy_from_slice(&val.to_le_bytes());
}

fn write_u64(buf: &mut [u8], loc: usize, val: u64) {
    buf[loc..loc + 8].copy_from_slice(&val.to_le_bytes());
}

fn bit(v: u32, n: u32) -> u32 {
    (v >> n) & 1
}

fn bits(v: u32, hi: u32, lo: u32) -> u32 {
    (v >> lo) & ((1 << (hi - lo + 1)) - 1)
}

fn itype(val: u32) -> u32 {
    val << 20
}

fn stype(val: u32) -> u32 {
    bits(val, 11, 5) << 25 | bits(val, 4, 0) << 7
}

fn btype(val: u32) -> u32 {
    bit(val, 12) << 31 | bits(val, 10, 5) << 25 | bits(val, 4, 1) << 8 | bit(val, 11) << 7
}

fn utype(val: u32) -> u32 {
    (val.wrapping_add(0x800)) & 0xffff_f000
}

fn jtype(val: u32) -> u32 {
    bit(val, 20) << 31 | bits(val, 10, 1) << 21 | bit(val, 11) << 20 | bits(val, 19, 12) << 12
}

fn write_itype(buf: &mut [u8], loc: usize, val: u32) {
    let mask: u32 = 0b000000_00000_11111_111_11111_1111111;
    write_u32(buf, loc, (read_u32(buf, loc) & mask) | itype(val));
}

fn write_stype(buf: &mut [u8], loc: usize, val: u32) {
    let mask: u32 = 0b000000_11111_11111_111_00000_1111111;
    write_u32(buf, loc, (read_u32(buf, loc) & mask) | stype(val));
}

fn write_btype(buf: &mut [u8], loc: usize, val: u32) {
    let mask: u32 = 0b000000_11111_11111_111_00000_1111111;
    write_u32(buf, loc, (read_u32(buf, loc) & mask) | btype(val));
}

fn write_utype(buf: &mut [u8], loc: usize, val: u32) {
    let mask: u32 = 0b000000_00000_00000_000_11111_1111111;
    write_u32(buf, loc, (read_u32(buf, loc) & mask) | utype(val));
}

fn write_jtype(buf: &mut [u8], loc: usize, val: u32) {
    let mask: u32 = 0b000000_00000_00000_000_11111_1111111;
    write_u32(buf, loc, (read_u32(buf, loc) & mask) | jtype(val));
}

fn set_rs1(buf: &mut [u8], loc: usize, rs1: u32) {
    let mask: u32 = 0b111111_11111_00000_111_11111_1111111;
    let cleared = read_u32(buf, loc) & mask;
    write_u32(buf, loc, cleared | (rs1 << 15));
}
