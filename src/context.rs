//! Process-wide linker state and the top-level pipeline driver (§3 `Context`,
//! grounded in `context.go`, generalized beyond its single-object snapshot
//! to the full multi-pass pipeline §2 describes).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use log::{debug, info};

use crate::archive;
use crate::chunk::{Chunk, ChunkKind};
use crate::cli::LinkerOptions;
use crate::elf;
use crate::error::{Error, Result};
use crate::file::{self, File};
use crate::mergeable::{MergedSection, MergedSectionId};
use crate::object::{self, ObjectFile, ObjectId, SymRef};
use crate::output_section::{self, OutputSectionTable};
use crate::symbol::{Binding, SymbolTable};

pub struct Context {
    pub args: LinkerOptions,
    pub objects: Vec<ObjectFile>,
    pub symbol_table: SymbolTable,
    pub merged_sections: Vec<MergedSection>,
    merged_index: HashMap<(String, u32, u64), MergedSectionId>,
    pub output_sections: OutputSectionTable,
    pub chunks: Vec<Chunk>,
    pub phdrs: Vec<elf::ProgramHeader>,
    pub buf: Vec<u8>,
    pub tp_addr: u64,
}

impl Context {
    pub fn new(args: LinkerOptions) -> Context {
        Context {
            args,
            objects: Vec::new(),
            symbol_table: SymbolTable::new(),
            merged_sections: Vec::new(),
            merged_index: HashMap::new(),
            output_sections: OutputSectionTable::new(),
            chunks: Vec::new(),
            phdrs: Vec::new(),
            buf: Vec::new(),
            tp_addr: 0,
        }
    }

    /// Lookup-or-create a process-wide `MergedSection`, mirroring
    /// `OutputSectionTable::get_or_create`'s key shape but with the
    /// merge-only flag bits stripped (§4.4).
    pub fn get_or_create_merged(&mut self, name: &str, sh_type: u32, sh_flags: u64) -> MergedSectionId {
        let canonical = output_section::canonicalize_name(name).to_string();
        let flags = output_section::merged_section_flags(sh_flags);
        let key = (canonical.clone(), sh_type, flags);
        if let Some(&id) = self.merged_index.get(&key) {
            return id;
        }
        let id = self.merged_sections.len();
        self.merged_sections.push(MergedSection::new(canonical, sh_type, flags));
        self.merged_index.insert(key, id);
        id
    }
}

/// Run the full pipeline: load inputs, resolve symbols, merge constant data,
/// lay out the image, relocate, write (§2).
pub fn link(args: LinkerOptions) -> Result<()> {
    let mut ctx = Context::new(args);

    info!("loading input files");
    load_inputs(&mut ctx)?;

    info!("resolving symbols");
    resolve_symbols_pass1(&mut ctx);
    mark_live_objects_pass2(&mut ctx);
    clear_dead_claims(&mut ctx);
    disable_dead_sections(&mut ctx);
    check_undefined(&ctx)?;

    info!("registering mergeable section pieces");
    register_section_pieces(&mut ctx)?;

    info!("building chunks");
    build_chunks(&mut ctx);

    info!("laying out sections");
    crate::layout::assign_addresses(&mut ctx);

    info!("writing output");
    crate::writer::write(&mut ctx)?;

    Ok(())
}

fn load_inputs(ctx: &mut Context) -> Result<()> {
    for spec in ctx.args.inputs.clone() {
        let path = spec.resolve(&ctx.args.library_paths)?;
        let top = File::read(&path)?;
        load_file(ctx, top, true)?;
    }
    Ok(())
}

fn load_file(ctx: &mut Context, f: File, is_alive: bool) -> Result<()> {
    match file::must_classify(&f)? {
        file::FileType::Object => {
            push_object(ctx, f, is_alive)?;
        }
        file::FileType::Archive => {
            debug!("expanding archive {}", f.name);
            for member in archive::read_members(&f)? {
                if file::classify(member.contents()) != file::FileType::Object {
                    return Err(Error::ArchiveParse {
                        name: member.name.clone(),
                        detail: "archive member is not an ELF object".to_string(),
                    });
                }
                push_object(ctx, member, false)?;
            }
        }
        file::FileType::Unknown => unreachable!("must_classify rejects Unknown"),
    }
    Ok(())
}

fn push_object(ctx: &mut Context, f: File, is_alive: bool) -> Result<()> {
    let id: ObjectId = ctx.objects.len();
    let obj = object::create_object_file(f, id, is_alive, &mut ctx.output_sections, &mut ctx.symbol_table)?;
    ctx.objects.push(obj);
    Ok(())
}

fn resolve_symbols_pass1(ctx: &mut Context) {
    for obj_id in 0..ctx.objects.len() {
        if !ctx.objects[obj_id].is_alive {
            continue;
        }
        resolve_object_symbols(ctx, obj_id);
    }
}

fn resolve_object_symbols(ctx: &mut Context, obj_id: ObjectId) {
    let first_global = ctx.objects[obj_id].first_global;
    let n = ctx.objects[obj_id].input_file.sym_table.len();
    for i in first_global..n {
        let esym = ctx.objects[obj_id].input_file.sym_table[i];
        if esym.is_undef() {
            continue;
        }
        let SymRef::Global(sym_id) = ctx.objects[obj_id].symbols[i] else {
            unreachable!("global symbol slot must resolve to a SymRef::Global")
        };
        if ctx.symbol_table.get(sym_id).file.is_some() {
            continue;
        }
        let binding = if esym.is_abs() || esym.is_common() {
            Binding::Absolute
        } else {
            let shndx = ctx.objects[obj_id].resolve_shndx(&esym, i);
            Binding::Section { obj: obj_id, shndx }
        };
        let sym = ctx.symbol_table.get_mut(sym_id);
        sym.file = Some(obj_id);
        sym.binding = binding;
        sym.value = esym.st_value;
        sym.sym_idx = i as i64;
    }
}

/// Every global symbol name to the (possibly still-dead) objects that
/// define it, in object order - built across *all* objects, since a dead
/// archive member's definitions were never recorded into the symbol table
/// by pass 1 (which only resolves already-alive objects).
fn build_definer_index(ctx: &Context) -> HashMap<String, Vec<ObjectId>> {
    let mut definers: HashMap<String, Vec<ObjectId>> = HashMap::new();
    for obj_id in 0..ctx.objects.len() {
        let first_global = ctx.objects[obj_id].first_global;
        let n = ctx.objects[obj_id].input_file.sym_table.len();
        for i in first_global..n {
            let esym = ctx.objects[obj_id].input_file.sym_table[i];
            if esym.is_undef() {
                continue;
            }
            let SymRef::Global(sym_id) = ctx.objects[obj_id].symbols[i] else {
                continue;
            };
            let name = ctx.symbol_table.get(sym_id).name.clone();
            definers.entry(name).or_default().push(obj_id);
        }
    }
    definers
}

/// Fixed-point archive-member liveness (§4.3 pass 2). A dead object newly
/// pulled in must have its own defined symbols resolved immediately
/// (`resolve_object_symbols`, same first-writer-wins rule as pass 1) before
/// its undefined globals are walked, since pass 1 never visited it while it
/// was still dead.
fn mark_live_objects_pass2(ctx: &mut Context) {
    let definers = build_definer_index(ctx);
    let mut queue: VecDeque<ObjectId> = (0..ctx.objects.len()).filter(|&id| ctx.objects[id].is_alive).collect();

    while let Some(obj_id) = queue.pop_front() {
        let first_global = ctx.objects[obj_id].first_global;
        let n = ctx.objects[obj_id].input_file.sym_table.len();
        for i in first_global..n {
            let esym = ctx.objects[obj_id].input_file.sym_table[i];
            if !esym.is_undef() {
                continue;
            }
            let SymRef::Global(sym_id) = ctx.objects[obj_id].symbols[i] else {
                continue;
            };
            if ctx.symbol_table.get(sym_id).file.is_some() {
                continue;
            }
            let name = ctx.symbol_table.get(sym_id).name.clone();
            let Some(candidates) = definers.get(&name) else {
                continue;
            };
            for &def_obj in candidates {
                if ctx.objects[def_obj].is_alive {
                    continue;
                }
                ctx.objects[def_obj].is_alive = true;
                debug!("archive member {} marked alive", ctx.objects[def_obj].name());
                resolve_object_symbols(ctx, def_obj);
                queue.push_back(def_obj);
            }
        }
    }
}

fn clear_dead_claims(ctx: &mut Context) {
    for obj_id in 0..ctx.objects.len() {
        if ctx.objects[obj_id].is_alive {
            continue;
        }
        let first_global = ctx.objects[obj_id].first_global;
        let n = ctx.objects[obj_id].input_file.sym_table.len();
        for i in first_global..n {
            let SymRef::Global(sym_id) = ctx.objects[obj_id].symbols[i] else {
                continue;
            };
            if ctx.symbol_table.get(sym_id).file == Some(obj_id) {
                ctx.symbol_table.get_mut(sym_id).clear();
            }
        }
    }
}

/// An archive member never claimed alive by pass 2 still has `ObjectFile`
/// and `InputSection` records (parsed up front in `push_object`), but none
/// of its sections may contribute to the output. `InputSection::is_alive`
/// is otherwise only cleared per-section by mergeable-section splitting, so
/// without this pass `build_chunks`/`pack_members`/`write_output_section`
/// would still pull in a dead archive member's bytes.
fn disable_dead_sections(ctx: &mut Context) {
    for obj in ctx.objects.iter_mut() {
        if obj.is_alive {
            continue;
        }
        for section in obj.sections.iter_mut().flatten() {
            section.is_alive = false;
        }
    }
}

fn check_undefined(ctx: &Context) -> Result<()> {
    for obj in &ctx.objects {
        if !obj.is_alive {
            continue;
        }
        for i in obj.first_global..obj.input_file.sym_table.len() {
            let esym = obj.input_file.sym_table[i];
            if !esym.is_undef() || esym.bind() == elf::STB_WEAK {
                continue;
            }
            let SymRef::Global(sym_id) = obj.symbols[i] else { continue };
            let sym = ctx.symbol_table.get(sym_id);
            if !sym.is_defined() {
                return Err(Error::UndefinedSymbol { name: sym.name.clone() });
            }
        }
    }
    Ok(())
}

/// Intern every live mergeable section's fragments into the process-wide
/// pool, then rebind any global symbol whose `value` pointed inside a split
/// section (§4.4's `RegisterSectionPieces`).
fn register_section_pieces(ctx: &mut Context) -> Result<()> {
    for obj_id in 0..ctx.objects.len() {
        if !ctx.objects[obj_id].is_alive {
            continue;
        }
        let shndxs: Vec<usize> = ctx.objects[obj_id].mergeable.keys().copied().collect();
        for shndx in shndxs {
            let (name, sh_type, sh_flags, entsize) = {
                let obj = &ctx.objects[obj_id];
                let shdr = obj.input_file.section_header(shndx);
                (obj.section_name(shndx).to_string(), shdr.sh_type, shdr.sh_flags, shdr.sh_entsize)
            };
            let merged_id = ctx.get_or_create_merged(&name, sh_type, sh_flags);

            let contents = ctx.objects[obj_id].section_contents(shndx).to_vec();
            let p2align = ctx.objects[obj_id].mergeable[&shndx].p2align;
            let pieces = crate::mergeable::split_fragments(ctx.objects[obj_id].name(), shndx, &contents, sh_flags, entsize)?;

            let fragment_ids: Vec<usize> = pieces
                .iter()
                .map(|(bytes, _)| ctx.merged_sections[merged_id].insert(merged_id, bytes, p2align))
                .collect();

            ctx.objects[obj_id].mergeable.get_mut(&shndx).unwrap().fragments = fragment_ids;
        }
    }

    rebind_fragment_symbols(ctx)?;
    Ok(())
}

fn rebind_fragment_symbols(ctx: &mut Context) -> Result<()> {
    for sym_id in 0..ctx.symbol_table.len() {
        let (obj_id, shndx, value) = {
            let sym = ctx.symbol_table.get(sym_id);
            match sym.binding {
                Binding::Section { obj, shndx } => (obj, shndx, sym.value),
                _ => continue,
            }
        };
        let Some(mergeable) = ctx.objects[obj_id].mergeable.get(&shndx) else {
            continue;
        };
        let section_name = ctx.objects[obj_id].section_name(shndx).to_string();
        let Some((piece_idx, rel_offset)) = mergeable.fragment_at(value as u32) else {
            return Err(Error::FragmentNotFound {
                symbol: ctx.symbol_table.get(sym_id).name.clone(),
                section: section_name,
            });
        };
        let fragment = mergeable.fragments[piece_idx];
        let sym = ctx.symbol_table.get_mut(sym_id);
        sym.binding = Binding::Fragment {
            merged: mergeable.parent,
            fragment,
        };
        sym.value = rel_offset as u64;
    }
    Ok(())
}

/// Build the chunk vector: `Ehdr`, `Phdr`, every live output section and
/// merged section, `Shdr` — unordered; `layout::assign_addresses` sorts and
/// assigns shndx/addr/offset.
fn build_chunks(ctx: &mut Context) {
    ctx.chunks.push(Chunk::ehdr());
    ctx.chunks.push(Chunk::phdr());

    for id in 0..ctx.output_sections.sections.len() {
        let has_live_member = ctx.output_sections.get(id).members.iter().any(|&(obj, shndx)| {
            ctx.objects[obj].sections[shndx].as_ref().map(|s| s.is_alive).unwrap_or(false)
        });
        if !has_live_member {
            continue;
        }
        let sec = ctx.output_sections.get(id);
        ctx.chunks.push(Chunk::output(id, sec.sh_type, sec.sh_flags, 1));
    }

    for id in 0..ctx.merged_sections.len() {
        if ctx.merged_sections[id].fragments.is_empty() {
            continue;
        }
        let sec = &ctx.merged_sections[id];
        let align = 1u64 << sec.max_p2align;
        ctx.chunks.push(Chunk::merged(id, sec.sh_type, sec.sh_flags, align));
    }

    ctx.chunks.push(Chunk::shdr_chunk());
}
