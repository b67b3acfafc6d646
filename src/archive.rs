//! A simple parser for System V (`ar`) archives, as produced by `ar rcs
//! libfoo.a *.o`.
//!
//! Grounded in the teacher's `archive/mod.rs` (file-header layout, even-byte
//! padding between members) but reworked around [`crate::file::File`]'s
//! shared-buffer slicing instead of a `Read + Seek` cursor, and extended
//! with GNU `//` long-name table support per §4.1.

use crate::error::{Error, Result};
use crate::file::File;

pub const MAGIC: &[u8; 8] = b"!<arch>\n";

const HEADER_SIZE: usize = 60;
const NAME_SIZE: usize = 16;

struct MemberHeader<'a> {
    raw_name: &'a [u8; NAME_SIZE],
    size: usize,
}

fn parse_header<'a>(name: &str, bytes: &'a [u8], pos: usize) -> Result<MemberHeader<'a>> {
    if pos + HEADER_SIZE > bytes.len() {
        return Err(Error::ArchiveParse {
            name: name.to_string(),
            detail: format!("truncated member header at offset {pos}"),
        });
    }
    let raw = &bytes[pos..pos + HEADER_SIZE];
    let terminator = &raw[58..60];
    if terminator != b"\x60\x0a" {
        return Err(Error::ArchiveParse {
            name: name.to_string(),
            detail: format!("bad member header terminator at offset {pos}"),
        });
    }
    let raw_name: &[u8; NAME_SIZE] = raw[0..16].try_into().unwrap();
    let size_field = std::str::from_utf8(&raw[48..58]).map_err(|_| Error::ArchiveParse {
        name: name.to_string(),
        detail: "non-UTF8 size field".to_string(),
    })?;
    let size: usize = size_field.trim_end().parse().map_err(|_| Error::ArchiveParse {
        name: name.to_string(),
        detail: format!("bad size field {size_field:?}"),
    })?;
    Ok(MemberHeader { raw_name, size })
}

fn member_name(raw_name: &[u8; NAME_SIZE], long_names: &[u8]) -> Result<String> {
    if raw_name[0] == b'/' && raw_name[1].is_ascii_digit() {
        let digits: String = raw_name[1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .map(|&b| b as char)
            .collect();
        let offset: usize = digits.parse().map_err(|_| Error::ArchiveParse {
            name: "<archive>".to_string(),
            detail: format!("bad long-name offset {digits:?}"),
        })?;
        let end = long_names[offset..]
            .iter()
            .position(|&b| b == b'/')
            .map(|p| offset + p)
            .unwrap_or(long_names.len());
        return Ok(String::from_utf8_lossy(&long_names[offset..end]).into_owned());
    }
    let end = raw_name
        .iter()
        .position(|&b| b == b'/')
        .unwrap_or(NAME_SIZE);
    Ok(String::from_utf8_lossy(&raw_name[..end]).into_owned())
}

/// Flatten an archive into its ELF-object members, in archive order.
///
/// The symbol-table member (`/` or `/SYM64/`) is skipped entirely; the
/// GNU long-name table (`//`) is retained only to resolve other members'
/// names and is not itself emitted.
pub fn read_members(file: &File) -> Result<Vec<File>> {
    let bytes = file.contents();
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(Error::BadMagic {
            name: file.name.clone(),
        });
    }

    let mut pos = MAGIC.len();
    let mut long_names: Vec<u8> = Vec::new();
    let mut members = Vec::new();

    while bytes.len().saturating_sub(pos) > 1 {
        if pos % 2 == 1 {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let hdr = parse_header(&file.name, bytes, pos)?;
        let data_start = pos + HEADER_SIZE;
        let data_end = data_start + hdr.size;
        if data_end > bytes.len() {
            return Err(Error::ArchiveParse {
                name: file.name.clone(),
                detail: format!("member at {pos} overruns archive (size {})", hdr.size),
            });
        }
        pos = data_end;

        if hdr.raw_name[0] == b'/' && hdr.raw_name[1] == b' ' {
            continue; // SysV symbol table
        }
        if &hdr.raw_name[0..8] == b"/SYM64/ " {
            continue; // 64-bit symbol table
        }
        if hdr.raw_name[0] == b'/' && hdr.raw_name[1] == b'/' {
            long_names = bytes[data_start..data_end].to_vec();
            continue;
        }

        let name = member_name(hdr.raw_name, &long_names)?;
        members.push(File::member_of(file, name, data_start, data_end));
    }

    for member in &members {
        if !crate::elf::check_magic(member.contents()) {
            return Err(Error::UnsupportedFeature {
                name: member.name.clone(),
                feature: "archive member that is not an ELF object",
            });
        }
    }

    Ok(members)
}
