//! Command-line front-end (§4.8 expansion), grounded in the distilled
//! spec's "External Interfaces" section and the `clap` derive convention.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{Error, Result};

/// A static linker for the RISC-V 64-bit ELF ABI.
#[derive(Debug, Parser)]
#[command(name = "rvld", version, about)]
struct Args {
    /// Object files, archives, and `-l<name>` tokens (recognized by a prefix
    /// scan before clap parses the rest).
    inputs: Vec<String>,

    /// Output path.
    #[arg(short = 'o', long, default_value = "a.out")]
    output: PathBuf,

    /// Target emulation. Only `elf64lriscv` is meaningful.
    #[arg(short = 'm', long, default_value = "elf64lriscv")]
    emulation: String,

    /// Library search path, repeatable.
    #[arg(short = 'L', action = clap::ArgAction::Append)]
    library_path: Vec<PathBuf>,
}

/// One positional input, before it has been resolved against the library
/// search path: either a direct path or an unresolved `-l<name>` token.
#[derive(Debug, Clone)]
pub enum InputSpec {
    Path(PathBuf),
    Library(String),
}

impl InputSpec {
    /// `-lfoo` -> first of `libfoo.a`/`libfoo.so` found on `library_paths`;
    /// anything else is a direct, already-resolved path.
    pub fn resolve(&self, library_paths: &[PathBuf]) -> Result<PathBuf> {
        let name = match self {
            InputSpec::Path(p) => return Ok(p.clone()),
            InputSpec::Library(name) => name,
        };
        for dir in library_paths {
            for candidate in [format!("lib{name}.a"), format!("lib{name}.so")] {
                let path = dir.join(&candidate);
                if path.is_file() {
                    return Ok(path);
                }
            }
        }
        Err(Error::LibraryNotFound {
            name: name.clone(),
            searched: library_paths.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emulation {
    Elf64LRiscv,
}

#[derive(Debug, Clone)]
pub struct LinkerOptions {
    pub inputs: Vec<InputSpec>,
    pub library_paths: Vec<PathBuf>,
    pub output: PathBuf,
    pub emulation: Emulation,
}

/// `-l<name>` tokens are just a path lookup: recognized here by prefix scan
/// over the raw args, before the rest goes to clap.
pub fn parse_args<I: IntoIterator<Item = String>>(raw: I) -> Result<LinkerOptions> {
    let mut specs = Vec::new();
    let mut rest = Vec::new();
    for arg in raw {
        if let Some(name) = arg.strip_prefix("-l") {
            if !name.is_empty() {
                specs.push(InputSpec::Library(name.to_string()));
                continue;
            }
        }
        rest.push(arg);
    }

    let args = Args::parse_from(rest);

    let mut inputs: Vec<InputSpec> = args.inputs.into_iter().map(|s| InputSpec::Path(PathBuf::from(s))).collect();
    inputs.extend(specs);

    let emulation = match args.emulation.as_str() {
        "elf64lriscv" => Emulation::Elf64LRiscv,
        other => {
            return Err(Error::UnsupportedFeature {
                name: other.to_string(),
                feature: "emulation mode",
            });
        }
    };

    Ok(LinkerOptions {
        inputs,
        library_paths: args.library_path,
        output: args.output,
        emulation,
    })
}
