//! Crate-wide error type.
//!
//! Every fatal condition the linker can hit funnels through this enum so
//! `main` has a single place to turn a failure into a diagnostic and a
//! nonzero exit code. No `thiserror`: the variant set is small and closed,
//! so a hand-written `Display`/`Error` impl is clearer than a derive.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Scroll(scroll::Error),
    InputTooSmall {
        name: String,
        len: usize,
        minimum: usize,
    },
    BadMagic {
        name: String,
    },
    UnsupportedAbi {
        name: String,
        class: u8,
        data: u8,
        machine: u16,
    },
    UnsupportedFeature {
        name: String,
        feature: &'static str,
    },
    ArchiveParse {
        name: String,
        detail: String,
    },
    SectionOutOfRange {
        name: String,
        shndx: usize,
        offset: u64,
        size: u64,
        file_len: usize,
    },
    UnterminatedMergeString {
        name: String,
        shndx: usize,
    },
    MergeSizeNotMultiple {
        name: String,
        shndx: usize,
        entsize: u64,
    },
    FragmentNotFound {
        symbol: String,
        section: String,
    },
    LibraryNotFound {
        name: String,
        searched: Vec<PathBuf>,
    },
    UndefinedSymbol {
        name: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Scroll(e) => write!(f, "malformed binary data: {e}"),
            Error::InputTooSmall { name, len, minimum } => write!(
                f,
                "{name}: file too small ({len} bytes, need at least {minimum})"
            ),
            Error::BadMagic { name } => write!(f, "{name}: not an ELF file or archive"),
            Error::UnsupportedAbi {
                name,
                class,
                data,
                machine,
            } => write!(
                f,
                "{name}: unsupported ABI (class={class}, data={data}, machine={machine}); only ELFCLASS64/ELFDATA2LSB/EM_RISCV is supported"
            ),
            Error::UnsupportedFeature { name, feature } => {
                write!(f, "{name}: unsupported feature: {feature}")
            }
            Error::ArchiveParse { name, detail } => {
                write!(f, "{name}: malformed archive: {detail}")
            }
            Error::SectionOutOfRange {
                name,
                shndx,
                offset,
                size,
                file_len,
            } => write!(
                f,
                "{name}: section {shndx} [{offset}, {size}) out of range of file (len {file_len})"
            ),
            Error::UnterminatedMergeString { name, shndx } => write!(
                f,
                "{name}: section {shndx} is SHF_MERGE|SHF_STRINGS but contains an unterminated string"
            ),
            Error::MergeSizeNotMultiple {
                name,
                shndx,
                entsize,
            } => write!(
                f,
                "{name}: section {shndx} size is not a multiple of entsize {entsize}"
            ),
            Error::FragmentNotFound { symbol, section } => write!(
                f,
                "symbol '{symbol}' has a value outside any fragment of mergeable section '{section}'"
            ),
            Error::LibraryNotFound { name, searched } => write!(
                f,
                "cannot find -l{name} (searched: {})",
                searched
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Error::UndefinedSymbol { name } => write!(f, "undefined symbol: {name}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<scroll::Error> for Error {
    fn from(e: scroll::Error) -> Self {
        Error::Scroll(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
