//! Structural validation of the produced eBPF ELF object.
//!
//! The kernel-side loader needs a 64-bit BPF relocatable with executable
//! program code and named entry-point symbols; anything else is a build
//! defect even when the toolchain exited cleanly.

use std::path::{Path, PathBuf};

use object::{elf, Object, ObjectSection, ObjectSymbol, SectionFlags, SymbolKind};
use thiserror::Error;

/// Section names holding BPF map definitions. Data, never code.
const MAP_SECTION_NAMES: &[&str] = &[".maps", "maps"];

#[derive(Debug, Error)]
pub enum ElfCheckError {
    #[error("output object not found: {}", .path.display())]
    NotFound { path: PathBuf },
    #[error("failed to read output object {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: not an ELF object (bad magic)", .path.display())]
    NotElf { path: PathBuf },
    #[error("{}: not a 64-bit ELF object (class {class})", .path.display())]
    Not64Bit { path: PathBuf, class: u8 },
    #[error("{}: machine {machine} is not BPF (247)", .path.display())]
    WrongMachine { path: PathBuf, machine: u16 },
    #[error("{}: malformed ELF: {message}", .path.display())]
    Malformed { path: PathBuf, message: String },
    #[error("{}: no section with executable code", .path.display())]
    NoCodeSection { path: PathBuf },
    #[error("{}: symbol table has no named symbols", .path.display())]
    NoSymbols { path: PathBuf },
    #[error("{}: map section {section:?} is marked executable", .path.display())]
    ExecutableMapsSection { path: PathBuf, section: String },
}

/// Validates the object file at `path` against all structural invariants.
pub fn validate_object(path: &Path) -> Result<(), ElfCheckError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ElfCheckError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ElfCheckError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    validate_bytes(path, &data)
}

/// In-memory variant of [`validate_object`]; `path` is only for diagnostics.
pub fn validate_bytes(path: &Path, data: &[u8]) -> Result<(), ElfCheckError> {
    if data.len() < 20 || data[..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(ElfCheckError::NotElf {
            path: path.to_path_buf(),
        });
    }
    let class = data[4];
    if class != elf::ELFCLASS64 {
        return Err(ElfCheckError::Not64Bit {
            path: path.to_path_buf(),
            class,
        });
    }
    let machine = if data[5] == elf::ELFDATA2MSB {
        u16::from_be_bytes([data[18], data[19]])
    } else {
        u16::from_le_bytes([data[18], data[19]])
    };
    if machine != elf::EM_BPF {
        return Err(ElfCheckError::WrongMachine {
            path: path.to_path_buf(),
            machine,
        });
    }

    let file = object::File::parse(data).map_err(|err| ElfCheckError::Malformed {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    let mut has_code = false;
    for section in file.sections() {
        let executable = matches!(
            section.flags(),
            SectionFlags::Elf { sh_flags } if sh_flags & u64::from(elf::SHF_EXECINSTR) != 0
        );
        if !executable {
            continue;
        }
        if let Ok(name) = section.name() {
            if MAP_SECTION_NAMES.contains(&name) {
                return Err(ElfCheckError::ExecutableMapsSection {
                    path: path.to_path_buf(),
                    section: name.to_string(),
                });
            }
        }
        has_code = true;
    }
    if !has_code {
        return Err(ElfCheckError::NoCodeSection {
            path: path.to_path_buf(),
        });
    }

    let named = file
        .symbols()
        .filter(|sym| sym.kind() != SymbolKind::Section)
        .filter(|sym| sym.name().map(|n| !n.is_empty()).unwrap_or(false))
        .count();
    if named == 0 {
        return Err(ElfCheckError::NoSymbols {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

/// Program entry points detected from the object's symbols: defined global
/// function symbols with non-empty names, excluding internal-looking names,
/// in symbol-table order.
pub fn detect_programs(path: &Path) -> Result<Vec<String>, ElfCheckError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ElfCheckError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ElfCheckError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let file = object::File::parse(&data[..]).map_err(|err| ElfCheckError::Malformed {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    let mut out: Vec<String> = Vec::new();
    for sym in file.symbols() {
        if !sym.is_definition() || !sym.is_global() || sym.kind() != SymbolKind::Text {
            continue;
        }
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() || name.starts_with('.') || name.starts_with("__") {
            continue;
        }
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    Ok(out)
}
