//! Discovery and validation of the external toolchain binaries.
//!
//! Resolution order is explicit override path first, then a PATH lookup by
//! canonical name. Every path that will later be executed goes through
//! [`validate_tool_path`] before it is accepted.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Basenames we accept as toolchain binaries, after version-suffix stripping.
/// Includes the six driven tools plus auxiliary names a wrapper script may
/// legitimately point an override at.
const ALLOWED_TOOLS: &[&str] = &[
    "llvm-link",
    "opt",
    "llc",
    "llvm-ar",
    "llvm-objcopy",
    "pahole",
    "clang",
    "ld",
    "ld.lld",
    "bpftool",
];

/// Rejected anywhere in a tool path. The path ends up embedded in diagnostic
/// command strings, so it must never read as shell syntax even though
/// execution always uses argument vectors.
const UNSAFE_PATH_CHARS: &[char] = &[
    ';', '|', '&', '$', '`', '(', ')', '{', '}', '[', ']', '!', '~', '\\',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Linker,
    Optimizer,
    Codegen,
    Archiver,
    ObjCopy,
    BtfAnnotator,
}

impl Tool {
    /// Fixed order used everywhere the tool set is listed.
    pub const ALL: [Tool; 6] = [
        Tool::Linker,
        Tool::Optimizer,
        Tool::Codegen,
        Tool::Archiver,
        Tool::ObjCopy,
        Tool::BtfAnnotator,
    ];

    pub fn canonical_name(self) -> &'static str {
        match self {
            Tool::Linker => "llvm-link",
            Tool::Optimizer => "opt",
            Tool::Codegen => "llc",
            Tool::Archiver => "llvm-ar",
            Tool::ObjCopy => "llvm-objcopy",
            Tool::BtfAnnotator => "pahole",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Tool::Linker => "linker",
            Tool::Optimizer => "optimizer",
            Tool::Codegen => "codegen",
            Tool::Archiver => "archiver",
            Tool::ObjCopy => "objcopy",
            Tool::BtfAnnotator => "btf-annotator",
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Tool::Linker | Tool::Optimizer | Tool::Codegen)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Caller-supplied candidate paths; `None` means "discover on PATH".
#[derive(Debug, Clone, Default)]
pub struct ToolOverrides {
    pub linker: Option<PathBuf>,
    pub optimizer: Option<PathBuf>,
    pub codegen: Option<PathBuf>,
    pub archiver: Option<PathBuf>,
    pub objcopy: Option<PathBuf>,
    pub btf_annotator: Option<PathBuf>,
}

impl ToolOverrides {
    fn get(&self, tool: Tool) -> Option<&Path> {
        let path = match tool {
            Tool::Linker => &self.linker,
            Tool::Optimizer => &self.optimizer,
            Tool::Codegen => &self.codegen,
            Tool::Archiver => &self.archiver,
            Tool::ObjCopy => &self.objcopy,
            Tool::BtfAnnotator => &self.btf_annotator,
        };
        path.as_deref().filter(|p| !p.as_os_str().is_empty())
    }
}

/// Resolved, validated absolute paths for the toolchain. Required tools are
/// always present; optional tools may be absent, with a note explaining why.
#[derive(Debug, Clone)]
pub struct ToolSet {
    pub linker: PathBuf,
    pub optimizer: PathBuf,
    pub codegen: PathBuf,
    pub archiver: Option<PathBuf>,
    pub objcopy: Option<PathBuf>,
    pub btf_annotator: Option<PathBuf>,
    pub notes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{}: override path does not exist: {}", .tool, .path.display())]
    OverrideNotFound { tool: Tool, path: PathBuf },
    #[error("{}: {} is not executable", .tool, .path.display())]
    NotExecutable { tool: Tool, path: PathBuf },
    #[error("{tool}: `{name}` not found on PATH")]
    NotOnPath { tool: Tool, name: &'static str },
    #[error("unsafe tool path {path:?}: contains {ch:?}")]
    UnsafePath { path: String, ch: char },
    #[error("tool basename {name:?} is not an allowed toolchain binary")]
    DisallowedName { name: String },
}

/// Strips a trailing `-<digits>(.<digits>)*` version suffix, as distributions
/// commonly append to LLVM binaries (`opt-18`, `llc-17.0.6`).
pub fn strip_version_suffix(name: &str) -> &str {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"-\d+(\.\d+)*$").expect("version suffix regex"));
    match re.find(name) {
        Some(m) if m.start() > 0 => &name[..m.start()],
        _ => name,
    }
}

/// Rejects paths carrying shell metacharacters and basenames outside the
/// allowed tool set.
pub fn validate_tool_path(path: &Path) -> Result<(), ResolveError> {
    let text = path.to_string_lossy();
    if let Some(ch) = text.chars().find(|c| UNSAFE_PATH_CHARS.contains(c)) {
        return Err(ResolveError::UnsafePath {
            path: text.into_owned(),
            ch,
        });
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let base = strip_version_suffix(name);
    if !ALLOWED_TOOLS.contains(&base) {
        return Err(ResolveError::DisallowedName {
            name: name.to_string(),
        });
    }
    Ok(())
}

pub fn find_in_path(prog: &str) -> Option<PathBuf> {
    find_in_dirs(std::env::var_os("PATH"), prog)
}

fn find_in_dirs(path_env: Option<OsString>, prog: &str) -> Option<PathBuf> {
    let path = path_env?;
    for dir in std::env::split_paths(&path) {
        let cand = dir.join(prog);
        if cand.is_file() && is_executable(&cand) {
            return Some(cand);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if let Ok(meta) = std::fs::metadata(path) {
            return meta.permissions().mode() & 0o111 != 0;
        }
        false
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Resolves a single tool: explicit override if given, else PATH lookup.
/// Returns `Ok(None)` only when no override was given and the canonical name
/// is not on PATH.
pub fn resolve_one(tool: Tool, override_path: Option<&Path>) -> Result<Option<PathBuf>, ResolveError> {
    if let Some(path) = override_path {
        validate_tool_path(path)?;
        if !path.exists() {
            return Err(ResolveError::OverrideNotFound {
                tool,
                path: path.to_path_buf(),
            });
        }
        if !is_executable(path) {
            return Err(ResolveError::NotExecutable {
                tool,
                path: path.to_path_buf(),
            });
        }
        return Ok(Some(path.to_path_buf()));
    }
    match find_in_path(tool.canonical_name()) {
        Some(path) => {
            validate_tool_path(&path)?;
            Ok(Some(path))
        }
        None => Ok(None),
    }
}

/// Resolves all six tools. Missing required tools and missing explicitly
/// overridden optional tools are fatal; optional tools absent from PATH are
/// recorded as notes.
pub fn resolve_toolset(overrides: &ToolOverrides) -> Result<ToolSet, ResolveError> {
    let mut notes = Vec::new();
    let required = |tool: Tool| -> Result<PathBuf, ResolveError> {
        match resolve_one(tool, overrides.get(tool))? {
            Some(path) => {
                debug!(tool = %tool, path = %path.display(), "resolved");
                Ok(path)
            }
            None => Err(ResolveError::NotOnPath {
                tool,
                name: tool.canonical_name(),
            }),
        }
    };
    let linker = required(Tool::Linker)?;
    let optimizer = required(Tool::Optimizer)?;
    let codegen = required(Tool::Codegen)?;

    let mut optional = |tool: Tool| -> Result<Option<PathBuf>, ResolveError> {
        let resolved = resolve_one(tool, overrides.get(tool))?;
        match &resolved {
            Some(path) => debug!(tool = %tool, path = %path.display(), "resolved"),
            None => notes.push(format!(
                "{tool}: `{}` not found on PATH; dependent features are disabled",
                tool.canonical_name()
            )),
        }
        Ok(resolved)
    };
    let archiver = optional(Tool::Archiver)?;
    let objcopy = optional(Tool::ObjCopy)?;
    let btf_annotator = optional(Tool::BtfAnnotator)?;

    Ok(ToolSet {
        linker,
        optimizer,
        codegen,
        archiver,
        objcopy,
        btf_annotator,
        notes,
    })
}
