//! Optimization-pass pipeline construction and validation.

use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Characters never valid in a pass name. The pass list becomes part of an
/// optimizer argument, and these must not survive into it.
const FORBIDDEN_PASS_CHARS: &[char] = &[
    '/', '\\', '$', '`', '|', ';', '&', '(', ')', '{', '}', '[', ']', '!', '~',
];

/// Subset applied to full pipeline strings, which legitimately contain
/// parentheses and commas.
const FORBIDDEN_PIPELINE_CHARS: &[char] = &['/', '\\', '$', '`', '|', ';', '&', '!', '~'];

/// Named optimization presets for the optimizer's pass pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[clap(rename_all = "kebab_case")]
#[serde(rename_all = "kebab-case")]
pub enum OptProfile {
    Conservative,
    Default,
    Aggressive,
    VerifierSafe,
}

/// Hand-picked pipeline without loop unrolling or vectorization; those
/// produce control flow the in-kernel verifier rejects.
const VERIFIER_SAFE_PIPELINE: &str = "function(mem2reg,sroa,early-cse,simplifycfg,instcombine,reassociate,gvn,sccp,adce,simplifycfg),globalopt,globaldce";

impl OptProfile {
    /// The optimizer pipeline string for this profile. `default` optimizes
    /// for size: eBPF programs are bounded by the verifier's instruction
    /// budget, not execution speed.
    pub fn pipeline(self) -> &'static str {
        match self {
            OptProfile::Conservative => "default<O1>",
            OptProfile::Default => "default<Oz>",
            OptProfile::Aggressive => "default<O3>",
            OptProfile::VerifierSafe => VERIFIER_SAFE_PIPELINE,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PassError {
    #[error("empty pass name")]
    Empty,
    #[error("pass name {name:?} contains forbidden character {ch:?}")]
    Forbidden { name: String, ch: char },
    #[error("pass name {name:?} does not match the pass grammar")]
    Syntax { name: String },
}

/// Validates a single pass name: optional leading dash, alphanumeric/dash
/// body, optional trailing `<...>` parameter list.
pub fn validate_pass_flag(name: &str) -> Result<(), PassError> {
    if name.is_empty() {
        return Err(PassError::Empty);
    }
    if let Some(ch) = name.chars().find(|c| FORBIDDEN_PASS_CHARS.contains(c)) {
        return Err(PassError::Forbidden {
            name: name.to_string(),
            ch,
        });
    }
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^-?[A-Za-z0-9][A-Za-z0-9-]*(<[A-Za-z0-9,=_-]*>)?$").expect("pass grammar regex")
    });
    if !re.is_match(name) {
        return Err(PassError::Syntax {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validates an explicit, user-supplied pipeline string. Structural
/// characters (`(` `)` `,` `<` `>`) are allowed; shell-relevant ones are not.
pub fn validate_pipeline_string(pipeline: &str) -> Result<(), PassError> {
    if pipeline.trim().is_empty() {
        return Err(PassError::Empty);
    }
    if let Some(ch) = pipeline.chars().find(|c| FORBIDDEN_PIPELINE_CHARS.contains(c)) {
        return Err(PassError::Forbidden {
            name: pipeline.to_string(),
            ch,
        });
    }
    Ok(())
}

/// The pipeline actually handed to the optimizer: an explicit string wins
/// over the profile preset.
pub fn resolve_pipeline(profile: OptProfile, explicit: Option<&str>) -> String {
    explicit.unwrap_or(profile.pipeline()).to_string()
}

/// Merges custom passes into the optimizer argument list as a single
/// `function(...)` fragment. An existing `-passes=` argument is extended in
/// place; otherwise exactly one new argument is prepended.
pub fn append_custom_passes(args: &mut Vec<String>, custom: &[String]) {
    if custom.is_empty() {
        return;
    }
    let fragment = format!("function({})", custom.join(","));
    for arg in args.iter_mut() {
        if let Some(existing) = arg.strip_prefix("-passes=") {
            *arg = if existing.is_empty() {
                format!("-passes={fragment}")
            } else {
                format!("-passes={existing},{fragment}")
            };
            return;
        }
    }
    args.insert(0, format!("-passes={fragment}"));
}
