use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use bpfbuild_driver::exec::{CancelToken, SystemRunner};
use bpfbuild_driver::passes::OptProfile;
use bpfbuild_driver::pipeline::{run_build, BpfCpu, RunConfig};
use bpfbuild_driver::toolchain::ToolOverrides;

/// Extensions recognized when an input is a directory.
const INPUT_EXTENSIONS: &[&str] = &["bc", "ll", "o", "a"];

#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
    /// Input IR modules, objects, or archives; directories are searched.
    #[arg(long, value_name = "PATH", required = true)]
    pub input: Vec<PathBuf>,

    #[arg(long, value_name = "PATH", default_value = "bpf.o")]
    pub output: PathBuf,

    /// Target BPF processor variant.
    #[arg(long, value_enum, default_value_t = BpfCpu::Generic)]
    pub cpu: BpfCpu,

    /// Optimization profile.
    #[arg(long, value_enum, default_value_t = OptProfile::Default)]
    pub profile: OptProfile,

    /// Explicit optimizer pipeline; overrides --profile.
    #[arg(long, value_name = "PIPELINE")]
    pub passes: Option<String>,

    /// Additional pass merged into the pipeline (repeatable).
    #[arg(long = "custom-pass", value_name = "PASS")]
    pub custom_pass: Vec<String>,

    /// JSON config file naming custom passes.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Program to retain (repeatable; auto-detected from symbols if omitted).
    #[arg(long = "program", value_name = "NAME")]
    pub program: Vec<String>,

    /// Program-to-section mapping, as NAME=SECTION (repeatable).
    #[arg(long = "section-map", value_name = "NAME=SECTION")]
    pub section_map: Vec<String>,

    /// Per-stage timeout in seconds (0 selects the default).
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Normalization parallelism.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub jobs: usize,

    /// Scratch directory (created if absent, always retained).
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Keep the auto-created scratch directory for inspection.
    #[arg(long)]
    pub keep_workdir: bool,

    /// Inject BTF debug type information (requires pahole).
    #[arg(long)]
    pub btf: bool,

    /// Override the bitcode linker binary.
    #[arg(long, value_name = "PATH")]
    pub linker: Option<PathBuf>,

    /// Override the optimizer binary.
    #[arg(long, value_name = "PATH")]
    pub optimizer: Option<PathBuf>,

    /// Override the code generator binary.
    #[arg(long, value_name = "PATH")]
    pub codegen: Option<PathBuf>,

    /// Override the archiver binary.
    #[arg(long, value_name = "PATH")]
    pub archiver: Option<PathBuf>,

    /// Override the object-copy binary.
    #[arg(long, value_name = "PATH")]
    pub objcopy: Option<PathBuf>,

    /// Override the BTF annotator binary.
    #[arg(long, value_name = "PATH")]
    pub btf_annotator: Option<PathBuf>,

    /// Write the JSON build report here instead of stdout.
    #[arg(long, value_name = "PATH")]
    pub report_out: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct BuildReport {
    ok: bool,
    command: &'static str,
    output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    workdir: Option<String>,
    output_size: u64,
    sha256: String,
    duration_ms: u64,
}

pub fn cmd_build(args: BuildArgs) -> Result<ExitCode> {
    let started = Instant::now();

    let inputs = collect_inputs(&args.input).context("collect inputs")?;
    let section_map = parse_section_maps(&args.section_map)?;

    let config = RunConfig {
        inputs,
        output: args.output.clone(),
        cpu: args.cpu,
        programs: args.program.clone(),
        section_map,
        profile: args.profile,
        pipeline: args.passes.clone(),
        custom_passes: args.custom_pass.clone(),
        config_file: args.config.clone(),
        stage_timeout: Duration::from_secs(args.timeout_secs),
        jobs: args.jobs,
        workdir: args.workdir.clone(),
        keep_workdir: args.keep_workdir,
        inject_btf: args.btf,
        tools: ToolOverrides {
            linker: args.linker.clone(),
            optimizer: args.optimizer.clone(),
            codegen: args.codegen.clone(),
            archiver: args.archiver.clone(),
            objcopy: args.objcopy.clone(),
            btf_annotator: args.btf_annotator.clone(),
        },
    };

    let artifacts = match run_build(&config, &SystemRunner, &CancelToken::new()) {
        Ok(artifacts) => artifacts,
        Err(err) => {
            eprintln!("bpfbuild: {err}");
            return Ok(ExitCode::from(1));
        }
    };

    let bytes = std::fs::read(&artifacts.output)
        .with_context(|| format!("read output: {}", artifacts.output.display()))?;
    let report = BuildReport {
        ok: true,
        command: "build",
        output: artifacts.output.display().to_string(),
        workdir: artifacts.workdir.map(|p| p.display().to_string()),
        output_size: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
        duration_ms: started.elapsed().as_millis() as u64,
    };

    let mut out = serde_json::to_vec(&report)?;
    out.push(b'\n');
    match args.report_out.as_deref() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create report dir: {}", parent.display()))?;
                }
            }
            std::fs::write(path, &out).with_context(|| format!("write: {}", path.display()))?;
        }
        None => {
            std::io::Write::write_all(&mut std::io::stdout(), &out).context("write stdout")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for input in inputs {
        if input.is_file() {
            if seen.insert(input.clone()) {
                out.push(input.clone());
            }
            continue;
        }
        if input.is_dir() {
            let mut files: Vec<PathBuf> = Vec::new();
            for entry in WalkDir::new(input).follow_links(false).into_iter().flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.into_path();
                if path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| INPUT_EXTENSIONS.contains(&e))
                {
                    files.push(path);
                }
            }
            files.sort();
            for file in files {
                if seen.insert(file.clone()) {
                    out.push(file);
                }
            }
            continue;
        }

        anyhow::bail!(
            "--input does not exist or is not a file/dir: {}",
            input.display()
        );
    }

    if out.is_empty() {
        anyhow::bail!("no linkable inputs found");
    }

    Ok(out)
}

fn parse_section_maps(entries: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for entry in entries {
        let Some((name, section)) = entry.split_once('=') else {
            anyhow::bail!("--section-map expects NAME=SECTION, got {entry:?}");
        };
        if name.is_empty() || section.is_empty() {
            anyhow::bail!("--section-map expects NAME=SECTION, got {entry:?}");
        }
        map.insert(name.to_string(), section.to_string());
    }
    Ok(map)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TMP_N: AtomicUsize = AtomicUsize::new(0);

    fn tmp_root(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let n = TMP_N.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("bpfbuild_cli_{prefix}_{pid}_{n}"))
    }

    #[test]
    fn collect_inputs_walks_dirs_sorted_and_dedupes() {
        let root = tmp_root("collect");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        let a = root.join("a.bc");
        let b = root.join("sub/b.o");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        std::fs::write(root.join("notes.txt"), b"x").unwrap();

        let got = collect_inputs(std::slice::from_ref(&root)).unwrap();
        assert_eq!(got, vec![a.clone(), b.clone()]);

        // Passing a file twice keeps a single entry.
        let got = collect_inputs(&[a.clone(), root.clone()]).unwrap();
        assert_eq!(got, vec![a, b]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn collect_inputs_rejects_missing_paths() {
        let missing = tmp_root("missing").join("nope.bc");
        assert!(collect_inputs(&[missing]).is_err());
    }

    #[test]
    fn section_map_entries_parse() {
        let map = parse_section_maps(&[
            "xdp_filter=xdp".to_string(),
            "probe_open=kprobe/sys_open".to_string(),
        ])
        .unwrap();
        assert_eq!(map.get("xdp_filter").unwrap(), "xdp");
        assert_eq!(map.get("probe_open").unwrap(), "kprobe/sys_open");
        assert!(parse_section_maps(&["nosep".to_string()]).is_err());
        assert!(parse_section_maps(&["=xdp".to_string()]).is_err());
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
