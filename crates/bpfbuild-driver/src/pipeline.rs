//! The staged build pipeline: resolve, normalize, link, optimize, codegen,
//! optional BTF/section post-processing, and output validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{load_linker_config, ConfigError};
use crate::elf_check::{self, ElfCheckError};
use crate::exec::{CancelToken, CommandOutput, ExecError, ToolRunner, DEFAULT_STAGE_TIMEOUT};
use crate::passes::{
    append_custom_passes, resolve_pipeline, validate_pass_flag, validate_pipeline_string,
    OptProfile, PassError,
};
use crate::toolchain::{resolve_toolset, ResolveError, ToolOverrides, ToolSet};

/// BPF processor variants understood by the code generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[clap(rename_all = "kebab_case")]
#[serde(rename_all = "kebab-case")]
pub enum BpfCpu {
    #[default]
    Generic,
    Probe,
    V1,
    V2,
    V3,
}

impl BpfCpu {
    pub fn as_str(self) -> &'static str {
        match self {
            BpfCpu::Generic => "generic",
            BpfCpu::Probe => "probe",
            BpfCpu::V1 => "v1",
            BpfCpu::V2 => "v2",
            BpfCpu::V3 => "v3",
        }
    }
}

impl fmt::Display for BpfCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One full build run's configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Linkable IR/object/archive modules, in link order. At least one.
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub cpu: BpfCpu,
    /// Programs to retain; auto-detected from exported symbols when empty.
    pub programs: Vec<String>,
    /// Program name to BPF section name. Ordered so remap application order
    /// is deterministic.
    pub section_map: BTreeMap<String, String>,
    pub profile: OptProfile,
    /// Explicit optimizer pipeline; overrides `profile` when set.
    pub pipeline: Option<String>,
    pub custom_passes: Vec<String>,
    /// Optional JSON config contributing more custom passes.
    pub config_file: Option<PathBuf>,
    pub stage_timeout: Duration,
    /// Normalization worker count; clamped to at least 1.
    pub jobs: usize,
    /// Caller-owned scratch directory; auto-created and cleaned when `None`.
    pub workdir: Option<PathBuf>,
    pub keep_workdir: bool,
    pub inject_btf: bool,
    pub tools: ToolOverrides,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output: PathBuf::from("bpf.o"),
            cpu: BpfCpu::default(),
            programs: Vec::new(),
            section_map: BTreeMap::new(),
            profile: OptProfile::Default,
            pipeline: None,
            custom_passes: Vec::new(),
            config_file: None,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            jobs: 1,
            workdir: None,
            keep_workdir: false,
            inject_btf: false,
            tools: ToolOverrides::default(),
        }
    }
}

/// Outputs reported to the caller on success.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub output: PathBuf,
    /// Scratch directory, when retained.
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Resolve,
    Config,
    Workdir,
    Normalize,
    Link,
    Optimize,
    Codegen,
    BtfInject,
    SectionRemap,
    Validate,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Config => "config",
            Stage::Workdir => "workdir",
            Stage::Normalize => "normalize",
            Stage::Link => "link",
            Stage::Optimize => "optimize",
            Stage::Codegen => "codegen",
            Stage::BtfInject => "btf-inject",
            Stage::SectionRemap => "section-remap",
            Stage::Validate => "validate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no input modules given")]
    NoInputs,
    #[error("input module not found: {}", .0.display())]
    InputNotFound(PathBuf),
    #[error("invalid pass: {0}")]
    InvalidPass(#[from] PassError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("btf injection requested but `pahole` is unavailable")]
    BtfToolMissing,
    #[error("archive input {} requires `llvm-ar`, which is unavailable", .input.display())]
    ArchiveNeedsArchiver { input: PathBuf },
    #[error("{message}: {source}")]
    Filesystem {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: ExecError,
    },
    #[error("build canceled")]
    Canceled,
    #[error("output validation failed: {0}")]
    Validation(#[from] ElfCheckError),
}

fn stage_result(
    stage: Stage,
    result: Result<CommandOutput, ExecError>,
) -> Result<CommandOutput, BuildError> {
    match result {
        Ok(out) => Ok(out),
        Err(ExecError::Canceled { .. }) => Err(BuildError::Canceled),
        Err(source) => Err(BuildError::Stage { stage, source }),
    }
}

fn fs_err(message: String) -> impl FnOnce(std::io::Error) -> BuildError {
    move |source| BuildError::Filesystem { message, source }
}

/// Scratch directory for one run. Caller-supplied directories are always
/// retained; auto-created ones are removed on drop unless retention was
/// requested.
struct Workdir {
    path: PathBuf,
    owned: bool,
    keep: bool,
}

impl Workdir {
    fn prepare(config: &RunConfig) -> Result<Self, BuildError> {
        if let Some(dir) = &config.workdir {
            std::fs::create_dir_all(dir)
                .map_err(fs_err(format!("create workdir {}", dir.display())))?;
            return Ok(Self {
                path: dir.clone(),
                owned: false,
                keep: true,
            });
        }

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let base = std::env::temp_dir();
        let pid = std::process::id();
        for _ in 0..10_000 {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = base.join(format!("bpfbuild_{pid}_{n}"));
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    return Ok(Self {
                        path,
                        owned: true,
                        keep: config.keep_workdir,
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(BuildError::Filesystem {
                        message: format!("create temp workdir {}", path.display()),
                        source,
                    })
                }
            }
        }
        Err(BuildError::Filesystem {
            message: format!("no unique temp workdir under {}", base.display()),
            source: std::io::Error::other("name space exhausted"),
        })
    }

    fn retained_path(&self) -> Option<PathBuf> {
        (self.keep || !self.owned).then(|| self.path.clone())
    }
}

impl Drop for Workdir {
    fn drop(&mut self) {
        if self.owned && !self.keep {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Runs the whole pipeline. Blocks until the build completes, fails, or the
/// token is canceled. On failure any output file written by this run is
/// removed so a broken object never masquerades as a successful build.
pub fn run_build(
    config: &RunConfig,
    runner: &dyn ToolRunner,
    cancel: &CancelToken,
) -> Result<Artifacts, BuildError> {
    let mut output_written = false;
    let result = run_build_inner(config, runner, cancel, &mut output_written);
    if result.is_err() && output_written {
        let _ = std::fs::remove_file(&config.output);
    }
    result
}

fn run_build_inner(
    config: &RunConfig,
    runner: &dyn ToolRunner,
    cancel: &CancelToken,
    output_written: &mut bool,
) -> Result<Artifacts, BuildError> {
    let started = Instant::now();

    if cancel.is_canceled() {
        return Err(BuildError::Canceled);
    }
    if config.inputs.is_empty() {
        return Err(BuildError::NoInputs);
    }
    for pass in &config.custom_passes {
        validate_pass_flag(pass)?;
    }
    if let Some(pipeline) = config.pipeline.as_deref() {
        validate_pipeline_string(pipeline)?;
    }

    info!("resolving toolchain");
    let tools = resolve_toolset(&config.tools)?;
    for note in &tools.notes {
        info!("{note}");
    }
    if config.inject_btf && tools.btf_annotator.is_none() {
        return Err(BuildError::BtfToolMissing);
    }

    let mut custom_passes = config.custom_passes.clone();
    if let Some(path) = &config.config_file {
        let loaded = load_linker_config(path)?;
        debug!(
            count = loaded.custom_passes.len(),
            config = %path.display(),
            "merged custom passes from config"
        );
        custom_passes.extend(loaded.custom_passes);
    }

    for input in &config.inputs {
        if !input.is_file() {
            return Err(BuildError::InputNotFound(input.clone()));
        }
    }

    let workdir = Workdir::prepare(config)?;
    debug!(workdir = %workdir.path.display(), "prepared scratch directory");

    let timeout = if config.stage_timeout.is_zero() {
        DEFAULT_STAGE_TIMEOUT
    } else {
        config.stage_timeout
    };

    let normalized = normalize_inputs(config, &tools, runner, cancel, &workdir.path, timeout)?;

    if cancel.is_canceled() {
        return Err(BuildError::Canceled);
    }
    let linked = workdir.path.join("linked.bc");
    let mut link_args: Vec<String> = normalized.iter().map(|p| p.display().to_string()).collect();
    link_args.push("-o".to_string());
    link_args.push(linked.display().to_string());
    info!(modules = normalized.len(), "linking");
    stage_result(Stage::Link, runner.run(&tools.linker, &link_args, timeout, cancel))?;

    let optimized = workdir.path.join("optimized.bc");
    let mut opt_args = vec![format!(
        "-passes={}",
        resolve_pipeline(config.profile, config.pipeline.as_deref())
    )];
    append_custom_passes(&mut opt_args, &custom_passes);
    opt_args.push(linked.display().to_string());
    opt_args.push("-o".to_string());
    opt_args.push(optimized.display().to_string());
    info!(profile = ?config.profile, "optimizing");
    stage_result(
        Stage::Optimize,
        runner.run(&tools.optimizer, &opt_args, timeout, cancel),
    )?;

    if let Some(parent) = config.output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(fs_err(format!("create output dir {}", parent.display())))?;
        }
    }
    let codegen_args = vec![
        "-march=bpf".to_string(),
        format!("-mcpu={}", config.cpu),
        "-filetype=obj".to_string(),
        optimized.display().to_string(),
        "-o".to_string(),
        config.output.display().to_string(),
    ];
    info!(cpu = %config.cpu, "generating code");
    stage_result(
        Stage::Codegen,
        runner.run(&tools.codegen, &codegen_args, timeout, cancel),
    )?;
    *output_written = true;

    if config.inject_btf {
        let annotator = tools
            .btf_annotator
            .as_ref()
            .ok_or(BuildError::BtfToolMissing)?;
        info!("injecting BTF");
        stage_result(
            Stage::BtfInject,
            runner.run(
                annotator,
                &["-J".to_string(), config.output.display().to_string()],
                timeout,
                cancel,
            ),
        )?;
    }

    remap_sections(config, &tools, runner, cancel, timeout)?;

    elf_check::validate_object(&config.output)?;

    let artifacts = Artifacts {
        output: config.output.clone(),
        workdir: workdir.retained_path(),
    };
    info!(
        output = %artifacts.output.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "build complete"
    );
    Ok(artifacts)
}

/// Converts each input into a linker-consumable module. Workers run
/// concurrently up to the configured parallelism; the returned paths are in
/// original input order regardless of completion order, so the link stage is
/// deterministic.
fn normalize_inputs(
    config: &RunConfig,
    tools: &ToolSet,
    runner: &dyn ToolRunner,
    cancel: &CancelToken,
    workdir: &Path,
    timeout: Duration,
) -> Result<Vec<PathBuf>, BuildError> {
    let jobs = config.jobs.max(1).min(config.inputs.len());
    info!(inputs = config.inputs.len(), jobs = jobs, "normalizing inputs");

    if jobs <= 1 {
        let mut out = Vec::with_capacity(config.inputs.len());
        for (index, input) in config.inputs.iter().enumerate() {
            if cancel.is_canceled() {
                return Err(BuildError::Canceled);
            }
            out.push(normalize_one(
                input, index, tools, runner, cancel, workdir, timeout,
            )?);
        }
        return Ok(out);
    }

    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<(usize, PathBuf)>> = Mutex::new(Vec::with_capacity(config.inputs.len()));
    let first_err: Mutex<Option<BuildError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..jobs {
            scope.spawn(|| loop {
                if cancel.is_canceled() {
                    return;
                }
                if let Ok(guard) = first_err.lock() {
                    if guard.is_some() {
                        return;
                    }
                }
                let index = next.fetch_add(1, Ordering::Relaxed);
                if index >= config.inputs.len() {
                    return;
                }
                let input = &config.inputs[index];
                match normalize_one(input, index, tools, runner, cancel, workdir, timeout) {
                    Ok(path) => {
                        if let Ok(mut guard) = results.lock() {
                            guard.push((index, path));
                        }
                    }
                    Err(err) => {
                        if let Ok(mut guard) = first_err.lock() {
                            if guard.is_none() {
                                *guard = Some(err);
                            }
                        }
                        return;
                    }
                }
            });
        }
    });

    if let Some(err) = first_err.into_inner().unwrap_or_else(|e| e.into_inner()) {
        return Err(err);
    }
    if cancel.is_canceled() {
        return Err(BuildError::Canceled);
    }
    let mut results = results.into_inner().unwrap_or_else(|e| e.into_inner());
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, path)| path).collect())
}

fn normalize_one(
    input: &Path,
    index: usize,
    tools: &ToolSet,
    runner: &dyn ToolRunner,
    cancel: &CancelToken,
    workdir: &Path,
    timeout: Duration,
) -> Result<PathBuf, BuildError> {
    let out = workdir.join(format!("norm_{index}.bc"));
    let is_archive = input
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("a"));

    if is_archive {
        let archiver = tools
            .archiver
            .as_ref()
            .ok_or_else(|| BuildError::ArchiveNeedsArchiver {
                input: input.to_path_buf(),
            })?;
        let member_dir = workdir.join(format!("members_{index}"));
        std::fs::create_dir_all(&member_dir)
            .map_err(fs_err(format!("create {}", member_dir.display())))?;
        let extract_args = vec![
            "x".to_string(),
            "--output".to_string(),
            member_dir.display().to_string(),
            input.display().to_string(),
        ];
        stage_result(
            Stage::Normalize,
            runner.run(archiver, &extract_args, timeout, cancel),
        )?;

        let mut members: Vec<PathBuf> = std::fs::read_dir(&member_dir)
            .map_err(fs_err(format!("list {}", member_dir.display())))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        members.sort();
        let mut link_args: Vec<String> = members.iter().map(|p| p.display().to_string()).collect();
        link_args.push("-o".to_string());
        link_args.push(out.display().to_string());
        stage_result(
            Stage::Normalize,
            runner.run(&tools.linker, &link_args, timeout, cancel),
        )?;
    } else {
        let args = vec![
            "-passes=verify".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            out.display().to_string(),
        ];
        stage_result(
            Stage::Normalize,
            runner.run(&tools.optimizer, &args, timeout, cancel),
        )?;
    }
    Ok(out)
}

/// Renames each retained program's code section per the configured mapping.
/// Degrades to a logged skip when the object copier is unavailable.
fn remap_sections(
    config: &RunConfig,
    tools: &ToolSet,
    runner: &dyn ToolRunner,
    cancel: &CancelToken,
    timeout: Duration,
) -> Result<(), BuildError> {
    let Some(objcopy) = tools.objcopy.as_ref() else {
        if !config.programs.is_empty() || !config.section_map.is_empty() {
            info!("`llvm-objcopy` unavailable; leaving program sections unrenamed");
        }
        return Ok(());
    };

    let programs = if config.programs.is_empty() {
        elf_check::detect_programs(&config.output)?
    } else {
        config.programs.clone()
    };
    if programs.is_empty() {
        return Ok(());
    }

    for name in &programs {
        let target = config
            .section_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| format!("prog/{name}"));
        debug!(program = %name, section = %target, "renaming program section");
        let args = vec![
            format!("--rename-section=.text.{name}={target}"),
            config.output.display().to_string(),
        ];
        stage_result(
            Stage::SectionRemap,
            runner.run(objcopy, &args, timeout, cancel),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use std::sync::atomic::AtomicUsize;

    static TMP_N: AtomicUsize = AtomicUsize::new(0);

    fn tmp_root(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let n = TMP_N.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("bpfbuild_pipe_{prefix}_{pid}_{n}"));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    /// Records invocations and emulates the toolchain by writing files: the
    /// codegen tool emits a prebuilt BPF object, everything else touches its
    /// `-o` argument.
    struct FakeRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        object_bytes: Vec<u8>,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                object_bytes: crate::elf_check::testobj::bpf_object(&["prog_main"]),
            }
        }

        fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ToolRunner for FakeRunner {
        fn run(
            &self,
            program: &Path,
            args: &[String],
            _timeout: Duration,
            _cancel: &CancelToken,
        ) -> Result<CommandOutput, ExecError> {
            let name = program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.calls
                .lock()
                .unwrap()
                .push((name.clone(), args.to_vec()));

            let out = args
                .windows(2)
                .find(|w| w[0] == "-o")
                .map(|w| PathBuf::from(&w[1]));
            if let Some(out) = out {
                let bytes: &[u8] = if name.starts_with("llc") {
                    &self.object_bytes
                } else {
                    b"BC\xc0\xde"
                };
                std::fs::write(&out, bytes).unwrap();
            }
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                command: crate::exec::display_command(program, args),
            })
        }
    }

    #[cfg(unix)]
    fn stub_tools(root: &Path) -> ToolOverrides {
        use std::os::unix::fs::PermissionsExt as _;
        let mut make = |name: &str| -> PathBuf {
            let path = root.join(name);
            std::fs::write(&path, b"#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        ToolOverrides {
            linker: Some(make("llvm-link")),
            optimizer: Some(make("opt")),
            codegen: Some(make("llc")),
            archiver: Some(make("llvm-ar")),
            objcopy: Some(make("llvm-objcopy")),
            btf_annotator: Some(make("pahole")),
        }
    }

    fn write_input(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        std::fs::write(&path, b"BC\xc0\xde").unwrap();
        path
    }

    #[test]
    fn zero_inputs_fail_before_anything_runs() {
        let runner = FakeRunner::new();
        let config = RunConfig::default();
        let err = run_build(&config, &runner, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, BuildError::NoInputs));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn invalid_inline_custom_pass_fails_before_anything_runs() {
        let runner = FakeRunner::new();
        let config = RunConfig {
            inputs: vec![PathBuf::from("a.bc")],
            custom_passes: vec!["-inline;rm".to_string()],
            ..RunConfig::default()
        };
        let err = run_build(&config, &runner, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidPass(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn canceled_token_short_circuits() {
        let runner = FakeRunner::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let config = RunConfig {
            inputs: vec![PathBuf::from("a.bc")],
            ..RunConfig::default()
        };
        let err = run_build(&config, &runner, &cancel).unwrap_err();
        assert!(matches!(err, BuildError::Canceled));
        assert!(runner.calls().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn end_to_end_produces_validated_object() {
        let root = tmp_root("e2e");
        let runner = FakeRunner::new();
        let config = RunConfig {
            inputs: vec![write_input(&root, "a.bc"), write_input(&root, "b.bc")],
            output: root.join("out").join("bpf.o"),
            jobs: 2,
            tools: stub_tools(&root),
            workdir: Some(root.join("work")),
            ..RunConfig::default()
        };

        let artifacts = run_build(&config, &runner, &CancelToken::new()).unwrap();
        assert_eq!(artifacts.output, config.output);
        assert_eq!(artifacts.workdir, Some(root.join("work")));
        crate::elf_check::validate_object(&artifacts.output).unwrap();

        let calls = runner.calls();
        // Two normalizations, one link, one optimize, one codegen, then one
        // section rename for the detected program.
        let link_call = calls
            .iter()
            .find(|(name, _)| name == "llvm-link")
            .expect("link invoked");
        let norm_args: Vec<&String> = link_call
            .1
            .iter()
            .filter(|a| a.contains("norm_"))
            .collect();
        assert_eq!(norm_args.len(), 2);
        assert!(norm_args[0].contains("norm_0"));
        assert!(norm_args[1].contains("norm_1"));

        let remap = calls
            .iter()
            .find(|(name, _)| name == "llvm-objcopy")
            .expect("objcopy invoked");
        assert_eq!(remap.1[0], "--rename-section=.text.prog_main=prog/prog_main");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn link_order_matches_input_order_for_any_pool_size() {
        let mut orders = Vec::new();
        for jobs in [1usize, 4] {
            let root = tmp_root("order");
            let runner = FakeRunner::new();
            let inputs: Vec<PathBuf> = (0..4)
                .map(|i| write_input(&root, &format!("m{i}.bc")))
                .collect();
            let config = RunConfig {
                inputs,
                output: root.join("bpf.o"),
                jobs,
                tools: stub_tools(&root),
                ..RunConfig::default()
            };
            run_build(&config, &runner, &CancelToken::new()).unwrap();
            let calls = runner.calls();
            let link_call = calls
                .iter()
                .find(|(name, _)| name == "llvm-link")
                .expect("link invoked");
            let norm_order: Vec<String> = link_call
                .1
                .iter()
                .filter(|a| a.contains("norm_"))
                .map(|a| {
                    Path::new(a)
                        .file_name()
                        .unwrap()
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();
            orders.push(norm_order);
            let _ = std::fs::remove_dir_all(&root);
        }
        assert_eq!(orders[0], orders[1]);
        assert_eq!(
            orders[0],
            vec!["norm_0.bc", "norm_1.bc", "norm_2.bc", "norm_3.bc"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn config_file_injection_fails_before_any_tool_runs() {
        let root = tmp_root("cfg");
        let runner = FakeRunner::new();
        let config_path = root.join("bpfbuild.json");
        std::fs::write(
            &config_path,
            br#"{"custom_passes": ["-inline;rm"]}"#,
        )
        .unwrap();
        let config = RunConfig {
            inputs: vec![write_input(&root, "a.bc")],
            output: root.join("bpf.o"),
            config_file: Some(config_path),
            tools: stub_tools(&root),
            ..RunConfig::default()
        };
        let err = run_build(&config, &runner, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, BuildError::Config(ConfigError::InvalidPass { .. })));
        assert!(runner.calls().is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn btf_requested_without_annotator_is_fatal() {
        let root = tmp_root("btf");
        let runner = FakeRunner::new();
        let mut tools = stub_tools(&root);
        tools.btf_annotator = None;
        // Only meaningful when pahole is genuinely absent from PATH.
        if crate::toolchain::find_in_path("pahole").is_some() {
            return;
        }
        let config = RunConfig {
            inputs: vec![write_input(&root, "a.bc")],
            output: root.join("bpf.o"),
            inject_btf: true,
            tools,
            ..RunConfig::default()
        };
        let err = run_build(&config, &runner, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, BuildError::BtfToolMissing));
        assert!(runner.calls().is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn btf_override_that_does_not_exist_is_fatal() {
        let root = tmp_root("btf_override");
        let runner = FakeRunner::new();
        let mut tools = stub_tools(&root);
        tools.btf_annotator = Some(root.join("pahole-missing").join("pahole"));
        let config = RunConfig {
            inputs: vec![write_input(&root, "a.bc")],
            output: root.join("bpf.o"),
            inject_btf: true,
            tools,
            ..RunConfig::default()
        };
        let err = run_build(&config, &runner, &CancelToken::new()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Resolve(ResolveError::OverrideNotFound { .. })
        ));
        assert!(runner.calls().is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn normalization_failure_names_the_stage() {
        struct FailingRunner;
        impl ToolRunner for FailingRunner {
            fn run(
                &self,
                program: &Path,
                args: &[String],
                _timeout: Duration,
                _cancel: &CancelToken,
            ) -> Result<CommandOutput, ExecError> {
                Err(ExecError::NonZeroExit {
                    command: crate::exec::display_command(program, args),
                    status: 1,
                    stdout: String::new(),
                    stderr: "broken bitcode".to_string(),
                })
            }
        }

        let root = tmp_root("stagefail");
        let config = RunConfig {
            inputs: vec![write_input(&root, "a.bc"), write_input(&root, "b.bc")],
            output: root.join("bpf.o"),
            jobs: 2,
            tools: stub_tools(&root),
            ..RunConfig::default()
        };
        let err = run_build(&config, &FailingRunner, &CancelToken::new()).unwrap_err();
        match err {
            BuildError::Stage { stage, source } => {
                assert_eq!(stage, Stage::Normalize);
                assert!(source.to_string().contains("broken bitcode"));
            }
            other => panic!("expected stage error, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn archive_input_without_archiver_fails() {
        let root = tmp_root("archive");
        let runner = FakeRunner::new();
        let mut tools = stub_tools(&root);
        tools.archiver = None;
        let archive = root.join("lib.a");
        std::fs::write(&archive, b"!<arch>\n").unwrap();
        // With no override, PATH may or may not carry llvm-ar; force absence
        // by scrubbing PATH for this resolution is not possible in-process,
        // so only run the assertion when llvm-ar is genuinely absent.
        if crate::toolchain::find_in_path("llvm-ar").is_some() {
            return;
        }
        let config = RunConfig {
            inputs: vec![archive.clone()],
            output: root.join("bpf.o"),
            tools,
            ..RunConfig::default()
        };
        let err = run_build(&config, &runner, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, BuildError::ArchiveNeedsArchiver { .. }));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn failed_validation_removes_the_output() {
        /// Emits a non-ELF file from the codegen stage.
        struct BadObjectRunner;
        impl ToolRunner for BadObjectRunner {
            fn run(
                &self,
                program: &Path,
                args: &[String],
                _timeout: Duration,
                _cancel: &CancelToken,
            ) -> Result<CommandOutput, ExecError> {
                if let Some(w) = args.windows(2).find(|w| w[0] == "-o") {
                    std::fs::write(&w[1], b"garbage").unwrap();
                }
                Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    command: crate::exec::display_command(program, args),
                })
            }
        }

        let root = tmp_root("badout");
        let config = RunConfig {
            inputs: vec![write_input(&root, "a.bc")],
            output: root.join("bpf.o"),
            tools: stub_tools(&root),
            ..RunConfig::default()
        };
        let err = run_build(&config, &BadObjectRunner, &CancelToken::new()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Validation(ElfCheckError::NotElf { .. })
        ));
        assert!(!config.output.exists(), "broken output must be removed");
        let _ = std::fs::remove_dir_all(&root);
    }
}
