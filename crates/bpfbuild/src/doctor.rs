use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use bpfbuild_driver::exec::{CancelToken, SystemRunner, ToolRunner};
use bpfbuild_driver::toolchain::{resolve_one, Tool};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Args)]
pub struct DoctorArgs {}

#[derive(Debug, Serialize)]
struct DoctorReport {
    ok: bool,
    command: &'static str,
    tools: Vec<ToolCheck>,
    suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ToolCheck {
    name: &'static str,
    binary: &'static str,
    required: bool,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

pub fn cmd_doctor(_args: DoctorArgs) -> Result<ExitCode> {
    let runner = SystemRunner;
    let cancel = CancelToken::new();

    let mut tools = Vec::new();
    let mut ok = true;
    // Tool::ALL fixes the listing order; never iterate a map here.
    for tool in Tool::ALL {
        let resolved = resolve_one(tool, None).unwrap_or(None);
        let found = resolved.is_some();
        if tool.is_required() && !found {
            ok = false;
        }
        let version = resolved
            .as_deref()
            .and_then(|path| probe_version(&runner, &cancel, path));
        tools.push(ToolCheck {
            name: tool.label(),
            binary: tool.canonical_name(),
            required: tool.is_required(),
            ok: found,
            path: resolved.map(|p| p.display().to_string()),
            version,
        });
    }

    let mut suggestions = Vec::new();
    if !ok {
        suggestions.push(
            "Install LLVM (llvm-link, opt, llc) and ensure the binaries are on PATH.".to_string(),
        );
    }
    if tools.iter().any(|t| t.binary == "pahole" && !t.ok) {
        suggestions.push("Install dwarves (pahole) to enable BTF injection.".to_string());
    }

    let report = DoctorReport {
        ok,
        command: "doctor",
        tools,
        suggestions,
    };

    let mut bytes = serde_json::to_vec(&report)?;
    bytes.push(b'\n');
    std::io::Write::write_all(&mut std::io::stdout(), &bytes).context("write stdout")?;

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn probe_version(runner: &SystemRunner, cancel: &CancelToken, path: &Path) -> Option<String> {
    let out = runner
        .run(
            path,
            &["--version".to_string()],
            VERSION_PROBE_TIMEOUT,
            cancel,
        )
        .ok()?;
    out.stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
