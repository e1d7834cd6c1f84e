use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

const CONFIG_FILE: &str = "bpfbuild.json";

const CONFIG_TEMPLATE: &str = "{\n  \"custom_passes\": []\n}\n";

const SAMPLE_PROGRAM: &str = r#"// Minimal XDP pass-through program.
//
// Compile to bitcode, then build the object:
//   clang -O2 -g -target bpf -emit-llvm -c src/prog.bpf.c -o prog.bc
//   bpfbuild build --input prog.bc --output bpf.o

struct xdp_md;

#define SEC(name) __attribute__((section(name), used))

SEC("xdp")
int xdp_pass(struct xdp_md *ctx)
{
    return 2; /* XDP_PASS */
}

char _license[] SEC("license") = "GPL";
"#;

const GITIGNORE: &str = "*.bc\n*.o\n";

#[derive(Debug, Clone, Args)]
pub struct InitArgs {
    /// Directory to scaffold (created if absent).
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub path: std::path::PathBuf,
}

#[derive(Debug, Serialize)]
struct InitReport {
    ok: bool,
    command: &'static str,
    root: String,
    created: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    notes: Vec<String>,
}

pub fn cmd_init(args: InitArgs) -> Result<ExitCode> {
    let root = &args.path;
    let config_path = root.join(CONFIG_FILE);
    if config_path.exists() {
        anyhow::bail!("refusing to overwrite existing {}", config_path.display());
    }

    std::fs::create_dir_all(root.join("src"))
        .with_context(|| format!("create {}", root.join("src").display()))?;

    let mut created = Vec::new();
    let mut notes = Vec::new();

    write_new(&config_path, CONFIG_TEMPLATE, &mut created)?;
    let prog_path = root.join("src").join("prog.bpf.c");
    if prog_path.exists() {
        notes.push(format!("kept existing {}", prog_path.display()));
    } else {
        write_new(&prog_path, SAMPLE_PROGRAM, &mut created)?;
    }
    let gitignore_path = root.join(".gitignore");
    if gitignore_path.exists() {
        notes.push(format!("kept existing {}", gitignore_path.display()));
    } else {
        write_new(&gitignore_path, GITIGNORE, &mut created)?;
    }

    let report = InitReport {
        ok: true,
        command: "init",
        root: root.display().to_string(),
        created,
        notes,
    };
    let mut bytes = serde_json::to_vec(&report)?;
    bytes.push(b'\n');
    std::io::Write::write_all(&mut std::io::stdout(), &bytes).context("write stdout")?;

    Ok(ExitCode::SUCCESS)
}

fn write_new(path: &Path, contents: &str, created: &mut Vec<String>) -> Result<()> {
    std::fs::write(path, contents.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    created.push(path.display().to_string());
    Ok(())
}
