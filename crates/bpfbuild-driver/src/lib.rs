//! Build driver turning compiled IR modules into verified eBPF ELF objects.
//!
//! The driver orchestrates an external LLVM toolchain (`llvm-link`, `opt`,
//! `llc`, plus optional `llvm-ar`, `llvm-objcopy`, and `pahole`) through a
//! fixed stage sequence, validating untrusted configuration on the way in and
//! the produced binary on the way out. It never implements a linker or
//! optimizer itself.

pub mod config;
pub mod elf_check;
pub mod exec;
pub mod passes;
pub mod pipeline;
pub mod toolchain;

pub use pipeline::{run_build, Artifacts, BpfCpu, BuildError, RunConfig, Stage};
