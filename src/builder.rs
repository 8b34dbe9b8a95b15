use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use anyhow::{bail, Context, Result};
use walkdir::WalkDir;
use crate::config::Config;
use crate::spec::PackageSpec;
use crate::util::{is_executable, would};

/// Where a virtual environment keeps its executables.
#[cfg(not(windows))]
pub const VENV_BIN: &str = "bin";
#[cfg(windows)]
pub const VENV_BIN: &str = "Scripts";

/// Interpreter plumbing that is part of every venv, never an entry point.
const VENV_NOISE: &[&str] = &["python", "pip", "activate", "easy_install", "wheel"];

/// Materializes one version of a package: creates a virtual environment at
/// the spec's install dir and installs the package into it.
///
/// Returns the exposed entry points, mapping command name to its path
/// relative to the install dir. In simulation mode nothing is touched and
/// the intended actions are reported instead.
pub fn build(cfg: &Config, spec: &PackageSpec, version: &str) -> Result<BTreeMap<String, String>> {
    let dest = spec.install_dir(cfg, version);
    if cfg.dry_run {
        would(cfg, &format!("create virtual environment {}", dest.display()));
        would(cfg, &format!("install {} into it", spec.pip_spec(version)));
        let assumed = format!("{}/{}", VENV_BIN, spec.canonical_name);
        return Ok(BTreeMap::from([(spec.canonical_name.clone(), assumed)]));
    }
    if dest.exists() {
        // leftovers from an interrupted attempt
        std::fs::remove_dir_all(&dest)?;
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    run(Command::new(&spec.settings.python).arg("-m").arg("venv").arg(&dest))?;

    let pip = dest.join(VENV_BIN).join("pip");
    let mut install = Command::new(&pip);
    install.arg("install").arg("-qq");
    if spec.settings.index != crate::config::DEFAULT_INDEX {
        install.arg("--index-url").arg(&spec.settings.index);
    }
    install.arg(spec.pip_spec(version));
    run(&mut install)?;

    let entrypoints = discover_entrypoints(&dest)?;
    if entrypoints.is_empty() {
        bail!("{}=={} exposes no entry points", spec.canonical_name, version);
    }
    Ok(entrypoints)
}

fn run(command: &mut Command) -> Result<()> {
    let rendered = format!("{:?}", command);
    let status = command
        .status()
        .with_context(|| format!("could not run {}", rendered))?;
    if !status.success() {
        bail!("{} exited with {}", rendered, status);
    }
    Ok(())
}

/// Scans the venv's executable directory, skipping interpreter plumbing.
fn discover_entrypoints(install_dir: &Path) -> Result<BTreeMap<String, String>> {
    let bin_dir = install_dir.join(VENV_BIN);
    let mut entrypoints = BTreeMap::new();
    for entry in WalkDir::new(&bin_dir).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() || !is_executable(entry.path()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let lowered = name.to_lowercase();
        if VENV_NOISE.iter().any(|noise| lowered.starts_with(noise)) {
            continue;
        }
        entrypoints.insert(name.clone(), format!("{}/{}", VENV_BIN, name));
    }
    Ok(entrypoints)
}
