use std::fmt;
use std::path::Path;
use std::str::FromStr;
use anyhow::{anyhow, bail, Context, Result};
use walkdir::WalkDir;
use crate::config::Config;
use crate::spec::{PackageSpec, OWN_PACKAGE};
use crate::util::would;

/// Sentinel embedded in every generated wrapper so conflict detection and
/// uninstall can recognize "this file was produced by us" from its first
/// few lines.
pub const WRAPPER_MARK: &str = "generated by pipkin, do not edit";

/// How an entry point is exposed at its stable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    /// Plain symlink to the installed executable.
    Symlink,
    /// Small shell script that triggers a background upgrade check, then
    /// execs the installed executable.
    Wrap,
    /// Byte copy (recursive for directories).
    Copy,
}

impl FromStr for DeliveryMethod {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<DeliveryMethod> {
        match text.trim().to_lowercase().as_str() {
            "symlink" => Ok(DeliveryMethod::Symlink),
            "wrap" => Ok(DeliveryMethod::Wrap),
            "copy" => Ok(DeliveryMethod::Copy),
            other => Err(anyhow!(
                "unknown delivery method '{}', expected one of: symlink, wrap, copy",
                other
            )),
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeliveryMethod::Symlink => "symlink",
            DeliveryMethod::Wrap => "wrap",
            DeliveryMethod::Copy => "copy",
        };
        write!(f, "{}", text)
    }
}

/// Exposes `source` at the stable path `target`, single-shot and idempotent:
/// any pre-existing file or link at `target` is deleted first. Aborts if the
/// source does not exist; on failure the partial target is cleaned up and
/// the error names the strategy and the target path.
pub fn deliver(
    cfg: &Config,
    spec: &PackageSpec,
    method: DeliveryMethod,
    target: &Path,
    source: &Path,
) -> Result<()> {
    if would(cfg, &format!("deliver ({}) {} -> {}", method, target.display(), source.display())) {
        return Ok(());
    }
    if !source.exists() {
        bail!(
            "{} delivery to {} failed: source {} does not exist",
            method,
            target.display(),
            source.display()
        );
    }
    clear_target(target)?;
    let outcome = match method {
        DeliveryMethod::Symlink => install_symlink(target, source),
        DeliveryMethod::Wrap => install_wrapper(cfg, spec, target, source),
        DeliveryMethod::Copy => install_copy(target, source),
    };
    if outcome.is_err() {
        let _ = std::fs::remove_file(target);
    }
    outcome.with_context(|| format!("{} delivery to {} failed", method, target.display()))
}

fn clear_target(target: &Path) -> Result<()> {
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(target)?,
        Ok(_) => std::fs::remove_file(target)?,
        Err(_) => {}
    }
    Ok(())
}

/// A relative link is stored when the source lives under the target's
/// parent, which keeps the whole base directory relocatable.
#[cfg(unix)]
fn install_symlink(target: &Path, source: &Path) -> Result<()> {
    let link_value = match (target.parent(), source.is_absolute(), target.is_absolute()) {
        (Some(parent), true, true) => {
            source.strip_prefix(parent).map(|p| p.to_path_buf()).unwrap_or_else(|_| source.to_path_buf())
        }
        _ => source.to_path_buf(),
    };
    std::os::unix::fs::symlink(link_value, target)?;
    Ok(())
}

#[cfg(windows)]
fn install_symlink(target: &Path, source: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(source, target)?;
    Ok(())
}

/// Writes the self-updating wrapper. The generic variant goes through the
/// delivered pipkin executable for the background check; pipkin's own
/// wrapper calls its source directly (going through the wrapper again would
/// recurse) and carries a bootstrap hint for when the install is gone.
#[cfg(unix)]
fn install_wrapper(cfg: &Config, spec: &PackageSpec, target: &Path, source: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let name = &spec.canonical_name;
    let script = if spec.is_own_package() {
        format!(
            r#"#!/bin/sh
# {mark}
if [ -x "{source}" ]; then
    ("{source}" auto-upgrade {own} >/dev/null 2>&1 &)
    exec "{source}" "$@"
else
    echo "{source} is not available anymore" >&2
    echo "reinstall with: curl -sSL https://raw.githubusercontent.com/pipkin-dev/pipkin/main/get-pipkin.sh | sh" >&2
    exit 1
fi
"#,
            mark = WRAPPER_MARK,
            source = source.display(),
            own = OWN_PACKAGE,
        )
    } else {
        format!(
            r#"#!/bin/sh
# {mark}
if [ -x "{source}" ]; then
    ("{pipkin}" auto-upgrade {name} >/dev/null 2>&1 &)
    exec "{source}" "$@"
else
    echo "{source} is not available anymore" >&2
    echo "reinstall with: pipkin install {name}" >&2
    exit 1
fi
"#,
            mark = WRAPPER_MARK,
            source = source.display(),
            pipkin = cfg.base.join(OWN_PACKAGE).display(),
            name = name,
        )
    };
    std::fs::write(target, script)?;
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(windows)]
fn install_wrapper(_cfg: &Config, _spec: &PackageSpec, target: &Path, source: &Path) -> Result<()> {
    let script = format!(
        ":: {}\r\n@echo off\r\ncall \"{}\" %*\r\n",
        WRAPPER_MARK,
        source.display()
    );
    std::fs::write(target.with_extension("bat"), script)?;
    Ok(())
}

fn install_copy(target: &Path, source: &Path) -> Result<()> {
    if !source.is_dir() {
        std::fs::copy(source, target)?;
        return Ok(());
    }
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
