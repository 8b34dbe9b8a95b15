use anyhow::{bail, Result};
use colored::Colorize;
use pipkin::config::{CliOverrides, Config};
use pipkin::installer::{perform_auto_upgrade, perform_install, perform_uninstall, InstallOptions};
use pipkin::manifest::TrackedManifest;
use pipkin::spec::PackageSpec;
use pipkin::versions::desired_version;
use crate::cli::{PipkinCommand, CLI};

pub fn execute(cli: CLI) -> Result<()> {
    let overrides = CliOverrides {
        index: cli.index,
        delivery: cli.delivery,
        python: cli.python,
    };
    let cfg = Config::resolve(cli.base, cli.config, overrides, cli.dry_run)?;
    match cli.command {
        PipkinCommand::Install { packages, force } => {
            execute_install(&cfg, &packages, force, false)
        }
        PipkinCommand::Upgrade { packages, force } => {
            execute_install(&cfg, &packages, force, true)
        }
        PipkinCommand::Uninstall { packages } => execute_uninstall(&cfg, &packages),
        PipkinCommand::Check { packages } => execute_check(&cfg, &packages),
        PipkinCommand::List => execute_list(&cfg),
        PipkinCommand::AutoUpgrade { package } => {
            let spec = PackageSpec::resolve(&cfg, &package, None)?;
            perform_auto_upgrade(&cfg, &spec)
        }
    }
}

/// Expands `bundle:<name>` references in place, leaving plain references
/// untouched.
fn expand_references(cfg: &Config, packages: &[String]) -> Result<Vec<String>> {
    let mut references = Vec::new();
    for package in packages {
        match package.strip_prefix("bundle:") {
            Some(bundle) => {
                let expanded = cfg.resolved_bundle(bundle);
                if expanded.is_empty() {
                    bail!("bundle '{}' is not configured", bundle);
                }
                for name in expanded {
                    if !references.contains(&name) {
                        references.push(name);
                    }
                }
            }
            None => {
                if !references.contains(package) {
                    references.push(package.clone());
                }
            }
        }
    }
    Ok(references)
}

pub fn execute_install(cfg: &Config, packages: &[String], force: bool, is_upgrade: bool) -> Result<()> {
    for reference in expand_references(cfg, packages)? {
        let spec = PackageSpec::resolve(cfg, &reference, None)?;
        let opts = InstallOptions { force, is_upgrade, ..Default::default() };
        perform_install(cfg, &spec, &opts)?;
    }
    Ok(())
}

pub fn execute_uninstall(cfg: &Config, packages: &[String]) -> Result<()> {
    for reference in expand_references(cfg, packages)? {
        let spec = PackageSpec::resolve(cfg, &reference, None)?;
        perform_uninstall(cfg, &spec)?;
    }
    Ok(())
}

/// Lockless status report: installed vs desired for the named packages, or
/// for everything installed when none are named.
pub fn execute_check(cfg: &Config, packages: &[String]) -> Result<()> {
    let references = if packages.is_empty() {
        installed_packages(cfg)
    } else {
        expand_references(cfg, packages)?
    };
    if references.is_empty() {
        println!("No packages installed");
        return Ok(());
    }
    let mut troubled = 0;
    for reference in references {
        let spec = PackageSpec::resolve(cfg, &reference, None)?;
        let manifest = TrackedManifest::load(spec.manifest_path(cfg));
        let desired = desired_version(cfg, &spec, false);
        if desired.is_problem() {
            println!("{}: {}", spec.canonical_name, desired.problem.red());
            troubled += 1;
            continue;
        }
        match manifest {
            Some(manifest) if manifest.version == desired.version => {
                println!("{} v{} ({}): up-to-date", spec.canonical_name, desired.version, desired.source);
            }
            Some(manifest) => {
                println!(
                    "{} v{} ({}): currently v{}",
                    spec.canonical_name, desired.version, desired.source, manifest.version
                );
            }
            None => {
                println!("{} v{} ({}): {}", spec.canonical_name, desired.version, desired.source, "not installed".red());
                troubled += 1;
            }
        }
    }
    if troubled > 0 {
        bail!("{} package(s) need attention", troubled);
    }
    Ok(())
}

pub fn execute_list(cfg: &Config) -> Result<()> {
    let names = installed_packages(cfg);
    if names.is_empty() {
        println!("No packages installed");
        return Ok(());
    }
    for name in names {
        let Some(manifest) = TrackedManifest::load(cfg.meta_root().join(&name).join(".manifest.json"))
        else {
            continue;
        };
        println!("{} v{} ({})", name, manifest.version, manifest.settings.delivery);
    }
    Ok(())
}

/// Every package with a valid manifest under the meta root, sorted.
fn installed_packages(cfg: &Config) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(entries) = std::fs::read_dir(cfg.meta_root()) else {
        return names;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if entry.path().join(".manifest.json").is_file() {
            names.push(name);
        }
    }
    names.sort();
    names
}
