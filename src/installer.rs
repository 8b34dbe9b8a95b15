use std::time::{Duration, Instant, SystemTime};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use crate::builder;
use crate::config::Config;
use crate::delivery::{deliver, DeliveryMethod};
use crate::manifest::{InstallInfo, TrackedManifest};
use crate::softlock::{LockError, SoftLock};
use crate::spec::PackageSpec;
use crate::util::{audit, ensure_base_dirs, is_tool_owned, would};
use crate::versions::{desired_version, Version};

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Install even when the desired version is already satisfied, and
    /// bypass the latest-version cache.
    pub force: bool,
    /// Upgrades abort when the package was never installed.
    pub is_upgrade: bool,
    pub quiet: bool,
    /// How long to wait for the package's lock; defaults to the install
    /// timeout.
    pub give_up: Option<Duration>,
}

/// The install/upgrade state machine, entirely under the package's soft
/// lock: resolve the desired version, no-op when the manifest already
/// satisfies it, otherwise build, persist the manifest (canonical path and
/// inside the artifact), deliver every entry point, then groom old versions.
pub fn perform_install(cfg: &Config, spec: &PackageSpec, opts: &InstallOptions) -> Result<TrackedManifest> {
    let started = Instant::now();
    ensure_base_dirs(cfg)?;
    if !opts.force && !spec.is_clear_for_installation(cfg) {
        bail!(
            "{} exists but was not installed by pipkin, uninstall it first or pass --force",
            spec.delivery_target(cfg, &spec.canonical_name).display()
        );
    }
    let give_up = opts.give_up.unwrap_or_else(|| cfg.install_timeout());
    let lock = SoftLock::new(spec.lock_path(cfg), give_up, cfg.install_timeout());
    let _guard = lock.acquire()?;

    let existing = TrackedManifest::load(spec.manifest_path(cfg));
    if opts.is_upgrade && existing.is_none() {
        bail!(
            "'{}' is not installed, run: pipkin install {}",
            spec.canonical_name,
            spec.canonical_name
        );
    }
    let desired = desired_version(cfg, spec, opts.force);
    if desired.is_problem() {
        bail!("can not determine a version for '{}': {}", spec.canonical_name, desired.problem);
    }
    let method: DeliveryMethod = spec.settings.delivery.parse()?;

    if !opts.force {
        if let Some(manifest) = &existing {
            if manifest.version == desired.version {
                if !opts.quiet {
                    println!(
                        "{} v{} is already up-to-date ({})",
                        spec.canonical_name, manifest.version, desired.source
                    );
                }
                groom(cfg, spec, &manifest.version)?;
                return Ok(manifest.clone());
            }
        }
    }

    let entrypoints = builder::build(cfg, spec, &desired.version)?;
    let manifest = TrackedManifest {
        settings: spec.settings.clone(),
        entrypoints,
        install_info: InstallInfo::current(),
        pinned: cfg.pinned_version(&spec.canonical_name).unwrap_or_default(),
        version: desired.version.clone(),
    };
    let install_dir = spec.install_dir(cfg, &desired.version);
    if !would(cfg, &format!("write manifest {}", spec.manifest_path(cfg).display())) {
        manifest.save(spec.manifest_path(cfg))?;
        manifest.save(install_dir.join(".manifest.json"))?;
    }
    for (name, relative) in &manifest.entrypoints {
        let target = spec.delivery_target(cfg, name);
        // entry-point names only become known after the build, so the
        // don't-clobber gate has to run again per actual target
        if !opts.force && !is_tool_owned(cfg, &target) {
            bail!(
                "{} exists but was not installed by pipkin, uninstall it first or pass --force",
                target.display()
            );
        }
        deliver(cfg, spec, method, &target, &install_dir.join(relative))?;
    }
    let action = if existing.is_some() { "upgraded" } else { "installed" };
    audit(cfg, &format!("{} {} v{} ({})", action, spec.canonical_name, desired.version, desired.source));
    groom(cfg, spec, &desired.version)?;
    if !opts.quiet {
        println!(
            "{} {} v{} in {:.1}s",
            action.green().bold(),
            spec.canonical_name,
            desired.version,
            started.elapsed().as_secs_f32()
        );
    }
    Ok(manifest)
}

/// Removes a package's delivered entry points and its metadata directory.
/// Refuses to touch executables that are not recognizably ours.
pub fn perform_uninstall(cfg: &Config, spec: &PackageSpec) -> Result<()> {
    ensure_base_dirs(cfg)?;
    let lock = SoftLock::new(spec.lock_path(cfg), cfg.install_timeout(), cfg.install_timeout());
    let _guard = lock.acquire()?;

    let Some(manifest) = TrackedManifest::load(spec.manifest_path(cfg)) else {
        bail!("'{}' is not installed", spec.canonical_name);
    };
    for name in manifest.entrypoints.keys() {
        let target = spec.delivery_target(cfg, name);
        if !target.exists() && target.symlink_metadata().is_err() {
            continue;
        }
        if !is_tool_owned(cfg, &target) {
            bail!("{} was not produced by pipkin, refusing to remove it", target.display());
        }
        if !would(cfg, &format!("delete {}", target.display())) {
            std::fs::remove_file(&target)
                .with_context(|| format!("Could not delete {}", target.display()))?;
        }
    }
    let meta_dir = spec.package_meta_dir(cfg);
    if !would(cfg, &format!("delete {}", meta_dir.display())) {
        std::fs::remove_dir_all(&meta_dir)
            .with_context(|| format!("Could not delete {}", meta_dir.display()))?;
    }
    audit(cfg, &format!("uninstalled {}", spec.canonical_name));
    println!("Uninstalled {}", spec.canonical_name);
    Ok(())
}

/// Background upgrade check, spawned by wrappers. Throttled by the ping
/// file's age; lock contention degrades to a skip line instead of an error
/// because a busy lock here just means someone else is already on it.
pub fn perform_auto_upgrade(cfg: &Config, spec: &PackageSpec) -> Result<()> {
    let ping = spec.ping_path(cfg);
    if let Ok(modified) = std::fs::metadata(&ping).and_then(|meta| meta.modified()) {
        let age = SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO);
        if age < cfg.version_check_delay() {
            return Ok(());
        }
    }
    if !cfg.dry_run {
        if let Some(parent) = ping.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&ping, b"");
    }
    let opts = InstallOptions { quiet: true, give_up: Some(Duration::ZERO), ..Default::default() };
    match perform_install(cfg, spec, &opts) {
        Ok(_) => Ok(()),
        Err(err) => match err.downcast_ref::<LockError>() {
            Some(LockError::Busy { resource, holder }) => {
                println!("auto-upgrade of {} skipped, locked by: {}", resource, holder);
                Ok(())
            }
            _ => Err(err),
        },
    }
}

struct GroomCandidate {
    name: String,
    version: Option<Version>,
    age: Duration,
}

/// Retention pass over old installed versions of one package.
///
/// Non-hidden subdirectories of the package meta dir that fail to parse as
/// a version are cruft and go immediately. Of the valid old versions, only
/// the most recently modified one is kept as a rollback spare, and even
/// that one goes once the current install has outlived the retention
/// window.
pub fn groom(cfg: &Config, spec: &PackageSpec, current_version: &str) -> Result<()> {
    let meta_dir = spec.package_meta_dir(cfg);
    if !meta_dir.exists() {
        return Ok(());
    }
    let now = SystemTime::now();
    let current_age = std::fs::metadata(spec.install_dir(cfg, current_version))
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .unwrap_or(Duration::ZERO);

    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(&meta_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.file_type()?.is_dir() || name == current_version {
            continue;
        }
        let age = entry
            .metadata()?
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        candidates.push(GroomCandidate { version: Version::parse(&name), name, age });
    }
    for victim in groom_victims(candidates, current_age, cfg.retention()) {
        let path = meta_dir.join(&victim);
        if would(cfg, &format!("delete {}", path.display())) {
            continue;
        }
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("Could not delete {}", path.display()))?;
        audit(cfg, &format!("groomed {}/{}", spec.canonical_name, victim));
    }
    Ok(())
}

/// Pure victim selection: cruft always goes; valid old versions all go
/// except the youngest, which survives only while the current install is
/// younger than the retention window.
fn groom_victims(candidates: Vec<GroomCandidate>, current_age: Duration, retention: Duration) -> Vec<String> {
    let mut victims = Vec::new();
    let mut valid = Vec::new();
    for candidate in candidates {
        match candidate.version {
            Some(_) => valid.push(candidate),
            None => victims.push(candidate.name),
        }
    }
    valid.sort_by_key(|candidate| candidate.age);
    let spares = if current_age < retention { 1 } else { 0 };
    victims.extend(valid.into_iter().skip(spares).map(|candidate| candidate.name));
    victims
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use tempfile::tempdir;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    fn candidate(name: &str, age_minutes: u64) -> GroomCandidate {
        GroomCandidate {
            name: name.to_string(),
            version: Version::parse(name),
            age: minutes(age_minutes),
        }
    }

    /// A config whose only non-default layer pins `mgit` to 1.3.0, so
    /// resolution never needs the network.
    fn pinned_config(base: &std::path::Path) -> Config {
        let mut cfg = Config::bare(base);
        cfg.layers.insert(
            0,
            RawConfig {
                source: "test".to_string(),
                values: serde_json::json!({"pinned": {"mgit": "1.3.0"}}),
            },
        );
        cfg
    }

    #[test]
    fn test_groom_keeps_one_recent_spare() {
        let victims = groom_victims(
            vec![candidate("0.9", 90), candidate("0.8", 5)],
            minutes(10),
            minutes(60),
        );
        assert_eq!(victims, vec!["0.9"]);
    }

    #[test]
    fn test_groom_spare_is_time_boxed() {
        // current install is 70 minutes old: even the youngest spare goes
        let victims = groom_victims(
            vec![candidate("0.9", 90), candidate("0.8", 5)],
            minutes(70),
            minutes(60),
        );
        assert_eq!(victims, vec!["0.8", "0.9"]);
    }

    #[test]
    fn test_groom_deletes_cruft_outright() {
        let victims = groom_victims(
            vec![candidate("not-a-version", 1), candidate("1.1", 2)],
            minutes(0),
            minutes(60),
        );
        assert_eq!(victims, vec!["not-a-version"]);
    }

    #[test]
    fn test_groom_on_disk_skips_hidden_and_current() {
        let dir = tempdir().unwrap();
        let cfg = pinned_config(dir.path());
        let spec = PackageSpec::resolve(&cfg, "mgit", None).unwrap();
        let meta = spec.package_meta_dir(&cfg);
        for sub in ["1.3.0", "1.2.0", "cruft-dir", ".cache"] {
            std::fs::create_dir_all(meta.join(sub)).unwrap();
        }
        groom(&cfg, &spec, "1.3.0").unwrap();
        assert!(meta.join("1.3.0").exists());
        assert!(meta.join(".cache").exists());
        assert!(!meta.join("cruft-dir").exists());
        // 1.2.0 is the single fresh spare
        assert!(meta.join("1.2.0").exists());
    }

    #[test]
    fn test_satisfied_install_is_a_no_op() {
        let dir = tempdir().unwrap();
        let cfg = pinned_config(dir.path());
        let spec = PackageSpec::resolve(&cfg, "mgit", None).unwrap();
        let manifest = TrackedManifest {
            settings: spec.settings.clone(),
            entrypoints: std::collections::BTreeMap::from([("mgit".to_string(), "bin/mgit".to_string())]),
            install_info: InstallInfo::current(),
            pinned: "1.3.0".to_string(),
            version: "1.3.0".to_string(),
        };
        manifest.save(spec.manifest_path(&cfg)).unwrap();

        // no builder, no network: the pinned version is already satisfied
        let first = perform_install(&cfg, &spec, &InstallOptions { quiet: true, ..Default::default() }).unwrap();
        let second = perform_install(&cfg, &spec, &InstallOptions { quiet: true, ..Default::default() }).unwrap();
        assert_eq!(first.version, "1.3.0");
        assert_eq!(second.version, first.version);
        assert_eq!(second.entrypoints, first.entrypoints);
    }

    #[test]
    fn test_upgrade_requires_existing_install() {
        let dir = tempdir().unwrap();
        let cfg = pinned_config(dir.path());
        let spec = PackageSpec::resolve(&cfg, "mgit", None).unwrap();
        let err = perform_install(
            &cfg,
            &spec,
            &InstallOptions { is_upgrade: true, quiet: true, ..Default::default() },
        )
        .unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    #[cfg(unix)]
    #[test]
    fn test_foreign_executable_blocks_install() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let cfg = pinned_config(dir.path());
        let spec = PackageSpec::resolve(&cfg, "mgit", None).unwrap();
        let foreign = dir.path().join("mgit");
        std::fs::write(&foreign, "#!/bin/sh\necho foreign\n").unwrap();
        std::fs::set_permissions(&foreign, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = perform_install(&cfg, &spec, &InstallOptions { quiet: true, ..Default::default() })
            .unwrap_err();
        assert!(err.to_string().contains("--force"));
    }

    #[cfg(unix)]
    #[test]
    fn test_foreign_entrypoint_target_blocks_delivery() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let mut cfg = pinned_config(dir.path());
        cfg.dry_run = true;
        let spec = PackageSpec::resolve(&cfg, "mgit", None).unwrap();
        // previously installed, so the preflight gate is satisfied
        let manifest = TrackedManifest {
            settings: spec.settings.clone(),
            entrypoints: std::collections::BTreeMap::from([("mgit".to_string(), "bin/mgit".to_string())]),
            install_info: InstallInfo::current(),
            pinned: String::new(),
            version: "1.2.0".to_string(),
        };
        manifest.save(spec.manifest_path(&cfg)).unwrap();
        // someone else's executable now sits where the entry point goes
        let foreign = spec.delivery_target(&cfg, "mgit");
        std::fs::write(&foreign, "#!/bin/sh\necho foreign\n").unwrap();
        std::fs::set_permissions(&foreign, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = perform_install(&cfg, &spec, &InstallOptions { quiet: true, ..Default::default() })
            .unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert!(foreign.exists());
    }

    #[test]
    fn test_uninstall_not_installed() {
        let dir = tempdir().unwrap();
        let cfg = pinned_config(dir.path());
        let spec = PackageSpec::resolve(&cfg, "mgit", None).unwrap();
        assert!(perform_uninstall(&cfg, &spec).is_err());
    }
}
