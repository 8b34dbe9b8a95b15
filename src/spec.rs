use std::path::{Path, PathBuf};
use std::process::Command;
use anyhow::{bail, Context, Result};
use regex::Regex;
use crate::config::Config;
use crate::manifest::{TrackedManifest, TrackedSettings};
use crate::util::{is_tool_owned, warn};

/// The tool's own package name; self-upgrade logic is keyed off this and
/// nothing else.
pub const OWN_PACKAGE: &str = "pipkin";

/// The three reference forms a user can hand us, decided eagerly.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageRef {
    /// Plain index spec: `name` or `name==version`.
    Index { name: String, version: Option<String> },
    /// An existing local project folder.
    Local { path: PathBuf },
    /// A remote VCS URL, cloned into the checkout cache before use.
    Remote { url: String },
}

/// Classifies a raw reference. Remote markers are checked first, then an
/// existing local directory, and everything else is an index spec.
pub fn parse_reference(reference: &str) -> PackageRef {
    let reference = reference.trim();
    if reference.contains("://") || reference.ends_with(".git") {
        return PackageRef::Remote { url: reference.to_string() };
    }
    if reference.contains(std::path::MAIN_SEPARATOR) || reference.contains('/') {
        let path = PathBuf::from(reference);
        if path.is_dir() {
            return PackageRef::Local { path };
        }
    }
    match reference.split_once("==") {
        Some((name, version)) => PackageRef::Index {
            name: name.trim().to_string(),
            version: Some(version.trim().to_string()),
        },
        None => PackageRef::Index { name: reference.to_string(), version: None },
    }
}

/// Identity and resolved configuration for one target package.
#[derive(Debug, Clone)]
pub struct PackageSpec {
    /// The reference exactly as the user typed it.
    pub original: String,
    pub canonical_name: String,
    /// Explicit version, when the reference (or project metadata) carries one.
    pub version: Option<String>,
    /// Local project folder backing a local/remote reference.
    pub project: Option<PathBuf>,
    /// Settings snapshot taken at resolution time.
    pub settings: TrackedSettings,
}

impl PackageSpec {
    /// Resolves a raw reference into a spec: canonical name, explicit
    /// version, settings snapshot. Local and remote references are resolved
    /// through their project metadata before anything else happens.
    pub fn resolve(cfg: &Config, reference: &str, version: Option<&str>) -> Result<PackageSpec> {
        let (name, embedded_version, project) = match parse_reference(reference) {
            PackageRef::Index { name, version } => (name, version, None),
            PackageRef::Local { path } => {
                let (name, version) = project_metadata(&path)?;
                (name, Some(version), Some(path))
            }
            PackageRef::Remote { url } => {
                let checkout = clone_checkout(cfg, &url)?;
                let (name, version) = project_metadata(&checkout)?;
                (name, Some(version), Some(checkout))
            }
        };
        let canonical_name = canonical_name(&name);
        validate_name(&name, &canonical_name)?;
        let version = version.map(str::to_string).or(embedded_version);
        let mut settings = TrackedSettings {
            delivery: cfg.delivery_method(&canonical_name),
            index: cfg.index_url(&canonical_name),
            python: cfg.python(&canonical_name),
        };
        // pipkin keeps itself fresh through its wrapper unless told otherwise
        if canonical_name == OWN_PACKAGE && !cfg.is_user_set("delivery", Some(OWN_PACKAGE)) {
            settings.delivery = "wrap".to_string();
        }
        Ok(PackageSpec {
            original: reference.to_string(),
            canonical_name,
            version,
            project,
            settings,
        })
    }

    pub fn is_own_package(&self) -> bool {
        self.canonical_name == OWN_PACKAGE
    }

    /// What gets handed to the package installer inside the venv.
    pub fn pip_spec(&self, version: &str) -> String {
        match &self.project {
            Some(path) => path.display().to_string(),
            None => format!("{}=={}", self.canonical_name, version),
        }
    }

    pub fn package_meta_dir(&self, cfg: &Config) -> PathBuf {
        cfg.meta_root().join(&self.canonical_name)
    }

    pub fn install_dir(&self, cfg: &Config, version: &str) -> PathBuf {
        self.package_meta_dir(cfg).join(version)
    }

    pub fn manifest_path(&self, cfg: &Config) -> PathBuf {
        self.package_meta_dir(cfg).join(".manifest.json")
    }

    pub fn latest_cache_path(&self, cfg: &Config) -> PathBuf {
        self.package_meta_dir(cfg).join(".latest.json")
    }

    /// Throttle marker for background auto-upgrade checks.
    pub fn ping_path(&self, cfg: &Config) -> PathBuf {
        self.package_meta_dir(cfg).join(".ping")
    }

    pub fn lock_path(&self, cfg: &Config) -> PathBuf {
        cfg.meta_root().join(format!("{}.lock", self.canonical_name))
    }

    /// Stable path an entry point is delivered to.
    pub fn delivery_target(&self, cfg: &Config, entrypoint: &str) -> PathBuf {
        cfg.base.join(entrypoint)
    }

    /// The don't-clobber gate: safe to proceed if we installed this package
    /// before, or whatever sits at the target path is recognizably ours (or
    /// harmless). A foreign executable blocks installation until the caller
    /// forces or uninstalls it.
    pub fn is_clear_for_installation(&self, cfg: &Config) -> bool {
        if TrackedManifest::load(self.manifest_path(cfg)).is_some() {
            return true;
        }
        is_tool_owned(cfg, &self.delivery_target(cfg, &self.canonical_name))
    }
}

/// Normalized form: lowercase, dash-separated.
pub fn canonical_name(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

/// Rejects names that are malformed or look unsafe, with distinct messages.
/// A valid but non-canonical spelling warns and is accepted.
fn validate_name(original: &str, canonical: &str) -> Result<()> {
    if canonical.contains('/')
        || canonical.contains('\\')
        || canonical.contains("..")
        || canonical.starts_with('.')
    {
        bail!("'{}' does not look safe as a package name, refusing to proceed", original);
    }
    let re = Regex::new(r"^[a-z][a-z0-9.-]*$")?;
    if !re.is_match(canonical) {
        bail!("'{}' is not a valid package name", original);
    }
    if original != canonical {
        warn(&format!("'{}' is not canonical, using '{}'", original, canonical));
    }
    Ok(())
}

/// Reads `[project]` name and version from a project's `pyproject.toml`.
fn project_metadata(path: &Path) -> Result<(String, String)> {
    let file = path.join("pyproject.toml");
    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("Could not read {}", file.display()))?;
    let doc: toml::Value = toml::from_str(&text)
        .with_context(|| format!("Could not parse {}", file.display()))?;
    let project = doc
        .get("project")
        .with_context(|| format!("{} has no [project] table", file.display()))?;
    let name = project
        .get("name")
        .and_then(toml::Value::as_str)
        .with_context(|| format!("{} has no project name", file.display()))?;
    let version = project
        .get("version")
        .and_then(toml::Value::as_str)
        .with_context(|| {
            format!("{} has no static project version (dynamic versions are not supported)", file.display())
        })?;
    Ok((name.to_string(), version.to_string()))
}

/// Clones a remote reference into the checkout cache, replacing any stale
/// checkout of the same URL.
fn clone_checkout(cfg: &Config, url: &str) -> Result<PathBuf> {
    let slug = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("checkout")
        .trim_end_matches(".git");
    let dest = cfg.checkout_cache_dir().join(slug);
    if dest.exists() {
        std::fs::remove_dir_all(&dest)
            .with_context(|| format!("Could not clear old checkout {}", dest.display()))?;
    }
    std::fs::create_dir_all(cfg.checkout_cache_dir())?;
    let status = Command::new("git")
        .args(["clone", "--depth", "1", url])
        .arg(&dest)
        .status()
        .context("could not run git")?;
    if !status.success() {
        bail!("git clone of {} failed", url);
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_index_reference() {
        assert_eq!(
            parse_reference("httpie"),
            PackageRef::Index { name: "httpie".to_string(), version: None }
        );
        assert_eq!(
            parse_reference("httpie==3.2.4"),
            PackageRef::Index { name: "httpie".to_string(), version: Some("3.2.4".to_string()) }
        );
    }

    #[test]
    fn test_parse_remote_reference() {
        assert_eq!(
            parse_reference("https://example.com/someone/tool.git"),
            PackageRef::Remote { url: "https://example.com/someone/tool.git".to_string() }
        );
        assert_eq!(
            parse_reference("git@example.com:someone/tool.git"),
            PackageRef::Remote { url: "git@example.com:someone/tool.git".to_string() }
        );
    }

    #[test]
    fn test_parse_local_reference_requires_existing_dir() {
        let dir = tempdir().unwrap();
        let text = dir.path().to_string_lossy().to_string();
        assert_eq!(parse_reference(&text), PackageRef::Local { path: dir.path().to_path_buf() });
        // a path-looking reference that does not exist is treated as an index spec
        assert!(matches!(parse_reference("no/such/dir"), PackageRef::Index { .. }));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("mgit", "mgit").is_ok());
        assert!(validate_name("0-0", "0-0").is_err());
        assert!(validate_name("../evil", "../evil").is_err());
        // valid but non-canonical: accepted (warns)
        assert!(validate_name("My_Pkg", &canonical_name("My_Pkg")).is_ok());
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("My_Pkg"), "my-pkg");
        assert_eq!(canonical_name("HTTPie"), "httpie");
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        let first = PackageSpec::resolve(&cfg, "HTTPie==3.2.4", None).unwrap();
        let second = PackageSpec::resolve(&cfg, "HTTPie==3.2.4", None).unwrap();
        assert_eq!(first.canonical_name, second.canonical_name);
        assert_eq!(first.version, second.version);
        assert_eq!(first.settings, second.settings);
    }

    #[test]
    fn test_malformed_name_aborts() {
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        assert!(PackageSpec::resolve(&cfg, "0-0", None).is_err());
    }

    #[test]
    fn test_derived_paths() {
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        let spec = PackageSpec::resolve(&cfg, "httpie==3.2.4", None).unwrap();
        assert_eq!(spec.manifest_path(&cfg), cfg.meta_root().join("httpie").join(".manifest.json"));
        assert_eq!(spec.install_dir(&cfg, "3.2.4"), cfg.meta_root().join("httpie").join("3.2.4"));
        assert_eq!(spec.lock_path(&cfg), cfg.meta_root().join("httpie.lock"));
        assert_eq!(spec.delivery_target(&cfg, "http"), dir.path().join("http"));
    }

    #[test]
    fn test_own_package_defaults_to_wrap() {
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        let spec = PackageSpec::resolve(&cfg, "pipkin", None).unwrap();
        assert_eq!(spec.settings.delivery, "wrap");
        assert!(spec.is_own_package());
    }

    #[test]
    fn test_local_project_metadata() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[project]\nname = \"My_Tool\"\nversion = \"0.9.1\"\n",
        )
        .unwrap();
        let base = tempdir().unwrap();
        let cfg = Config::bare(base.path());
        let reference = dir.path().to_string_lossy().to_string();
        let spec = PackageSpec::resolve(&cfg, &reference, None).unwrap();
        assert_eq!(spec.canonical_name, "my-tool");
        assert_eq!(spec.version.as_deref(), Some("0.9.1"));
        assert!(spec.project.is_some());
    }
}
