use std::cmp::Ordering;
use std::fmt;
use std::time::SystemTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::config::Config;
use crate::index;
use crate::manifest::{InstallInfo, TrackedManifest};
use crate::spec::PackageSpec;

/// Accepted version shapes, index-style: dotted release segments followed by
/// optional pre-release (`a`/`b`/`rc` and their long spellings), post-release
/// and dev qualifiers, with `.`, `_` or `-` as separators.
const VERSION_PATTERN: &str =
    r"(?i)^v?(\d+(?:\.\d+)*)(?:[._-]?(alpha|beta|preview|pre|rc|a|b|c)[._-]?(\d*))?(?:[._-]?(post|rev|r)[._-]?(\d*))?(?:[._-]?dev[._-]?(\d*))?$";

/// A package version as package indexes define them (not strict semver:
/// `1.2`, `2.0.0.post1` and `1.0rc1` are all valid).
///
/// Ordering is total and uniform across the whole tool: release segments
/// compare numerically with missing segments counting as zero, then
/// `dev` < `a` < `b` < `rc` < final < `post` within the same release.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    release: Vec<u64>,
    pre: Option<(u8, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
}

impl Version {
    /// Parses a version string, returning `None` for anything that does not
    /// look like an index version (e.g. a stray directory name).
    pub fn parse(text: &str) -> Option<Version> {
        let re = Regex::new(VERSION_PATTERN).ok()?;
        let caps = re.captures(text.trim())?;
        let release = caps[1]
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<u64>, _>>()
            .ok()?;
        let pre = caps.get(2).map(|kind| {
            let rank = match kind.as_str().to_ascii_lowercase().as_str() {
                "a" | "alpha" => 0,
                "b" | "beta" => 1,
                _ => 2, // c, rc, pre, preview
            };
            (rank, number(caps.get(3)))
        });
        let post = caps.get(4).map(|_| number(caps.get(5)));
        let dev = caps.get(6).map(|m| m.as_str().parse().unwrap_or(0));
        Some(Version { raw: text.trim().to_string(), release, pre, post, dev })
    }

    /// Comparison key following the common package-index ordering: a bare
    /// `dev` release sorts below any pre-release of the same version, a
    /// `post` release above the final one.
    fn qualifier_key(&self) -> (u8, u64, u8, u64, u8, u64) {
        let (pre_rank, pre_n) = match self.pre {
            Some((rank, n)) => (rank + 1, n),
            None if self.post.is_none() && self.dev.is_some() => (0, 0),
            None => (4, 0),
        };
        let (post_rank, post_n) = match self.post {
            Some(n) => (1, n),
            None => (0, 0),
        };
        let (dev_rank, dev_n) = match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        };
        (pre_rank, pre_n, post_rank, post_n, dev_rank, dev_n)
    }
}

fn number(m: Option<regex::Match<'_>>) -> u64 {
    m.map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0)
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let segments = self.release.len().max(other.release.len());
        for i in 0..segments {
            let a = self.release.get(i).copied().unwrap_or(0);
            let b = other.release.get(i).copied().unwrap_or(0);
            if a != b {
                return a.cmp(&b);
            }
        }
        self.qualifier_key().cmp(&other.qualifier_key())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Where a desired-version determination came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionSource {
    Explicit,
    Pinned,
    Installed,
    Current,
    #[default]
    Latest,
}

impl fmt::Display for VersionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VersionSource::Explicit => "explicit",
            VersionSource::Pinned => "pinned",
            VersionSource::Installed => "installed",
            VersionSource::Current => "current",
            VersionSource::Latest => "latest",
        };
        write!(f, "{}", text)
    }
}

/// One determination of "which version is desired" for a package.
///
/// Exactly one of `version` or `problem` is meaningfully set; an empty
/// `problem` means the determination succeeded.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TrackedVersion {
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub install_info: InstallInfo,
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub source: VersionSource,
    #[serde(default)]
    pub version: String,
}

impl TrackedVersion {
    pub fn resolved(version: &str, source: VersionSource, index: &str) -> TrackedVersion {
        TrackedVersion {
            index: index.to_string(),
            install_info: InstallInfo::current(),
            problem: String::new(),
            source,
            version: version.to_string(),
        }
    }

    pub fn trouble(problem: String, index: &str) -> TrackedVersion {
        TrackedVersion {
            index: index.to_string(),
            install_info: InstallInfo::current(),
            problem,
            source: VersionSource::Latest,
            version: String::new(),
        }
    }

    pub fn is_problem(&self) -> bool {
        !self.problem.is_empty()
    }
}

/// Decides the desired version for `spec`, short-circuiting in priority
/// order: explicit version, configured pin, then latest-from-index.
///
/// The "latest" answer is folded against the installed manifest's version
/// and, for pipkin's own package, against the running executable's version:
/// the numerically greatest candidate wins. This lets a manually placed
/// newer install beat a stale index answer.
///
/// Resolution never fails: index problems are carried in the returned
/// record's `problem` field, to be surfaced where a value is needed.
pub fn desired_version(cfg: &Config, spec: &PackageSpec, force: bool) -> TrackedVersion {
    if let Some(version) = &spec.version {
        return TrackedVersion::resolved(version, VersionSource::Explicit, &spec.settings.index);
    }
    if let Some(pin) = cfg.pinned_version(&spec.canonical_name) {
        return TrackedVersion::resolved(&pin, VersionSource::Pinned, &spec.settings.index);
    }
    let mut best = latest_from_index(cfg, spec, force);
    if let Some(manifest) = TrackedManifest::load(&spec.manifest_path(cfg)) {
        fold_candidate(&mut best, &manifest.version, VersionSource::Installed, spec);
    }
    if spec.is_own_package() {
        fold_candidate(&mut best, env!("CARGO_PKG_VERSION"), VersionSource::Current, spec);
    }
    best
}

fn fold_candidate(best: &mut TrackedVersion, candidate: &str, source: VersionSource, spec: &PackageSpec) {
    let Some(parsed) = Version::parse(candidate) else {
        return;
    };
    let current_wins = match Version::parse(&best.version) {
        Some(current) => current >= parsed,
        None => false, // problem or unparsable: any valid candidate wins
    };
    if !current_wins {
        *best = TrackedVersion::resolved(candidate, source, &spec.settings.index);
    }
}

/// Latest-from-index lookup with a sidecar cache file: a determination
/// younger than the configured check delay is reused, file mtime being the
/// cache's clock. Failures to write the cache are non-fatal.
fn latest_from_index(cfg: &Config, spec: &PackageSpec, force: bool) -> TrackedVersion {
    let cache_path = spec.latest_cache_path(cfg);
    if !force {
        if let Some(cached) = read_fresh_cache(&cache_path, cfg) {
            return cached;
        }
    }
    let determined = match index::latest_version(&spec.settings.index, &spec.canonical_name) {
        Ok(version) => TrackedVersion::resolved(&version, VersionSource::Latest, &spec.settings.index),
        Err(problem) => TrackedVersion::trouble(problem, &spec.settings.index),
    };
    if !cfg.dry_run {
        if let Ok(text) = serde_json::to_string_pretty(&determined) {
            if let Some(parent) = cache_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::write(&cache_path, text);
        }
    }
    determined
}

fn read_fresh_cache(path: &std::path::Path, cfg: &Config) -> Option<TrackedVersion> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    if age > cfg.version_check_delay() {
        return None;
    }
    let cached: TrackedVersion = serde_json::from_str(&std::fs::read_to_string(path).ok()?).ok()?;
    if cached.version.is_empty() {
        return None;
    }
    Some(cached)
}
