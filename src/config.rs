use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use serde_json::Value;
use crate::util::warn;

pub const DEFAULT_INDEX: &str = "https://pypi.org/pypi";
pub const DEFAULT_DELIVERY: &str = "symlink";
pub const DEFAULT_PYTHON: &str = "python3";

/// One named source of key/value overrides: the CLI, a specific config file,
/// or the hardcoded defaults.
#[derive(Debug)]
pub struct RawConfig {
    /// Where these values came from, for diagnostics.
    pub source: String,
    pub values: Value,
}

impl RawConfig {
    /// Looks a key up in this layer. With a package given, the nested
    /// `pinned.<name>.<key>` table takes precedence over the flat key;
    /// a bare string under `pinned.<name>` is shorthand for a version pin.
    pub fn get_value(&self, key: &str, package: Option<&str>) -> Option<&Value> {
        if let Some(name) = package {
            match self.values.get("pinned").and_then(|p| p.get(name)) {
                Some(pin @ Value::String(_)) if key == "version" => return non_empty(pin),
                Some(entry) => {
                    if let Some(value) = entry.get(key).and_then(non_empty) {
                        return Some(value);
                    }
                }
                None => {}
            }
        }
        self.values.get(key).and_then(non_empty)
    }
}

/// An empty or null raw value is treated as absent, before any validation.
fn non_empty(value: &Value) -> Option<&Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(a) if a.is_empty() => None,
        _ => Some(value),
    }
}

/// The resolved configuration context for one process invocation.
///
/// Constructed once in `execute()` and passed by reference to every component
/// that needs it; lookup order across layers is fixed: CLI overrides, then
/// config files in inclusion order, then built-in defaults.
#[derive(Debug)]
pub struct Config {
    pub layers: Vec<RawConfig>,
    /// Installation base directory: delivered entry points land here.
    pub base: PathBuf,
    pub dry_run: bool,
}

/// CLI-provided overrides, forming the highest-priority layer.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub index: Option<String>,
    pub delivery: Option<String>,
    pub python: Option<String>,
}

impl Config {
    pub fn resolve(
        base: Option<PathBuf>,
        config_path: Option<PathBuf>,
        overrides: CliOverrides,
        dry_run: bool,
    ) -> Result<Config> {
        let base = match base {
            Some(base) => base,
            None => default_base()?,
        };
        let mut layers = Vec::new();

        let mut cli = serde_json::Map::new();
        if let Some(index) = overrides.index {
            cli.insert("index".to_string(), Value::String(index));
        }
        if let Some(delivery) = overrides.delivery {
            cli.insert("delivery".to_string(), Value::String(delivery));
        }
        if let Some(python) = overrides.python {
            cli.insert("python".to_string(), Value::String(python));
        }
        if !cli.is_empty() {
            layers.push(RawConfig { source: "cli".to_string(), values: Value::Object(cli) });
        }

        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let mut seen = HashSet::new();
        load_config_chain(&config_path, &mut layers, &mut seen);

        layers.push(RawConfig {
            source: "defaults".to_string(),
            values: serde_json::json!({
                "delivery": DEFAULT_DELIVERY,
                "index": DEFAULT_INDEX,
                "python": DEFAULT_PYTHON,
                "install_timeout": 30,
                "version_check_delay": 5,
                "retention": 60,
            }),
        });

        Ok(Config { layers, base, dry_run })
    }

    /// A bare context for library callers and tests: defaults only, rooted
    /// at the given base.
    pub fn bare<P: AsRef<Path>>(base: P) -> Config {
        Config::resolve(
            Some(base.as_ref().to_path_buf()),
            Some(PathBuf::from("/dev/null/no-config")),
            CliOverrides::default(),
            false,
        )
        .unwrap_or_else(|_| Config {
            layers: Vec::new(),
            base: base.as_ref().to_path_buf(),
            dry_run: false,
        })
    }

    /// First non-empty match across all layers, or `None` when no layer
    /// defines the key (the caller applies the domain default).
    pub fn get_value(&self, key: &str, package: Option<&str>) -> Option<&Value> {
        self.layers.iter().find_map(|layer| layer.get_value(key, package))
    }

    /// Whether a key was set anywhere above the built-in defaults layer.
    pub fn is_user_set(&self, key: &str, package: Option<&str>) -> bool {
        self.layers
            .iter()
            .filter(|layer| layer.source != "defaults")
            .any(|layer| layer.get_value(key, package).is_some())
    }

    pub fn get_string(&self, key: &str, package: Option<&str>) -> Option<String> {
        match self.get_value(key, package)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Integer lookup; the parse validator runs after the lookup succeeded,
    /// so a malformed value warns and falls back like an absent one.
    pub fn get_minutes(&self, key: &str, package: Option<&str>) -> Option<u64> {
        let value = self.get_value(key, package)?;
        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        if parsed.is_none() {
            warn(&format!("ignoring invalid value for '{}': {}", key, value));
        }
        parsed
    }

    pub fn pinned_version(&self, package: &str) -> Option<String> {
        self.get_string("version", Some(package))
    }

    pub fn delivery_method(&self, package: &str) -> String {
        self.get_string("delivery", Some(package)).unwrap_or_else(|| DEFAULT_DELIVERY.to_string())
    }

    pub fn index_url(&self, package: &str) -> String {
        self.get_string("index", Some(package)).unwrap_or_else(|| DEFAULT_INDEX.to_string())
    }

    pub fn python(&self, package: &str) -> String {
        self.get_string("python", Some(package)).unwrap_or_else(|| DEFAULT_PYTHON.to_string())
    }

    /// How long an install may run; doubles as the soft lock's staleness
    /// window.
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.get_minutes("install_timeout", None).unwrap_or(30) * 60)
    }

    /// How long a cached latest-version determination stays fresh.
    pub fn version_check_delay(&self) -> Duration {
        Duration::from_secs(self.get_minutes("version_check_delay", None).unwrap_or(5) * 60)
    }

    /// How long the one spare old version of a package is retained.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.get_minutes("retention", None).unwrap_or(60) * 60)
    }

    /// Hidden metadata root beneath the base directory.
    pub fn meta_root(&self) -> PathBuf {
        self.base.join(".pipkin")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.meta_root().join("audit.log")
    }

    pub fn checkout_cache_dir(&self) -> PathBuf {
        self.meta_root().join(".cache").join("checkouts")
    }

    /// Expands a named bundle into a deduplicated, order-preserving flat
    /// list of package names. `bundle:<name>` entries recurse; a bundle is
    /// expanded at most once per resolution, so cycles terminate.
    pub fn resolved_bundle(&self, name: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.expand_bundle(name, &mut seen, &mut out);
        out
    }

    fn expand_bundle(&self, name: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(entries) = self
            .layers
            .iter()
            .find_map(|layer| layer.values.get("bundle").and_then(|b| b.get(name)).and_then(Value::as_array))
        else {
            return;
        };
        for entry in entries {
            let Some(text) = entry.as_str() else {
                continue;
            };
            if let Some(nested) = text.strip_prefix("bundle:") {
                self.expand_bundle(nested, seen, out);
            } else if !out.iter().any(|existing| existing == text) {
                out.push(text.to_string());
            }
        }
    }
}

/// The base defaults to the directory holding the running executable, which
/// is what makes self-upgrades find themselves.
fn default_base() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| anyhow!("cannot determine base directory from {}", exe.display()))
}

fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("org", "pipkin", "pipkin")
        .ok_or_else(|| anyhow!("Could not get project directories"))?;
    Ok(dirs.config_dir().join("config.json"))
}

/// Loads a config file and everything it includes, depth-first. Each file is
/// loaded at most once (deduplicated by resolved path); missing files are
/// silently skipped, unparsable ones skipped with a warning.
fn load_config_chain(path: &Path, layers: &mut Vec<RawConfig>, seen: &mut HashSet<PathBuf>) {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(resolved.clone()) || !resolved.is_file() {
        return;
    }
    let text = match std::fs::read_to_string(&resolved) {
        Ok(text) => text,
        Err(_) => return,
    };
    let values: Value = match serde_json::from_str(&text) {
        Ok(values) => values,
        Err(e) => {
            warn(&format!("skipping malformed config {}: {}", resolved.display(), e));
            return;
        }
    };
    let includes: Vec<PathBuf> = values
        .get("include")
        .and_then(Value::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(Value::as_str)
                .map(|p| resolved.parent().unwrap_or(Path::new(".")).join(p))
                .collect()
        })
        .unwrap_or_default();
    layers.push(RawConfig { source: resolved.display().to_string(), values });
    for include in includes {
        load_config_chain(&include, layers, seen);
    }
}
