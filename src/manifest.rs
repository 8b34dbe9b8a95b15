use std::collections::BTreeMap;
use std::path::Path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use crate::util::unix_now;

/// Settings snapshot recorded with an installation: how entry points were
/// delivered, which index answered, which interpreter was used.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TrackedSettings {
    #[serde(default)]
    pub delivery: String,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub python: String,
}

/// Who produced a record, and when.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InstallInfo {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub tool_version: String,
}

impl InstallInfo {
    pub fn current() -> InstallInfo {
        InstallInfo {
            args: std::env::args().collect(),
            timestamp: unix_now(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Durable record of a completed installation.
///
/// Persisted as JSON at the canonical meta path and copied inside the
/// installed artifact for self-description. Its presence at the canonical
/// path is the sole source of truth for "installed by pipkin". Every field
/// defaults, so manifests written by older releases still load.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TrackedManifest {
    #[serde(default)]
    pub settings: TrackedSettings,
    #[serde(default)]
    pub entrypoints: BTreeMap<String, String>,
    #[serde(default)]
    pub install_info: InstallInfo,
    #[serde(default)]
    pub pinned: String,
    #[serde(default)]
    pub version: String,
}

impl TrackedManifest {
    /// Reads a manifest, `None` when absent or unreadable (an unreadable
    /// manifest means "not installed by us", not an error).
    pub fn load<P: AsRef<Path>>(path: P) -> Option<TrackedManifest> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Writes the manifest via a temp file renamed into place, so lockless
    /// readers never observe a torn record.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let parent = path.parent().context("manifest path has no parent")?;
        std::fs::create_dir_all(parent)?;
        let text = serde_json::to_string_pretty(self)?;
        let file = NamedTempFile::new_in(parent)?;
        std::fs::write(file.path(), text)?;
        file.persist(path)
            .with_context(|| format!("Could not write manifest {}", path.display()))?;
        Ok(())
    }
}
