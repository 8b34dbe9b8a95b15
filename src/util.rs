use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::Result;
use colored::Colorize;
use crate::config::Config;
use crate::delivery::WRAPPER_MARK;

/// Ensures the base directory and the hidden `.pipkin` metadata root exist.
///
/// Returns the full path to the metadata root.
pub fn ensure_base_dirs(cfg: &Config) -> Result<PathBuf> {
    let meta_root = cfg.meta_root();
    std::fs::create_dir_all(&meta_root)?;
    Ok(meta_root)
}

/// Seconds since the Unix epoch; the clock used by install records and the
/// audit log.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn warn(message: &str) {
    eprintln!("{} {}", "warning:".yellow().bold(), message);
}

/// Appends one line to the audit log. Best-effort: auditing must never fail
/// an actual operation, so errors are swallowed here.
pub fn audit(cfg: &Config, action: &str) {
    if cfg.dry_run {
        return;
    }
    let path = cfg.audit_log_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{} [{}] {}", unix_now(), std::process::id(), action);
    }
}

/// Prints what a mutating action would do in dry-run mode; returns whether
/// the caller should skip the real action.
pub fn would(cfg: &Config, action: &str) -> bool {
    if cfg.dry_run {
        println!("would {}", action);
    }
    cfg.dry_run
}

/// Checks if a given path is an executable file on Unix.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Checks if a given path has a Windows executable extension (.exe, .bat, .cmd).
#[cfg(windows)]
pub fn is_executable(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        let ext = ext.to_ascii_lowercase();
        matches!(ext.as_str(), "exe" | "bat" | "cmd")
    } else {
        false
    }
}

/// Recognizes a file produced by pipkin's wrap delivery by scanning its
/// first few lines for the embedded marker.
pub fn is_tool_wrapper(path: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    text.lines().take(5).any(|line| line.contains(WRAPPER_MARK))
}

/// Whether an existing file at a delivery target belongs to this tool:
/// a symlink resolving under the metadata root, one of our wrappers, or an
/// empty/non-executable leftover that is safe to replace.
pub fn is_tool_owned(cfg: &Config, path: &Path) -> bool {
    if !path.exists() {
        return true;
    }
    if let Ok(resolved) = std::fs::canonicalize(path) {
        let meta_root = std::fs::canonicalize(cfg.meta_root()).unwrap_or_else(|_| cfg.meta_root());
        if resolved.starts_with(&meta_root) {
            return true;
        }
    }
    let empty = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    if empty || !is_executable(path) {
        return true;
    }
    is_tool_wrapper(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_base_dirs_creates_meta_root() {
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        let meta = ensure_base_dirs(&cfg).unwrap();
        assert!(meta.exists());
        assert!(meta.ends_with(".pipkin"));
    }

    #[test]
    fn test_audit_appends_lines() {
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        audit(&cfg, "install httpie 3.2.4");
        audit(&cfg, "uninstall httpie");
        let text = std::fs::read_to_string(cfg.audit_log_path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("install httpie 3.2.4"));
    }

    #[test]
    fn test_missing_target_is_owned() {
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        assert!(is_tool_owned(&cfg, &dir.path().join("no-such-entry")));
    }

    #[cfg(unix)]
    #[test]
    fn test_foreign_executable_is_not_owned() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        let foreign = dir.path().join("other-tool");
        std::fs::write(&foreign, "#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&foreign, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(!is_tool_owned(&cfg, &foreign));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_into_meta_root_is_owned() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let cfg = Config::bare(dir.path());
        let inside = cfg.meta_root().join("httpie").join("3.2.4").join("bin");
        std::fs::create_dir_all(&inside).unwrap();
        let real = inside.join("http");
        std::fs::write(&real, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&real, std::fs::Permissions::from_mode(0o755)).unwrap();
        let link = dir.path().join("http");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        assert!(is_tool_owned(&cfg, &link));
    }
}
