use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lock acquisition failures. `Busy` is the distinguished contention case:
/// it carries the holder's recorded command line so the abort message (and
/// the auto-upgrade skip line) can say who is in the way.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("'{resource}' is busy, locked by: {holder}")]
    Busy { resource: String, holder: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cooperative, crash-tolerant mutual exclusion over a named resource.
///
/// The lock is a file containing `<pid>\n<command line>\n`. It blocks others
/// only while it is younger than `invalid_after` AND its pid is still alive;
/// either condition failing means the holder is gone and the lock may be
/// seized silently. Two processes targeting the same package contend on the
/// same path regardless of in-memory state.
pub struct SoftLock {
    path: PathBuf,
    resource: String,
    give_up: Duration,
    invalid_after: Duration,
}

impl SoftLock {
    pub fn new<P: AsRef<Path>>(path: P, give_up: Duration, invalid_after: Duration) -> SoftLock {
        let path = path.as_ref().to_path_buf();
        let resource = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        SoftLock { path, resource, give_up, invalid_after }
    }

    /// Polls once a second until the lock is free or `give_up` elapses.
    /// On success the lock file is written and held until the guard drops.
    pub fn acquire(&self) -> Result<SoftLockGuard, LockError> {
        let started = Instant::now();
        while let Some(holder) = live_holder(&self.path, self.invalid_after) {
            if started.elapsed() >= self.give_up {
                return Err(LockError::Busy { resource: self.resource.clone(), holder });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let args: Vec<String> = std::env::args().map(quote_arg).collect();
        std::fs::write(&self.path, format!("{}\n{}\n", std::process::id(), args.join(" ")))?;
        Ok(SoftLockGuard { path: self.path.clone() })
    }
}

/// Held lock; releasing deletes the lock file unconditionally, on normal
/// and exceptional exits alike.
pub struct SoftLockGuard {
    path: PathBuf,
}

impl Drop for SoftLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn quote_arg(arg: String) -> String {
    if arg.contains(' ') {
        format!("\"{}\"", arg)
    } else {
        arg
    }
}

/// Returns the holder's command line if the lock file denotes a live holder:
/// young enough and with a running pid. Anything else (absent, stale,
/// malformed, dead pid) is not a holder.
fn live_holder(path: &Path, invalid_after: Duration) -> Option<String> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let age = SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO);
    if age >= invalid_after {
        return None;
    }
    let content = std::fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    let pid: u32 = lines.next()?.trim().parse().ok()?;
    if !pid_alive(pid) {
        return None;
    }
    Some(lines.next().unwrap_or("unknown process").to_string())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // /proc is authoritative where it exists; elsewhere ask `kill -0`
    if Path::new("/proc").is_dir() {
        return Path::new(&format!("/proc/{}", pid)).exists();
    }
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn pid_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/NH", "/FI", &format!("PID eq {}", pid)])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}
