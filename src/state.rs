use crate::paths::Paths;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// More than this many supervisor restarts inside the window flips the
/// sticky crash-loop flag.
pub const CRASH_LOOP_THRESHOLD: usize = 5;
pub const CRASH_LOOP_WINDOW_SECS: i64 = 120;

/// Persistent per-service runtime record (`state/<name>.json`).
///
/// The PID itself lives in its own file; this record carries everything that
/// must survive a stop: restart bookkeeping and the crash-loop flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    #[serde(default)]
    pub restart_count: u64,
    /// Unix seconds of supervisor-initiated restarts; entries older than the
    /// crash-loop window are evicted on every write.
    #[serde(default)]
    pub restart_times: Vec<i64>,
    /// Sticky: cleared only by an explicit `restart` or by `remove`.
    #[serde(default)]
    pub crash_loop: bool,
    #[serde(default)]
    pub started_at: Option<i64>,
}

impl RuntimeRecord {
    /// Fold one supervisor-initiated restart into the record: prune entries
    /// that fell out of the window, append `now`, bump the counter, and raise
    /// the crash-loop flag when the windowed count crosses the threshold.
    pub fn note_restart(&mut self, now: i64) {
        let cutoff = now - CRASH_LOOP_WINDOW_SECS;
        self.restart_times.retain(|&t| t > cutoff);
        self.restart_times.push(now);
        self.restart_count += 1;
        if self.restart_times.len() > CRASH_LOOP_THRESHOLD {
            self.crash_loop = true;
        }
    }

    /// Manual recovery: forget the restart history along with the flag.
    pub fn reset_crash_loop(&mut self) {
        self.crash_loop = false;
        self.restart_times.clear();
        self.restart_count = 0;
    }

    /// Whether any supervisor restart fell inside the crash-loop window.
    /// Keeps a crash-cycling service under supervision even after a failed
    /// start wiped its PID file and `started_at`.
    pub fn recently_restarted(&self, now: i64) -> bool {
        let cutoff = now - CRASH_LOOP_WINDOW_SECS;
        self.restart_times.iter().any(|&t| t > cutoff)
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Read a service's record; a missing file initializes to defaults.
pub fn load(paths: &Paths, name: &str) -> anyhow::Result<RuntimeRecord> {
    let file = paths.state_file(name);
    let raw = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RuntimeRecord::default()),
        Err(e) => return Err(e).with_context(|| format!("read {}", file.display())),
    };
    serde_json::from_str(&raw).with_context(|| format!("parse state file {}", file.display()))
}

pub fn save(paths: &Paths, name: &str, record: &RuntimeRecord) -> anyhow::Result<()> {
    write_atomic(&paths.state_file(name), record)
}

/// Read-modify-write. All state mutations go through here so nobody
/// overwrites fields they did not intend to change.
pub fn update(
    paths: &Paths,
    name: &str,
    mutate: impl FnOnce(&mut RuntimeRecord),
) -> anyhow::Result<RuntimeRecord> {
    let mut record = load(paths, name)?;
    mutate(&mut record);
    save(paths, name, &record)?;
    Ok(record)
}

/// Record a supervisor-initiated restart. Returns the updated record so the
/// caller can re-check `crash_loop` immediately.
pub fn record_restart(paths: &Paths, name: &str) -> anyhow::Result<RuntimeRecord> {
    update(paths, name, |r| r.note_restart(unix_now()))
}

pub fn clear_crash_loop(paths: &Paths, name: &str) -> anyhow::Result<()> {
    update(paths, name, RuntimeRecord::reset_crash_loop)?;
    Ok(())
}

pub fn is_crash_looped(paths: &Paths, name: &str) -> anyhow::Result<bool> {
    Ok(load(paths, name)?.crash_loop)
}

/// Delete a service's record (used by `remove`).
pub fn delete(paths: &Paths, name: &str) -> anyhow::Result<()> {
    match std::fs::remove_file(paths.state_file(name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", paths.state_file(name).display())),
    }
}

fn write_atomic(path: &Path, record: &RuntimeRecord) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create_dir_all {}", parent.display()))?;
    let json = serde_json::to_vec_pretty(record)?;
    let file_name = path
        .file_name()
        .map(|os| os.to_string_lossy().to_string())
        .unwrap_or_else(|| "state.json".to_string());
    let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    std::fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
