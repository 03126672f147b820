use crate::config::{self, ServiceEntry};
use crate::control;
use crate::logfile;
use crate::paths::Paths;
use crate::state;
use anyhow::Context as _;
use chrono::Local;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

pub const WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// Single-instance guard: the lock file holds the supervisor's PID.
/// Dropping the guard removes the lock, so every exit path releases it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn acquire(paths: &Paths) -> anyhow::Result<Self> {
        let lock = paths.lock_file();
        match std::fs::read_to_string(&lock) {
            Ok(raw) => {
                if let Ok(pid) = raw.trim().parse::<i32>() {
                    if pid > 0 && control::pid_alive(pid) {
                        anyhow::bail!(
                            "supervisor already running: pid {pid} holds {}",
                            lock.display()
                        );
                    }
                }
                // Holder is dead (or the contents are garbage): stale lock.
                std::fs::remove_file(&lock)
                    .with_context(|| format!("remove stale lock {}", lock.display()))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("read lock {}", lock.display())),
        }
        std::fs::write(&lock, std::process::id().to_string())
            .with_context(|| format!("write lock {}", lock.display()))?;
        Ok(Self { path: lock })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Foreground supervisor: poll every `WATCH_INTERVAL`, restart enabled-but-
/// dead services, honor SIGINT/SIGTERM between iterations. Supervised
/// services are left running on shutdown; they live in their own sessions.
pub async fn run(paths: &Paths) -> anyhow::Result<()> {
    paths.ensure_layout()?;
    let _guard = LockGuard::acquire(paths)?;
    sup_log(paths, &format!("supervisor started (pid {})", std::process::id()));

    let mut term = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    loop {
        if let Err(e) = poll_once(paths) {
            sup_log(paths, &format!("poll failed: {e:#}"));
        }
        tokio::select! {
            _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            _ = term.recv() => break,
            _ = int.recv() => break,
        }
    }

    sup_log(paths, "supervisor stopped");
    Ok(())
}

/// One poll iteration, separated from the loop so tests can drive it.
pub fn poll_once(paths: &Paths) -> anyhow::Result<()> {
    // Children launched in earlier iterations may have exited since; collect
    // them first so the liveness checks below see the truth.
    reap_children();

    // The config may be edited (or deleted) out from under us; an unreadable
    // file means "nothing to do this round", never a dead supervisor.
    let services = match config::load(paths) {
        Ok(s) => s,
        Err(e) => {
            sup_log(paths, &format!("config unreadable, skipping round: {e:#}"));
            return Ok(());
        }
    };

    for svc in services.iter().filter(|s| s.enabled) {
        if let Err(e) = consider(paths, svc) {
            sup_log(paths, &format!("{}: {e:#}", svc.name));
        }
    }

    // Opportunistic log rotation for every configured service, plus our own.
    for svc in &services {
        let _ = logfile::rotate(&paths.log_file(&svc.name));
    }
    let _ = logfile::rotate(&paths.supervisor_log());
    Ok(())
}

/// Decide what to do about one enabled service. The restart is recorded
/// before the start is attempted, so a start that dies instantly still
/// counts toward the crash loop; the flag is re-checked because recording
/// may have just raised it.
fn consider(paths: &Paths, svc: &ServiceEntry) -> anyhow::Result<()> {
    let record = state::load(paths, &svc.name)?;
    if record.crash_loop {
        return Ok(());
    }

    let pid = control::read_pid(paths, &svc.name)?;
    // Never bootstrap: a service with no launch history must be started by
    // the user at least once before the supervisor will touch it. Restart
    // activity inside the window counts as history, so a service whose
    // failed restart just wiped its PID file stays supervised until the
    // crash-loop flag settles the matter.
    if pid.is_none()
        && record.started_at.is_none()
        && !record.recently_restarted(state::unix_now())
    {
        return Ok(());
    }
    if let Some(p) = pid {
        if control::pid_alive(p) {
            return Ok(());
        }
    }

    sup_log(paths, &format!("auto-restart: {}", svc.name));
    let record = state::record_restart(paths, &svc.name)?;
    if record.crash_loop {
        let last = logfile::last_meaningful_line(&paths.log_file(&svc.name), 120)
            .unwrap_or_else(|| "(no output)".to_string());
        sup_log(
            paths,
            &format!("crash-loop engaged: {} (last log: {last})", svc.name),
        );
        return Ok(());
    }
    if let Err(e) = control::start(paths, svc) {
        sup_log(paths, &format!("start failed: {}: {e:#}", svc.name));
    }
    Ok(())
}

/// Collect every child that has exited since the last pass; returns how many
/// were reaped. A zombie still satisfies `kill(pid, 0)`, so skipping this
/// would make dead supervised children read as running forever. The pass
/// runs at the top of each poll iteration, before any liveness check.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    while let Ok(status) = waitpid(None, Some(WaitPidFlag::WNOHANG)) {
        if matches!(status, WaitStatus::StillAlive) {
            break;
        }
        reaped += 1;
    }
    reaped
}

/// Timestamped line to stdout and the supervisor log.
fn sup_log(paths: &Paths, msg: &str) {
    let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = format!("[{ts}] {msg}");
    println!("{line}");
    if let Ok(mut f) = logfile::open_append(&paths.supervisor_log()) {
        let _ = writeln!(f, "{line}");
    }
}
