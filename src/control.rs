use crate::config::ServiceEntry;
use crate::logfile;
use crate::paths::{self, Paths};
use crate::state;
use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, setsid, Pid};
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

pub const STOP_GRACE_SECS: u64 = 5;

/// How long a child must survive after spawn before we believe it started.
const START_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning(i32),
    Started(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(i32),
    NotRunning,
}

/// `kill(pid, 0)` liveness probe. EPERM means the process exists but is not
/// ours, which still counts as alive.
pub fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Read the recorded PID for a service. An unparsable PID file is stale
/// garbage: delete it and report no PID.
pub fn read_pid(paths: &Paths, name: &str) -> anyhow::Result<Option<i32>> {
    let file = paths.pid_file(name);
    let raw = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", file.display())),
    };
    match raw.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => {
            let _ = std::fs::remove_file(&file);
            Ok(None)
        }
    }
}

fn write_pid(paths: &Paths, name: &str, pid: i32) -> anyhow::Result<()> {
    let file = paths.pid_file(name);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    std::fs::write(&file, pid.to_string())
        .with_context(|| format!("write {}", file.display()))
}

/// Remove the PID file and null `started_at`. Safe to call whether or not the
/// service was running.
pub fn clear_runtime(paths: &Paths, name: &str) -> anyhow::Result<()> {
    let file = paths.pid_file(name);
    match std::fs::remove_file(&file) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("remove {}", file.display())),
    }
    state::update(paths, name, |r| r.started_at = None)?;
    Ok(())
}

/// Launch a service as a detached session.
///
/// Already-running is a no-op success. Otherwise: rotate the log, write the
/// start marker, spawn the tokenized command with `setsid` in the child (new
/// session, new process group, survives this process exiting), stdout+stderr
/// appended to the service log, and the env file merged into the child env.
/// After a 500 ms grace the child must still be alive; an immediate exit is
/// rolled back and reported as an error.
pub fn start(paths: &Paths, svc: &ServiceEntry) -> anyhow::Result<StartOutcome> {
    if let Some(pid) = read_pid(paths, &svc.name)? {
        if pid_alive(pid) {
            return Ok(StartOutcome::AlreadyRunning(pid));
        }
    }

    let dir = paths::expand_tilde(&svc.dir);
    anyhow::ensure!(
        dir.is_dir(),
        "working directory {} does not exist (refuse to start {})",
        dir.display(),
        svc.name
    );

    let argv = shell_words::split(&svc.cmd)
        .with_context(|| format!("tokenize command for {}: {:?}", svc.name, svc.cmd))?;
    anyhow::ensure!(!argv.is_empty(), "command for {} is empty", svc.name);

    let mut extra_env: Vec<(String, String)> = Vec::new();
    if let Some(env_file) = svc.env_file.as_deref() {
        let env_path = paths::expand_tilde(env_file);
        if env_path.is_file() {
            extra_env = parse_env_file(&env_path)?;
        } else {
            eprintln!(
                "warning: env file {} not found; starting {} without it",
                env_path.display(),
                svc.name
            );
        }
    }

    let log_path = paths.log_file(&svc.name);
    logfile::rotate(&log_path)?;
    logfile::append_marker(&log_path, "starting", &svc.name)?;

    let log_out = logfile::open_append(&log_path)?;
    let log_err = log_out
        .try_clone()
        .with_context(|| format!("dup log handle for {}", svc.name))?;

    let mut cmd = Command::new(&argv[0]);
    if argv.len() > 1 {
        cmd.args(&argv[1..]);
    }
    cmd.current_dir(&dir);
    for (k, v) in &extra_env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log_out))
        .stderr(Stdio::from(log_err));

    // Child-side setup: detach into a new session (and process group) so the
    // child outlives us and signals can later target the whole group.
    unsafe {
        cmd.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        anyhow::anyhow!(
            "spawn {} cwd={} argv={} failed: kind={:?} os_error={:?} err={e}",
            svc.name,
            dir.display(),
            argv.join(" "),
            e.kind(),
            e.raw_os_error()
        )
    })?;
    let pid = child.id() as i32;

    std::thread::sleep(START_GRACE);
    match child.try_wait() {
        Ok(None) => {
            write_pid(paths, &svc.name, pid)?;
            state::update(paths, &svc.name, |r| r.started_at = Some(state::unix_now()))?;
            // Disown: the next reaping pass (or init, once we exit) collects it.
            drop(child);
            Ok(StartOutcome::Started(pid))
        }
        Ok(Some(status)) => {
            clear_runtime(paths, &svc.name)?;
            anyhow::bail!("{} exited immediately after start ({status})", svc.name)
        }
        // Already collected by a concurrent reaping pass: the child is gone
        // either way.
        Err(_) => {
            clear_runtime(paths, &svc.name)?;
            anyhow::bail!("{} exited immediately after start", svc.name)
        }
    }
}

/// Stop a service via escalating signals to its process group.
///
/// A missing or dead PID cleans up and reports not-running as success.
/// Otherwise SIGTERM the group, poll liveness at 1 s up to `STOP_GRACE_SECS`,
/// then SIGKILL the group and wait another 500 ms. The PID file is removed
/// and `started_at` nulled regardless of whether SIGKILL was needed.
pub fn stop(paths: &Paths, name: &str) -> anyhow::Result<StopOutcome> {
    let pid = match read_pid(paths, name)? {
        Some(pid) => pid,
        None => {
            clear_runtime(paths, name)?;
            return Ok(StopOutcome::NotRunning);
        }
    };
    if !pid_alive(pid) {
        clear_runtime(paths, name)?;
        return Ok(StopOutcome::NotRunning);
    }

    let pgid = getpgid(Some(Pid::from_raw(pid))).ok();
    signal_group(pid, pgid, Signal::SIGTERM);

    let mut alive = true;
    for _ in 0..STOP_GRACE_SECS {
        std::thread::sleep(Duration::from_secs(1));
        if !pid_alive(pid) {
            alive = false;
            break;
        }
    }
    if alive {
        signal_group(pid, pgid, Signal::SIGKILL);
        std::thread::sleep(Duration::from_millis(500));
    }

    clear_runtime(paths, name)?;
    logfile::append_marker(&paths.log_file(name), "stopped", name)?;
    Ok(StopOutcome::Stopped(pid))
}

/// Manual restart: clearing the crash-loop flag comes first so a failing
/// Start still leaves the user a path to recover.
pub fn restart(paths: &Paths, svc: &ServiceEntry) -> anyhow::Result<StartOutcome> {
    state::clear_crash_loop(paths, &svc.name)?;
    stop(paths, &svc.name)?;
    start(paths, svc)
}

/// Signal the whole process group when the PGID is usable (> 1; PGID 0 and
/// init's group are never addressed), else the PID alone. ESRCH means the
/// target is already gone; anything else is warned and escalation continues.
fn signal_group(pid: i32, pgid: Option<Pid>, sig: Signal) {
    let res = match pgid {
        Some(pg) if pg.as_raw() > 1 => killpg(pg, sig),
        _ => kill(Pid::from_raw(pid), sig),
    };
    if let Err(e) = res {
        if e != Errno::ESRCH {
            eprintln!("warning: failed to send {sig} to pid {pid}: {e}");
        }
    }
}

/// Parse a KEY=VALUE env file: blank lines and `#` comments are skipped, a
/// leading `export ` is stripped, quoted values are unquoted shell-style.
/// Malformed lines are skipped with a warning rather than failing the start.
pub fn parse_env_file(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read env file {}", path.display()))?;
    let mut out: Vec<(String, String)> = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let Some((key, value)) = line.split_once('=') else {
            eprintln!(
                "warning: {} line {}: no KEY=VALUE, skipped",
                path.display(),
                idx + 1
            );
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !is_env_key(key) {
            eprintln!(
                "warning: {} line {}: bad key {key:?}, skipped",
                path.display(),
                idx + 1
            );
            continue;
        }
        out.push((key.to_string(), unquote(value.trim())));
    }
    Ok(out)
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> String {
    match shell_words::split(value) {
        Ok(tokens) if tokens.len() == 1 => tokens.into_iter().next().unwrap_or_default(),
        _ => value.to_string(),
    }
}
