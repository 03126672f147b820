use crate::config::ServiceEntry;
use crate::control;
use crate::logfile;
use crate::paths::Paths;
use crate::state;
use serde::Serialize;

/// Display width cap for the "last log" column.
const LAST_LOG_WIDTH: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Running,
    Stopped,
    Disabled,
    CrashLoop,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Disabled => "disabled",
            ServiceState::CrashLoop => "CRASH-LOOP",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<i32>,
    pub uptime_secs: Option<i64>,
    pub restart_count: u64,
    pub last_log: Option<String>,
}

/// Derive one service's live status by reconciling the on-disk PID with OS
/// liveness. Reading has a deliberate side effect: a stale PID file is
/// deleted and `started_at` nulled, so status output never lies twice.
pub fn read_one(paths: &Paths, svc: &ServiceEntry) -> anyhow::Result<ServiceStatus> {
    let record = state::load(paths, &svc.name)?;
    let pid = control::read_pid(paths, &svc.name)?;
    let alive_pid = pid.filter(|&p| control::pid_alive(p));

    let state = if record.crash_loop {
        ServiceState::CrashLoop
    } else if alive_pid.is_some() {
        ServiceState::Running
    } else if svc.enabled {
        ServiceState::Stopped
    } else {
        ServiceState::Disabled
    };

    let uptime_secs = match state {
        ServiceState::Running => {
            let started = record.started_at.unwrap_or_else(state::unix_now);
            Some((state::unix_now() - started).max(0))
        }
        _ => None,
    };

    // Stale runtime leftovers are cleaned up here, not just observed.
    if alive_pid.is_none() && (pid.is_some() || record.started_at.is_some()) {
        control::clear_runtime(paths, &svc.name)?;
    }

    Ok(ServiceStatus {
        name: svc.name.clone(),
        state,
        pid: alive_pid,
        uptime_secs,
        restart_count: record.restart_count,
        last_log: logfile::last_meaningful_line(&paths.log_file(&svc.name), LAST_LOG_WIDTH),
    })
}

pub fn read_all(paths: &Paths, services: &[ServiceEntry]) -> anyhow::Result<Vec<ServiceStatus>> {
    services.iter().map(|svc| read_one(paths, svc)).collect()
}

/// PID of a live supervisor, if the lock file names one.
pub fn supervisor_pid(paths: &Paths) -> Option<i32> {
    let raw = std::fs::read_to_string(paths.lock_file()).ok()?;
    let pid: i32 = raw.trim().parse().ok()?;
    if pid > 0 && control::pid_alive(pid) {
        Some(pid)
    } else {
        None
    }
}

/// `Xs` under a minute, `Xm Ys` under an hour, `Xh Ym` under a day, `Xd Yh`.
pub fn fmt_uptime(secs: i64) -> String {
    let s = secs.max(0);
    if s < 60 {
        format!("{s}s")
    } else if s < 3_600 {
        format!("{}m {}s", s / 60, s % 60)
    } else if s < 86_400 {
        format!("{}h {}m", s / 3_600, (s % 3_600) / 60)
    } else {
        format!("{}d {}h", s / 86_400, (s % 86_400) / 3_600)
    }
}

const TABLE_HEADERS: [&str; 6] = ["service", "state", "pid", "uptime", "restarts", "last log"];

fn table_cells(s: &ServiceStatus) -> [String; 6] {
    [
        s.name.clone(),
        s.state.as_str().to_string(),
        s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        s.uptime_secs.map(fmt_uptime).unwrap_or_else(|| "-".to_string()),
        s.restart_count.to_string(),
        s.last_log.clone().unwrap_or_else(|| "-".to_string()),
    ]
}

pub fn render_table(statuses: &[ServiceStatus], supervisor: Option<i32>) -> String {
    let rows: Vec<[String; 6]> = statuses.iter().map(table_cells).collect();

    // Each column is as wide as its widest cell, header included.
    let mut widths: [usize; 6] = TABLE_HEADERS.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let rule = format!(
        "+{}+",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let line = |cells: &[String]| {
        let body = cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!(" {cell:<width$} ", width = *w))
            .collect::<Vec<_>>()
            .join("|");
        format!("|{body}|\n")
    };

    let mut out = format!("{rule}\n");
    out.push_str(&line(&TABLE_HEADERS.map(String::from)));
    out.push_str(&rule);
    out.push('\n');
    for row in &rows {
        out.push_str(&line(row));
    }
    out.push_str(&rule);
    out.push('\n');

    match supervisor {
        Some(pid) => out.push_str(&format!("supervisor: running (pid {pid})\n")),
        None => out.push_str("supervisor: not running\n"),
    }
    out
}
