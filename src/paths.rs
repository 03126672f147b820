use anyhow::Context as _;
use std::path::{Path, PathBuf};

/// Resolved filesystem layout for one ada home.
///
/// Everything ada touches lives under a single root (default `~/.ada`):
/// `services.json`, `pids/`, `logs/`, `state/`, plus the supervisor lock and
/// log at the top level. The name-to-path mapping is pure; service names are
/// validated before they ever reach a path join.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Resolve the ada home for the current user.
    ///
    /// `ADA_HOME` overrides the default `$HOME/.ada` root.
    pub fn resolve() -> anyhow::Result<Self> {
        if let Some(over) = std::env::var_os("ADA_HOME") {
            if !over.is_empty() {
                return Ok(Self { root: PathBuf::from(over) });
            }
        }
        let home = std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow::anyhow!("HOME is not set; cannot resolve ~/.ada"))?;
        Ok(Self {
            root: PathBuf::from(home).join(".ada"),
        })
    }

    /// Use an explicit root instead of the resolved home.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and its subdirectories if missing.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [self.root.clone(), self.pids_dir(), self.logs_dir(), self.state_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create_dir_all {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn services_file(&self) -> PathBuf {
        self.root.join("services.json")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.pids_dir().join(format!("{name}.pid"))
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}.log"))
    }

    pub fn state_file(&self, name: &str) -> PathBuf {
        self.state_dir().join(format!("{name}.json"))
    }

    /// Single-instance supervisor lock; contents are the holder's PID.
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("supervisor.lock")
    }

    /// Supervisor's own log. Lives at the root so it cannot collide with a
    /// service log in `logs/`.
    pub fn supervisor_log(&self) -> PathBuf {
        self.root.join("supervisor.log")
    }
}

/// Service names double as file stems, so the shape is strict:
/// `[A-Za-z0-9][A-Za-z0-9._-]*`. `all` is reserved by the CLI.
pub fn valid_name(name: &str) -> bool {
    if name == "all" {
        return false;
    }
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Expand a leading `~` or `~/` against `$HOME`. Other `~user` forms and
/// paths without a tilde pass through unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
