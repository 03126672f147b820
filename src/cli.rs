use crate::build_info;
use crate::config::{self, ServiceEntry};
use crate::control::{self, StartOutcome, StopOutcome};
use crate::logfile;
use crate::paths::Paths;
use crate::state;
use crate::status;
use crate::supervisor;
use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};

#[derive(Debug, Parser)]
#[command(name = "ada", version, about = "personal process supervisor")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Show all services and the supervisor (default)
    #[command(visible_aliases = ["st", "s"])]
    Status {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Start a service, or all enabled services
    Start { name: String },
    /// Stop a service, or all configured services
    Stop { name: String },
    /// Stop and start again, clearing the crash-loop flag first
    Restart { name: String },
    /// Tail a service's log (follows by default)
    Logs {
        name: String,
        /// Print the last N lines and exit
        #[arg(short = 'n')]
        n: Option<usize>,
        /// Follow appended output (the default when -n is not given)
        #[arg(short = 'f')]
        follow: bool,
    },
    /// Declare a new service (enabled by default)
    Add {
        name: String,
        cmd: String,
        dir: String,
        env_file: Option<String>,
    },
    /// Stop a service and delete it, including its PID and state files
    #[command(visible_alias = "rm")]
    Remove { name: String },
    /// Permit the supervisor to auto-restart this service
    Enable { name: String },
    /// Stop the service and bar the supervisor from restarting it
    Disable { name: String },
    /// Run the supervisor in the foreground
    #[command(visible_alias = "w")]
    Watch,
    /// Print build info
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    if matches!(&args.cmd, Some(Cmd::Version)) {
        println!("{}", build_info::banner());
        return Ok(());
    }
    let paths = Paths::resolve()?;
    paths.ensure_layout()?;

    match args.cmd {
        None => do_status(&paths, OutputFormat::Text),
        Some(Cmd::Status { format }) => do_status(&paths, format),
        Some(Cmd::Start { name }) => do_start(&paths, &name),
        Some(Cmd::Stop { name }) => do_stop(&paths, &name),
        Some(Cmd::Restart { name }) => do_restart(&paths, &name),
        Some(Cmd::Logs { name, n, follow }) => do_logs(&paths, &name, n, follow),
        Some(Cmd::Add { name, cmd, dir, env_file }) => do_add(&paths, name, cmd, dir, env_file),
        Some(Cmd::Remove { name }) => do_remove(&paths, &name),
        Some(Cmd::Enable { name }) => do_enable(&paths, &name),
        Some(Cmd::Disable { name }) => do_disable(&paths, &name),
        Some(Cmd::Watch) => supervisor::run(&paths).await,
        Some(Cmd::Version) => unreachable!("handled before home resolution"),
    }
}

fn do_status(paths: &Paths, format: OutputFormat) -> anyhow::Result<()> {
    // A missing or broken config never breaks status; it degrades.
    let services = config::load(paths).unwrap_or_default();
    let statuses = status::read_all(paths, &services)?;
    match format {
        OutputFormat::Text => {
            if statuses.is_empty() {
                println!("no services configured");
                match status::supervisor_pid(paths) {
                    Some(pid) => println!("supervisor: running (pid {pid})"),
                    None => println!("supervisor: not running"),
                }
            } else {
                print!("{}", status::render_table(&statuses, status::supervisor_pid(paths)));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
    }
    Ok(())
}

fn do_start(paths: &Paths, name: &str) -> anyhow::Result<()> {
    if name == "all" {
        let enabled: Vec<ServiceEntry> = config::load(paths)?
            .into_iter()
            .filter(|s| s.enabled)
            .collect();
        for svc in &enabled {
            match control::start(paths, svc) {
                Ok(outcome) => report_start(&svc.name, outcome),
                Err(e) => eprintln!("{}: {e:#}", svc.name),
            }
        }
        return Ok(());
    }
    let svc = config::find(paths, name)?;
    let outcome = control::start(paths, &svc)?;
    report_start(name, outcome);
    Ok(())
}

fn do_stop(paths: &Paths, name: &str) -> anyhow::Result<()> {
    if name == "all" {
        for svc in config::load(paths)? {
            match control::stop(paths, &svc.name) {
                Ok(outcome) => report_stop(&svc.name, outcome),
                Err(e) => eprintln!("{}: {e:#}", svc.name),
            }
        }
        return Ok(());
    }
    config::find(paths, name)?;
    let outcome = control::stop(paths, name)?;
    report_stop(name, outcome);
    Ok(())
}

fn do_restart(paths: &Paths, name: &str) -> anyhow::Result<()> {
    if name == "all" {
        let enabled: Vec<ServiceEntry> = config::load(paths)?
            .into_iter()
            .filter(|s| s.enabled)
            .collect();
        for svc in &enabled {
            match control::restart(paths, svc) {
                Ok(outcome) => report_start(&svc.name, outcome),
                Err(e) => eprintln!("{}: {e:#}", svc.name),
            }
        }
        return Ok(());
    }
    let svc = config::find(paths, name)?;
    let outcome = control::restart(paths, &svc)?;
    report_start(name, outcome);
    Ok(())
}

fn report_start(name: &str, outcome: StartOutcome) {
    match outcome {
        StartOutcome::Started(pid) => println!("started {name} (pid {pid})"),
        StartOutcome::AlreadyRunning(pid) => println!("{name} already running (pid {pid})"),
    }
}

fn report_stop(name: &str, outcome: StopOutcome) {
    match outcome {
        StopOutcome::Stopped(pid) => println!("stopped {name} (pid {pid})"),
        StopOutcome::NotRunning => println!("{name} is not running"),
    }
}

fn do_add(
    paths: &Paths,
    name: String,
    cmd: String,
    dir: String,
    env_file: Option<String>,
) -> anyhow::Result<()> {
    config::add(
        paths,
        ServiceEntry {
            name: name.clone(),
            cmd,
            dir,
            env_file,
            enabled: true,
        },
    )?;
    println!("added {name}");
    Ok(())
}

fn do_remove(paths: &Paths, name: &str) -> anyhow::Result<()> {
    config::find(paths, name)?;
    control::stop(paths, name)?;
    config::remove(paths, name)?;
    state::delete(paths, name)?;
    // stop already removed the PID file unless something raced it.
    let _ = std::fs::remove_file(paths.pid_file(name));
    println!("removed {name}");
    Ok(())
}

fn do_enable(paths: &Paths, name: &str) -> anyhow::Result<()> {
    config::set_enabled(paths, name, true)?;
    println!("enabled {name}");
    Ok(())
}

fn do_disable(paths: &Paths, name: &str) -> anyhow::Result<()> {
    config::find(paths, name)?;
    control::stop(paths, name)?;
    config::set_enabled(paths, name, false)?;
    println!("disabled {name}");
    Ok(())
}

fn do_logs(paths: &Paths, name: &str, n: Option<usize>, follow: bool) -> anyhow::Result<()> {
    config::find(paths, name)?;
    let path = paths.log_file(name);
    if let Some(n) = n {
        if !follow {
            let tail = logfile::tail_lines(&path, n)?;
            if !tail.is_empty() {
                println!("{tail}");
            }
            return Ok(());
        }
    }
    follow_log(paths, name, n.unwrap_or(10))
}

/// Print the last `n` lines, then stream appended bytes until interrupted.
/// If the file shrinks (rotation), resume from the new end.
fn follow_log(paths: &Paths, name: &str, n: usize) -> anyhow::Result<()> {
    let path = paths.log_file(name);
    let tail = logfile::tail_lines(&path, n)?;
    if !tail.is_empty() {
        println!("{tail}");
    }

    let mut offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let stdout = std::io::stdout();
    loop {
        std::thread::sleep(std::time::Duration::from_millis(250));
        let len = match std::fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(_) => continue,
        };
        if len < offset {
            offset = len;
            continue;
        }
        if len == offset {
            continue;
        }
        let mut f = std::fs::File::open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        f.read_to_end(&mut buf)?;
        offset = len;
        let mut out = stdout.lock();
        out.write_all(&buf)?;
        out.flush()?;
    }
}
