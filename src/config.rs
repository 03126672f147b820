use crate::paths::Paths;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One declared service. The config file is an ordered JSON array of these;
/// order is preserved across mutations but carries no semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    pub name: String,
    /// Command line, tokenized shell-style at launch (no shell involved).
    pub cmd: String,
    /// Working directory; tilde-expanded at launch.
    pub dir: String,
    /// Optional KEY=VALUE env file, merged into the child environment.
    #[serde(default)]
    pub env_file: Option<String>,
    pub enabled: bool,
}

/// Read the full service list. A missing file is an empty list; a file that
/// does not parse as a JSON array of service objects is an error (callers
/// decide whether that is fatal).
pub fn load(paths: &Paths) -> anyhow::Result<Vec<ServiceEntry>> {
    let file = paths.services_file();
    let raw = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).with_context(|| format!("read {}", file.display())),
    };
    let services: Vec<ServiceEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("parse {} as a JSON array of services", file.display()))?;
    Ok(services)
}

/// Look a service up by name, or fail with the standard diagnostic.
pub fn find(paths: &Paths, name: &str) -> anyhow::Result<ServiceEntry> {
    load(paths)?
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| anyhow::anyhow!("unknown service: {name}"))
}

pub fn add(paths: &Paths, entry: ServiceEntry) -> anyhow::Result<()> {
    anyhow::ensure!(
        crate::paths::valid_name(&entry.name),
        "invalid service name {:?} (want [A-Za-z0-9][A-Za-z0-9._-]*, not \"all\")",
        entry.name
    );
    let mut services = load(paths)?;
    anyhow::ensure!(
        !services.iter().any(|s| s.name == entry.name),
        "service {} already exists",
        entry.name
    );
    services.push(entry);
    save(&paths.services_file(), &services)
}

pub fn remove(paths: &Paths, name: &str) -> anyhow::Result<ServiceEntry> {
    let mut services = load(paths)?;
    let idx = services
        .iter()
        .position(|s| s.name == name)
        .ok_or_else(|| anyhow::anyhow!("unknown service: {name}"))?;
    let removed = services.remove(idx);
    save(&paths.services_file(), &services)?;
    Ok(removed)
}

pub fn set_enabled(paths: &Paths, name: &str, enabled: bool) -> anyhow::Result<()> {
    let mut services = load(paths)?;
    let entry = services
        .iter_mut()
        .find(|s| s.name == name)
        .ok_or_else(|| anyhow::anyhow!("unknown service: {name}"))?;
    entry.enabled = enabled;
    save(&paths.services_file(), &services)
}

/// Serialize to a sibling temp file, then rename over the original.
/// Atomic replace on POSIX; concurrent writers are last-writer-wins.
fn save(path: &Path, services: &[ServiceEntry]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create_dir_all {}", parent.display()))?;
    let json = serde_json::to_vec_pretty(services)?;
    let tmp = parent.join(format!(".services.json.tmp.{}", std::process::id()));
    std::fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> ServiceEntry {
        ServiceEntry {
            name: name.to_string(),
            cmd: "sleep 30".to_string(),
            dir: "/tmp".to_string(),
            env_file: None,
            enabled: true,
        }
    }

    #[test]
    fn missing_file_is_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        assert!(load(&paths).unwrap().is_empty());
    }

    #[test]
    fn add_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        add(&paths, entry("a")).unwrap();
        let before = load(&paths).unwrap();

        add(&paths, entry("b")).unwrap();
        remove(&paths, "b").unwrap();
        assert_eq!(load(&paths).unwrap(), before);
    }

    #[test]
    fn add_rejects_duplicates_and_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        add(&paths, entry("svc")).unwrap();
        assert!(add(&paths, entry("svc")).is_err());
        assert!(add(&paths, entry("all")).is_err());
        assert!(add(&paths, entry("bad name")).is_err());
    }

    #[test]
    fn enable_then_disable_restores_flag() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        let mut e = entry("svc");
        e.enabled = false;
        add(&paths, e).unwrap();

        set_enabled(&paths, "svc", true).unwrap();
        assert!(find(&paths, "svc").unwrap().enabled);
        set_enabled(&paths, "svc", false).unwrap();
        assert!(!find(&paths, "svc").unwrap().enabled);
    }

    #[test]
    fn preserves_order_across_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        for n in ["c", "a", "b"] {
            add(&paths, entry(n)).unwrap();
        }
        set_enabled(&paths, "a", false).unwrap();
        let names: Vec<String> = load(&paths).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        std::fs::write(paths.services_file(), b"{\"not\": \"an array\"}").unwrap();
        assert!(load(&paths).is_err());
        assert!(set_enabled(&paths, "svc", true).is_err());
    }

    #[test]
    fn unknown_service_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        let err = find(&paths, "ghost").unwrap_err();
        assert!(err.to_string().contains("unknown service: ghost"));
        assert!(remove(&paths, "ghost").is_err());
    }
}
