use anyhow::Context as _;
use chrono::Local;
use std::fs;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::Path;

pub const MAX_LOG_BYTES: u64 = 2 * 1024 * 1024;

/// After rotation the file holds the newest 75% of the cap.
const ROTATE_KEEP_BYTES: u64 = MAX_LOG_BYTES / 4 * 3;

/// Controller-written marker lines share this tag so the status reader can
/// filter them out of "last log line".
const MARKER_TAG: &str = "=== ada ";

pub fn open_append(path: &Path) -> anyhow::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {} for append", path.display()))
}

/// `[YYYY-MM-DD HH:MM:SS] === ada starting <name> ===`
pub fn append_marker(path: &Path, action: &str, name: &str) -> anyhow::Result<()> {
    let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
    let mut f = open_append(path)?;
    writeln!(f, "[{ts}] {MARKER_TAG}{action} {name} ===")
        .with_context(|| format!("write marker to {}", path.display()))?;
    Ok(())
}

pub fn is_marker_line(line: &str) -> bool {
    line.contains(MARKER_TAG) && line.trim_end().ends_with("===")
}

/// Truncate-tail rotation: when the file exceeds the cap, keep only the
/// newest `ROTATE_KEEP_BYTES` by stream-copying the tail to a sibling temp
/// file and renaming it over the original. Byte-oriented, so the first
/// surviving line may be partial.
pub fn rotate(path: &Path) -> anyhow::Result<bool> {
    rotate_with_cap(path, MAX_LOG_BYTES, ROTATE_KEEP_BYTES)
}

fn rotate_with_cap(path: &Path, max_bytes: u64, keep_bytes: u64) -> anyhow::Result<bool> {
    let len = match fs::metadata(path) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if len <= max_bytes {
        return Ok(false);
    }

    let mut src = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    src.seek(SeekFrom::Start(len - keep_bytes))
        .with_context(|| format!("seek {}", path.display()))?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|os| os.to_string_lossy().to_string())
        .unwrap_or_else(|| "log".to_string());
    let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    let mut dst = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    std::io::copy(&mut src, &mut dst)
        .with_context(|| format!("copy tail {} -> {}", path.display(), tmp.display()))?;
    dst.flush()?;
    drop(dst);
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(true)
}

/// Last `n` lines of a file.
///
/// One bounded read from the end: start with a window sized from a generous
/// bytes-per-line estimate and widen it until it holds more than `n`
/// newlines or covers the whole file. Rotation keeps logs at or under the
/// cap, so the scan never needs to exceed `MAX_LOG_BYTES`.
pub fn tail_lines(path: &Path, n: usize) -> anyhow::Result<String> {
    if n == 0 {
        return Ok(String::new());
    }
    let mut f = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let len = f.metadata()?.len();
    if len == 0 {
        return Ok(String::new());
    }

    let mut window = (n as u64).saturating_mul(200).max(4096);
    loop {
        let take = window.min(len).min(MAX_LOG_BYTES);
        f.seek(SeekFrom::Start(len - take))?;
        let mut buf = vec![0u8; take as usize];
        f.read_exact(&mut buf)?;

        // More than n newlines guarantees n complete lines after the
        // (possibly partial) first one.
        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        if newlines > n || take >= len || take >= MAX_LOG_BYTES {
            let text = String::from_utf8_lossy(&buf);
            let lines: Vec<&str> = text.split_terminator('\n').collect();
            let skip = lines.len().saturating_sub(n);
            return Ok(lines[skip..].join("\n"));
        }
        window = window.saturating_mul(2);
    }
}

/// Most recent log line worth showing: scan the 20-line suffix, drop the
/// controller's own markers and blank lines, clip to `width` chars.
pub fn last_meaningful_line(path: &Path, width: usize) -> Option<String> {
    let tail = tail_lines(path, 20).ok()?;
    let line = tail
        .lines()
        .rev()
        .map(str::trim_end)
        .find(|l| !l.trim().is_empty() && !is_marker_line(l))?;
    Some(clip(line, width))
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
