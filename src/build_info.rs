use chrono::{DateTime, Utc};

/// `build.rs` stamps a single `ADA_BUILD_STAMP` of the form
/// `"<epoch-seconds> <host>"`.
fn stamp() -> &'static str {
    option_env!("ADA_BUILD_STAMP").unwrap_or("0 unknown")
}

fn parse_stamp(raw: &str) -> (i64, &str) {
    let (epoch, host) = raw.split_once(' ').unwrap_or((raw, ""));
    let host = host.trim();
    (
        epoch.trim().parse().unwrap_or(0),
        if host.is_empty() { "unknown" } else { host },
    )
}

fn format_epoch(epoch: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| format!("epoch {epoch}"))
}

pub fn banner() -> String {
    let (epoch, host) = parse_stamp(stamp());
    format!(
        "ada {} (built {} on {})",
        env!("CARGO_PKG_VERSION"),
        format_epoch(epoch),
        host
    )
}
