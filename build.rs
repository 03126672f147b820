use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // One stamp, "epoch-seconds host". SOURCE_DATE_EPOCH wins over the clock
    // so the stamp is reproducible when the build environment asks for it.
    let epoch = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });

    let host = env::var("HOSTNAME")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(uname_hostname)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=ADA_BUILD_STAMP={epoch} {host}");
}

fn uname_hostname() -> Option<String> {
    let out = Command::new("uname").arg("-n").output().ok()?;
    if !out.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}
