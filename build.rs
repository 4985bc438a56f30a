//! Build script for realityhub-bridge
//!
//! Embeds git state, build timestamp, target and compiler version so that
//! `realityhub-bridge version` and the HTTP user agent can report exactly
//! which build is talking to a device.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = run("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => (!out.stdout.is_empty()).to_string(),
        _ => "unknown".to_string(),
    };
    let rustc_version = run("rustc", &["--version"]);

    let env_or_unknown = |key: &str| env::var(key).unwrap_or_else(|_| "unknown".to_string());

    let vars = [
        ("BRIDGE_GIT_HASH", git_hash),
        ("BRIDGE_GIT_BRANCH", git_branch),
        ("BRIDGE_GIT_DIRTY", git_dirty),
        (
            "BRIDGE_BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("BRIDGE_TARGET", env_or_unknown("TARGET")),
        ("BRIDGE_PROFILE", env_or_unknown("PROFILE")),
        ("BRIDGE_RUSTC_VERSION", rustc_version),
    ];

    for (key, value) in &vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

/// Run a command and return its trimmed stdout, or "unknown"
fn run(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
