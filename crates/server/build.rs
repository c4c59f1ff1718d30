use std::process::Command;

/// Short commit hash for the version banner. `GIT_HASH` in the build
/// environment takes precedence.
fn commit_hash() -> String {
    if let Ok(hash) = std::env::var("GIT_HASH") {
        return hash;
    }
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "dev".to_string())
}

fn main() {
    println!("cargo:rustc-env=GIT_HASH={}", commit_hash());
    println!("cargo:rerun-if-env-changed=GIT_HASH");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
